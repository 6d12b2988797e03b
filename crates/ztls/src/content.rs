//! Content values: command line arguments which carry data either inline, in
//! an encoded form or as a reference to a file.
//!
//! | Form | Meaning |
//! | ---- | ------- |
//! | `base64:DATA` | Standard base64 with padding |
//! | `raw-base64:DATA` | Standard base64 without padding |
//! | `hex:DATA` | Hexadecimal |
//! | `file:PATH` | The contents of the file at `PATH` |
//! | anything else | The value itself, or a file path where paths are the default |
use std::path::{Path, PathBuf};

use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD},
};
use snafu::{ResultExt, Snafu};

/// Appended to the help text of every content value argument.
pub const CONTENT_VALUE_HELP: &str = "Formats: 'raw value', 'base64:BASE64CONTENT', \
                                      'raw-base64:UNPADDEDBASE64', 'hex:HEXCONTENT', \
                                      'file:/path/to/file'";

const PEM_PREFIX: &str = "-----BEGIN ";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to decode base64 content"))]
    DecodeBase64 { source: base64::DecodeError },

    #[snafu(display("failed to decode hex content"))]
    DecodeHex { source: hex::FromHexError },

    #[snafu(display("failed to read content from file {path:?}"))]
    ReadFile {
        source: std::io::Error,
        path: PathBuf,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentValue {
    Raw(String),
    Base64(String),
    RawBase64(String),
    Hex(String),
    File(PathBuf),
}

impl ContentValue {
    /// Parses a content value. Unprefixed values are file paths if
    /// `default_is_path` is set, unless they are an inline PEM block.
    pub fn parse(value: &str, default_is_path: bool) -> Self {
        if let Some(data) = value.strip_prefix("base64:") {
            Self::Base64(data.to_owned())
        } else if let Some(data) = value.strip_prefix("raw-base64:") {
            Self::RawBase64(data.to_owned())
        } else if let Some(data) = value.strip_prefix("hex:") {
            Self::Hex(data.to_owned())
        } else if let Some(path) = value.strip_prefix("file:") {
            Self::File(PathBuf::from(path))
        } else if default_is_path && !value.trim_start().starts_with(PEM_PREFIX) {
            Self::File(PathBuf::from(value))
        } else {
            Self::Raw(value.to_owned())
        }
    }

    /// Returns the data of the content value, reading files if required.
    pub fn read(&self) -> Result<Vec<u8>> {
        match self {
            Self::Raw(data) => Ok(data.as_bytes().to_vec()),
            Self::Base64(data) => STANDARD.decode(data.trim()).context(DecodeBase64Snafu),
            Self::RawBase64(data) => STANDARD_NO_PAD
                .decode(data.trim())
                .context(DecodeBase64Snafu),
            Self::Hex(data) => hex::decode(data.trim()).context(DecodeHexSnafu),
            Self::File(path) => read_file(path),
        }
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).context(ReadFileSnafu { path })
}

/// Parses and reads a content value in one go.
pub fn read_content_value(value: &str, default_is_path: bool) -> Result<Vec<u8>> {
    ContentValue::parse(value, default_is_path).read()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("base64:aGVsbG8=", false, b"hello")]
    #[case("raw-base64:aGVsbG8", false, b"hello")]
    #[case("hex:68656c6c6f", false, b"hello")]
    #[case("hello", false, b"hello")]
    #[case("-----BEGIN ZTLSCONFIG-----", true, b"-----BEGIN ZTLSCONFIG-----")]
    fn decodes_inline_values(
        #[case] value: &str,
        #[case] default_is_path: bool,
        #[case] expected: &[u8],
    ) {
        assert_eq!(read_content_value(value, default_is_path).unwrap(), expected);
    }

    #[rstest]
    #[case("base64:!!!")]
    #[case("raw-base64:aGVsbG8=")]
    #[case("hex:xyz")]
    #[case("file:/does/not/exist")]
    fn rejects_broken_values(#[case] value: &str) {
        assert!(read_content_value(value, false).is_err());
    }

    #[test]
    fn reads_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"from a file").unwrap();
        let path = file.path().to_str().unwrap();

        assert_eq!(
            read_content_value(&format!("file:{path}"), false).unwrap(),
            b"from a file"
        );
        assert_eq!(read_content_value(path, true).unwrap(), b"from a file");
        assert_eq!(read_content_value(path, false).unwrap(), path.as_bytes());
    }

    #[test]
    fn parses_prefixes() {
        assert_eq!(
            ContentValue::parse("file:/etc/ztls", false),
            ContentValue::File(PathBuf::from("/etc/ztls"))
        );
        assert_eq!(
            ContentValue::parse("/etc/ztls", true),
            ContentValue::File(PathBuf::from("/etc/ztls"))
        );
        assert_eq!(
            ContentValue::parse("/etc/ztls", false),
            ContentValue::Raw("/etc/ztls".to_owned())
        );
    }
}
