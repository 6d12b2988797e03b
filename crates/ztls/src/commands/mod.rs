//! Implementations of the `ztls` subcommands.
//!
//! Every failure maps onto a distinct process exit code, see [`exit_code_for`].
use std::{
    fs::OpenOptions,
    io::{self, Write},
    os::unix::fs::OpenOptionsExt,
    path::Path,
};

use ztls_certs::ErrorKind;

pub mod config;
pub mod easycert;
pub mod generate;
pub mod serve;
pub mod util;

/// Exit code of failures which are not caused by the certificate library.
pub mod exit_codes {
    pub const INVALID_CONFIG: u8 = 1;
    pub const SERVER: u8 = 2;
    pub const INVALID_CONTENT: u8 = 3;
    pub const IO: u8 = 4;
    pub const TELEMETRY: u8 = 5;
    pub const REMOTE: u8 = 6;
    pub const MISSING_OUTPUT: u8 = 10;
}

/// Maps library error kinds onto exit codes, starting at `20`.
pub fn exit_code_for(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::InvalidEncoding => 20,
        ErrorKind::LabelMismatch => 21,
        ErrorKind::DecryptionError => 22,
        ErrorKind::InvalidKey => 23,
        ErrorKind::InvalidCaCert => 24,
        ErrorKind::InvalidCaKey => 25,
        ErrorKind::InvalidCsr => 26,
        ErrorKind::InvalidIp => 27,
        ErrorKind::NotConfigured => 28,
        ErrorKind::UntrustedRoot => 29,
        ErrorKind::KeyGenError => 30,
        ErrorKind::DeserializationError => 31,
        ErrorKind::InvalidServerName => 32,
        ErrorKind::Internal => 33,
    }
}

/// Writes `contents` to `path`, readable and writable by the owner only.
pub(crate) fn write_private_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    file.flush()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let codes: HashSet<u8> = ErrorKind::iter().map(exit_code_for).collect();
        assert_eq!(codes.len(), ErrorKind::iter().count());

        for code in [
            exit_codes::INVALID_CONFIG,
            exit_codes::SERVER,
            exit_codes::INVALID_CONTENT,
            exit_codes::IO,
            exit_codes::TELEMETRY,
            exit_codes::REMOTE,
            exit_codes::MISSING_OUTPUT,
        ] {
            assert!(!codes.contains(&code));
        }
    }

    #[test]
    fn private_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.pem");
        write_private_file(&path, b"secret").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read(&path).unwrap(), b"secret");
    }
}
