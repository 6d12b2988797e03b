//! Encoding and decoding of labeled PEM blocks.
//!
//! Every artifact exchanged by the CA (keys, CSRs, certificates and the
//! configuration blob) is a single PEM block. Decoding always checks the
//! label exactly. Private keys can optionally be protected with the legacy
//! OpenSSL encryption scheme (`Proc-Type`/`DEK-Info` headers), see
//! [`PemCipher`].
use std::collections::BTreeMap;

use ::pem::{EncodeConfig, LineEnding, Pem};
use snafu::{ResultExt, Snafu, ensure};
use tracing::instrument;
use zeroize::Zeroizing;

use crate::ErrorKind;

mod encryption;
pub use encryption::PemCipher;

/// Label of X.509 certificates.
pub const CERTIFICATE_LABEL: &str = "CERTIFICATE";

/// Label of PKCS#1 encoded RSA private keys.
pub const RSA_PRIVATE_KEY_LABEL: &str = "RSA PRIVATE KEY";

/// Label of PKCS#10 certificate signing requests.
pub const CERTIFICATE_REQUEST_LABEL: &str = "CERTIFICATE REQUEST";

/// Label of the serialized authority configuration.
pub const CONFIG_LABEL: &str = "ZTLSCONFIG";

const PROC_TYPE_HEADER: &str = "Proc-Type";
const DEK_INFO_HEADER: &str = "DEK-Info";
const PROC_TYPE_ENCRYPTED: &str = "4,ENCRYPTED";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse PEM block"))]
    ParsePem { source: ::pem::PemError },

    #[snafu(display("expected PEM block labeled {expected:?}, found {found:?}"))]
    LabelMismatch { expected: String, found: String },

    #[snafu(display("invalid PEM header {key:?}"))]
    InvalidHeader {
        source: ::pem::PemError,
        key: String,
    },

    #[snafu(display("PEM block is encrypted, but no password was provided"))]
    MissingPassword,

    #[snafu(display("failed to decrypt PEM block"))]
    Decrypt { source: encryption::Error },

    #[snafu(display("failed to encrypt PEM block"))]
    Encrypt { source: encryption::Error },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ParsePem { .. } | Error::InvalidHeader { .. } => ErrorKind::InvalidEncoding,
            Error::LabelMismatch { .. } => ErrorKind::LabelMismatch,
            Error::MissingPassword | Error::Decrypt { .. } => ErrorKind::DecryptionError,
            Error::Encrypt { .. } => ErrorKind::Internal,
        }
    }
}

/// A decoded PEM block whose label has already been checked.
#[derive(Debug)]
pub struct Block {
    /// Headers of the block, for example the configuration metadata.
    pub headers: BTreeMap<String, String>,

    /// The (decrypted) payload of the block.
    pub contents: Zeroizing<Vec<u8>>,
}

/// Encodes `contents` as a PEM block labeled `label` without any headers.
pub fn encode(label: &str, contents: &[u8]) -> String {
    encode_pem(&Pem::new(label, contents))
}

/// Encodes `contents` as a PEM block labeled `label` and attaches `headers`
/// in iteration order.
///
/// Header keys must not contain colons and neither keys nor values may
/// contain line breaks.
pub fn encode_with_headers<'a, H>(label: &str, contents: &[u8], headers: H) -> Result<String>
where
    H: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut pem = Pem::new(label, contents);

    for (key, value) in headers {
        pem.headers_mut()
            .add(key, value)
            .context(InvalidHeaderSnafu { key })?;
    }

    Ok(encode_pem(&pem))
}

/// Encodes `contents` as an encrypted PEM block using the legacy OpenSSL
/// scheme with a freshly generated random IV.
#[instrument(skip(contents, password))]
pub fn encrypt(label: &str, contents: &[u8], password: &[u8], cipher: PemCipher) -> Result<String> {
    let (dek_info, ciphertext) = encryption::encrypt(contents, password, cipher).context(EncryptSnafu)?;

    encode_with_headers(label, &ciphertext, [
        (PROC_TYPE_HEADER, PROC_TYPE_ENCRYPTED),
        (DEK_INFO_HEADER, dek_info.as_str()),
    ])
}

/// Decodes the first PEM block in `input` and returns its payload.
///
/// The block must be labeled `expected_label`. A non-empty `password`
/// decrypts the block.
pub fn decode(
    input: &[u8],
    expected_label: &str,
    password: Option<&[u8]>,
) -> Result<Zeroizing<Vec<u8>>> {
    decode_block(input, expected_label, password).map(|block| block.contents)
}

/// Same as [`decode`], but additionally returns the headers of the block.
pub fn decode_block(input: &[u8], expected_label: &str, password: Option<&[u8]>) -> Result<Block> {
    let pem = ::pem::parse(input).context(ParsePemSnafu)?;

    ensure!(pem.tag() == expected_label, LabelMismatchSnafu {
        expected: expected_label,
        found: pem.tag(),
    });

    let headers: BTreeMap<String, String> = pem
        .headers()
        .iter()
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect();
    let encrypted = headers
        .get(PROC_TYPE_HEADER)
        .is_some_and(|proc_type| proc_type == PROC_TYPE_ENCRYPTED);

    let contents = match password.filter(|password| !password.is_empty()) {
        Some(password) => encryption::decrypt(
            headers.get(DEK_INFO_HEADER).map(String::as_str),
            encrypted,
            pem.contents(),
            password,
        )
        .context(DecryptSnafu)?,
        None => {
            ensure!(!encrypted, MissingPasswordSnafu);
            Zeroizing::new(pem.contents().to_vec())
        }
    };

    Ok(Block { headers, contents })
}

fn encode_pem(pem: &Pem) -> String {
    ::pem::encode_config(pem, EncodeConfig::new().set_line_ending(LineEnding::LF))
}
