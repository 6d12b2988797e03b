//! This crate implements a minimal private certificate authority (CA). A single
//! root key/certificate pair signs leaf certificates requested through PKCS#10
//! certificate signing requests (CSRs).
//!
//! The main entry point is the [`Authority`](crate::authority::Authority),
//! which is created from an [`AuthorityConfig`](crate::config::AuthorityConfig)
//! and can:
//!
//! - sign CSRs (PEM encoded) or subject descriptors,
//! - generate fresh RSA keys,
//! - provision ready-to-use rustls client and server configurations which
//!   trust each other through the root CA (mutual TLS).
//!
//! Lower-level building blocks are exposed as well: the [`pem`] codec, RSA
//! [`keys`], the [`csr`] builder/parser, the [`ca`] issuer and the [`serial`]
//! number sources.
//!
//! ## References
//!
//! - <https://datatracker.ietf.org/doc/html/rfc5280>
//! - <https://datatracker.ietf.org/doc/html/rfc2986>
//! - <https://datatracker.ietf.org/doc/html/rfc1423>
pub mod authority;
pub mod ca;
pub mod config;
pub mod csr;
pub mod keys;
pub mod pem;
pub mod serial;
pub mod tls;

// Selected re-exports
pub use crate::{
    authority::{Authority, AuthorityState},
    config::AuthorityConfig,
    csr::CsrSubject,
    serial::SerialNumberSource,
};

/// Coarse classification of every error this crate returns.
///
/// Each module error exposes a `kind()` function, which outer layers (HTTP,
/// CLI) use to map errors onto status and exit codes without inspecting
/// messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "PascalCase")]
pub enum ErrorKind {
    /// The input is not a parseable PEM block (or too short to be one).
    InvalidEncoding,

    /// The PEM block carries a different label than expected.
    LabelMismatch,

    /// Decrypting a password protected PEM block failed.
    DecryptionError,

    /// A private key could not be decoded or doesn't match its certificate.
    InvalidKey,

    /// The root certificate could not be decoded.
    #[strum(serialize = "InvalidCACert")]
    InvalidCaCert,

    /// The root key could not be decoded or doesn't match the root certificate.
    #[strum(serialize = "InvalidCAKey")]
    InvalidCaKey,

    /// The certificate signing request is malformed or its signature is invalid.
    #[strum(serialize = "InvalidCSR")]
    InvalidCsr,

    /// An IP address of a subject descriptor could not be parsed.
    #[strum(serialize = "InvalidIP")]
    InvalidIp,

    /// The authority has no usable root material.
    NotConfigured,

    /// The root certificate could not be added to a TLS trust pool.
    UntrustedRoot,

    /// Generating a new RSA key failed.
    KeyGenError,

    /// The configuration payload doesn't match the configuration structure.
    DeserializationError,

    /// A TLS server name is neither a DNS name nor an IP address.
    InvalidServerName,

    /// Encoding or building a structure failed unexpectedly.
    Internal,
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::sync::OnceLock;

    use crate::{ca::CertificateAuthority, keys::SigningKey};

    /// Key size used for all generated test keys. 2048 bits is the smallest
    /// size rustls accepts.
    pub const TEST_KEY_SIZE: usize = 2048;

    /// Returns a lazily created, process-wide RSA key to avoid paying for key
    /// generation in every single test.
    pub fn shared_key() -> &'static SigningKey {
        static KEY: OnceLock<SigningKey> = OnceLock::new();
        KEY.get_or_init(|| SigningKey::new(TEST_KEY_SIZE).expect("failed to create test key"))
    }

    /// Returns a second key, which is different from [`shared_key`].
    pub fn other_key() -> &'static SigningKey {
        static KEY: OnceLock<SigningKey> = OnceLock::new();
        KEY.get_or_init(|| SigningKey::new(TEST_KEY_SIZE).expect("failed to create test key"))
    }

    /// Returns a lazily created root CA signed by [`shared_key`].
    pub fn shared_ca() -> &'static CertificateAuthority {
        static CA: OnceLock<CertificateAuthority> = OnceLock::new();
        CA.get_or_init(|| {
            CertificateAuthority::builder()
                .signing_key(shared_key().clone())
                .build()
                .expect("failed to build test CA")
        })
    }
}
