//! The authority configuration and its portable `ZTLSCONFIG` PEM container.
//!
//! The configuration bundles everything an [`Authority`](crate::Authority)
//! needs: the root certificate, the (optionally encrypted) root key with its
//! password and the access secret which gates privileged REST routes. It is
//! the only artifact which is ever persisted.
use std::{collections::BTreeMap, fmt};

use bon::Builder;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};
use tracing::{debug, instrument};
use x509_cert::{Certificate, der::Decode};
use zeroize::Zeroize;

use crate::{
    ErrorKind,
    ca::{CertificateAuthority, CreateCertificateAuthorityError, LoadCertificateAuthorityError},
    keys::{self, DEFAULT_KEY_SIZE, SigningKey},
    pem::{self, CERTIFICATE_LABEL, CONFIG_LABEL, PemCipher},
};

/// Identifies the tool which generated a configuration.
pub const GENERATOR: &str = "ztls CLI";

pub const GENERATOR_HEADER: &str = "Generator";
pub const EXPIRES_HEADER: &str = "Expires";
pub const ACCESS_SECRET_HEADER: &str = "X-API-KEY";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to decode the configuration PEM block"))]
    DecodePem { source: pem::Error },

    #[snafu(display("failed to encode the configuration PEM block"))]
    EncodePem { source: pem::Error },

    #[snafu(display("failed to deserialize the configuration payload"))]
    DeserializePayload { source: serde_json::Error },

    #[snafu(display("failed to serialize the configuration payload"))]
    SerializePayload { source: serde_json::Error },

    #[snafu(display("failed to decode the root certificate PEM block"))]
    DecodeRootCertificatePem { source: pem::Error },

    #[snafu(display("failed to parse the root certificate"))]
    ParseRootCertificate { source: x509_cert::der::Error },

    #[snafu(display("a root certificate was provided without its root key"))]
    MissingRootKey,

    #[snafu(display("failed to create the root key"))]
    CreateRootKey { source: keys::Error },

    #[snafu(display("failed to encrypt the root key"))]
    EncryptRootKey { source: keys::Error },

    #[snafu(display("failed to create the root certificate"))]
    CreateRootCertificate {
        source: CreateCertificateAuthorityError,
    },

    #[snafu(display("the root key and the root certificate don't form a valid CA"))]
    ValidateRoot {
        source: LoadCertificateAuthorityError,
    },

    #[snafu(display("failed to serialize the root certificate as PEM"))]
    SerializeRootCertificate { source: x509_cert::der::Error },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DecodePem { source } | Error::EncodePem { source } => source.kind(),
            Error::DeserializePayload { .. } => ErrorKind::DeserializationError,
            Error::DecodeRootCertificatePem { .. } | Error::ParseRootCertificate { .. } => {
                ErrorKind::InvalidCaCert
            }
            Error::MissingRootKey => ErrorKind::InvalidCaKey,
            Error::CreateRootKey { source } => source.kind(),
            Error::CreateRootCertificate { source } => source.kind(),
            Error::ValidateRoot { source } => source.kind(),
            Error::SerializePayload { .. }
            | Error::EncryptRootKey { .. }
            | Error::SerializeRootCertificate { .. } => ErrorKind::Internal,
        }
    }
}

/// Root material and access secret of an authority.
///
/// Private material is wiped from memory when the configuration is dropped
/// and never shows up in [`Debug`](fmt::Debug) output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorityConfig {
    /// The PEM encoded, self-signed root certificate.
    pub root_certificate: String,

    /// The PEM encoded PKCS#1 root key, encrypted if
    /// [`root_key_password`](Self::root_key_password) is set.
    pub root_key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_key_password: Option<String>,

    /// Shared secret callers present in the `X-API-KEY` header.
    pub access_secret: String,
}

impl fmt::Debug for AuthorityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorityConfig")
            .field("root_certificate", &self.root_certificate)
            .field("root_key", &"<redacted>")
            .field(
                "root_key_password",
                &self.root_key_password.as_ref().map(|_| "<redacted>"),
            )
            .field("access_secret", &"<redacted>")
            .finish()
    }
}

impl Drop for AuthorityConfig {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.root_key_password.zeroize();
        self.access_secret.zeroize();
    }
}

/// Options to [generate](AuthorityConfig::generate) a new configuration.
///
/// Every piece of root material which is not provided is created. A provided
/// root certificate requires the matching root key.
#[derive(Builder)]
pub struct GenerateOptions {
    /// Size of a newly generated root key in bits.
    #[builder(default = DEFAULT_KEY_SIZE)]
    pub key_size: usize,

    /// An existing PEM encoded root key.
    #[builder(into)]
    pub root_key: Option<String>,

    /// An existing PEM encoded root certificate, which must match the root
    /// key.
    #[builder(into)]
    pub root_certificate: Option<String>,

    /// Password of the root key. An existing root key is expected to be
    /// encrypted with it, a newly generated root key gets encrypted with it.
    #[builder(into)]
    pub root_key_password: Option<String>,

    /// The access secret, a random UUID is used if not provided.
    #[builder(into)]
    pub access_secret: Option<String>,
}

impl AuthorityConfig {
    /// Generates a configuration, see [`GenerateOptions`] for what is created
    /// and what is reused.
    #[instrument(
        name = "generate_authority_config",
        skip(options),
        fields(key_size = options.key_size),
    )]
    pub fn generate(options: GenerateOptions) -> Result<Self> {
        ensure!(
            options.root_certificate.is_none() || options.root_key.is_some(),
            MissingRootKeySnafu
        );

        let password = options
            .root_key_password
            .as_deref()
            .filter(|password| !password.is_empty());

        let root_key = match &options.root_key {
            Some(root_key) => root_key.clone(),
            None => {
                let key = SigningKey::new(options.key_size).context(CreateRootKeySnafu)?;
                match password {
                    Some(password) => key
                        .to_encrypted_pem(password.as_bytes(), PemCipher::default())
                        .context(EncryptRootKeySnafu)?,
                    None => key.to_pem().context(CreateRootKeySnafu)?,
                }
            }
        };
        let password_bytes = password.map(str::as_bytes);

        let root_certificate = match &options.root_certificate {
            Some(root_certificate) => root_certificate.clone(),
            None => {
                let signing_key = SigningKey::from_pem(root_key.as_bytes(), password_bytes)
                    .context(CreateRootKeySnafu)?;
                CertificateAuthority::builder()
                    .signing_key(signing_key)
                    .build()
                    .context(CreateRootCertificateSnafu)?
                    .ca_cert_pem()
                    .context(SerializeRootCertificateSnafu)?
            }
        };

        CertificateAuthority::from_pem(
            root_certificate.as_bytes(),
            root_key.as_bytes(),
            password_bytes,
        )
        .context(ValidateRootSnafu)?;

        let access_secret = options
            .access_secret
            .clone()
            .filter(|secret| !secret.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        debug!(
            config.root_key.generated = options.root_key.is_none(),
            config.root_key.encrypted = password.is_some(),
            config.root_certificate.generated = options.root_certificate.is_none(),
            "generated authority configuration"
        );
        Ok(Self {
            root_certificate,
            root_key,
            root_key_password: password.map(ToOwned::to_owned),
            access_secret,
        })
    }

    /// Serializes the configuration as `ZTLSCONFIG` PEM block with the
    /// given `metadata` headers.
    pub fn to_pem<'a, M>(&self, metadata: M) -> Result<String>
    where
        M: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let payload =
            zeroize::Zeroizing::new(serde_json::to_vec(self).context(SerializePayloadSnafu)?);
        pem::encode_with_headers(CONFIG_LABEL, &payload, metadata).context(EncodePemSnafu)
    }

    /// Serializes the configuration with the [default
    /// metadata](Self::default_metadata).
    pub fn to_pem_with_default_metadata(&self) -> Result<String> {
        let metadata = self.default_metadata()?;
        self.to_pem(metadata.iter().map(|(key, value)| (*key, value.as_str())))
    }

    /// Deserializes a `ZTLSCONFIG` PEM block.
    pub fn from_pem(input: &[u8]) -> Result<Self> {
        Self::from_pem_with_metadata(input).map(|(config, _)| config)
    }

    /// Same as [`AuthorityConfig::from_pem`], but also returns the metadata
    /// headers of the block.
    #[instrument(name = "decode_authority_config", skip_all)]
    pub fn from_pem_with_metadata(input: &[u8]) -> Result<(Self, BTreeMap<String, String>)> {
        let block = pem::decode_block(input, CONFIG_LABEL, None).context(DecodePemSnafu)?;
        let config = serde_json::from_slice(&block.contents).context(DeserializePayloadSnafu)?;

        Ok((config, block.headers))
    }

    /// The metadata written by the CLI: the generator, the expiry date of the
    /// root certificate (`YYYY-MM-DD`) and the access secret.
    pub fn default_metadata(&self) -> Result<Vec<(&'static str, String)>> {
        Ok(vec![
            (GENERATOR_HEADER, GENERATOR.to_owned()),
            (EXPIRES_HEADER, self.root_expiry_date()?),
            (ACCESS_SECRET_HEADER, self.access_secret.clone()),
        ])
    }

    fn root_expiry_date(&self) -> Result<String> {
        let der = pem::decode(self.root_certificate.as_bytes(), CERTIFICATE_LABEL, None)
            .context(DecodeRootCertificatePemSnafu)?;
        let certificate = Certificate::from_der(&der).context(ParseRootCertificateSnafu)?;
        let not_after = certificate
            .tbs_certificate
            .validity
            .not_after
            .to_date_time();

        Ok(format!(
            "{:04}-{:02}-{:02}",
            not_after.year(),
            not_after.month(),
            not_after.day()
        ))
    }

    /// The password of the root key as bytes, if any.
    pub fn root_key_password_bytes(&self) -> Option<&[u8]> {
        self.root_key_password.as_deref().map(str::as_bytes)
    }
}
