use std::time::{Duration, SystemTime};

use bon::Builder;
use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument};
use x509_cert::{
    builder::{Builder, CertificateBuilder, Profile},
    der::referenced::OwnedToRef,
    ext::pkix::{
        AuthorityKeyIdentifier, BasicConstraints, KeyUsage, KeyUsages, SubjectKeyIdentifier,
    },
    name::Name,
    serial_number::SerialNumber,
    time::Validity,
};

use super::{CertificateAuthority, to_x509_time};
use crate::{
    ErrorKind,
    ca::{CLOCK_SKEW_ALLOWANCE, DEFAULT_CA_VALIDITY, ROOT_CA_SERIAL, ZTLS_ROOT_CA_SUBJECT},
    keys::{self, DEFAULT_KEY_SIZE, SigningKey},
};

/// Defines all error variants which can occur when creating a CA
#[derive(Debug, Snafu)]
pub enum CreateCertificateAuthorityError {
    #[snafu(display("failed to parse validity"))]
    ParseValidity { source: x509_cert::der::Error },

    #[snafu(display("failed to parse \"{subject}\" as subject"))]
    ParseSubject {
        source: x509_cert::der::Error,
        subject: String,
    },

    #[snafu(display("failed to create signing key pair"))]
    CreateSigningKeyPair { source: keys::Error },

    #[snafu(display("failed to load signing key pair"))]
    LoadSigningKeyPair { source: keys::Error },

    #[snafu(display("failed to retrieve the subject public key info"))]
    RetrieveSpki { source: keys::Error },

    #[snafu(display("failed to derive key identifier"))]
    DeriveKeyIdentifier { source: x509_cert::der::Error },

    #[snafu(display("failed to create certificate builder"))]
    CreateCertificateBuilder { source: x509_cert::builder::Error },

    #[snafu(display("failed to add certificate extension"))]
    AddCertificateExtension { source: x509_cert::builder::Error },

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: x509_cert::builder::Error },

    #[snafu(display("failed to serialize certificate as PEM"))]
    SerializeCertificate { source: x509_cert::der::Error },
}

impl CreateCertificateAuthorityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CreateSigningKeyPair { .. } => ErrorKind::KeyGenError,
            Self::LoadSigningKeyPair { source } if source.kind() == ErrorKind::DecryptionError => {
                ErrorKind::DecryptionError
            }
            Self::LoadSigningKeyPair { .. } => ErrorKind::InvalidKey,
            _ => ErrorKind::Internal,
        }
    }
}

/// This builder builds self-signed root certificate authorities of type
/// [`CertificateAuthority`].
///
/// It has many default values, notably;
///
/// - A default validity of [`DEFAULT_CA_VALIDITY`], starting
///   [`CLOCK_SKEW_ALLOWANCE`] in the past
/// - A default subject of [`ZTLS_ROOT_CA_SUBJECT`]
/// - The serial number [`ROOT_CA_SERIAL`]
/// - In case no `signing_key` was provided, a fresh RSA key with
///   [`DEFAULT_KEY_SIZE`] bits will be created.
///
/// The CA is marked as CA with a path length of zero, can sign certificates
/// and CRLs and identifies its key with the SHA-1 hash of the public key.
///
/// Example code to construct a CA:
///
/// ```no_run
/// use ztls_certs::ca::CertificateAuthority;
///
/// let ca = CertificateAuthority::builder()
///     .subject("CN=My Internal CA")
///     .build()
///     .expect("failed to build CA");
/// ```
#[derive(Builder)]
#[builder(start_fn = start_builder, finish_fn = finish_builder)]
pub struct CertificateAuthorityBuilder<'a> {
    /// Required subject of the certificate authority, usually starts with `CN=`.
    #[builder(default = ZTLS_ROOT_CA_SUBJECT)]
    subject: &'a str,

    /// Validity/lifetime of the certificate.
    ///
    /// If not specified the default of [`DEFAULT_CA_VALIDITY`] will be used.
    #[builder(default = DEFAULT_CA_VALIDITY)]
    validity: Duration,

    /// Cryptographic keypair used to sign leaf certificates.
    ///
    /// If not specified a random keypair will be generated.
    signing_key: Option<SigningKey>,
}

impl<S> CertificateAuthorityBuilderBuilder<'_, S>
where
    S: certificate_authority_builder_builder::IsComplete,
{
    /// Convenience function to avoid calling `builder().finish_builder().build()`
    pub fn build(self) -> Result<CertificateAuthority, CreateCertificateAuthorityError> {
        self.finish_builder().build()
    }
}

impl CertificateAuthority {
    /// Use this function in combination with [`CertificateAuthorityBuilder`]
    /// to create new CAs.
    pub fn builder() -> CertificateAuthorityBuilderBuilder<'static> {
        CertificateAuthorityBuilder::start_builder()
    }
}

impl CertificateAuthorityBuilder<'_> {
    #[instrument(
        name = "build_certificate_authority",
        skip(self),
        fields(subject = self.subject),
    )]
    pub fn build(self) -> Result<CertificateAuthority, CreateCertificateAuthorityError> {
        let now = SystemTime::now();
        let validity = Validity {
            not_before: to_x509_time(now - CLOCK_SKEW_ALLOWANCE).context(ParseValiditySnafu)?,
            not_after: to_x509_time(now + self.validity).context(ParseValiditySnafu)?,
        };
        let subject: Name = self.subject.parse().context(ParseSubjectSnafu {
            subject: self.subject,
        })?;
        let signing_key = match self.signing_key {
            Some(signing_key) => signing_key,
            None => SigningKey::new(DEFAULT_KEY_SIZE).context(CreateSigningKeyPairSnafu)?,
        };

        let serial_number = SerialNumber::from(ROOT_CA_SERIAL);
        let spki = signing_key
            .subject_public_key_info()
            .context(RetrieveSpkiSnafu)?;

        // The root is self-signed, so the subject and authority key
        // identifiers are both the SHA-1 hash of the subject public key
        // (RFC 5280, section 4.2.1.2).
        let ski = SubjectKeyIdentifier::try_from(spki.owned_to_ref())
            .context(DeriveKeyIdentifierSnafu)?;
        let aki = AuthorityKeyIdentifier::try_from(spki.owned_to_ref())
            .context(DeriveKeyIdentifierSnafu)?;

        debug!(
            ca.subject = %subject,
            ca.not_after = %validity.not_after,
            ca.not_before = %validity.not_before,
            ca.serial = %serial_number,
            ca.public_key.size = signing_key.key_size(),
            "creating certificate authority"
        );
        let mut builder = CertificateBuilder::new(
            Profile::Manual { issuer: None },
            serial_number,
            validity,
            subject,
            spki,
            signing_key.signing_key(),
        )
        .context(CreateCertificateBuilderSnafu)?;

        builder
            .add_extension(&BasicConstraints {
                ca: true,
                path_len_constraint: Some(0),
            })
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&KeyUsage(KeyUsages::KeyCertSign | KeyUsages::CRLSign))
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&ski)
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&aki)
            .context(AddCertificateExtensionSnafu)?;

        let certificate = builder
            .build::<rsa::pkcs1v15::Signature>()
            .context(BuildCertificateSnafu)?;

        Ok(CertificateAuthority {
            certificate,
            signing_key,
        })
    }
}

/// Creates a new self-signed root CA certificate for the PKCS#1 PEM encoded
/// `key_pem` and returns it as PEM block.
pub fn new_ca_root_pem(
    key_pem: &[u8],
    password: Option<&[u8]>,
) -> Result<String, CreateCertificateAuthorityError> {
    let signing_key = SigningKey::from_pem(key_pem, password).context(LoadSigningKeyPairSnafu)?;
    let ca = CertificateAuthority::builder()
        .signing_key(signing_key)
        .build()?;

    ca.ca_cert_pem().context(SerializeCertificateSnafu)
}
