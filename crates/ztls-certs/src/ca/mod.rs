//! Contains types and functions to create the root certificate authority (CA)
//! and to sign leaf certificates with it.
use std::time::SystemTime;

use snafu::{ResultExt, Snafu, ensure};
use tracing::instrument;
use x509_cert::{
    Certificate,
    der::{
        DateTime, Decode, Encode,
        asn1::{GeneralizedTime, UtcTime},
    },
    name::RdnSequence,
    time::Time,
};

use crate::{
    ErrorKind,
    keys::{self, SigningKey},
    pem::{self, CERTIFICATE_LABEL},
};

mod ca_builder;
mod consts;
mod leaf;
pub use ca_builder::*;
pub use consts::*;
pub use leaf::*;

#[derive(Debug, Snafu)]
pub enum LoadCertificateAuthorityError {
    #[snafu(display("failed to decode CA certificate PEM block"))]
    DecodeCertificatePem { source: pem::Error },

    #[snafu(display("failed to parse CA certificate"))]
    ParseCertificate { source: x509_cert::der::Error },

    #[snafu(display("failed to load CA signing key"))]
    LoadSigningKey { source: keys::Error },

    #[snafu(display("the CA signing key doesn't belong to the CA certificate {subject}"))]
    KeyMismatch { subject: String },
}

impl LoadCertificateAuthorityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DecodeCertificatePem { .. } | Self::ParseCertificate { .. } => {
                ErrorKind::InvalidCaCert
            }
            Self::LoadSigningKey { source } if source.kind() == ErrorKind::DecryptionError => {
                ErrorKind::DecryptionError
            }
            Self::LoadSigningKey { .. } | Self::KeyMismatch { .. } => ErrorKind::InvalidCaKey,
        }
    }
}

/// A certificate authority (CA) which is used to sign leaf certificates.
///
/// Use [`CertificateAuthority::builder`] to create a new self-signed root CA
/// or [`CertificateAuthority::from_pem`] to load an existing one.
#[derive(Clone, Debug)]
pub struct CertificateAuthority {
    certificate: Certificate,
    signing_key: SigningKey,
}

impl CertificateAuthority {
    /// Loads a CA from its PEM encoded certificate and PKCS#1 PEM encoded key.
    ///
    /// The key must belong to the certificate.
    #[instrument(name = "load_certificate_authority", skip_all)]
    pub fn from_pem(
        certificate_pem: &[u8],
        key_pem: &[u8],
        password: Option<&[u8]>,
    ) -> Result<Self, LoadCertificateAuthorityError> {
        let der = pem::decode(certificate_pem, CERTIFICATE_LABEL, None)
            .context(DecodeCertificatePemSnafu)?;
        let certificate = Certificate::from_der(&der).context(ParseCertificateSnafu)?;
        let signing_key = SigningKey::from_pem(key_pem, password).context(LoadSigningKeySnafu)?;

        ensure!(signing_key.matches_certificate(&certificate), KeyMismatchSnafu {
            subject: certificate.tbs_certificate.subject.to_string(),
        });

        Ok(Self {
            certificate,
            signing_key,
        })
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn ca_cert(&self) -> &Certificate {
        &self.certificate
    }

    /// The subject of the CA, which is the issuer of all signed certificates.
    pub fn issuer_name(&self) -> &RdnSequence {
        &self.certificate.tbs_certificate.subject
    }

    /// The CA certificate as PEM block.
    pub fn ca_cert_pem(&self) -> Result<String, x509_cert::der::Error> {
        certificate_to_pem(&self.certificate)
    }
}

/// Encodes a certificate as `CERTIFICATE` PEM block.
pub fn certificate_to_pem(certificate: &Certificate) -> Result<String, x509_cert::der::Error> {
    let der = certificate.to_der()?;
    Ok(pem::encode(CERTIFICATE_LABEL, &der))
}

/// Converts a [`SystemTime`] into an X.509 [`Time`], using UTCTime for dates
/// before 2050 and GeneralizedTime afterwards (RFC 5280, section 4.1.2.5).
pub(crate) fn to_x509_time(time: SystemTime) -> Result<Time, x509_cert::der::Error> {
    let date_time = DateTime::from_system_time(time)?;

    if date_time.year() < 2050 {
        Ok(Time::UtcTime(UtcTime::from_date_time(date_time)?))
    } else {
        Ok(Time::GeneralTime(GeneralizedTime::from_date_time(date_time)))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_utils::{other_key, shared_ca, shared_key};

    #[test]
    fn load_from_pem() {
        let ca = shared_ca();
        let certificate_pem = ca.ca_cert_pem().unwrap();
        let key_pem = shared_key().to_pem().unwrap();

        let loaded =
            CertificateAuthority::from_pem(certificate_pem.as_bytes(), key_pem.as_bytes(), None)
                .unwrap();
        assert_eq!(loaded.ca_cert(), ca.ca_cert());
    }

    #[test]
    fn load_with_foreign_key() {
        let certificate_pem = shared_ca().ca_cert_pem().unwrap();
        let key_pem = other_key().to_pem().unwrap();

        let err =
            CertificateAuthority::from_pem(certificate_pem.as_bytes(), key_pem.as_bytes(), None)
                .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCaKey);
    }

    #[test]
    fn load_broken_certificate() {
        let certificate_pem = pem::encode(CERTIFICATE_LABEL, b"not a certificate");
        let key_pem = shared_key().to_pem().unwrap();

        let err =
            CertificateAuthority::from_pem(certificate_pem.as_bytes(), key_pem.as_bytes(), None)
                .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCaCert);
    }

    #[test]
    fn x509_time_encoding() {
        let now = SystemTime::now();
        assert!(matches!(to_x509_time(now).unwrap(), Time::UtcTime(_)));

        // 2060-01-01T00:00:00Z
        let later = SystemTime::UNIX_EPOCH + Duration::from_secs(2_840_140_800);
        assert!(matches!(to_x509_time(later).unwrap(), Time::GeneralTime(_)));
    }
}
