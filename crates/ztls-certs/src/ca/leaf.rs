use std::time::SystemTime;

use const_oid::db::rfc5280::{ID_KP_CLIENT_AUTH, ID_KP_SERVER_AUTH};
use rand_core::{OsRng, RngCore};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::{debug, instrument};
use x509_cert::{
    Certificate,
    builder::{Builder, CertificateBuilder, Profile},
    der::{asn1::Ia5String, referenced::OwnedToRef},
    ext::pkix::{
        AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages,
        SubjectAltName, SubjectKeyIdentifier, name::GeneralName,
    },
    serial_number::SerialNumber,
    time::Validity,
};

use super::{
    CLOCK_SKEW_ALLOWANCE, CertificateAuthority, LoadCertificateAuthorityError,
    certificate_to_pem, to_x509_time,
};
use crate::{ErrorKind, csr::CertificateSigningRequest};

/// Defines all error variants which can occur when signing a certificate
#[derive(Debug, Snafu)]
pub enum SignCertificateError {
    #[snafu(display("failed to load the CA"))]
    LoadCertificateAuthority {
        source: LoadCertificateAuthorityError,
    },

    #[snafu(display("failed to parse the certificate signing request"))]
    ParseRequest { source: crate::csr::Error },

    #[snafu(display("serial number {serial} is negative"))]
    NegativeSerial { serial: i64 },

    #[snafu(display("failed to create serial number"))]
    CreateSerialNumber { source: x509_cert::der::Error },

    #[snafu(display("failed to parse validity"))]
    ParseValidity { source: x509_cert::der::Error },

    #[snafu(display(
        "the requested expiry {expires_at:?} lies before the start of the validity {not_before:?}"
    ))]
    ExpiryBeforeStart {
        expires_at: SystemTime,
        not_before: SystemTime,
    },

    #[snafu(display("failed to derive key identifier"))]
    DeriveKeyIdentifier { source: x509_cert::der::Error },

    #[snafu(display(
        "failed to parse subject alternative DNS name \"{subject_alternative_dns_name}\" as a Ia5 string"
    ))]
    ParseSubjectAlternativeDnsName {
        subject_alternative_dns_name: String,
        source: x509_cert::der::Error,
    },

    #[snafu(display("failed to create certificate builder"))]
    CreateCertificateBuilder { source: x509_cert::builder::Error },

    #[snafu(display("failed to add certificate extension"))]
    AddCertificateExtension { source: x509_cert::builder::Error },

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: x509_cert::builder::Error },

    #[snafu(display("failed to serialize certificate as PEM"))]
    SerializeCertificate { source: x509_cert::der::Error },
}

impl SignCertificateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LoadCertificateAuthority { source } => source.kind(),
            Self::ParseRequest { source } => source.kind(),
            Self::DeriveKeyIdentifier { .. } | Self::ParseSubjectAlternativeDnsName { .. } => {
                ErrorKind::InvalidCsr
            }
            _ => ErrorKind::Internal,
        }
    }
}

impl CertificateAuthority {
    /// Signs a leaf certificate for the already verified `csr`.
    ///
    /// - The subject is copied verbatim from the CSR, so are the requested
    ///   DNS names and IP addresses.
    /// - The certificate becomes valid [`CLOCK_SKEW_ALLOWANCE`] in the past
    ///   and expires at `expires_at`, but never after the CA itself. Without
    ///   `expires_at` the expiry of the CA is used.
    /// - A `serial` of `0` is replaced by a random 128-bit serial number,
    ///   other serials must be positive.
    ///
    /// The certificate can be used for TLS client and server authentication,
    /// because it includes [`ID_KP_CLIENT_AUTH`] and [`ID_KP_SERVER_AUTH`] in
    /// the extended key usage extension.
    #[instrument(
        name = "sign_certificate",
        skip(self, csr),
        fields(subject = %csr.subject()),
    )]
    pub fn sign(
        &self,
        csr: &CertificateSigningRequest,
        serial: i64,
        expires_at: Option<SystemTime>,
    ) -> Result<Certificate, SignCertificateError> {
        let serial_number = serial_number(serial)?;

        let now = SystemTime::now();
        let not_before = to_x509_time(now - CLOCK_SKEW_ALLOWANCE).context(ParseValiditySnafu)?;
        let ca_not_after = self.ca_cert().tbs_certificate.validity.not_after;
        let not_after = match expires_at {
            Some(expires_at) if expires_at < ca_not_after.to_system_time() => {
                to_x509_time(expires_at).context(ParseValiditySnafu)?
            }
            _ => ca_not_after,
        };

        ensure!(
            not_after.to_system_time() > not_before.to_system_time(),
            ExpiryBeforeStartSnafu {
                expires_at: not_after.to_system_time(),
                not_before: not_before.to_system_time(),
            }
        );
        let validity = Validity {
            not_before,
            not_after,
        };

        let spki = csr.public_key_info().clone();
        let ski = SubjectKeyIdentifier::try_from(spki.owned_to_ref())
            .context(DeriveKeyIdentifierSnafu)?;
        let aki = AuthorityKeyIdentifier::try_from(
            self.ca_cert()
                .tbs_certificate
                .subject_public_key_info
                .owned_to_ref(),
        )
        .context(DeriveKeyIdentifierSnafu)?;

        let san_dns = csr.dns_names().iter().map(|dns_name| {
            Ok(GeneralName::DnsName(Ia5String::new(dns_name).with_context(
                |_| ParseSubjectAlternativeDnsNameSnafu {
                    subject_alternative_dns_name: dns_name.clone(),
                },
            )?))
        });
        let san_ips = csr
            .ip_addresses()
            .iter()
            .copied()
            .map(GeneralName::from)
            .map(Result::Ok);
        let sans = san_dns
            .chain(san_ips)
            .collect::<Result<Vec<_>, SignCertificateError>>()?;

        debug!(
            certificate.subject = %csr.subject(),
            certificate.not_after = %validity.not_after,
            certificate.not_before = %validity.not_before,
            certificate.serial = %serial_number,
            certificate.san.dns_names = ?csr.dns_names(),
            certificate.san.ip_addresses = ?csr.ip_addresses(),
            certificate.signed_by.issuer = %self.issuer_name(),
            "signing certificate"
        );
        let mut builder = CertificateBuilder::new(
            Profile::Manual {
                issuer: Some(self.issuer_name().clone()),
            },
            serial_number,
            validity,
            csr.subject().clone(),
            spki,
            self.signing_key().signing_key(),
        )
        .context(CreateCertificateBuilderSnafu)?;

        builder
            .add_extension(&BasicConstraints {
                ca: false,
                path_len_constraint: None,
            })
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&KeyUsage(
                KeyUsages::DigitalSignature
                    | KeyUsages::KeyEncipherment
                    | KeyUsages::DataEncipherment
                    | KeyUsages::KeyAgreement,
            ))
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&ExtendedKeyUsage(vec![
                ID_KP_SERVER_AUTH,
                ID_KP_CLIENT_AUTH,
            ]))
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&ski)
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&aki)
            .context(AddCertificateExtensionSnafu)?;

        if !sans.is_empty() {
            builder
                .add_extension(&SubjectAltName(sans))
                .context(AddCertificateExtensionSnafu)?;
        }

        builder
            .build::<rsa::pkcs1v15::Signature>()
            .context(BuildCertificateSnafu)
    }

    /// Same as [`CertificateAuthority::sign`], but returns the certificate as
    /// PEM block.
    pub fn sign_pem(
        &self,
        csr: &CertificateSigningRequest,
        serial: i64,
        expires_at: Option<SystemTime>,
    ) -> Result<String, SignCertificateError> {
        let certificate = self.sign(csr, serial, expires_at)?;
        certificate_to_pem(&certificate).context(SerializeCertificateSnafu)
    }
}

/// Signs the PEM encoded `csr_pem` with the PEM encoded root certificate and
/// key.
pub fn sign_csr_pem(
    root_certificate_pem: &[u8],
    root_key_pem: &[u8],
    root_key_password: Option<&[u8]>,
    csr_pem: &[u8],
    serial: i64,
    expires_at: Option<SystemTime>,
) -> Result<String, SignCertificateError> {
    let csr = CertificateSigningRequest::from_pem(csr_pem).context(ParseRequestSnafu)?;
    let ca = CertificateAuthority::from_pem(root_certificate_pem, root_key_pem, root_key_password)
        .context(LoadCertificateAuthoritySnafu)?;

    ca.sign_pem(&csr, serial, expires_at)
}

fn serial_number(serial: i64) -> Result<SerialNumber, SignCertificateError> {
    if serial == 0 {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);

        return positive_serial_number(&bytes).context(CreateSerialNumberSnafu);
    }

    let serial = u64::try_from(serial)
        .ok()
        .context(NegativeSerialSnafu { serial })?;

    positive_serial_number(&serial.to_be_bytes()).context(CreateSerialNumberSnafu)
}

/// Encodes big-endian `bytes` as a positive DER integer, stripping leading
/// zeros and prepending a zero byte if the sign bit would be set.
fn positive_serial_number(bytes: &[u8]) -> Result<SerialNumber, x509_cert::der::Error> {
    let mut bytes: Vec<u8> = bytes.iter().copied().skip_while(|byte| *byte == 0).collect();
    if bytes.first().is_none_or(|byte| byte & 0x80 != 0) {
        bytes.insert(0, 0);
    }

    SerialNumber::new(&bytes)
}
