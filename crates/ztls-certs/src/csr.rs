//! Creation and verification of PKCS#10 certificate signing requests (CSRs).
//!
//! A CSR binds a [`CsrSubject`] to a public key and is self-signed with the
//! matching private key. The subject is encoded field by field in a fixed
//! order (country, province, locality, street address, postal code,
//! organization, organizational unit, common name). Repeated values keep the
//! order in which they were supplied and each value becomes its own relative
//! distinguished name. Requested IP addresses and DNS names are carried as a
//! SubjectAltName extension request.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use const_oid::{
    AssociatedOid, ObjectIdentifier,
    db::rfc5912::{
        SHA_256_WITH_RSA_ENCRYPTION, SHA_384_WITH_RSA_ENCRYPTION, SHA_512_WITH_RSA_ENCRYPTION,
    },
};
use rsa::{RsaPublicKey, pkcs8::DecodePublicKey};
use sha2::{Sha256, Sha384, Sha512};
use signature::Verifier;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::{debug, instrument};
use x509_cert::{
    attr::AttributeTypeAndValue,
    builder::{Builder, RequestBuilder},
    der::{
        Any, Decode, Encode,
        asn1::{Ia5String, PrintableStringRef, SetOfVec, Utf8StringRef},
    },
    ext::{
        Extension,
        pkix::{SubjectAltName, name::GeneralName},
    },
    name::{Name, RdnSequence, RelativeDistinguishedName},
    request::{CertReq, ExtensionReq},
    spki::SubjectPublicKeyInfoOwned,
};

use crate::{
    ErrorKind,
    keys::{self, SigningKey},
    pem::{self, CERTIFICATE_REQUEST_LABEL},
};

pub const COUNTRY_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.6");
pub const STATE_OR_PROVINCE_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.8");
pub const LOCALITY_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.7");
pub const STREET_ADDRESS: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.9");
pub const POSTAL_CODE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.17");
pub const ORGANIZATION_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");
pub const ORGANIZATIONAL_UNIT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.11");
pub const COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("the subject requires a common name"))]
    MissingCommonName,

    #[snafu(display("failed to parse {ip_address:?} as IP address"))]
    ParseIpAddress {
        source: std::net::AddrParseError,
        ip_address: String,
    },

    #[snafu(display("failed to load the request signing key"))]
    LoadKey { source: keys::Error },

    #[snafu(display("failed to encode subject attribute value {value:?}"))]
    EncodeAttribute {
        source: x509_cert::der::Error,
        value: String,
    },

    #[snafu(display("failed to parse subject alternative DNS name {dns_name:?} as a Ia5 string"))]
    ParseDnsName {
        source: x509_cert::der::Error,
        dns_name: String,
    },

    #[snafu(display("failed to create request builder"))]
    CreateRequestBuilder { source: x509_cert::builder::Error },

    #[snafu(display("failed to add request extension"))]
    AddRequestExtension { source: x509_cert::builder::Error },

    #[snafu(display("failed to build certificate signing request"))]
    BuildRequest { source: x509_cert::builder::Error },

    #[snafu(display("failed to serialize certificate signing request as DER"))]
    SerializeRequest { source: x509_cert::der::Error },

    #[snafu(display("failed to decode certificate signing request PEM block"))]
    DecodePem { source: pem::Error },

    #[snafu(display("failed to parse certificate signing request"))]
    ParseRequest { source: x509_cert::der::Error },

    #[snafu(display("certificate signing request doesn't contain an RSA public key"))]
    UnsupportedPublicKey { source: x509_cert::spki::Error },

    #[snafu(display("unsupported certificate signing request signature algorithm {oid}"))]
    UnsupportedSignatureAlgorithm { oid: ObjectIdentifier },

    #[snafu(display("certificate signing request signature is malformed"))]
    MalformedSignature,

    #[snafu(display("failed to verify certificate signing request signature"))]
    VerifySignature { source: signature::Error },

    #[snafu(display("failed to decode requested extensions"))]
    DecodeExtensions { source: x509_cert::der::Error },

    #[snafu(display("requested IP address has invalid length {length}"))]
    InvalidIpAddressLength { length: usize },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ParseIpAddress { .. } => ErrorKind::InvalidIp,
            Error::LoadKey { source } => source.kind(),
            Error::DecodePem { source } => source.kind(),
            Error::CreateRequestBuilder { .. }
            | Error::AddRequestExtension { .. }
            | Error::BuildRequest { .. }
            | Error::SerializeRequest { .. } => ErrorKind::Internal,
            Error::MissingCommonName
            | Error::EncodeAttribute { .. }
            | Error::ParseDnsName { .. }
            | Error::ParseRequest { .. }
            | Error::UnsupportedPublicKey { .. }
            | Error::UnsupportedSignatureAlgorithm { .. }
            | Error::MalformedSignature
            | Error::VerifySignature { .. }
            | Error::DecodeExtensions { .. }
            | Error::InvalidIpAddressLength { .. } => ErrorKind::InvalidCsr,
        }
    }
}

/// Describes the subject of a certificate signing request.
///
/// Only the common name is required. All other fields may hold any number of
/// values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CsrSubject {
    pub common_name: String,
    pub country: Vec<String>,
    pub province: Vec<String>,
    pub locality: Vec<String>,
    pub street_address: Vec<String>,
    pub postal_code: Vec<String>,
    pub organization: Vec<String>,
    pub organizational_unit: Vec<String>,

    /// Literal IP addresses. A list with a single empty string counts as
    /// empty.
    pub ip_addresses: Vec<String>,
    pub dns_names: Vec<String>,
}

impl CsrSubject {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            ..Default::default()
        }
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country.push(country.into());
        self
    }

    pub fn with_province(mut self, province: impl Into<String>) -> Self {
        self.province.push(province.into());
        self
    }

    pub fn with_locality(mut self, locality: impl Into<String>) -> Self {
        self.locality.push(locality.into());
        self
    }

    pub fn with_street_address(mut self, street_address: impl Into<String>) -> Self {
        self.street_address.push(street_address.into());
        self
    }

    pub fn with_postal_code(mut self, postal_code: impl Into<String>) -> Self {
        self.postal_code.push(postal_code.into());
        self
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization.push(organization.into());
        self
    }

    pub fn with_organizational_unit(mut self, organizational_unit: impl Into<String>) -> Self {
        self.organizational_unit.push(organizational_unit.into());
        self
    }

    pub fn with_ip_address(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_addresses.push(ip_address.into());
        self
    }

    pub fn with_dns_name(mut self, dns_name: impl Into<String>) -> Self {
        self.dns_names.push(dns_name.into());
        self
    }

    /// Adds the common name as DNS name (or IP address, if it parses as one)
    /// unless it is already listed. TLS peers verify names against the
    /// subject alternative names only.
    pub fn with_common_name_as_alt_name(mut self) -> Self {
        match self.common_name.parse::<IpAddr>() {
            Ok(ip_address) => {
                let listed = self
                    .ip_addresses
                    .iter()
                    .any(|listed| listed.parse::<IpAddr>().is_ok_and(|listed| listed == ip_address));
                if !listed {
                    self.ip_addresses.retain(|ip_address| !ip_address.is_empty());
                    self.ip_addresses.push(self.common_name.clone());
                }
            }
            Err(_) => {
                let listed = self
                    .dns_names
                    .iter()
                    .any(|dns_name| dns_name.eq_ignore_ascii_case(&self.common_name));
                if !listed && !self.common_name.is_empty() {
                    self.dns_names.push(self.common_name.clone());
                }
            }
        }
        self
    }

    /// Encodes the descriptor as an X.509 name.
    pub fn to_name(&self) -> Result<Name> {
        ensure!(!self.common_name.is_empty(), MissingCommonNameSnafu);

        let fields: [(ObjectIdentifier, &[String]); 7] = [
            (COUNTRY_NAME, &self.country),
            (STATE_OR_PROVINCE_NAME, &self.province),
            (LOCALITY_NAME, &self.locality),
            (STREET_ADDRESS, &self.street_address),
            (POSTAL_CODE, &self.postal_code),
            (ORGANIZATION_NAME, &self.organization),
            (ORGANIZATIONAL_UNIT_NAME, &self.organizational_unit),
        ];

        let mut rdns = fields
            .iter()
            .flat_map(|(oid, values)| values.iter().map(|value| rdn(*oid, value)))
            .collect::<Result<Vec<_>>>()?;
        rdns.push(rdn(COMMON_NAME, &self.common_name)?);

        Ok(RdnSequence(rdns))
    }

    /// Parses all IP addresses of the descriptor.
    pub fn parsed_ip_addresses(&self) -> Result<Vec<IpAddr>> {
        parse_ip_addresses(&self.ip_addresses)
    }
}

/// Parses literal IP addresses. A single empty string is treated as "no IP
/// addresses".
pub fn parse_ip_addresses(ip_addresses: &[String]) -> Result<Vec<IpAddr>> {
    if let [ip_address] = ip_addresses
        && ip_address.is_empty()
    {
        return Ok(Vec::new());
    }

    ip_addresses
        .iter()
        .map(|ip_address| {
            ip_address
                .parse()
                .context(ParseIpAddressSnafu { ip_address })
        })
        .collect()
}

fn rdn(oid: ObjectIdentifier, value: &str) -> Result<RelativeDistinguishedName> {
    let encoded = match PrintableStringRef::new(value) {
        Ok(printable) => Any::encode_from(&printable),
        Err(_) => Utf8StringRef::new(value).and_then(|utf8| Any::encode_from(&utf8)),
    }
    .context(EncodeAttributeSnafu { value })?;

    let attribute = AttributeTypeAndValue {
        oid,
        value: encoded,
    };

    SetOfVec::try_from(vec![attribute])
        .map(RelativeDistinguishedName)
        .context(EncodeAttributeSnafu { value })
}

/// Builds a new PEM encoded CSR for `subject`, signed by the PKCS#1 PEM
/// encoded `key_pem`.
#[instrument(skip(key_pem, password), fields(subject.common_name = subject.common_name))]
pub fn new_csr_pem(subject: &CsrSubject, key_pem: &[u8], password: Option<&[u8]>) -> Result<String> {
    let key = SigningKey::from_pem(key_pem, password).context(LoadKeySnafu)?;
    let request = build_request(subject, &key)?;
    let der = request.to_der().context(SerializeRequestSnafu)?;

    Ok(pem::encode(CERTIFICATE_REQUEST_LABEL, &der))
}

/// Builds a new CSR for `subject`, signed by `key`.
pub fn build_request(subject: &CsrSubject, key: &SigningKey) -> Result<CertReq> {
    let name = subject.to_name()?;
    let ip_addresses = subject.parsed_ip_addresses()?;

    let san_dns = subject.dns_names.iter().map(|dns_name| {
        Ok(GeneralName::DnsName(
            Ia5String::new(dns_name).context(ParseDnsNameSnafu { dns_name })?,
        ))
    });
    let san_ips = ip_addresses
        .iter()
        .copied()
        .map(GeneralName::from)
        .map(Result::Ok);
    let sans = san_dns.chain(san_ips).collect::<Result<Vec<_>>>()?;

    debug!(
        csr.subject = %name,
        csr.san.dns_names = ?subject.dns_names,
        csr.san.ip_addresses = ?ip_addresses,
        csr.public_key.size = key.key_size(),
        "creating certificate signing request"
    );
    let mut builder =
        RequestBuilder::new(name, key.signing_key()).context(CreateRequestBuilderSnafu)?;

    if !sans.is_empty() {
        builder
            .add_extension(&SubjectAltName(sans))
            .context(AddRequestExtensionSnafu)?;
    }

    builder
        .build::<rsa::pkcs1v15::Signature>()
        .context(BuildRequestSnafu)
}

/// A parsed CSR whose self-signature has been verified.
#[derive(Clone, Debug)]
pub struct CertificateSigningRequest {
    request: CertReq,
    dns_names: Vec<String>,
    ip_addresses: Vec<IpAddr>,
}

impl CertificateSigningRequest {
    /// Decodes a `CERTIFICATE REQUEST` PEM block, verifies the signature and
    /// extracts the requested subject alternative names.
    #[instrument(name = "parse_certificate_signing_request", skip_all)]
    pub fn from_pem(input: &[u8]) -> Result<Self> {
        let der = pem::decode(input, CERTIFICATE_REQUEST_LABEL, None).context(DecodePemSnafu)?;
        Self::from_der(&der)
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        let request = CertReq::from_der(der).context(ParseRequestSnafu)?;
        verify_signature(&request)?;

        let (dns_names, ip_addresses) = requested_alt_names(&request)?;

        Ok(Self {
            request,
            dns_names,
            ip_addresses,
        })
    }

    /// The subject exactly as encoded by the requester.
    pub fn subject(&self) -> &Name {
        &self.request.info.subject
    }

    pub fn public_key_info(&self) -> &SubjectPublicKeyInfoOwned {
        &self.request.info.public_key
    }

    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    pub fn ip_addresses(&self) -> &[IpAddr] {
        &self.ip_addresses
    }

    pub fn request(&self) -> &CertReq {
        &self.request
    }
}

fn verify_signature(request: &CertReq) -> Result<()> {
    let spki_der = request
        .info
        .public_key
        .to_der()
        .context(ParseRequestSnafu)?;
    let public_key =
        RsaPublicKey::from_public_key_der(&spki_der).context(UnsupportedPublicKeySnafu)?;

    let message = request.info.to_der().context(ParseRequestSnafu)?;
    let signature = request
        .signature
        .as_bytes()
        .context(MalformedSignatureSnafu)?;
    let signature =
        rsa::pkcs1v15::Signature::try_from(signature).context(VerifySignatureSnafu)?;

    let oid = request.algorithm.oid;
    let verified = if oid == SHA_256_WITH_RSA_ENCRYPTION {
        rsa::pkcs1v15::VerifyingKey::<Sha256>::new(public_key).verify(&message, &signature)
    } else if oid == SHA_384_WITH_RSA_ENCRYPTION {
        rsa::pkcs1v15::VerifyingKey::<Sha384>::new(public_key).verify(&message, &signature)
    } else if oid == SHA_512_WITH_RSA_ENCRYPTION {
        rsa::pkcs1v15::VerifyingKey::<Sha512>::new(public_key).verify(&message, &signature)
    } else {
        return UnsupportedSignatureAlgorithmSnafu { oid }.fail();
    };

    verified.context(VerifySignatureSnafu)
}

/// Collects the DNS names and IP addresses of all requested SubjectAltName
/// extensions. Other name types are ignored.
fn requested_alt_names(request: &CertReq) -> Result<(Vec<String>, Vec<IpAddr>)> {
    let mut dns_names = Vec::new();
    let mut ip_addresses = Vec::new();

    let requested = request
        .info
        .attributes
        .iter()
        .filter(|attribute| attribute.oid == ExtensionReq::OID)
        .flat_map(|attribute| attribute.values.iter());

    for value in requested {
        let value = value.to_der().context(DecodeExtensionsSnafu)?;
        let extensions = Vec::<Extension>::from_der(&value).context(DecodeExtensionsSnafu)?;

        for extension in extensions
            .iter()
            .filter(|extension| extension.extn_id == SubjectAltName::OID)
        {
            let san = SubjectAltName::from_der(extension.extn_value.as_bytes())
                .context(DecodeExtensionsSnafu)?;

            for name in san.0 {
                match name {
                    GeneralName::DnsName(dns_name) => dns_names.push(dns_name.as_str().to_owned()),
                    GeneralName::IpAddress(ip_address) => {
                        ip_addresses.push(bytes_to_ip_addr(ip_address.as_bytes())?);
                    }
                    _ => {}
                }
            }
        }
    }

    Ok((dns_names, ip_addresses))
}

fn bytes_to_ip_addr(bytes: &[u8]) -> Result<IpAddr> {
    if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
        return Ok(IpAddr::V4(Ipv4Addr::from(octets)));
    }

    <[u8; 16]>::try_from(bytes)
        .map(|octets| IpAddr::V6(Ipv6Addr::from(octets)))
        .ok()
        .context(InvalidIpAddressLengthSnafu {
            length: bytes.len(),
        })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::test_utils::shared_key;

    fn key_pem() -> String {
        shared_key().to_pem().unwrap()
    }

    fn attribute_values(name: &Name) -> Vec<(ObjectIdentifier, String)> {
        name.0
            .iter()
            .flat_map(|rdn| rdn.0.iter())
            .map(|atv| {
                (
                    atv.oid,
                    String::from_utf8(atv.value.value().to_vec()).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn subject_order_is_preserved() {
        let subject = CsrSubject::new("example.com")
            .with_country("US")
            .with_organization("Acme")
            .with_organization("Acme Subsidiary");
        let csr = new_csr_pem(&subject, key_pem().as_bytes(), None).unwrap();
        let parsed = CertificateSigningRequest::from_pem(csr.as_bytes()).unwrap();

        assert_eq!(attribute_values(parsed.subject()), vec![
            (COUNTRY_NAME, "US".to_owned()),
            (ORGANIZATION_NAME, "Acme".to_owned()),
            (ORGANIZATION_NAME, "Acme Subsidiary".to_owned()),
            (COMMON_NAME, "example.com".to_owned()),
        ]);
    }

    #[test]
    fn non_printable_values_use_utf8() {
        let subject = CsrSubject::new("svc").with_locality("São Paulo");
        let name = subject.to_name().unwrap();

        assert_eq!(attribute_values(&name), vec![
            (LOCALITY_NAME, "São Paulo".to_owned()),
            (COMMON_NAME, "svc".to_owned()),
        ]);
    }

    #[test]
    fn alt_names_are_requested() {
        let subject = CsrSubject::new("svc")
            .with_dns_name("svc.internal")
            .with_dns_name("localhost")
            .with_ip_address("10.0.0.1")
            .with_ip_address("fe80::42");
        let csr = new_csr_pem(&subject, key_pem().as_bytes(), None).unwrap();
        let parsed = CertificateSigningRequest::from_pem(csr.as_bytes()).unwrap();

        assert_eq!(parsed.dns_names(), ["svc.internal", "localhost"]);
        assert_eq!(parsed.ip_addresses(), [
            "10.0.0.1".parse::<IpAddr>().unwrap(),
            "fe80::42".parse::<IpAddr>().unwrap()
        ]);
    }

    #[test]
    fn single_empty_ip_means_none() {
        let subject = CsrSubject::new("svc").with_ip_address("");
        assert!(subject.parsed_ip_addresses().unwrap().is_empty());

        let csr = new_csr_pem(&subject, key_pem().as_bytes(), None).unwrap();
        let parsed = CertificateSigningRequest::from_pem(csr.as_bytes()).unwrap();
        assert!(parsed.ip_addresses().is_empty());
    }

    #[rstest]
    #[case::hostname("not-an-ip")]
    #[case::octets("300.1.1.1")]
    #[case::trailing_space("10.0.0.1 ")]
    fn invalid_ip_address(#[case] ip_address: &str) {
        let subject = CsrSubject::new("svc")
            .with_ip_address("10.0.0.2")
            .with_ip_address(ip_address);
        let err = new_csr_pem(&subject, key_pem().as_bytes(), None).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidIp);
    }

    #[test]
    fn common_name_is_required() {
        let err = new_csr_pem(&CsrSubject::default(), key_pem().as_bytes(), None).unwrap_err();
        assert!(matches!(err, Error::MissingCommonName));
    }

    #[test]
    fn invalid_key() {
        let err = new_csr_pem(&CsrSubject::new("svc"), b"nope", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidKey);
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let request = build_request(&CsrSubject::new("svc"), shared_key()).unwrap();
        let mut der = request.to_der().unwrap();
        let last = der.len() - 1;
        der[last] ^= 0xff;

        let csr = pem::encode(CERTIFICATE_REQUEST_LABEL, &der);
        let err = CertificateSigningRequest::from_pem(csr.as_bytes()).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidCsr);
    }

    #[test]
    fn wrong_label_is_rejected() {
        let request = build_request(&CsrSubject::new("svc"), shared_key()).unwrap();
        let csr = pem::encode("NEW CERTIFICATE REQUEST", &request.to_der().unwrap());
        let err = CertificateSigningRequest::from_pem(csr.as_bytes()).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::LabelMismatch);
    }

    #[test]
    fn garbage_der_is_rejected() {
        let csr = pem::encode(CERTIFICATE_REQUEST_LABEL, b"garbage");
        let err = CertificateSigningRequest::from_pem(csr.as_bytes()).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidCsr);
    }

    #[rstest]
    #[case::dns("svc", &["svc.internal"], &[], &["svc.internal", "svc"], &[])]
    #[case::dns_listed("svc", &["SVC"], &[], &["SVC"], &[])]
    #[case::ip("10.0.0.1", &[], &[""], &[], &["10.0.0.1"])]
    #[case::ip_listed("10.0.0.1", &[], &["10.0.0.1"], &[], &["10.0.0.1"])]
    fn common_name_as_alt_name(
        #[case] common_name: &str,
        #[case] dns_names: &[&str],
        #[case] ip_addresses: &[&str],
        #[case] expected_dns_names: &[&str],
        #[case] expected_ip_addresses: &[&str],
    ) {
        let subject = CsrSubject {
            common_name: common_name.to_owned(),
            dns_names: dns_names.iter().map(ToString::to_string).collect(),
            ip_addresses: ip_addresses.iter().map(ToString::to_string).collect(),
            ..Default::default()
        }
        .with_common_name_as_alt_name();

        assert_eq!(subject.dns_names, expected_dns_names);
        assert_eq!(subject.ip_addresses, expected_ip_addresses);
    }
}
