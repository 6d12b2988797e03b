//! The runtime of the certificate authority.
//!
//! An [`Authority`] is created from an [`AuthorityConfig`] and decodes the
//! root material lazily on first use. The outcome of that decode, success or
//! failure, is cached for the lifetime of the authority: a broken
//! configuration never crashes the process, every operation which needs the
//! root fails with [`ErrorKind::NotConfigured`] instead.
use std::{
    sync::{Arc, OnceLock},
    time::SystemTime,
};

use snafu::{ResultExt, Snafu, ensure};
use tracing::{error, info, instrument};

use crate::{
    ErrorKind,
    ca::{CertificateAuthority, DEFAULT_CERTIFICATE_VALIDITY, SignCertificateError},
    config::{self, AuthorityConfig},
    csr::{self, CertificateSigningRequest, CsrSubject},
    keys::{self, DEFAULT_KEY_SIZE},
    serial::{RandomSerialSource, SerialNumberSource},
    tls::{self, ClientTls, ServerTls},
};

/// Inputs shorter than this can't possibly be a PEM encoded CSR.
pub const MIN_CSR_PEM_LENGTH: usize = 10;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("input of {length} bytes is too short to be a PEM encoded CSR"))]
    InputTooShort { length: usize },

    #[snafu(display("the authority is not configured: {reason}"))]
    NotConfigured { reason: String },

    #[snafu(display("failed to decode the authority configuration"))]
    DecodeConfig { source: config::Error },

    #[snafu(display("failed to parse the certificate signing request"))]
    ParseRequest { source: csr::Error },

    #[snafu(display("failed to build a certificate signing request"))]
    BuildRequest { source: csr::Error },

    #[snafu(display("failed to sign the certificate"))]
    SignCertificate { source: SignCertificateError },

    #[snafu(display("failed to create a new key"))]
    CreateKey { source: keys::Error },

    #[snafu(display("failed to create the TLS configuration"))]
    CreateTlsConfig { source: tls::Error },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InputTooShort { .. } => ErrorKind::InvalidEncoding,
            Error::NotConfigured { .. } => ErrorKind::NotConfigured,
            Error::DecodeConfig { source } => source.kind(),
            Error::ParseRequest { source } | Error::BuildRequest { source } => source.kind(),
            Error::SignCertificate { source } => source.kind(),
            Error::CreateKey { source } => source.kind(),
            Error::CreateTlsConfig { source } => source.kind(),
        }
    }
}

/// The outcome of decoding the root material.
#[derive(Debug)]
pub enum AuthorityState {
    /// The root certificate or key could not be decoded, `reason` describes
    /// why.
    Unconfigured { reason: String },

    /// The root material is usable.
    Ready(CertificateAuthority),
}

/// Signs certificates and provisions TLS configurations with the root of its
/// [`AuthorityConfig`].
///
/// All operations take `&self`, so an authority can be shared (for example
/// in an [`Arc`]) and used from any number of threads at once.
#[derive(Debug)]
pub struct Authority {
    config: AuthorityConfig,
    state: OnceLock<AuthorityState>,
    serial_source: Arc<dyn SerialNumberSource>,
    key_size: usize,
}

impl Authority {
    /// Creates an authority with a wall-clock seeded [`RandomSerialSource`].
    pub fn new(config: AuthorityConfig) -> Self {
        Self {
            config,
            state: OnceLock::new(),
            serial_source: Arc::new(RandomSerialSource::new()),
            key_size: DEFAULT_KEY_SIZE,
        }
    }

    /// Decodes a `ZTLSCONFIG` PEM block and creates an authority from it.
    pub fn from_config_pem(input: &[u8]) -> Result<Self> {
        let config = AuthorityConfig::from_pem(input).context(DecodeConfigSnafu)?;
        Ok(Self::new(config))
    }

    /// Replaces the serial number source.
    pub fn with_serial_source(mut self, serial_source: Arc<dyn SerialNumberSource>) -> Self {
        self.serial_source = serial_source;
        self
    }

    /// Sets the size of keys created by [`Authority::new_key`] and the
    /// provisioning functions. Defaults to [`DEFAULT_KEY_SIZE`].
    pub fn with_key_size(mut self, key_size: usize) -> Self {
        self.key_size = key_size;
        self
    }

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    /// The secret callers present to access privileged operations.
    pub fn access_secret(&self) -> &str {
        &self.config.access_secret
    }

    /// Returns the decoded root material, decoding it on first access.
    pub fn state(&self) -> &AuthorityState {
        self.state.get_or_init(|| {
            match CertificateAuthority::from_pem(
                self.config.root_certificate.as_bytes(),
                self.config.root_key.as_bytes(),
                self.config.root_key_password_bytes(),
            ) {
                Ok(ca) => {
                    info!(
                        ca.subject = %ca.issuer_name(),
                        ca.not_after = %ca.ca_cert().tbs_certificate.validity.not_after,
                        "loaded root certificate authority"
                    );
                    AuthorityState::Ready(ca)
                }
                Err(err) => {
                    error!(
                        error = &err as &dyn std::error::Error,
                        error.kind = %err.kind(),
                        "failed to load root certificate authority"
                    );
                    AuthorityState::Unconfigured {
                        reason: err.to_string(),
                    }
                }
            }
        })
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state(), AuthorityState::Ready(_))
    }

    fn ca(&self) -> Result<&CertificateAuthority> {
        match self.state() {
            AuthorityState::Ready(ca) => Ok(ca),
            AuthorityState::Unconfigured { reason } => NotConfiguredSnafu { reason }.fail(),
        }
    }

    /// The configured root certificate as PEM block.
    pub fn ca_certificate_pem(&self) -> Result<&str> {
        self.ca()?;
        Ok(&self.config.root_certificate)
    }

    /// Signs a PEM encoded CSR with the next serial number. The certificate
    /// expires after [`DEFAULT_CERTIFICATE_VALIDITY`], but never after the
    /// root.
    #[instrument(name = "sign_csr", skip_all, fields(csr.length = csr_pem.len()))]
    pub fn sign_csr_pem(&self, csr_pem: &[u8]) -> Result<String> {
        ensure!(csr_pem.len() >= MIN_CSR_PEM_LENGTH, InputTooShortSnafu {
            length: csr_pem.len()
        });

        let csr = CertificateSigningRequest::from_pem(csr_pem).context(ParseRequestSnafu)?;
        let ca = self.ca()?;

        let expires_at = SystemTime::now() + DEFAULT_CERTIFICATE_VALIDITY;
        ca.sign_pem(&csr, self.serial_source.next_serial(), Some(expires_at))
            .context(SignCertificateSnafu)
    }

    /// Builds a CSR for `subject` with the PKCS#1 PEM encoded `key_pem` and
    /// signs it like [`Authority::sign_csr_pem`].
    pub fn sign_descriptor(&self, subject: &CsrSubject, key_pem: &[u8]) -> Result<String> {
        let csr_pem = csr::new_csr_pem(subject, key_pem, None).context(BuildRequestSnafu)?;
        self.sign_csr_pem(csr_pem.as_bytes())
    }

    /// Generates a new PKCS#1 PEM encoded RSA key.
    pub fn new_key(&self) -> Result<String> {
        keys::new_key_pem(self.key_size).context(CreateKeySnafu)
    }

    /// Creates a fresh key and certificate for `subject` and returns a client
    /// TLS configuration which trusts the root and expects the server to be
    /// `server_name`.
    #[instrument(
        name = "provision_client_tls",
        skip(self, subject),
        fields(subject.common_name = subject.common_name)
    )]
    pub fn provision_client(&self, server_name: &str, subject: &CsrSubject) -> Result<ClientTls> {
        let (key_pem, certificate_pem) = self.provision(subject)?;

        ClientTls::new(
            server_name,
            self.config.root_certificate.as_bytes(),
            key_pem,
            certificate_pem,
        )
        .context(CreateTlsConfigSnafu)
    }

    /// Creates a fresh key and certificate for `subject` and returns a server
    /// TLS configuration which requires clients to present a certificate
    /// signed by the root.
    #[instrument(
        name = "provision_server_tls",
        skip(self, subject),
        fields(subject.common_name = subject.common_name)
    )]
    pub fn provision_server(&self, subject: &CsrSubject) -> Result<ServerTls> {
        let (key_pem, certificate_pem) = self.provision(subject)?;

        ServerTls::new(
            self.config.root_certificate.as_bytes(),
            key_pem,
            certificate_pem,
        )
        .context(CreateTlsConfigSnafu)
    }

    fn provision(&self, subject: &CsrSubject) -> Result<(String, String)> {
        // Fail before spending time on key generation
        self.ca()?;

        let subject = subject.clone().with_common_name_as_alt_name();
        let key_pem = self.new_key()?;
        let certificate_pem = self.sign_descriptor(&subject, key_pem.as_bytes())?;

        Ok((key_pem, certificate_pem))
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, thread};

    use rstest::rstest;
    use tokio::io::duplex;
    use x509_cert::{Certificate, der::Decode};

    use super::*;
    use crate::{
        pem::{self, CERTIFICATE_LABEL},
        serial::SequentialSerialSource,
        test_utils::{TEST_KEY_SIZE, other_key, shared_ca, shared_key},
    };

    fn config() -> AuthorityConfig {
        AuthorityConfig {
            root_certificate: shared_ca().ca_cert_pem().unwrap(),
            root_key: shared_key().to_pem().unwrap(),
            root_key_password: None,
            access_secret: "secret".to_owned(),
        }
    }

    fn authority() -> Authority {
        Authority::new(config()).with_key_size(TEST_KEY_SIZE)
    }

    fn parse_certificate(certificate_pem: &str) -> Certificate {
        let der = pem::decode(certificate_pem.as_bytes(), CERTIFICATE_LABEL, None).unwrap();
        Certificate::from_der(&der).unwrap()
    }

    fn csr_pem(common_name: &str) -> String {
        csr::new_csr_pem(
            &CsrSubject::new(common_name),
            other_key().to_pem().unwrap().as_bytes(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn sign_raw_csr() {
        let authority =
            authority().with_serial_source(Arc::new(SequentialSerialSource::starting_at(5)));

        let certificate_pem = authority.sign_csr_pem(csr_pem("svc").as_bytes()).unwrap();
        let certificate = parse_certificate(&certificate_pem);
        assert_eq!(certificate.tbs_certificate.serial_number.as_bytes(), [5]);
        assert_eq!(&certificate.tbs_certificate.issuer, shared_ca().issuer_name());
        assert!(authority.is_ready());
    }

    #[test]
    fn subject_fidelity() {
        let subject = CsrSubject::new("example.com")
            .with_country("US")
            .with_organization("Acme");
        let certificate_pem = authority()
            .sign_descriptor(&subject, other_key().to_pem().unwrap().as_bytes())
            .unwrap();

        let subject_name = parse_certificate(&certificate_pem).tbs_certificate.subject;
        assert_eq!(subject_name, subject.to_name().unwrap());

        let oids: Vec<_> = subject_name
            .0
            .iter()
            .map(|rdn| rdn.0.iter().next().unwrap().oid)
            .collect();
        assert_eq!(oids, [
            csr::COUNTRY_NAME,
            csr::ORGANIZATION_NAME,
            csr::COMMON_NAME
        ]);
    }

    #[rstest]
    #[case::empty(b"", ErrorKind::InvalidEncoding)]
    #[case::too_short(b"-----BEG", ErrorKind::InvalidEncoding)]
    #[case::garbage(b"this is certainly not PEM", ErrorKind::InvalidEncoding)]
    #[case::certificate(
        b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n",
        ErrorKind::LabelMismatch
    )]
    #[case::broken_request(
        b"-----BEGIN CERTIFICATE REQUEST-----\nAAAA\n-----END CERTIFICATE REQUEST-----\n",
        ErrorKind::InvalidCsr
    )]
    fn reject_malformed_input(#[case] input: &[u8], #[case] expected: ErrorKind) {
        let err = authority().sign_csr_pem(input).unwrap_err();
        assert_eq!(err.kind(), expected);
    }

    #[test]
    fn unconfigured_authority() {
        let mut config = config();
        config.root_key = other_key().to_pem().unwrap();
        let authority = Authority::new(config).with_key_size(TEST_KEY_SIZE);

        let err = authority.sign_csr_pem(csr_pem("svc").as_bytes()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConfigured);
        assert!(matches!(authority.state(), AuthorityState::Unconfigured { .. }));

        let err = authority.ca_certificate_pem().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConfigured);

        let err = authority.provision_server(&CsrSubject::new("svc")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConfigured);
    }

    #[test]
    fn ca_certificate_is_the_configured_one() {
        let authority = authority();
        assert_eq!(authority.ca_certificate_pem().unwrap(), config().root_certificate);
        assert_eq!(authority.access_secret(), "secret");
    }

    fn serial_of(certificate_pem: &str) -> i64 {
        parse_certificate(certificate_pem)
            .tbs_certificate
            .serial_number
            .as_bytes()
            .iter()
            .fold(0, |serial, byte| (serial << 8) | i64::from(*byte))
    }

    #[test]
    fn concurrent_signing_gives_unique_serials() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 1_250;

        let authority = Arc::new(authority());
        let csr_pem = Arc::new(csr_pem("svc"));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let authority = Arc::clone(&authority);
                let csr_pem = Arc::clone(&csr_pem);
                thread::spawn(move || {
                    (0..PER_THREAD)
                        .map(|_| serial_of(&authority.sign_csr_pem(csr_pem.as_bytes()).unwrap()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let serials: Vec<_> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        assert_eq!(serials.len(), 10_000);

        let unique: HashSet<_> = serials.iter().copied().collect();
        assert_eq!(unique.len(), serials.len());
    }

    #[test]
    fn new_key_has_configured_size() {
        let key_pem = authority().new_key().unwrap();
        let key = keys::SigningKey::from_pem(key_pem.as_bytes(), None).unwrap();

        assert_eq!(key.key_size(), TEST_KEY_SIZE);
    }

    #[tokio::test]
    async fn auto_provisioned_mutual_trust() {
        let authority = authority();
        let server = authority.provision_server(&CsrSubject::new("svc")).unwrap();
        let client = authority
            .provision_client("svc", &CsrSubject::new("cli"))
            .unwrap();

        // The key and certificate form a valid pair
        let key = keys::SigningKey::from_pem(client.key_pem.as_bytes(), None).unwrap();
        assert!(key.matches_certificate(&parse_certificate(&client.certificate_pem)));

        let (client_io, server_io) = duplex(64 * 1024);
        let (client_stream, server_stream) =
            tokio::join!(client.connect(client_io), server.accept(server_io));

        client_stream.expect("client handshake failed");
        let server_stream = server_stream.expect("server handshake failed");
        assert!(server_stream.get_ref().1.peer_certificates().is_some());
    }

    #[test]
    fn provision_client_with_invalid_server_name() {
        let err = authority()
            .provision_client("no spaces allowed", &CsrSubject::new("cli"))
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidServerName);
    }

    #[test]
    fn from_config_pem() {
        let encoded = config().to_pem([("Generator", "tests")]).unwrap();
        let authority = Authority::from_config_pem(encoded.as_bytes()).unwrap();
        assert!(authority.is_ready());

        let err = Authority::from_config_pem(b"nope").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidEncoding);
    }
}
