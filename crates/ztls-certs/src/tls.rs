//! Ready-to-use rustls configurations for mutual TLS between peers whose
//! certificates were signed by the same root CA.
//!
//! Both sides trust only the root CA. The server requires and verifies client
//! certificates, the client verifies the server against the expected server
//! name.
use std::{fmt, io, sync::Arc};

use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{
    TlsAcceptor, TlsConnector, client, server,
    rustls::{
        ClientConfig, RootCertStore, ServerConfig,
        crypto::{CryptoProvider, ring::default_provider},
        pki_types::{
            CertificateDer, InvalidDnsNameError, PrivateKeyDer, PrivatePkcs1KeyDer, ServerName,
        },
        server::{VerifierBuilderError, WebPkiClientVerifier},
        version::{TLS12, TLS13},
    },
};
use tracing::{debug, instrument};

use crate::{
    ErrorKind,
    pem::{self, CERTIFICATE_LABEL, RSA_PRIVATE_KEY_LABEL},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to decode the root certificate PEM block"))]
    DecodeRootCertificate { source: pem::Error },

    #[snafu(display("failed to add the root certificate to the trust store"))]
    AddRootCertificate { source: tokio_rustls::rustls::Error },

    #[snafu(display("failed to decode the certificate PEM block"))]
    DecodeCertificate { source: pem::Error },

    #[snafu(display("failed to decode the private key PEM block"))]
    DecodePrivateKey { source: pem::Error },

    #[snafu(display("{server_name:?} is neither a valid DNS name nor an IP address"))]
    InvalidServerName {
        source: InvalidDnsNameError,
        server_name: String,
    },

    #[snafu(display("failed to set safe TLS protocol versions"))]
    SetSafeTlsProtocolVersions { source: tokio_rustls::rustls::Error },

    #[snafu(display("failed to build the client certificate verifier"))]
    BuildClientVerifier { source: VerifierBuilderError },

    #[snafu(display("the private key doesn't fit the certificate"))]
    InvalidCertifiedKey { source: tokio_rustls::rustls::Error },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DecodeRootCertificate { .. }
            | Error::AddRootCertificate { .. }
            | Error::BuildClientVerifier { .. } => ErrorKind::UntrustedRoot,
            Error::DecodeCertificate { source } => source.kind(),
            Error::DecodePrivateKey { source } => match source.kind() {
                ErrorKind::DecryptionError => ErrorKind::DecryptionError,
                _ => ErrorKind::InvalidKey,
            },
            Error::InvalidServerName { .. } => ErrorKind::InvalidServerName,
            Error::InvalidCertifiedKey { .. } => ErrorKind::InvalidKey,
            Error::SetSafeTlsProtocolVersions { .. } => ErrorKind::Internal,
        }
    }
}

/// The client side of a provisioned mutual TLS setup.
#[derive(Clone)]
pub struct ClientTls {
    pub config: Arc<ClientConfig>,
    pub server_name: ServerName<'static>,

    /// The freshly generated PKCS#1 key of the client.
    pub key_pem: String,

    /// The client certificate, signed by the root CA.
    pub certificate_pem: String,
}

impl ClientTls {
    /// Builds a client configuration which trusts only `root_certificate_pem`,
    /// authenticates itself with the given certificate and key and expects the
    /// server to present a certificate valid for `server_name`.
    #[instrument(
        name = "create_client_tls",
        skip(root_certificate_pem, key_pem, certificate_pem)
    )]
    pub fn new(
        server_name: &str,
        root_certificate_pem: &[u8],
        key_pem: String,
        certificate_pem: String,
    ) -> Result<Self> {
        let server_name = ServerName::try_from(server_name)
            .context(InvalidServerNameSnafu { server_name })?
            .to_owned();
        let roots = root_cert_store(root_certificate_pem)?;
        let (certificate_chain, private_key) = certified_key(&certificate_pem, &key_pem)?;

        let config = ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&TLS12, &TLS13])
            .context(SetSafeTlsProtocolVersionsSnafu)?
            .with_root_certificates(roots)
            .with_client_auth_cert(certificate_chain, private_key)
            .context(InvalidCertifiedKeySnafu)?;

        debug!(?server_name, "created client TLS configuration");
        Ok(Self {
            config: Arc::new(config),
            server_name,
            key_pem,
            certificate_pem,
        })
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(Arc::clone(&self.config))
    }

    /// Performs the TLS handshake as client over `stream`.
    pub async fn connect<IO>(&self, stream: IO) -> io::Result<client::TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        self.connector()
            .connect(self.server_name.clone(), stream)
            .await
    }
}

impl fmt::Debug for ClientTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTls")
            .field("server_name", &self.server_name)
            .field("key_pem", &"<redacted>")
            .field("certificate_pem", &self.certificate_pem)
            .finish_non_exhaustive()
    }
}

/// The server side of a provisioned mutual TLS setup.
#[derive(Clone)]
pub struct ServerTls {
    pub config: Arc<ServerConfig>,

    /// The freshly generated PKCS#1 key of the server.
    pub key_pem: String,

    /// The server certificate, signed by the root CA.
    pub certificate_pem: String,
}

impl ServerTls {
    /// Builds a server configuration which presents the given certificate and
    /// requires clients to present a certificate signed by
    /// `root_certificate_pem`.
    #[instrument(name = "create_server_tls", skip_all)]
    pub fn new(
        root_certificate_pem: &[u8],
        key_pem: String,
        certificate_pem: String,
    ) -> Result<Self> {
        let provider = provider();
        let roots = root_cert_store(root_certificate_pem)?;
        let client_verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
                .build()
                .context(BuildClientVerifierSnafu)?;
        let (certificate_chain, private_key) = certified_key(&certificate_pem, &key_pem)?;

        let config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&TLS12, &TLS13])
            .context(SetSafeTlsProtocolVersionsSnafu)?
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(certificate_chain, private_key)
            .context(InvalidCertifiedKeySnafu)?;

        debug!("created server TLS configuration");
        Ok(Self {
            config: Arc::new(config),
            key_pem,
            certificate_pem,
        })
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::clone(&self.config))
    }

    /// Performs the TLS handshake as server over `stream`.
    pub async fn accept<IO>(&self, stream: IO) -> io::Result<server::TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        self.acceptor().accept(stream).await
    }
}

impl fmt::Debug for ServerTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTls")
            .field("key_pem", &"<redacted>")
            .field("certificate_pem", &self.certificate_pem)
            .finish_non_exhaustive()
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(default_provider())
}

fn root_cert_store(root_certificate_pem: &[u8]) -> Result<RootCertStore> {
    let der = pem::decode(root_certificate_pem, CERTIFICATE_LABEL, None)
        .context(DecodeRootCertificateSnafu)?;

    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(der.to_vec()))
        .context(AddRootCertificateSnafu)?;

    Ok(roots)
}

fn certified_key(
    certificate_pem: &str,
    key_pem: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let certificate = pem::decode(certificate_pem.as_bytes(), CERTIFICATE_LABEL, None)
        .context(DecodeCertificateSnafu)?;
    let key = pem::decode(key_pem.as_bytes(), RSA_PRIVATE_KEY_LABEL, None)
        .context(DecodePrivateKeySnafu)?;

    Ok((
        vec![CertificateDer::from(certificate.to_vec())],
        PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(key.to_vec())),
    ))
}
