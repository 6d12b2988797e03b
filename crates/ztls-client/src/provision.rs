//! Mutual TLS configurations with certificates issued by a remote ztls server.
//!
//! Works like [`Authority::provision_client`] and
//! [`Authority::provision_server`], except that the root certificate is
//! fetched from the server and the CSR is signed there.
//!
//! [`Authority::provision_client`]: ztls_certs::Authority::provision_client
//! [`Authority::provision_server`]: ztls_certs::Authority::provision_server
use std::fmt;

use snafu::{ResultExt, Snafu};
use tokio::task::{JoinError, spawn_blocking};
use tracing::{debug, instrument};
use ztls_certs::{
    CsrSubject, csr, keys,
    tls::{self, ClientTls, ServerTls},
};

use crate::Client;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to fetch the root certificate"))]
    FetchCaCertificate { source: crate::Error },

    #[snafu(display("failed to generate the private key"))]
    CreateKey { source: keys::Error },

    #[snafu(display("failed to join the key generation task"))]
    JoinKeyTask { source: JoinError },

    #[snafu(display("failed to build the certificate signing request"))]
    BuildRequest { source: csr::Error },

    #[snafu(display("failed to request the certificate"))]
    RequestCertificate { source: crate::Error },

    #[snafu(display("failed to create the TLS configuration"))]
    CreateTlsConfig { source: tls::Error },
}

/// A fresh key, the certificate the server issued for it and the root
/// certificate that signed it. All PEM encoded.
#[derive(Clone)]
pub struct Credentials {
    pub ca_certificate_pem: String,
    pub key_pem: String,
    pub certificate_pem: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ca_certificate_pem", &self.ca_certificate_pem)
            .field("key_pem", &"<redacted>")
            .field("certificate_pem", &self.certificate_pem)
            .finish()
    }
}

/// Creates a key of [`Client::key_size`] bits and has the server sign a
/// certificate for `subject`. The common name is added as alternative name.
#[instrument(skip_all, fields(subject.common_name = subject.common_name))]
pub async fn request_credentials(client: &Client, subject: &CsrSubject) -> Result<Credentials> {
    // Fail before spending time on key generation
    let ca_certificate_pem = client
        .ca_certificate()
        .await
        .context(FetchCaCertificateSnafu)?;

    let key_size = client.key_size();
    let key_pem = spawn_blocking(move || keys::new_key_pem(key_size))
        .await
        .context(JoinKeyTaskSnafu)?
        .context(CreateKeySnafu)?;

    let subject = subject.clone().with_common_name_as_alt_name();
    let csr_pem =
        csr::new_csr_pem(&subject, key_pem.as_bytes(), None).context(BuildRequestSnafu)?;
    let certificate_pem = client
        .new_certificate(&csr_pem)
        .await
        .context(RequestCertificateSnafu)?;

    debug!("received certificate");
    Ok(Credentials {
        ca_certificate_pem,
        key_pem,
        certificate_pem,
    })
}

/// Returns a client TLS configuration which trusts the server's root and
/// expects the peer to be `server_name`.
pub async fn provision_client(
    client: &Client,
    server_name: &str,
    subject: &CsrSubject,
) -> Result<ClientTls> {
    let credentials = request_credentials(client, subject).await?;

    ClientTls::new(
        server_name,
        credentials.ca_certificate_pem.as_bytes(),
        credentials.key_pem,
        credentials.certificate_pem,
    )
    .context(CreateTlsConfigSnafu)
}

/// Returns a server TLS configuration which requires clients to present a
/// certificate signed by the server's root.
pub async fn provision_server(client: &Client, subject: &CsrSubject) -> Result<ServerTls> {
    let credentials = request_credentials(client, subject).await?;

    ServerTls::new(
        credentials.ca_certificate_pem.as_bytes(),
        credentials.key_pem,
        credentials.certificate_pem,
    )
    .context(CreateTlsConfigSnafu)
}
