//! A client for the REST API of a ztls server.
//!
//! The [`Client`] fetches the root certificate and requests signed
//! certificates. [`provision_client`] and [`provision_server`] build on it to
//! create ready-to-use mutual TLS configurations whose certificates come from
//! the remote authority.
//!
//! ```no_run
//! use ztls_certs::CsrSubject;
//! use ztls_client::{Client, provision_server};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new("http://127.0.0.1:8080")?.with_api_key("s3cr3t");
//! let tls = provision_server(&client, &CsrSubject::new("api.localhost")).await?;
//! # Ok(())
//! # }
//! ```
use std::{fmt, time::Duration};

use axum::{
    body::{Body, to_bytes},
    http::{
        Method, Request, StatusCode, Uri, header,
        request::Builder,
        uri::{InvalidUri, Scheme},
    },
};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tokio::{net::TcpStream, time::error::Elapsed};
use tracing::{debug, instrument, warn};
use ztls_certs::{config::ACCESS_SECRET_HEADER, keys::DEFAULT_KEY_SIZE};

pub use crate::provision::{Credentials, provision_client, provision_server, request_credentials};

pub mod provision;

pub const CA_CERTIFICATE_PATH: &str = "/1/ca.crt.pem";
pub const NEW_CERTIFICATE_PATH: &str = "/1/new-certificate";
pub const NEW_SERVER_CERTIFICATE_PATH: &str = "/1/new-server-certificate";

/// Responses larger than 1 MiB are rejected.
const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{endpoint:?} is not a valid endpoint"))]
    InvalidEndpoint {
        source: InvalidUri,
        endpoint: String,
    },

    #[snafu(display("the endpoint {endpoint:?} must use the http scheme"))]
    UnsupportedScheme { endpoint: String },

    #[snafu(display("the endpoint {endpoint:?} lacks a host"))]
    MissingHost { endpoint: String },

    #[snafu(display("failed to connect to {address}"))]
    Connect {
        source: std::io::Error,
        address: String,
    },

    #[snafu(display("failed to establish the HTTP connection"))]
    Handshake { source: hyper::Error },

    #[snafu(display("failed to encode the request body"))]
    EncodeRequest { source: serde_json::Error },

    #[snafu(display("failed to build the request"))]
    BuildRequest { source: axum::http::Error },

    #[snafu(display("failed to send the request"))]
    SendRequest { source: hyper::Error },

    #[snafu(display("failed to read the response body"))]
    ReadResponse { source: axum::Error },

    #[snafu(display("the response body is not valid UTF-8"))]
    InvalidUtf8 { source: std::string::FromUtf8Error },

    #[snafu(display("the request didn't finish within {timeout:?}"))]
    TimedOut { source: Elapsed, timeout: Duration },

    #[snafu(display("the server responded with {status}: {body}"))]
    UnexpectedStatus { status: StatusCode, body: String },
}

#[derive(Serialize)]
struct NewCertificateRequest<'a> {
    csr: &'a str,
}

/// Talks to a ztls server at an `http://host[:port][/prefix]` endpoint.
///
/// With an API key set, certificates are requested from
/// `POST /1/new-server-certificate` and every request carries the key in the
/// `X-API-KEY` header. Without one, `POST /1/new-certificate` is used.
#[derive(Clone)]
pub struct Client {
    host: String,
    port: u16,
    authority: String,
    base_path: String,
    api_key: Option<String>,
    key_size: usize,
    timeout: Duration,
}

impl Client {
    pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080";
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(endpoint: &str) -> Result<Self> {
        let uri: Uri = endpoint
            .parse()
            .context(InvalidEndpointSnafu { endpoint })?;
        ensure!(
            uri.scheme() == Some(&Scheme::HTTP),
            UnsupportedSchemeSnafu { endpoint }
        );
        let authority = uri.authority().context(MissingHostSnafu { endpoint })?;

        // IPv6 hosts are bracketed in URIs but not in socket addresses
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();

        Ok(Self {
            host,
            port: authority.port_u16().unwrap_or(80),
            authority: authority.to_string(),
            base_path: uri.path().trim_end_matches('/').to_owned(),
            api_key: None,
            key_size: DEFAULT_KEY_SIZE,
            timeout: Self::DEFAULT_TIMEOUT,
        })
    }

    /// An empty key counts as no key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into()).filter(|api_key| !api_key.is_empty());
        self
    }

    /// Size of the RSA keys created while provisioning.
    pub fn with_key_size(mut self, key_size: usize) -> Self {
        self.key_size = key_size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Fetches the PEM encoded root certificate.
    #[instrument(skip(self), fields(server.address = %self.authority))]
    pub async fn ca_certificate(&self) -> Result<String> {
        let request = self
            .request(Method::GET, CA_CERTIFICATE_PATH)
            .body(Body::empty())
            .context(BuildRequestSnafu)?;

        self.send(request).await
    }

    /// Submits the PEM encoded `csr_pem` and returns the signed certificate.
    #[instrument(skip_all, fields(server.address = %self.authority))]
    pub async fn new_certificate(&self, csr_pem: &str) -> Result<String> {
        let path = if self.api_key.is_some() {
            NEW_SERVER_CERTIFICATE_PATH
        } else {
            NEW_CERTIFICATE_PATH
        };
        let body = serde_json::to_vec(&NewCertificateRequest { csr: csr_pem })
            .context(EncodeRequestSnafu)?;
        let request = self
            .request(Method::POST, path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .context(BuildRequestSnafu)?;

        self.send(request).await
    }

    fn request(&self, method: Method, path: &str) -> Builder {
        let builder = Request::builder()
            .method(method)
            .uri(format!("{}{path}", self.base_path))
            .header(header::HOST, &self.authority);

        match &self.api_key {
            Some(api_key) => builder.header(ACCESS_SECRET_HEADER, api_key),
            None => builder,
        }
    }

    async fn send(&self, request: Request<Body>) -> Result<String> {
        tokio::time::timeout(self.timeout, self.send_without_timeout(request))
            .await
            .context(TimedOutSnafu {
                timeout: self.timeout,
            })?
    }

    async fn send_without_timeout(&self, request: Request<Body>) -> Result<String> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .context(ConnectSnafu {
                address: &self.authority,
            })?;
        let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .context(HandshakeSnafu)?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(
                    error = &err as &dyn std::error::Error,
                    "HTTP connection failed"
                );
            }
        });

        let path = request.uri().path().to_owned();
        let response = sender.send_request(request).await.context(SendRequestSnafu)?;
        let status = response.status();
        debug!(%path, %status, "received response");

        let body = to_bytes(Body::new(response.into_body()), MAX_RESPONSE_SIZE)
            .await
            .context(ReadResponseSnafu)?;
        let body = String::from_utf8(body.to_vec()).context(InvalidUtf8Snafu)?;

        if status != StatusCode::OK {
            return UnexpectedStatusSnafu {
                status,
                body: body.trim(),
            }
            .fail();
        }

        Ok(body)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("authority", &self.authority)
            .field("base_path", &self.base_path)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("key_size", &self.key_size)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::{
        net::{Ipv4Addr, SocketAddr},
        sync::{Arc, OnceLock},
    };

    use tokio::net::TcpListener;
    use ztls_certs::{Authority, AuthorityConfig, config::GenerateOptions};
    use ztls_server::Options;

    pub const TEST_KEY_SIZE: usize = 2048;
    pub const ACCESS_SECRET: &str = "s3cr3t";

    pub fn config() -> &'static AuthorityConfig {
        static CONFIG: OnceLock<AuthorityConfig> = OnceLock::new();
        CONFIG.get_or_init(|| {
            AuthorityConfig::generate(
                GenerateOptions::builder()
                    .key_size(TEST_KEY_SIZE)
                    .access_secret(ACCESS_SECRET)
                    .build(),
            )
            .expect("failed to generate test configuration")
        })
    }

    /// Serves the REST routes on a random local port and returns the
    /// endpoint.
    pub async fn serve() -> String {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("failed to bind test listener");
        let address = listener.local_addr().expect("listener has no address");

        let router = ztls_server::router(
            Arc::new(Authority::new(config().clone())),
            &Options::default(),
        );
        tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .expect("test server failed");
        });

        format!("http://{address}")
    }
}
