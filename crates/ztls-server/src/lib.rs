//! A small REST server which exposes an [`Authority`] over HTTP.
//!
//! | Route | Description |
//! | ----- | ----------- |
//! | `GET /` | Server name and version |
//! | `GET /1/ca.crt.pem` | The PEM encoded root certificate |
//! | `POST /1/new-certificate` | Signs a CSR, rate limited |
//! | `POST /1/new-server-certificate` | Signs a CSR, requires the `X-API-KEY` header |
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ztls_certs::{Authority, config::{AuthorityConfig, GenerateOptions}};
//! use ztls_server::{Options, Server};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AuthorityConfig::generate(GenerateOptions::builder().build())?;
//! let server = Server::new(Arc::new(Authority::new(config)), Options::default());
//! server.run().await?;
//! # Ok(())
//! # }
//! ```
use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use futures_util::{FutureExt as _, pin_mut, select};
use snafu::{ResultExt, Snafu};
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
    sync::oneshot,
};
use tower::ServiceBuilder;
use tower_http::{
    limit::RequestBodyLimitLayer, map_response_body::MapResponseBodyLayer, timeout::TimeoutLayer,
    trace::TraceLayer,
};
use ztls_certs::Authority;

use crate::{
    handlers::AppState,
    middleware::{
        auth::{AccessSecret, require_access_secret},
        rate_limit::{RateLimiter, limit_requests},
    },
};

pub mod constants;
pub mod handlers;
pub mod middleware;
pub mod options;

// Selected re-exports
pub use crate::options::Options;

pub type Result<T, E = ServerError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum ServerError {
    #[snafu(display("failed to bind to socket address {socket_addr}"))]
    BindSocket {
        source: std::io::Error,
        socket_addr: SocketAddr,
    },

    #[snafu(display("failed to create unix signal handler"))]
    CreateSignalHandler { source: std::io::Error },

    #[snafu(display("failed to serve requests"))]
    Serve { source: std::io::Error },
}

/// Serves the routes of an [`Authority`].
pub struct Server {
    router: Router,
    options: Options,
}

impl Server {
    pub fn new(authority: Arc<Authority>, options: Options) -> Self {
        let router = router(authority, &options);
        Self { router, options }
    }

    /// Binds to [`Options::socket_addr`] and serves requests until SIGINT or
    /// SIGTERM is received.
    pub async fn run(self) -> Result<()> {
        let socket_addr = self.options.socket_addr;
        let listener = TcpListener::bind(socket_addr)
            .await
            .context(BindSocketSnafu { socket_addr })?;

        let mut sigint = signal(SignalKind::interrupt()).context(CreateSignalHandlerSnafu)?;
        let mut sigterm = signal(SignalKind::terminate()).context(CreateSignalHandlerSnafu)?;
        tracing::debug!("created unix signal handlers");

        let shutdown_signal = async move {
            select! {
                signal = sigint.recv().fuse() => {
                    if signal.is_some() {
                        tracing::debug!("received SIGINT");
                    }
                },
                signal = sigterm.recv().fuse() => {
                    if signal.is_some() {
                        tracing::debug!("received SIGTERM");
                    }
                },
            };
        };

        self.run_with_listener(listener, shutdown_signal).await
    }

    /// Serves requests on `listener` until `shutdown_signal` completes. Open
    /// connections get [`Options::shutdown_timeout`] to finish afterwards.
    pub async fn run_with_listener<F>(self, listener: TcpListener, shutdown_signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(local_addr) = listener.local_addr() {
            tracing::info!(server.address = %local_addr, "serving REST API");
        }

        let (drain_tx, drain_rx) = oneshot::channel::<()>();
        let server = axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = drain_rx.await;
        })
        .into_future()
        .fuse();
        let shutdown_signal = shutdown_signal.fuse();

        // select requires Future + Unpin
        pin_mut!(server);
        pin_mut!(shutdown_signal);

        select! {
            result = server => return result.context(ServeSnafu),
            () = shutdown_signal => {},
        };

        tracing::info!(
            shutdown.timeout = ?self.options.shutdown_timeout,
            "shutting down, draining open connections"
        );
        let _ = drain_tx.send(());

        match tokio::time::timeout(self.options.shutdown_timeout, server).await {
            Ok(result) => result.context(ServeSnafu),
            Err(_) => {
                tracing::warn!("open connections didn't finish in time, closing them");
                Ok(())
            }
        }
    }
}

/// Creates the [`Router`] with all routes and middlewares.
pub fn router(authority: Arc<Authority>, options: &Options) -> Router {
    let access_secret = AccessSecret::new(authority.access_secret());
    let certificate_limiter =
        RateLimiter::new(options.certificate_rate_limit, options.trust_forwarded_headers);
    let server_certificate_limiter = RateLimiter::new(
        options.server_certificate_rate_limit,
        options.trust_forwarded_headers,
    );

    // The last added layer runs first: the rate limit applies before the
    // access secret is checked.
    let new_certificate = post(handlers::new_certificate)
        .layer(from_fn_with_state(certificate_limiter, limit_requests));
    let new_server_certificate = post(handlers::new_certificate)
        .layer(from_fn_with_state(access_secret, require_access_secret))
        .layer(from_fn_with_state(server_certificate_limiter, limit_requests));

    let service_builder = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(options.request_timeout))
        .layer(MapResponseBodyLayer::new(axum::body::Body::new))
        .layer(RequestBodyLimitLayer::new(options.body_limit));

    Router::new()
        .route("/", get(handlers::root))
        .route("/1/ca.crt.pem", get(handlers::ca_certificate))
        .route("/1/new-certificate", new_certificate)
        .route("/1/new-server-certificate", new_server_certificate)
        .layer(service_builder)
        .with_state(AppState { authority })
}

#[cfg(test)]
mod tests {
    use std::{sync::OnceLock, time::Duration};

    use axum::{
        body::{Body, to_bytes},
        extract::connect_info::MockConnectInfo,
        http::{Request, StatusCode, header},
        response::Response,
    };
    use tower::ServiceExt;
    use ztls_certs::{
        AuthorityConfig, CsrSubject,
        config::GenerateOptions,
        csr::new_csr_pem,
        keys::new_key_pem,
    };

    use super::*;
    use crate::middleware::rate_limit::RateLimit;

    const TEST_KEY_SIZE: usize = 2048;

    fn config() -> &'static AuthorityConfig {
        static CONFIG: OnceLock<AuthorityConfig> = OnceLock::new();
        CONFIG.get_or_init(|| {
            AuthorityConfig::generate(
                GenerateOptions::builder()
                    .key_size(TEST_KEY_SIZE)
                    .access_secret("s3cr3t")
                    .build(),
            )
            .expect("failed to generate test configuration")
        })
    }

    fn csr_pem() -> &'static str {
        static CSR: OnceLock<String> = OnceLock::new();
        CSR.get_or_init(|| {
            let key = new_key_pem(TEST_KEY_SIZE).expect("failed to create test key");
            new_csr_pem(&CsrSubject::new("svc"), key.as_bytes(), None)
                .expect("failed to create test CSR")
        })
    }

    fn test_router(options: &Options) -> Router {
        router(Arc::new(Authority::new(config().clone())), options)
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 1234))))
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn post_csr(uri: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(body.into())
            .unwrap()
    }

    #[tokio::test]
    async fn root_shows_version() {
        let response = test_router(&Options::default())
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_string(response).await,
            format!("ztls REST SERVER - {}", env!("CARGO_PKG_VERSION"))
        );
    }

    #[tokio::test]
    async fn serves_ca_certificate() {
        let response = test_router(&Options::default())
            .oneshot(
                Request::builder()
                    .uri("/1/ca.crt.pem")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            handlers::PEM_CONTENT_TYPE
        );
        assert_eq!(body_string(response).await, config().root_certificate);
    }

    #[tokio::test]
    async fn signs_json_and_plain_requests() {
        let router = test_router(&Options::default());

        let json = serde_json::json!({ "csr": csr_pem() }).to_string();
        let request = Request::builder()
            .method("POST")
            .uri("/1/new-certificate")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            body_string(response)
                .await
                .starts_with("-----BEGIN CERTIFICATE-----")
        );

        let response = router
            .oneshot(post_csr("/1/new-certificate", csr_pem().to_owned()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-remaining"], "2");
    }

    #[tokio::test]
    async fn rejects_malformed_csr() {
        let response = test_router(&Options::default())
            .oneshot(post_csr("/1/new-certificate", "short"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rate_limits_new_certificate() {
        let options = Options::builder()
            .certificate_rate_limit(RateLimit::new(1, Duration::from_secs(60)))
            .build();
        let router = test_router(&options);

        let first = router
            .clone()
            .oneshot(post_csr("/1/new-certificate", "short"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::BAD_REQUEST);

        let second = router
            .oneshot(post_csr("/1/new-certificate", "short"))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_string(second).await, "too many requests");
    }

    #[tokio::test]
    async fn server_certificate_requires_access_secret() {
        let router = test_router(&Options::default());

        let response = router
            .clone()
            .oneshot(post_csr("/1/new-server-certificate", csr_pem().to_owned()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_string(response).await,
            "invalid/missing header X-API-KEY"
        );

        let request = Request::builder()
            .method("POST")
            .uri("/1/new-server-certificate")
            .header("X-API-KEY", "s3cr3t")
            .body(Body::from(csr_pem().to_owned()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "50");
    }

    #[tokio::test]
    async fn rejects_large_bodies() {
        let options = Options::builder().body_limit(16).build();
        let response = test_router(&options)
            .oneshot(post_csr("/1/new-certificate", vec![b'A'; 64]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn unconfigured_authority_is_unavailable() {
        let mut config = config().clone();
        config.root_key = new_key_pem(TEST_KEY_SIZE).unwrap();

        let response = router(Arc::new(Authority::new(config)), &Options::default())
            .oneshot(
                Request::builder()
                    .uri("/1/ca.crt.pem")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn shuts_down_on_signal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::new(
            Arc::new(Authority::new(config().clone())),
            Options::default(),
        );

        tokio::time::timeout(
            Duration::from_secs(10),
            server.run_with_listener(listener, async {}),
        )
        .await
        .expect("server must stop after the shutdown signal")
        .unwrap();
    }
}
