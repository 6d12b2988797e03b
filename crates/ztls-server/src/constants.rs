//! Contains various constant definitions, mostly for default addresses, limits
//! and timeouts.
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

/// The default HTTP port `8080`
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// The default IP address [`Ipv4Addr::UNSPECIFIED`] (`0.0.0.0`) the server binds to,
/// which represents binding on all network addresses.
pub const DEFAULT_LISTEN_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// The default socket address `0.0.0.0:8080` the server binds to.
pub const DEFAULT_SOCKET_ADDR: SocketAddr = SocketAddr::new(DEFAULT_LISTEN_ADDRESS, DEFAULT_HTTP_PORT);

/// Request bodies larger than 2 MiB are rejected.
pub const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

/// Requests taking longer than this are answered with `408 Request Timeout`.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(45);

/// Time open connections get to drain after a shutdown signal was received.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// The window all rate limits are counted in.
pub const DEFAULT_RATE_LIMIT_PERIOD: Duration = Duration::from_secs(60);

/// Requests per window and caller to `POST /1/new-certificate`.
pub const DEFAULT_CERTIFICATE_RATE_LIMIT: u32 = 4;

/// Requests per window and caller to `POST /1/new-server-certificate`.
pub const DEFAULT_SERVER_CERTIFICATE_RATE_LIMIT: u32 = 50;

/// Header carrying the access secret.
pub const ACCESS_SECRET_HEADER: &str = "x-api-key";
