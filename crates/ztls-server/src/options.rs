//! Contains available options to configure the [`Server`](crate::Server).
use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use crate::{
    constants::{
        DEFAULT_BODY_LIMIT, DEFAULT_CERTIFICATE_RATE_LIMIT, DEFAULT_RATE_LIMIT_PERIOD,
        DEFAULT_REQUEST_TIMEOUT, DEFAULT_SERVER_CERTIFICATE_RATE_LIMIT, DEFAULT_SHUTDOWN_TIMEOUT,
        DEFAULT_SOCKET_ADDR,
    },
    middleware::rate_limit::RateLimit,
};

/// Specifies available server options.
///
/// To construct [`Options`], use the [`OptionsBuilder`] (see
/// [`Options::builder()`]) or [`Options::default()`].
///
/// ### Example
///
/// ```
/// use ztls_server::Options;
///
/// let options = Options::builder()
///     .bind_port(12345)
///     .trust_forwarded_headers(true)
///     .build();
///
/// assert_eq!(options.socket_addr.port(), 12345);
/// ```
#[derive(Clone, Debug)]
pub struct Options {
    /// The default socket address the server binds to, see
    /// [`DEFAULT_SOCKET_ADDR`].
    pub socket_addr: SocketAddr,

    /// Whether the caller IP used for rate limiting is taken from the
    /// `X-Forwarded-For` and `X-Real-IP` headers. Only enable this behind a
    /// reverse proxy which sets them.
    pub trust_forwarded_headers: bool,

    /// Maximum size of request bodies in bytes.
    pub body_limit: usize,

    /// Maximum duration of a single request.
    pub request_timeout: Duration,

    /// Time open connections get to finish after a shutdown signal.
    pub shutdown_timeout: Duration,

    /// Rate limit of `POST /1/new-certificate`.
    pub certificate_rate_limit: RateLimit,

    /// Rate limit of `POST /1/new-server-certificate`.
    pub server_certificate_rate_limit: RateLimit,
}

impl Default for Options {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Options {
    /// Returns the default [`OptionsBuilder`] which allows to selectively
    /// customize the options.
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::default()
    }
}

/// The [`OptionsBuilder`] which allows to selectively customize the server
/// [`Options`].
///
/// Usually, this struct is not constructed manually, but instead by calling
/// [`Options::builder()`] or [`OptionsBuilder::default()`].
#[derive(Debug, Default)]
pub struct OptionsBuilder {
    socket_addr: Option<SocketAddr>,
    trust_forwarded_headers: bool,
    body_limit: Option<usize>,
    request_timeout: Option<Duration>,
    shutdown_timeout: Option<Duration>,
    certificate_rate_limit: Option<RateLimit>,
    server_certificate_rate_limit: Option<RateLimit>,
}

impl OptionsBuilder {
    /// Sets the socket address the server binds to.
    pub fn socket_addr(mut self, socket_addr: impl Into<SocketAddr>) -> Self {
        self.socket_addr = Some(socket_addr.into());
        self
    }

    /// Sets the IP address of the socket address the server binds to. The
    /// port defaults to `8080`.
    pub fn bind_ip(mut self, bind_ip: impl Into<IpAddr>) -> Self {
        let addr = self.socket_addr.get_or_insert(DEFAULT_SOCKET_ADDR);
        addr.set_ip(bind_ip.into());
        self
    }

    /// Sets the port of the socket address the server binds to.
    pub fn bind_port(mut self, bind_port: u16) -> Self {
        let addr = self.socket_addr.get_or_insert(DEFAULT_SOCKET_ADDR);
        addr.set_port(bind_port);
        self
    }

    pub fn trust_forwarded_headers(mut self, trust_forwarded_headers: bool) -> Self {
        self.trust_forwarded_headers = trust_forwarded_headers;
        self
    }

    pub fn body_limit(mut self, body_limit: usize) -> Self {
        self.body_limit = Some(body_limit);
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = Some(request_timeout);
        self
    }

    pub fn shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = Some(shutdown_timeout);
        self
    }

    pub fn certificate_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.certificate_rate_limit = Some(rate_limit);
        self
    }

    pub fn server_certificate_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.server_certificate_rate_limit = Some(rate_limit);
        self
    }

    /// Builds the final [`Options`] by using default values for any not
    /// explicitly set option.
    pub fn build(self) -> Options {
        Options {
            socket_addr: self.socket_addr.unwrap_or(DEFAULT_SOCKET_ADDR),
            trust_forwarded_headers: self.trust_forwarded_headers,
            body_limit: self.body_limit.unwrap_or(DEFAULT_BODY_LIMIT),
            request_timeout: self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            shutdown_timeout: self.shutdown_timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT),
            certificate_rate_limit: self.certificate_rate_limit.unwrap_or_else(|| {
                RateLimit::new(DEFAULT_CERTIFICATE_RATE_LIMIT, DEFAULT_RATE_LIMIT_PERIOD)
            }),
            server_certificate_rate_limit: self.server_certificate_rate_limit.unwrap_or_else(
                || {
                    RateLimit::new(
                        DEFAULT_SERVER_CERTIFICATE_RATE_LIMIT,
                        DEFAULT_RATE_LIMIT_PERIOD,
                    )
                },
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn default_options() {
        let options = Options::default();

        assert_eq!(options.socket_addr, DEFAULT_SOCKET_ADDR);
        assert!(!options.trust_forwarded_headers);
        assert_eq!(options.body_limit, 2 * 1024 * 1024);
        assert_eq!(options.certificate_rate_limit.max_requests, 4);
        assert_eq!(options.server_certificate_rate_limit.max_requests, 50);
    }

    #[test]
    fn bind_ip_keeps_default_port() {
        let options = Options::builder().bind_ip(Ipv4Addr::LOCALHOST).build();

        assert_eq!(options.socket_addr, SocketAddr::from(([127, 0, 0, 1], 8080)));
    }
}
