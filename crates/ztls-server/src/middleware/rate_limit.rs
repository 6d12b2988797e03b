//! Fixed window rate limiting per caller IP address.
//!
//! Every route gets its own [`RateLimiter`], so the counters are effectively
//! kept per caller and route.
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// The body returned once a caller exceeded its limit.
pub const TOO_MANY_REQUESTS_MESSAGE: &str = "too many requests";

/// Expired windows are purged once more callers than this are tracked.
const PURGE_THRESHOLD: usize = 1024;

/// At most `max_requests` requests are allowed per `period`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimit {
    pub max_requests: u32,
    pub period: Duration,
}

impl RateLimit {
    pub const fn new(max_requests: u32, period: Duration) -> Self {
        Self {
            max_requests,
            period,
        }
    }
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

/// The outcome of [`RateLimiter::check`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allowed { remaining: u32 },
    Limited,
}

/// Counts requests per caller IP address in fixed windows.
///
/// Cloning is cheap, all clones share the same counters.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    trust_forwarded_headers: bool,
    windows: Arc<Mutex<HashMap<IpAddr, Window>>>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit, trust_forwarded_headers: bool) -> Self {
        Self {
            limit,
            trust_forwarded_headers,
            windows: Arc::default(),
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Records a request of `caller` at `now`.
    pub fn check(&self, caller: IpAddr, now: Instant) -> Decision {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);

        if windows.len() > PURGE_THRESHOLD {
            let period = self.limit.period;
            windows.retain(|_, window| now.saturating_duration_since(window.started) < period);
        }

        let window = windows.entry(caller).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.saturating_duration_since(window.started) >= self.limit.period {
            window.started = now;
            window.count = 0;
        }

        if window.count >= self.limit.max_requests {
            return Decision::Limited;
        }

        window.count += 1;
        Decision::Allowed {
            remaining: self.limit.max_requests - window.count,
        }
    }

    /// Determines the IP address of the caller of `request`.
    ///
    /// The `X-Forwarded-For` (first entry) and `X-Real-IP` headers are only
    /// considered if forwarded headers are trusted, the peer address of the
    /// connection is used otherwise.
    pub fn caller_ip(&self, request: &Request) -> IpAddr {
        if self.trust_forwarded_headers {
            if let Some(ip) = forwarded_ip(request.headers()) {
                return ip;
            }
        }

        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |ConnectInfo(addr)| {
                addr.ip()
            })
    }
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let forwarded_for = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|value| value.trim().parse().ok());

    forwarded_for.or_else(|| {
        headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
    })
}

/// Answers with `429 Too Many Requests` once the caller exceeded the limit of
/// the route. All responses carry the `X-RateLimit-Limit` and
/// `X-RateLimit-Remaining` headers.
pub async fn limit_requests(
    State(limiter): State<RateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    let caller = limiter.caller_ip(&request);
    let decision = limiter.check(caller, Instant::now());

    let (mut response, remaining) = match decision {
        Decision::Allowed { remaining } => (next.run(request).await, remaining),
        Decision::Limited => {
            tracing::debug!(
                client.address = %caller,
                http.path = %request.uri().path(),
                "rate limit exceeded"
            );
            (
                (StatusCode::TOO_MANY_REQUESTS, TOO_MANY_REQUESTS_MESSAGE).into_response(),
                0,
            )
        }
    };

    let headers = response.headers_mut();
    headers.insert(
        RATE_LIMIT_LIMIT_HEADER,
        HeaderValue::from(limiter.limit().max_requests),
    );
    headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(remaining));
    response
}

#[cfg(test)]
mod tests {
    use axum::{
        Router, body::Body, extract::connect_info::MockConnectInfo,
        middleware::from_fn_with_state, routing::get,
    };
    use tower::ServiceExt;

    use super::*;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn limiter(max_requests: u32, trust_forwarded_headers: bool) -> RateLimiter {
        RateLimiter::new(
            RateLimit::new(max_requests, Duration::from_secs(60)),
            trust_forwarded_headers,
        )
    }

    #[test]
    fn allows_up_to_the_limit() {
        let limiter = limiter(3, false);
        let now = Instant::now();

        assert_eq!(limiter.check(LOCALHOST, now), Decision::Allowed { remaining: 2 });
        assert_eq!(limiter.check(LOCALHOST, now), Decision::Allowed { remaining: 1 });
        assert_eq!(limiter.check(LOCALHOST, now), Decision::Allowed { remaining: 0 });
        assert_eq!(limiter.check(LOCALHOST, now), Decision::Limited);
    }

    #[test]
    fn window_resets_after_period() {
        let limiter = limiter(1, false);
        let now = Instant::now();

        assert_eq!(limiter.check(LOCALHOST, now), Decision::Allowed { remaining: 0 });
        assert_eq!(
            limiter.check(LOCALHOST, now + Duration::from_secs(59)),
            Decision::Limited
        );
        assert_eq!(
            limiter.check(LOCALHOST, now + Duration::from_secs(60)),
            Decision::Allowed { remaining: 0 }
        );
    }

    #[test]
    fn callers_are_counted_separately() {
        let limiter = limiter(1, false);
        let now = Instant::now();
        let other = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        assert_eq!(limiter.check(LOCALHOST, now), Decision::Allowed { remaining: 0 });
        assert_eq!(limiter.check(other, now), Decision::Allowed { remaining: 0 });
        assert_eq!(limiter.check(LOCALHOST, now), Decision::Limited);
    }

    #[test]
    fn caller_ip_ignores_forwarded_headers_by_default() {
        let request = Request::builder()
            .header("X-Forwarded-For", "10.1.2.3")
            .extension(ConnectInfo(SocketAddr::from(([192, 168, 0, 7], 4242))))
            .body(Body::empty())
            .unwrap();

        assert_eq!(
            limiter(1, false).caller_ip(&request),
            IpAddr::V4(Ipv4Addr::new(192, 168, 0, 7))
        );
        assert_eq!(
            limiter(1, true).caller_ip(&request),
            IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))
        );
    }

    #[test]
    fn forwarded_ip_prefers_first_forwarded_for_entry() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.9"));
        assert_eq!(forwarded_ip(&headers), Some("10.0.0.9".parse().unwrap()));

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("2001:db8::1, 10.0.0.2"),
        );
        assert_eq!(forwarded_ip(&headers), Some("2001:db8::1".parse().unwrap()));
    }

    #[tokio::test]
    async fn middleware_sets_headers_and_rejects() {
        let router = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(from_fn_with_state(limiter(2, false), limit_requests))
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 1234))));

        let mut statuses = Vec::new();
        for expected_remaining in ["1", "0", "0"] {
            let response = router
                .clone()
                .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.headers()[RATE_LIMIT_LIMIT_HEADER], "2");
            assert_eq!(
                response.headers()[RATE_LIMIT_REMAINING_HEADER],
                expected_remaining
            );
            statuses.push(response.status());
        }

        assert_eq!(statuses, [
            StatusCode::OK,
            StatusCode::OK,
            StatusCode::TOO_MANY_REQUESTS
        ]);
    }
}
