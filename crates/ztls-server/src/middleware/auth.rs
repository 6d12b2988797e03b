//! Access secret authentication.
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::constants::ACCESS_SECRET_HEADER;

/// The body returned to callers without a valid access secret.
pub const UNAUTHORIZED_MESSAGE: &str = "invalid/missing header X-API-KEY";

/// The expected access secret, shared by all requests.
#[derive(Clone)]
pub struct AccessSecret(Arc<str>);

impl AccessSecret {
    pub fn new(secret: impl Into<Arc<str>>) -> Self {
        Self(secret.into())
    }

    fn matches(&self, provided: &[u8]) -> bool {
        !self.0.is_empty() && self.0.as_bytes() == provided
    }
}

impl std::fmt::Debug for AccessSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessSecret(<redacted>)")
    }
}

/// Rejects requests whose `X-API-KEY` header doesn't carry the access secret
/// with `401 Unauthorized`.
pub async fn require_access_secret(
    State(secret): State<AccessSecret>,
    request: Request,
    next: Next,
) -> Response {
    match request.headers().get(ACCESS_SECRET_HEADER) {
        Some(provided) if secret.matches(provided.as_bytes()) => next.run(request).await,
        Some(_) => {
            tracing::warn!(http.path = %request.uri().path(), "invalid access secret provided");
            (StatusCode::UNAUTHORIZED, UNAUTHORIZED_MESSAGE).into_response()
        }
        None => {
            tracing::debug!(http.path = %request.uri().path(), "no access secret provided");
            (StatusCode::UNAUTHORIZED, UNAUTHORIZED_MESSAGE).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{Router, body::Body, middleware::from_fn_with_state, routing::get};
    use rstest::rstest;
    use tower::ServiceExt;

    use super::*;

    fn router() -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(from_fn_with_state(
                AccessSecret::new("s3cr3t"),
                require_access_secret,
            ))
    }

    #[rstest]
    #[case(Some("s3cr3t"), StatusCode::OK)]
    #[case(Some("wrong"), StatusCode::UNAUTHORIZED)]
    #[case(Some(""), StatusCode::UNAUTHORIZED)]
    #[case(None, StatusCode::UNAUTHORIZED)]
    #[tokio::test]
    async fn access_secret_is_checked(#[case] header: Option<&str>, #[case] expected: StatusCode) {
        let mut request = Request::builder().uri("/");
        if let Some(header) = header {
            request = request.header("X-API-KEY", header);
        }

        let response = router()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), expected);
    }

    #[test]
    fn empty_secret_never_matches() {
        assert!(!AccessSecret::new("").matches(b""));
    }
}
