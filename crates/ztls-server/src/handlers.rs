//! Route handlers of the REST server.
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use tracing::instrument;
use ztls_certs::{Authority, ErrorKind, authority};

/// Content type of PEM encoded responses.
pub const PEM_CONTENT_TYPE: &str = "application/x-pem-file";

#[derive(Debug, Snafu)]
pub enum HandlerError {
    #[snafu(display("failed to parse the JSON request body"))]
    ParseJsonBody { source: serde_json::Error },

    #[snafu(display("failed to sign the certificate"))]
    SignCertificate { source: authority::Error },

    #[snafu(display("failed to retrieve the CA certificate"))]
    RetrieveCaCertificate { source: authority::Error },

    #[snafu(display("the signing task failed"))]
    JoinSigningTask { source: tokio::task::JoinError },
}

impl HandlerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            HandlerError::ParseJsonBody { .. } => StatusCode::BAD_REQUEST,
            HandlerError::SignCertificate { source }
            | HandlerError::RetrieveCaCertificate { source } => status_code_for(source.kind()),
            HandlerError::JoinSigningTask { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Maps library error kinds onto HTTP status codes.
pub fn status_code_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidEncoding | ErrorKind::LabelMismatch | ErrorKind::InvalidCsr => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = &self as &dyn std::error::Error, "request failed");
        } else {
            tracing::debug!(error = &self as &dyn std::error::Error, "rejected request");
        }

        (status, error_message(&self)).into_response()
    }
}

/// Joins the error and all its sources. None of the errors carry key
/// material in their messages.
fn error_message(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[derive(Debug, Deserialize)]
struct CsrRequest {
    csr: String,
}

/// State shared by all handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    pub authority: Arc<Authority>,
}

/// `GET /`
pub async fn root() -> String {
    format!("ztls REST SERVER - {}", env!("CARGO_PKG_VERSION"))
}

/// `GET /1/ca.crt.pem`
pub async fn ca_certificate(State(state): State<AppState>) -> Result<Response, HandlerError> {
    let pem = state
        .authority
        .ca_certificate_pem()
        .context(RetrieveCaCertificateSnafu)?;

    Ok(pem_response(pem.to_owned()))
}

/// `POST /1/new-certificate` and `POST /1/new-server-certificate`
///
/// Accepts either a JSON object `{"csr": "<PEM>"}` or the PEM encoded CSR as
/// plain body and responds with the PEM encoded certificate.
#[instrument(name = "new_certificate", skip_all, fields(request.length = body.len()))]
pub async fn new_certificate(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HandlerError> {
    let csr_pem = csr_from_body(&headers, body)?;

    // Signing is CPU bound and must not block the async runtime
    let authority = state.authority.clone();
    let certificate_pem = tokio::task::spawn_blocking(move || authority.sign_csr_pem(&csr_pem))
        .await
        .context(JoinSigningTaskSnafu)?
        .context(SignCertificateSnafu)?;

    Ok(pem_response(certificate_pem))
}

fn csr_from_body(headers: &HeaderMap, body: Bytes) -> Result<Vec<u8>, HandlerError> {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"));

    if is_json || body.trim_ascii_start().starts_with(b"{") {
        let request: CsrRequest = serde_json::from_slice(&body).context(ParseJsonBodySnafu)?;
        Ok(request.csr.into_bytes())
    } else {
        Ok(body.to_vec())
    }
}

fn pem_response(pem: String) -> Response {
    ([(header::CONTENT_TYPE, PEM_CONTENT_TYPE)], pem).into_response()
}
