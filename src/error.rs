//! Closed error taxonomy for the execution chain.
//!
//! Stages never render wire responses for failures themselves. They return a
//! [`ChainError`] and the outermost error-mapping stage turns it into a
//! status-coded response with [`ChainError::into_response`].

use axum::body::Body;
use axum::http::{header, HeaderValue, Method, Response, StatusCode};
use thiserror::Error;

/// Boxed error used at crate boundaries (hyper, body streams).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can surface from any stage of the execution chain.
#[derive(Debug, Error)]
pub enum ChainError {
    /// The resource exists but does not answer this method.
    #[error("method not allowed")]
    MethodNotAllowed { allow: Vec<Method> },

    /// No representation satisfies the request's `Accept*` headers.
    #[error("not acceptable: {0}")]
    NotAcceptable(String),

    /// The request body uses a media type or coding the resource cannot consume.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// The request is malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The request body exceeds a configured limit.
    #[error("payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// `Content-MD5` did not match the received body.
    #[error("content digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Origin not configured or not ready.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Upstream connect failure or exchange deadline.
    #[error("gateway timeout: {0}")]
    GatewayTimeout(String),

    /// The exchange was cancelled before a response was produced.
    #[error("request cancelled")]
    Cancelled,

    /// Redirect chain exceeded the configured hop count.
    #[error("too many redirects (max {0})")]
    TooManyRedirects(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Any other failure.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;

impl ChainError {
    /// Status code surfaced for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ChainError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            ChainError::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
            ChainError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ChainError::BadRequest(_) | ChainError::DigestMismatch { .. } => {
                StatusCode::BAD_REQUEST
            }
            ChainError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ChainError::ServiceUnavailable(_) | ChainError::Cancelled => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ChainError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ChainError::TooManyRedirects(_) | ChainError::Io(_) | ChainError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// True for conditions that call for an alternate response rather than
    /// signalling a failure of the server.
    pub fn is_alternate_response(&self) -> bool {
        matches!(
            self,
            ChainError::MethodNotAllowed { .. }
                | ChainError::NotAcceptable(_)
                | ChainError::UnsupportedMediaType(_)
        )
    }

    /// Render this error as a wire response.
    pub fn into_response(self) -> Response<Body> {
        let status = self.status();
        let reason = status.canonical_reason().unwrap_or("Error");
        let body = if status.is_server_error() {
            format!("{}\n{}\n", reason, self)
        } else {
            format!("{}\n", reason)
        };

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        if let ChainError::MethodNotAllowed { allow } = &self {
            if let Some(value) = allow_header(allow) {
                headers.insert(header::ALLOW, value);
            }
        }
        if matches!(self, ChainError::Cancelled | ChainError::ServiceUnavailable(_)) {
            headers.insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        // The request body may be partly unread.
        if matches!(
            self,
            ChainError::DigestMismatch { .. } | ChainError::PayloadTooLarge { .. }
        ) {
            headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
        response
    }
}

/// Format a method set as an `Allow` header value.
pub fn allow_header(methods: &[Method]) -> Option<HeaderValue> {
    if methods.is_empty() {
        return None;
    }
    let joined = methods
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    HeaderValue::from_str(&joined).ok()
}

impl ChainError {
    /// Recover a chain error carried inside an I/O error, as body wrappers do.
    pub fn from_io(error: std::io::Error) -> Self {
        let carries_chain_error = error
            .get_ref()
            .is_some_and(|inner| inner.is::<ChainError>());
        if !carries_chain_error {
            return ChainError::Io(error);
        }
        match error.into_inner().map(|inner| inner.downcast::<ChainError>()) {
            Some(Ok(chain)) => *chain,
            Some(Err(other)) => ChainError::Internal(other.to_string()),
            None => ChainError::Internal("empty I/O error".into()),
        }
    }
}

impl From<axum::Error> for ChainError {
    fn from(e: axum::Error) -> Self {
        let inner = e.into_inner();
        match inner.downcast::<std::io::Error>() {
            Ok(io) => ChainError::from_io(*io),
            Err(other) => match other.downcast::<ChainError>() {
                Ok(chain) => *chain,
                Err(other) => ChainError::Internal(other.to_string()),
            },
        }
    }
}
