//! Error taxonomy shared by every component.
//!
//! Each variant carries enough context to render an [`ErrorResponse`] with a
//! stable numeric code and the HTTP status the caller should see.

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PacError {
    /// A requested row does not exist (or is not visible to the caller).
    #[error("{0}")]
    NotFound(String),

    /// A precondition on challenge or email state was violated.
    #[error("{0}")]
    InvalidState(String),

    /// The request itself is malformed.
    #[error("{0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    /// A peer service or provider could not be reached or timed out.
    #[error("{service} is unavailable")]
    Unavailable { service: &'static str },

    /// A peer service answered, but not with something usable.
    #[error("{0}")]
    BadGateway(String),

    /// Walking `previous_email` hit an id with no row behind it.
    #[error("Exchange chain is broken: email {0} not found")]
    BrokenChain(Uuid),

    #[error("store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PacError {
    pub fn http_status(&self) -> u16 {
        match self {
            PacError::NotFound(_) | PacError::BrokenChain(_) => 404,
            PacError::InvalidState(_) | PacError::BadRequest(_) => 400,
            PacError::Unauthorized => 401,
            PacError::Forbidden(_) => 403,
            PacError::Unavailable { .. } => 503,
            PacError::BadGateway(_) => 502,
            PacError::Store(_) | PacError::Config(_) => 500,
        }
    }

    pub fn error_code(&self) -> i32 {
        match self {
            PacError::NotFound(_) => 4040,
            PacError::BrokenChain(_) => 4041,
            PacError::InvalidState(_) => 4001,
            PacError::BadRequest(_) => 4000,
            PacError::Unauthorized => 2001,
            PacError::Forbidden(_) => 2003,
            PacError::Unavailable { .. } => 5030,
            PacError::BadGateway(_) => 5020,
            PacError::Store(_) => 5001,
            PacError::Config(_) => 5000,
        }
    }

    /// True for failures caused by a peer rather than by the request.
    pub fn is_upstream(&self) -> bool {
        matches!(self, PacError::Unavailable { .. } | PacError::BadGateway(_))
    }
}

/// JSON body returned for every failed request.
#[derive(Debug, Serialize, Clone)]
pub struct ErrorResponse {
    pub error_code: i32,
    pub message: String,
    pub http_status: u16,
}

impl From<&PacError> for ErrorResponse {
    fn from(err: &PacError) -> Self {
        ErrorResponse {
            error_code: err.error_code(),
            message: err.to_string(),
            http_status: err.http_status(),
        }
    }
}

pub type PacResult<T> = Result<T, PacError>;
