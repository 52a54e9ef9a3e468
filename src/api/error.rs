//! API error type and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::error::Category;
use thiserror::Error;
use tracing::warn;

use crate::ruletest::TestError;
use crate::silence::SilenceError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("body not sent")]
    BodyNotSent,

    #[error("{0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Test(#[from] TestError),

    #[error(transparent)]
    Silence(#[from] SilenceError),
}

impl ApiError {
    /// Classify a body decoding failure: unreadable input counts as no body,
    /// a well-formed body with the wrong shape is described back.
    pub fn from_body(err: serde_json::Error) -> Self {
        match err.classify() {
            Category::Data => ApiError::InvalidRequest(err.to_string()),
            Category::Io | Category::Syntax | Category::Eof => ApiError::BodyNotSent,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BodyNotSent | ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Test(TestError::InvalidOptions(_)) => StatusCode::BAD_REQUEST,
            ApiError::Test(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Silence(SilenceError::EmptyPath)
            | ApiError::Silence(SilenceError::DurationTooShort(_))
            | ApiError::Silence(SilenceError::OutOfRange { .. }) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_client_error() {
            warn!(status = status.as_u16(), error = %self, "request rejected");
        }
        (status, self.to_string()).into_response()
    }
}
