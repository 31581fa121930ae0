//! Gateway error type and its HTTP mapping.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("Could not read request body: {0}")]
    Body(#[from] axum::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::Body(_) => StatusCode::BAD_REQUEST,
            Error::Io(_) | Error::Json(_) | Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Internal error: {self}");
            "Internal server error".to_string()
        } else {
            tracing::warn!("{self}");
            self.to_string()
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
