//! Shared error types and their HTTP mapping.

use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Key material handling errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("malformed base64 key material")]
    Base64(#[from] base64::DecodeError),

    #[error("malformed key material: {0}")]
    Key(String),
}

/// Configuration file errors, fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file: {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot decode configuration file: {path}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot write configuration file: {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid client guid: {0}")]
    InvalidGuid(String),

    #[error("invalid channel name: {0}")]
    InvalidChannel(String),

    #[error("invalid public key for client {guid}")]
    ClientKey {
        guid: String,
        #[source]
        source: CryptoError,
    },

    #[error("invalid private key (wrong passphrase?)")]
    PrivateKey(#[source] CryptoError),
}

/// Stream store errors
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("stream store error")]
    Store(#[from] redis::RedisError),

    #[error("malformed stream entry: {0}")]
    Entry(String),
}

/// Errors surfaced by the HTTP handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("forbidden")]
    Forbidden,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Backend(error) => {
                error!(%error, "stream store failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = match &self {
            // do not leak store internals to clients
            ApiError::Backend(_) => "stream store error".to_string(),
            other => other.to_string(),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
