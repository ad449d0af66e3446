use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::error::Error;

impl Error {
    pub fn as_status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BadState | Self::InvalidState => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Provider(_) => StatusCode::BAD_GATEWAY,
            Self::Crypto(_) | Self::Store(_) | Self::Entropy => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show a client
    fn public_message(&self) -> String {
        match self {
            Self::Crypto(_) | Self::Store(_) | Self::Entropy => "internal error".to_string(),
            Self::Provider(_) => "identity provider request failed".to_string(),
            // Never reveal which correlation check failed
            Self::InvalidState => "invalid state".to_string(),
            e => e.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.as_status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }

        let body = json!({
            "error": self.kind(),
            "message": self.public_message(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoError;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::validation("track_uri", "is required").as_status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(Error::InvalidState.as_status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::not_found("session", "x").as_status_code(), StatusCode::NOT_FOUND);
        assert_eq!(Error::Forbidden("no").as_status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            Error::Crypto(CryptoError::Decrypt).as_status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_internal_details_are_hidden() {
        assert_eq!(
            Error::Store("connection refused at 10.0.0.3".to_string()).public_message(),
            "internal error"
        );
        assert_eq!(Error::InvalidState.public_message(), "invalid state");
    }
}
