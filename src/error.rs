use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Zone not found: {0}")]
    NotFoundZone(String),
    #[error("Invalid class: {0}")]
    InvalidClass(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("GPIO error: {0}")]
    Gpio(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFoundZone(_) => StatusCode::NOT_FOUND,
            AppError::InvalidClass(_) | AppError::InvalidState(_) => StatusCode::BAD_REQUEST,
            AppError::Config(_)
            | AppError::Gpio(_)
            | AppError::Transport(_)
            | AppError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_errors_to_status_codes() {
        assert_eq!(
            AppError::NotFoundZone("zone9".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::InvalidClass("garage".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Gpio("line busy".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn displays_context() {
        let err = AppError::NotFoundZone("zone42".into());
        assert_eq!(err.to_string(), "Zone not found: zone42");
    }
}
