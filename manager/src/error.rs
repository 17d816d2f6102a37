use actix_web::{HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session expired: {0}")]
    SessionGone(String),

    #[error("Session conflict: {0}")]
    SessionConflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Stage collaborator error: {0}")]
    Stage(#[from] anyhow::Error),
}

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let error_response = ErrorResponse {
            error: self.error_type(),
            message: self.to_string(),
        };

        match self {
            AppError::SessionNotFound(_) | AppError::NotFound(_) => {
                HttpResponse::NotFound().json(error_response)
            }
            AppError::SessionGone(_) => HttpResponse::Gone().json(error_response),
            AppError::SessionConflict(_) => HttpResponse::Conflict().json(error_response),
            AppError::InvalidRequest(_) => HttpResponse::BadRequest().json(error_response),
            AppError::Config(_) | AppError::Io(_) | AppError::Internal(_) | AppError::Stage(_) => {
                HttpResponse::InternalServerError().json(error_response)
            }
        }
    }
}

impl AppError {
    fn error_type(&self) -> String {
        match self {
            AppError::Config(_) => "config_error".to_string(),
            AppError::Io(_) => "io_error".to_string(),
            AppError::SessionNotFound(_) => "session_not_found".to_string(),
            AppError::SessionGone(_) => "session_gone".to_string(),
            AppError::SessionConflict(_) => "session_conflict".to_string(),
            AppError::NotFound(_) => "not_found".to_string(),
            AppError::InvalidRequest(_) => "invalid_request".to_string(),
            AppError::Internal(_) => "internal_error".to_string(),
            AppError::Stage(_) => "stage_error".to_string(),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
