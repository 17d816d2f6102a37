use crate::config::AppConfig;
use crate::error::AppError;
use crate::models::ServerStatus;
use crate::orchestrator::GenerationOrchestrator;
use crate::sessions::SessionManager;
use crate::store::SessionStore;
use actix_web::{web, HttpResponse, Result};
use std::sync::Arc;
use std::time::SystemTime;

pub struct AppState {
    pub store: Arc<SessionStore>,
    pub sessions: Arc<SessionManager>,
    pub orchestrator: Arc<GenerationOrchestrator>,
    pub config: Arc<AppConfig>,
    pub start_time: SystemTime,
}

pub async fn health_check(data: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let uptime = data
        .start_time
        .elapsed()
        .map_err(|e| AppError::Internal(format!("Failed to calculate uptime: {e}")))?
        .as_secs();

    let status = ServerStatus {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime,
    };

    Ok(HttpResponse::Ok().json(status))
}
