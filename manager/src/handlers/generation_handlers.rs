use super::main_handlers::AppState;
use crate::error::AppError;
use crate::models::{GenerationStatusResponse, StartGenerationRequest, StartGenerationResponse};
use actix_web::{web, HttpResponse, Result};

pub async fn start_full_generation(
    data: web::Data<AppState>,
    request: web::Json<StartGenerationRequest>,
) -> Result<HttpResponse, AppError> {
    let req = request.into_inner();

    // An empty metadata payload is recovered from the stored session.
    let metadata = match req.metadata {
        Some(metadata) if !metadata.is_empty() => metadata,
        _ => data
            .store
            .get_session(&req.session_id)?
            .map(|session| session.metadata)
            .unwrap_or_default(),
    };

    let run = data
        .orchestrator
        .start(req.session_id, req.vcs_analysis_text, metadata)?;

    let response = StartGenerationResponse {
        session_id: run.session_id.clone(),
        status: "accepted".to_string(),
        message: "Full generation started".to_string(),
    };
    Ok(HttpResponse::Accepted().json(response))
}

pub async fn get_generation_status(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let run = data
        .store
        .get_run(&session_id)?
        .ok_or_else(|| AppError::NotFound(format!("No generation run for {session_id}")))?;

    Ok(HttpResponse::Ok().json(GenerationStatusResponse::from(&run)))
}
