use super::main_handlers::AppState;
use crate::error::AppError;
use crate::models::{InitSessionResponse, PrepareSessionRequest};
use actix_web::{web, HttpResponse, Result};

pub async fn prepare_session(
    data: web::Data<AppState>,
    request: web::Json<PrepareSessionRequest>,
) -> Result<HttpResponse, AppError> {
    let response = data.sessions.prepare(request.into_inner())?;
    Ok(HttpResponse::Ok().json(response))
}

pub async fn init_session(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let existed = data.sessions.init(&session_id)?;

    let response = InitSessionResponse {
        session_id,
        status: if existed {
            "existing".to_string()
        } else {
            "initialized".to_string()
        },
    };
    Ok(HttpResponse::Ok().json(response))
}

pub async fn get_session_metadata(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let metadata = data.sessions.get_metadata(&session_id)?;
    Ok(HttpResponse::Ok().json(metadata))
}

pub async fn get_session_status(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let snapshot = data.sessions.get_status(&session_id)?;
    Ok(HttpResponse::Ok().json(snapshot))
}

pub async fn delete_session(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    data.sessions.delete(&session_id)?;
    Ok(HttpResponse::NoContent().finish())
}

pub async fn session_stats(data: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let stats = data.sessions.statistics()?;
    Ok(HttpResponse::Ok().json(stats))
}
