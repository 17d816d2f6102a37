//! Centralized route configuration for the testdoc manager API.
//!
//! Shared between the main server and test servers so both exercise the same
//! routing setup.

use crate::handlers::{generation_handlers, main_handlers, session_handlers};
use actix_web::web;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/health", web::get().to(main_handlers::health_check))
            // Session lifecycle endpoints
            .route(
                "/prepare-session",
                web::post().to(session_handlers::prepare_session),
            )
            .route(
                "/init-session/{session_id}",
                web::post().to(session_handlers::init_session),
            )
            .route(
                "/session/{id}/metadata",
                web::get().to(session_handlers::get_session_metadata),
            )
            .route(
                "/session/{id}/status",
                web::get().to(session_handlers::get_session_status),
            )
            .route(
                "/session/{id}",
                web::delete().to(session_handlers::delete_session),
            )
            .route(
                "/sessions/stats",
                web::get().to(session_handlers::session_stats),
            )
            // Generation pipeline endpoints
            .route(
                "/start-full-generation",
                web::post().to(generation_handlers::start_full_generation),
            )
            .route(
                "/full-generation-status/{session_id}",
                web::get().to(generation_handlers::get_generation_status),
            ),
    );
}
