pub mod collaborators;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod orchestrator;
pub mod routes;
pub mod sessions;
pub mod store;
pub mod websocket;
