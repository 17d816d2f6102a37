// Main handlers (system/health handlers)
pub mod main_handlers;
pub use main_handlers::AppState;

// Session lifecycle handlers module
pub mod session_handlers;

// Generation pipeline handlers module
pub mod generation_handlers;
