use actix::Actor;
use actix_web::{middleware::Logger, web, App, HttpServer};
use clap::{Arg, Command};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use testdoc_manager::collaborators::Collaborators;
use testdoc_manager::config::AppConfig;
use testdoc_manager::error::AppResult;
use testdoc_manager::handlers::AppState;
use testdoc_manager::orchestrator::GenerationOrchestrator;
use testdoc_manager::routes;
use testdoc_manager::sessions::SessionManager;
use testdoc_manager::store::SessionStore;
use testdoc_manager::websocket::{self, ProgressChannelServer, ProgressNotifier, ProgressSink};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[actix_web::main]
async fn main() -> AppResult<()> {
    // Parse command line arguments
    let matches = Command::new("testdoc-manager")
        .version(env!("CARGO_PKG_VERSION"))
        .about("testdoc Manager - test document generation daemon")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Path to configuration file")
                .value_name("FILE"),
        )
        .get_matches();

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("testdoc_manager=info".parse().unwrap()),
        )
        .init();

    tracing::info!("Starting testdoc Manager daemon");

    // Load configuration
    let config = match matches.get_one::<String>("config") {
        Some(path) => AppConfig::load_from_file(Path::new(path))?,
        None => AppConfig::load()?,
    };

    // The session/run tables live for the process lifetime and are shared by
    // handle, never through globals.
    let store = Arc::new(SessionStore::new());

    // Start the progress channel registry
    let progress_server = ProgressChannelServer::default().start();
    let ws_server_data = web::Data::new(progress_server.clone());
    let notifier = Arc::new(ProgressNotifier::new(progress_server));
    tracing::info!("Progress channel registry started");

    // Session lifecycle manager and its expiry sweep
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&store),
        config.sessions.ttl_seconds,
    ));
    let sweep_handle =
        sessions.spawn_sweep(Duration::from_secs(config.sessions.sweep_interval_seconds));
    tracing::info!(
        interval_seconds = config.sessions.sweep_interval_seconds,
        "Expiry sweep started"
    );

    // Stage collaborators and the orchestrator that drives them. The
    // orchestrator-level timeout leaves headroom over the HTTP client's own.
    let collaborators = Arc::new(Collaborators::http(&config.collaborators)?);
    let orchestrator = Arc::new(GenerationOrchestrator::new(
        Arc::clone(&store),
        collaborators,
        Arc::clone(&notifier) as Arc<dyn ProgressSink>,
        Duration::from_secs(config.collaborators.timeout_seconds + 10),
    ));

    let app_state = web::Data::new(AppState {
        store: Arc::clone(&store),
        sessions,
        orchestrator,
        config: Arc::new(config.clone()),
        start_time: SystemTime::now(),
    });

    // Start HTTP server
    let server_addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Starting HTTP server on {}", server_addr);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .app_data(ws_server_data.clone())
            .wrap(Logger::default())
            .configure(routes::configure_routes)
            .route(
                "/ws/progress/{session_id}",
                web::get().to(websocket::progress_websocket_handler),
            )
    })
    .bind(&server_addr)?
    .run();

    tokio::select! {
        result = server => {
            tracing::info!("HTTP server completed");
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    // Teardown: stop the sweep before the tables go away
    store.set_sweep_running(false);
    sweep_handle.abort();

    Ok(())
}
