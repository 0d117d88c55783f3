//! Charserver
//!
//! Character server of a login / char / map cluster. Relays client
//! authentication to the login server, tracks online accounts, fans out
//! account notices to map servers and keeps the guild castle registry.

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use charserver::config::ServerConfig;
use charserver::game::hooks::NoopContent;
use charserver::net::handler::{accept_connections, EventLoop};
use charserver::storage::open_castle_store;
use charserver::{CharServer, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!(version = VERSION, "Charserver starting");

    let config = ServerConfig::load().await?;
    info!(
        path = %config.config_path.display(),
        login = %config.login_address(),
        max_map_servers = config.max_map_servers,
        "Configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Load the castle registry before accepting anyone
    let castles = open_castle_store(&config.storage)?;
    info!(castles = castles.len(), "Castle store loaded");

    let listen_addr = config.listen_address();
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Char server listening on: {}", listen_addr);

    let server = CharServer::new(config, castles, Box::new(NoopContent));
    let event_loop = EventLoop::new(server);

    // Spawn connection acceptor
    let accept_handle = tokio::spawn(accept_connections(
        listener,
        event_loop.sender(),
        event_loop.ids(),
        shutdown_tx.subscribe(),
    ));

    // Spawn the event loop; it owns all server state
    let loop_handle = tokio::spawn(event_loop.run(shutdown_tx.subscribe()));

    info!("Server startup complete!");

    // Wait for shutdown signal
    wait_for_shutdown(shutdown_tx.clone()).await;

    info!("Shutting down server...");

    let _ = accept_handle.await;
    match loop_handle.await {
        Ok(Ok(())) => info!("Castle data saved"),
        Ok(Err(e)) => error!("Final castle save failed: {}", e),
        Err(e) => error!("Event loop task failed: {}", e),
    }

    info!("Server shutdown complete. Goodbye!");
    Ok(())
}

/// Set up tracing; `CHARSERVER_LOG_FORMAT=json` switches to JSON lines
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,charserver=debug"));
    let json = std::env::var("CHARSERVER_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);

    if json {
        builder.json().with_current_span(false).init();
    } else {
        builder.with_file(true).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Signal all tasks to shut down
    let _ = shutdown_tx.send(());
}
