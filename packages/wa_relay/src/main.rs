use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

use wa_session::{AuthStore, BatchSender, EventLog, SessionContext, SessionManager};

mod bridge;
mod cli;
mod config;
mod export;
mod handlers;
mod metrics;
mod responder;
mod sse;
#[cfg(test)]
mod test_helpers;

use crate::config::{FileConfig, RelayPaths, SendFileConfig, SseConfig};
use crate::metrics::RelayMetrics;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "wa-relay")]
#[command(about = "Relay between messaging sessions, a dashboard and an auto-reply backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.wa-relay)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server in the foreground (default)
    Serve(ServeArgs),

    /// Print the newest event-log records
    Events(EventsArgs),

    /// Remove a session's stored credentials
    WipeAuth(WipeAuthArgs),
}

#[derive(Parser, Default)]
struct ServeArgs {
    /// Port for the web server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser)]
struct EventsArgs {
    /// Maximum number of records
    #[arg(short, long, default_value = "50")]
    limit: usize,

    /// Only records at or after this epoch-ms timestamp
    #[arg(long, default_value = "0")]
    since: i64,

    /// Output as CSV
    #[arg(long)]
    csv: bool,
}

#[derive(Parser)]
struct WipeAuthArgs {
    /// Session (agent) id
    agent: String,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub manager: Arc<SessionManager>,
    pub log: Arc<EventLog>,
    pub batch: Arc<BatchSender>,
    /// Relay metrics for observability
    pub metrics: Arc<RelayMetrics>,
    pub sse: Arc<SseConfig>,
    pub send_config: Arc<SendFileConfig>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let paths = RelayPaths::new(cli.data_dir.clone())?;

    match cli.command {
        None => run_server(ServeArgs::default(), paths).await,
        Some(Commands::Serve(args)) => run_server(args, paths).await,
        Some(Commands::Events(args)) => {
            cli::events_command(&paths, args.limit, args.since, args.csv).await
        }
        Some(Commands::WipeAuth(args)) => cli::wipe_auth_command(&paths, &args.agent).await,
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root_redirect))
        // Push channels
        .route("/qr-events", get(handlers::qr_events))
        .route("/events-stream", get(handlers::events_stream))
        // Sending
        .route("/send-test", post(handlers::send_test))
        .route("/send-batch", post(handlers::send_batch))
        .route("/send-batch-demo", get(handlers::send_batch_demo))
        // Session lifecycle
        .route("/logout", post(handlers::logout))
        .route("/auth-path", get(handlers::auth_path))
        // Event log
        .route(
            "/api/events",
            get(handlers::list_events).delete(handlers::clear_events),
        )
        .route("/api/events.csv", get(handlers::events_csv))
        .route("/api/stats", get(handlers::stats))
        // Health endpoints
        .route("/health", get(handlers::health_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(state)
}

async fn run_server(args: ServeArgs, paths: RelayPaths) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "wa_relay=debug,wa_session=debug,tower_http=debug,info"
    } else {
        "wa_relay=info,wa_session=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting wa-relay");

    let file_config: FileConfig = config::load_config(&paths.data_dir)
        .extract()
        .with_context(|| format!("Invalid configuration in {:?}", paths.config_toml_path()))?;

    let log = Arc::new(
        EventLog::open(&paths.events_path)
            .await
            .with_context(|| format!("Failed to open event log {:?}", paths.events_path))?,
    );
    let responder = responder::HttpResponder::new(&file_config.responder)
        .context("Failed to build responder HTTP client")?;
    info!("Responder endpoint: {}", file_config.responder.endpoint);
    info!("Protocol bridge: {}", file_config.bridge.url);

    let ctx = SessionContext {
        connector: Arc::new(bridge::WsConnector::new(file_config.bridge.url.clone())),
        auth: AuthStore::new(&paths.auth_dir),
        log: log.clone(),
        responder: Arc::new(responder),
        timings: file_config.sessions.timings(),
    };
    let manager = Arc::new(
        SessionManager::new(ctx, file_config.sessions.auto_reply_settings())
            .with_max_sessions(file_config.sessions.session_limit()),
    );
    let batch = BatchSender::new(file_config.send.batch_settings(), log.clone());

    for agent in &file_config.sessions.agents {
        if let Err(e) = manager.get_or_start(agent).await {
            warn!("Not starting session '{}': {}", agent, e);
        }
    }

    let app_state = AppState {
        manager: manager.clone(),
        log,
        batch: Arc::new(batch),
        metrics: Arc::new(RelayMetrics::new()),
        sse: Arc::new(SseConfig::from_file(&file_config.sse)),
        send_config: Arc::new(file_config.send.clone()),
    };

    let mut app = build_router(app_state);
    if let Some(dir) = &file_config.server.public_dir {
        info!("Serving static files from {}", dir.display());
        app = app.fallback_service(ServeDir::new(dir));
    }
    let app = app
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive());

    let host = args.host.unwrap_or(file_config.server.host);
    let port = args.port.unwrap_or(file_config.server.port);
    let addr = format!("{}:{}", host, port).parse::<SocketAddr>()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("wa-relay listening on http://{}", actual_addr);
    info!("QR page: http://{}/qr.html", actual_addr);

    // Create shutdown signal handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    info!("Stopping sessions...");
    manager.shutdown_all().await;

    info!("Shutdown complete");
    server_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, http::StatusCode};
    use tower::ServiceExt;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["wa-relay", "events", "--limit", "5", "--csv"]).unwrap();
        match cli.command {
            Some(Commands::Events(args)) => {
                assert_eq!(args.limit, 5);
                assert!(args.csv);
            }
            _ => panic!("expected events"),
        }

        let cli = Cli::try_parse_from(["wa-relay", "--data-dir", "/tmp/x", "wipe-auth", "sales"]).unwrap();
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/x")));
        assert!(matches!(cli.command, Some(Commands::WipeAuth(a)) if a.agent == "sales"));

        let cli = Cli::try_parse_from(["wa-relay"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[tokio::test]
    async fn test_router_wires_routes() {
        let (state, _tmp) = test_helpers::test_app_state().await;
        let app = build_router(state);
        for uri in ["/health", "/metrics", "/api/events", "/api/stats", "/auth-path"] {
            let resp = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK, "{}", uri);
        }
    }
}
