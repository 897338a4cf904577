//! # HTTP server
//!
//! Routes:
//!
//! | Route          | Purpose                                               |
//! |----------------|-------------------------------------------------------|
//! | `GET /`        | Status page with a small chat box for manual testing |
//! | `GET /health`  | JSON liveness and store status                        |
//! | `GET /api/ws`  | WebSocket upgrade into a chat session                 |
//! | `POST /api/upload` | Multipart document upload and ingestion           |
//!
//! [`serve`] runs until SIGINT or SIGTERM, then cancels the server-wide
//! shutdown token (closing every session) and drains open connections.

use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, Multipart, State, WebSocketUpgrade, multipart::MultipartRejection,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use futures::StreamExt;
use serde::Serialize;
use std::future::IntoFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::OpenAiGenerator;
use crate::broadcast::BroadcastChannel;
use crate::config::{AwfulRagConfig, SessionConfig};
use crate::error::{RagError, Result};
use crate::ingest::Ingestor;
use crate::pipeline::Pipeline;
use crate::search::build_search_provider;
use crate::session::{SessionContext, reject_upgrade, run_session};
use crate::vector_store::{StoreStatus, store_status_at};

/// How long open connections get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
	<title>RAG Server</title>
	<meta charset="UTF-8" />
	<style>
		body { font-family: Arial; margin: 40px; }
		.box { padding: 20px; border: 1px solid #ccc; width: 500px; }
		.chat { margin-top: 30px; padding: 10px; border: 1px solid #555; }
	</style>
</head>
<body>

<h2>RAG Server Status</h2>

<div class="box">
	<p><b>Database Loaded:</b> {db_loaded}</p>
	<p><b>Embeddings in memory:</b> {count}</p>
	<p><b>Search backend:</b> {backend}</p>
</div>

<h2>Chat Test</h2>
<div class="chat">
	<input id="msg" style="width: 300px;" placeholder="Type message..." />
	<button onclick="sendMsg()">Send</button>
	<button onclick="stopMsg()">Stop</button>
	<pre id="log"></pre>
</div>

<script>
let ws = new WebSocket((location.protocol === "https:" ? "wss://" : "ws://") + location.host + "/api/ws");

ws.onmessage = function(event) {
	document.getElementById("log").textContent += "AI: " + event.data + "\n";
};

function sendMsg() {
	let txt = document.getElementById("msg").value;
	ws.send(JSON.stringify({ message: txt }));
	document.getElementById("log").textContent += "You: " + txt + "\n";
	document.getElementById("msg").value = "";
}

function stopMsg() {
	ws.send(JSON.stringify({ message: "stop" }));
}
</script>

</body>
</html>
"#;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub session: SessionConfig,
    pub broadcast: Option<BroadcastChannel>,
    pub ingestor: Arc<Ingestor>,
    pub status: StoreStatus,
    pub shutdown: CancellationToken,
    next_session: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(
        pipeline: Pipeline,
        session: SessionConfig,
        ingestor: Ingestor,
        status: StoreStatus,
    ) -> Self {
        let broadcast = session
            .broadcast
            .then(|| BroadcastChannel::new(session.broadcast_capacity));
        Self {
            pipeline: Arc::new(pipeline),
            session,
            broadcast,
            ingestor: Arc::new(ingestor),
            status,
            shutdown: CancellationToken::new(),
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Wire up the search backend, generator and ingestor from `config`.
    pub fn from_config(config: &AwfulRagConfig) -> Result<Self> {
        let search = build_search_provider(config)?;
        info!(backend = search.name(), "Search backend ready");
        let generator = Arc::new(OpenAiGenerator::new(config));
        let pipeline = Pipeline::new(search, generator, config.chat_model.clone());

        let status = store_status_at(&config.db_path).unwrap_or_else(|e| {
            warn!("Could not read store status from {}: {e}", config.db_path);
            StoreStatus::default()
        });

        let ingestor = Ingestor::new(config.upload_dir.clone(), &config.ingest);
        Ok(Self::new(pipeline, config.session.clone(), ingestor, status))
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            pipeline: self.pipeline.clone(),
            config: self.session.clone(),
            broadcast: self.broadcast.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Records the status page reports as in memory.
    fn in_memory(&self) -> i64 {
        match self.pipeline.search_provider().in_memory() {
            Some(n) => n as i64,
            None => self.status.count,
        }
    }
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index_page))
        .route("/health", get(health_check))
        .route("/api/ws", get(ws_handler))
        .route("/api/upload", post(upload_handler))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

async fn index_page(State(state): State<AppState>) -> Html<String> {
    Html(
        INDEX_HTML
            .replace("{db_loaded}", &state.status.populated.to_string())
            .replace("{count}", &state.in_memory().to_string())
            .replace("{backend}", state.pipeline.search_provider().name()),
    )
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    backend: &'static str,
    store: StoreStatus,
    in_memory: i64,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        backend: state.pipeline.search_provider().name(),
        store: state.status,
        in_memory: state.in_memory(),
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let id = state.next_session.fetch_add(1, Ordering::Relaxed);
    let ctx = state.session_context();
    ws.on_failed_upgrade(move |e| {
        reject_upgrade(id, e);
    })
        .on_upgrade(move |socket| async move {
            let (writer, reader) = socket.split();
            run_session(id, writer, reader, ctx).await;
        })
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub files: Vec<String>,
}

async fn upload_handler(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Response {
    let mut multipart = match multipart {
        Ok(m) => m,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("bad request: {e}")).into_response(),
    };

    let mut saved = Vec::new();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return (e.status(), format!("bad request: {e}")).into_response(),
        };
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let data = match field.bytes().await {
            Ok(data) => data,
            Err(e) => return (e.status(), format!("bad request: {e}")).into_response(),
        };

        let path = match state.ingestor.stage(&file_name, &data).await {
            Ok(path) => path,
            Err(RagError::Protocol(msg)) => {
                return (StatusCode::BAD_REQUEST, format!("bad request: {msg}")).into_response();
            }
            Err(e) => {
                error!("Failed to save upload {file_name:?}: {e}");
                return (StatusCode::INTERNAL_SERVER_ERROR, "failed to save file").into_response();
            }
        };

        match state.ingestor.ingest(&path).await {
            Ok(_) => saved.push(path.display().to_string()),
            Err(RagError::Ingest { output }) => {
                return (StatusCode::INTERNAL_SERVER_ERROR, output).into_response();
            }
            Err(e) => {
                return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
            }
        }
    }

    if saved.is_empty() {
        return (StatusCode::BAD_REQUEST, "no files uploaded").into_response();
    }

    Json(UploadResponse {
        status: "success",
        message: "PDF processed & embeddings saved",
        files: saved,
    })
    .into_response()
}

/// Bind, serve, and shut down cleanly on SIGINT/SIGTERM.
pub async fn serve(config: &AwfulRagConfig) -> Result<()> {
    let state = AppState::from_config(config)?;
    let shutdown = state.shutdown.clone();
    let app = router(state, config.max_upload_bytes);

    let listener = TcpListener::bind(&config.bind).await?;
    info!("Server running on {}", listener.local_addr()?);

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Received Server Shutdown Signal.");
        signal_token.cancel();
    });

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .into_future();

    tokio::select! {
        served = server => served?,
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            warn!("Connections still open after {SHUTDOWN_GRACE:?}; closing them");
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
