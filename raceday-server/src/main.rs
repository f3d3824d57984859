use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use socketioxide::extract::SocketRef;
use socketioxide::SocketIo;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use kart_types::{BatteryIndex, CategoryId};
use raceday_server::api_client::ApiClient;
use raceday_server::config::{Args, ServiceConfig};
use raceday_server::handlers::{csv_import_command, on_connect, SharedSession};
use raceday_server::import::ImportMode;
use raceday_server::persistence::{load_state, save_state};
use raceday_server::session::RaceDaySession;
use raceday_server::store::{CommandError, StageStore};

type AppSession = SharedSession<ApiClient>;

// ─── HTTP Routes ──────────────────────────────────────────────────────────────

async fn health(State(session): State<AppSession>) -> Json<serde_json::Value> {
    let stage_id = session.store().read(|state| state.stage_id.clone()).await;
    Json(json!({ "status": "ok", "stageId": stage_id }))
}

async fn ranking(
    State(session): State<AppSession>,
    Path((category_id, battery)): Path<(CategoryId, BatteryIndex)>,
) -> Response {
    let rows = session
        .store()
        .read(|state| state.ranking(&category_id, battery))
        .await;
    match rows {
        Ok(rows) => Json(rows).into_response(),
        Err(e @ (CommandError::UnknownCategory(_) | CommandError::BatteryOutOfRange { .. })) => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() }))).into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ImportQuery {
    mode: ImportMode,
    sheet: Option<String>,
}

/// CSV export of one timing sheet, posted as the request body.
async fn import_csv(
    State(session): State<AppSession>,
    Path((category_id, battery)): Path<(CategoryId, BatteryIndex)>,
    Query(query): Query<ImportQuery>,
    body: Bytes,
) -> Response {
    let sheet = query.sheet.unwrap_or_else(|| format!("{category_id}-{battery}"));
    let command = match csv_import_command(category_id, battery, query.mode, &sheet, &body) {
        Ok(command) => command,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response(),
    };
    match session.execute(command).await {
        Ok(events) => Json(events).into_response(),
        Err(e) => {
            warn!("CSV import of {sheet} rejected: {e}");
            (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

// ─── Event Relay ──────────────────────────────────────────────────────────────

async fn relay_events(store: Arc<StageStore>, io: SocketIo) {
    let mut events = store.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => {
                let _ = io.emit("stage-event", &event);
            }
            Err(RecvError::Lagged(missed)) => warn!("Event relay lagged, {missed} events dropped"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }
    info!("Shutdown requested");
}

// ─── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "raceday_server=info,socketioxide=warn".into()),
        )
        .init();

    let args = Args::parse();
    let config = ServiceConfig::load(&args)?;
    info!("🏁 Race-day server starting (backend {})", config.api.base_url);

    // Load local snapshot
    let state = match &config.stage.state_file {
        Some(path) => load_state(path).await,
        None => Default::default(),
    };
    let store = Arc::new(StageStore::new(state, config.draw.seed));
    let backend = Arc::new(ApiClient::new(
        config.api.base_url.clone(),
        config.api.access_token.clone(),
        config.api.refresh_token.clone(),
    ));
    let (session, _writers) = RaceDaySession::new(
        store.clone(),
        backend,
        config.autosave,
        config.stage.state_file.clone(),
    );
    let session: AppSession = Arc::new(session);

    // Build Socket.IO layer
    let (socket_layer, io) = SocketIo::builder().build_layer();

    let session_sock = session.clone();
    io.ns("/", move |socket: SocketRef| {
        let session = session_sock.clone();
        async move {
            on_connect(socket, session).await;
        }
    });

    tokio::spawn(relay_events(store.clone(), io.clone()));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/ranking/:category/:battery", get(ranking))
        .route("/import/:category/:battery", post(import_csv))
        .with_state(session.clone())
        .layer(socket_layer)
        .layer(cors);

    let addr = format!("0.0.0.0:{}", config.server.port);
    info!("🚀 Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Socket handlers still hold the session, so drain its debounce windows here
    session.flush().await;
    if let Some(path) = &config.stage.state_file {
        save_state(path, &store.snapshot().await).await?;
        info!("Snapshot written to {}", path.display());
    }
    Ok(())
}
