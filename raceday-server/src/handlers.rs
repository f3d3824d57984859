use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use socketioxide::extract::{Data, SocketRef};
use tracing::{info, warn};

use kart_types::{BatteryIndex, CategoryId};

use crate::api_client::StageBackend;
use crate::import::{ImportError, ImportMode};
use crate::session::RaceDaySession;
use crate::store::{Command, StageEvent};
use crate::workbook::{Sheet, Workbook};

// ─── Shared State Types ───────────────────────────────────────────────────────

pub type SharedSession<S> = Arc<RaceDaySession<S>>;

/// Socket events that map one-to-one onto a store `Command`.
pub const COMMAND_EVENTS: &[&str] = &[
    "load-stage",
    "run-draw",
    "set-kart",
    "clear-kart",
    "assign-fleet",
    "create-fleet",
    "resize-fleet",
    "toggle-kart",
    "update-result",
    "clear-results",
    "import-results",
    "set-sort",
    "save-schedule",
    "add-penalty",
    "delete-penalty",
    "set-penalty-status",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RankingRequest {
    category_id: CategoryId,
    battery: BatteryIndex,
}

// ─── Helper: payload → Command ────────────────────────────────────────────────

/// The event name doubles as the command tag; the payload carries the fields.
pub fn command_from_payload(event: &str, data: Value) -> Result<Command, serde_json::Error> {
    let mut fields = match data {
        Value::Object(fields) => fields,
        Value::Null => Map::new(),
        other => {
            return Err(serde::de::Error::custom(format!(
                "expected an object payload, got {other}"
            )))
        }
    };
    fields.insert("type".into(), Value::String(event.to_string()));
    serde_json::from_value(Value::Object(fields))
}

/// `import-results` for a single sheet posted as CSV.
pub fn csv_import_command(
    category_id: CategoryId,
    battery: BatteryIndex,
    mode: ImportMode,
    sheet_name: &str,
    body: &[u8],
) -> Result<Command, ImportError> {
    let sheet = Sheet::from_csv_reader(sheet_name, body)?;
    Ok(Command::ImportResults {
        category_id,
        battery,
        mode,
        workbook: Workbook::new(vec![sheet]),
    })
}

fn reject(s: &SocketRef, event: &str, message: String) {
    warn!("Client {}: {event} rejected: {message}", s.id);
    let _ = s.emit("command-rejected", &json!({ "event": event, "message": message }));
}

async fn run_command<S: StageBackend>(s: SocketRef, session: SharedSession<S>, event: &str, data: Value) {
    let command = match command_from_payload(event, data) {
        Ok(command) => command,
        Err(e) => return reject(&s, event, e.to_string()),
    };

    let events = match session.execute(command).await {
        Ok(events) => events,
        Err(e) => return reject(&s, event, e.to_string()),
    };

    for ev in &events {
        match ev {
            StageEvent::ResultsImported { .. } | StageEvent::LapTimesImported { .. } => {
                let _ = s.emit("import-report", ev);
            }
            StageEvent::SortChanged { .. } => emit_current_rankings(&s, &session).await,
            _ => {}
        }
    }

    let state = session.store().snapshot().await;
    let _ = s.broadcast().emit("state-update", &state);
    let _ = s.emit("state-update", &state);
}

/// Re-rank every battery the caller could be looking at after a sort change.
async fn emit_current_rankings<S: StageBackend>(s: &SocketRef, session: &SharedSession<S>) {
    let rankings: Vec<Value> = session
        .store()
        .read(|state| {
            state
                .categories
                .iter()
                .flat_map(|category| {
                    (0..category.battery_count).filter_map(move |battery| {
                        let rows = state.ranking(&category.id, battery).ok()?;
                        Some(json!({ "categoryId": category.id, "battery": battery, "rows": rows }))
                    })
                })
                .collect()
        })
        .await;
    for ranking in rankings {
        let _ = s.emit("ranking", &ranking);
    }
}

// ─── Main Connection Handler ──────────────────────────────────────────────────

pub async fn on_connect<S: StageBackend>(socket: SocketRef, session: SharedSession<S>) {
    info!("Client connected: {}", socket.id);

    socket.on_disconnect(|s: SocketRef| async move {
        info!("Client disconnected: {}", s.id);
    });

    // ── register ──────────────────────────────────────────────────────────────
    {
        let session = session.clone();
        socket.on("register", move |s: SocketRef, Data::<Value>(data)| {
            let session = session.clone();
            async move {
                let role = data["type"].as_str().unwrap_or("operator").to_string();
                info!("Client {}: registered as {role}", s.id);
                let _ = s.join(role);

                let state = session.store().snapshot().await;
                let _ = s.emit("init-state", &state);
            }
        });
    }

    // ── commands ──────────────────────────────────────────────────────────────
    for &event in COMMAND_EVENTS {
        let session = session.clone();
        socket.on(event, move |s: SocketRef, Data::<Value>(data)| {
            let session = session.clone();
            async move { run_command(s, session, event, data).await }
        });
    }

    // ── get-ranking ───────────────────────────────────────────────────────────
    {
        let session = session.clone();
        socket.on("get-ranking", move |s: SocketRef, Data::<Value>(data)| {
            let session = session.clone();
            async move {
                let request: RankingRequest = match serde_json::from_value(data) {
                    Ok(request) => request,
                    Err(e) => return reject(&s, "get-ranking", e.to_string()),
                };
                let rows = session
                    .store()
                    .read(|state| state.ranking(&request.category_id, request.battery))
                    .await;
                match rows {
                    Ok(rows) => {
                        let _ = s.emit(
                            "ranking",
                            &json!({
                                "categoryId": request.category_id,
                                "battery": request.battery,
                                "rows": rows,
                            }),
                        );
                    }
                    Err(e) => reject(&s, "get-ranking", e.to_string()),
                }
            }
        });
    }
}
