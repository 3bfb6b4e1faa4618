use anyhow::Result;
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{error, info};

use crate::core::errors::SpecrunError;
use crate::core::retrieval::{ResponseStatus, RetrievalService, SearchOptions};

pub const DEFAULT_PORT: u16 = 8003;
pub const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

static CLIENTS: AtomicUsize = AtomicUsize::new(0);

#[derive(Clone)]
struct ServerState {
    retrieval: Arc<RetrievalService>,
}

/// The closed set of operations reachable over the wire, keyed by the
/// message's `type` tag. Anything else is an UnknownOperationError.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum RequestBody {
    #[serde(rename = "server.version")]
    ServerVersion,
    #[serde(rename = "server.kill")]
    ServerKill,
    #[serde(rename = "retrieval.clear")]
    RetrievalClear,
    #[serde(rename = "retrieval.upsert")]
    RetrievalUpsert {
        filename: String,
        #[serde(default)]
        content: Option<String>,
    },
    #[serde(rename = "retrieval.search")]
    RetrievalSearch {
        text: String,
        #[serde(default)]
        top_k: Option<usize>,
    },
}

/// Bind the WebSocket endpoint and serve until killed. The index is
/// initialized up front so the first remote operation never pays for it.
pub async fn start_server(retrieval: Arc<RetrievalService>, port: u16) -> Result<()> {
    retrieval.init().await?;

    let state = ServerState { retrieval };
    let app = Router::new().route("/", get(ws_handler)).with_state(state);
    let addr = format!("127.0.0.1:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("specrun server listening on ws://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One receive loop per connection. Responses are written from this loop
/// only, so a single connection's response bytes never interleave;
/// connections run on independent tasks and never affect each other.
async fn handle_socket(mut socket: WebSocket, state: ServerState) {
    let clients = CLIENTS.fetch_add(1, Ordering::SeqCst) + 1;
    info!("clients: connected ({} clients)", clients);

    while let Some(msg) = socket.recv().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                error!("socket error: {}", e);
                break;
            }
        };
        let Message::Text(text) = msg else { continue };
        let reply = handle_message(&state, text.as_str()).await;
        if socket.send(Message::Text(reply.into())).await.is_err() {
            break;
        }
    }

    let clients = CLIENTS.fetch_sub(1, Ordering::SeqCst) - 1;
    info!("clients: closed ({} clients)", clients);
}

/// Handle one framed request and build the one response it gets back.
/// Every failure mode, including an unparseable frame, still answers with
/// the originating id so the caller can correlate.
async fn handle_message(state: &ServerState, raw: &str) -> String {
    let value: Value = serde_json::from_str(raw).unwrap_or(Value::Null);
    let id = value
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let response = dispatch(state, value).await;
    if let Some(err) = response.get("error").and_then(|e| e.as_str()) {
        error!("rpc error: {}", err);
    }
    json!({ "id": id, "response": response }).to_string()
}

async fn dispatch(state: &ServerState, value: Value) -> Value {
    let body: RequestBody = match serde_json::from_value(value.clone()) {
        Ok(body) => body,
        Err(e) => {
            let type_tag = value
                .get("type")
                .and_then(|t| t.as_str())
                .unwrap_or("<missing>");
            let err = if e.to_string().starts_with("unknown variant") || value.get("type").is_none()
            {
                SpecrunError::UnknownOperation(type_tag.to_string()).to_string()
            } else {
                format!("malformed {type_tag} message: {e}")
            };
            return json!({ "ok": false, "error": err });
        }
    };

    match body {
        RequestBody::ServerVersion => {
            info!("server: version {}", CORE_VERSION);
            json!({ "ok": true, "version": CORE_VERSION })
        }
        RequestBody::ServerKill => {
            info!("server: kill");
            std::process::exit(0);
        }
        RequestBody::RetrievalClear => {
            info!("retrieval: clear");
            status_json(state.retrieval.clear().await)
        }
        RequestBody::RetrievalUpsert { filename, content } => {
            info!("retrieval: upsert {}", filename);
            status_json(state.retrieval.upsert(&filename, content).await)
        }
        RequestBody::RetrievalSearch { text, top_k } => {
            info!("retrieval: search {}", text);
            let options = SearchOptions {
                top_k,
                ..Default::default()
            };
            match state.retrieval.search(&text, &options).await {
                Ok(res) => json!({
                    "ok": true,
                    "files": res.files,
                    "fragments": res.fragments,
                }),
                Err(e) => json!({ "ok": false, "error": format!("{e:#}") }),
            }
        }
    }
}

fn status_json(status: ResponseStatus) -> Value {
    match status.error {
        Some(error) => json!({ "ok": false, "error": error }),
        None => json!({ "ok": status.ok }),
    }
}
