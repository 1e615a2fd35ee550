//! Discovery and log-streaming HTTP server.
//!
//! Serves three endpoints on the configured discovery address: `/` is a small
//! log viewer page, `/state` dumps the discovery map as pretty JSON, and
//! `/logs` streams log messages as server-sent events with an optional
//! substring filter and ANSI-to-HTML rendering.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::ansi;
use crate::engine::Engine;

/// Binds the discovery address and serves until the root token is cancelled.
/// A disabled discovery configuration is a no-op.
pub async fn serve(engine: Arc<Engine>, root: CancellationToken) -> Result<()> {
    let Some(addr) = engine.discovery_addr().map(str::to_string) else {
        return Ok(());
    };
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind service discovery address {addr}"))?;
    info!("starting service discovery on {}", listener.local_addr()?);
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(async move { root.cancelled().await })
        .await
        .context("service discovery server error")?;
    Ok(())
}

fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/state", get(state_snapshot))
        .route("/logs", get(logs))
        .with_state(engine)
}

#[derive(Debug, Deserialize)]
struct IndexQuery {
    #[serde(default)]
    filter: String,
}

async fn index(Query(query): Query<IndexQuery>) -> Html<String> {
    let encoded = serde_json::to_string(&query.filter).unwrap_or_else(|_| "\"\"".to_string());
    Html(LOGS_PAGE.replace("__FILTER__", &encoded))
}

async fn state_snapshot(State(engine): State<Arc<Engine>>) -> Response {
    match serde_json::to_string_pretty(&engine.state.snapshot()) {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(err) => {
            error!("cannot serve service discovery request: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default)]
    filter: String,
    #[serde(default)]
    mode: String,
}

async fn logs(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let subscription = engine.mux.subscribe();
    let filter = query.filter;
    let html = query.mode == "html";
    let events = stream::unfold(subscription, |mut subscription| async move {
        subscription.recv().await.map(|msg| (msg, subscription))
    })
    .filter_map(move |mut msg| {
        let keep =
            filter.is_empty() || msg.name.contains(&filter) || msg.line.contains(&filter);
        if keep && html {
            msg.line = ansi::render_html(&msg.line);
        }
        futures_util::future::ready(keep.then_some(msg))
    })
    .map(|msg| Event::default().json_data(&msg));
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
}

const LOGS_PAGE: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>devrack</title>
<style>
body { background: #111; color: #ddd; font-family: monospace; margin: 0; }
#state { border-bottom: 1px solid #333; padding: 8px; margin: 0; color: #9a9; }
#logs { padding: 8px; }
#logs div { white-space: pre-wrap; }
</style>
</head>
<body>
<pre id="state"></pre>
<div id="logs"></div>
<script>
const filter = __FILTER__;
const params = new URLSearchParams({ mode: "html" });
if (filter) params.set("filter", filter);
const logs = document.getElementById("logs");
const source = new EventSource("/logs?" + params.toString());
source.onmessage = (event) => {
  const msg = JSON.parse(event.data);
  const line = document.createElement("div");
  line.innerHTML = msg.paddedName.replace(/ /g, "&nbsp;") + ": " + msg.line;
  logs.appendChild(line);
  while (logs.childElementCount > 5000) logs.removeChild(logs.firstChild);
  window.scrollTo(0, document.body.scrollHeight);
};
const refreshState = async () => {
  const res = await fetch("/state");
  document.getElementById("state").textContent = await res.text();
};
refreshState();
setInterval(refreshState, 2000);
</script>
</body>
</html>
"#;
