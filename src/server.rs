//! HTTP surface: viewer page, SSE packet stream, and JSON inspection endpoints.
//!
//! - `GET /` — viewer UI
//! - `GET /stream` — live `text/event-stream`, one `data: <packet json>` event
//!   per packet; `?backlog=true` replays the stored history first
//! - `GET /api/packets` — snapshot of the stored history
//! - `GET /api/stats` — pipeline counters

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, Json};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::packet::Packet;
use crate::pipeline::{Pipeline, PipelineStats};

const INDEX_HTML: &str = include_str!("../templates/index.html");

#[derive(Debug, Default, Deserialize)]
struct StreamParams {
    #[serde(default)]
    backlog: bool,
}

/// Build the router over a shared pipeline
pub fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/stream", get(stream))
        .route("/api/packets", get(api_packets))
        .route("/api/stats", get(api_stats))
        .with_state(pipeline)
}

/// Bind and serve until `shutdown` resolves
pub async fn serve<F>(pipeline: Arc<Pipeline>, bind: SocketAddr, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind to {}", bind))?;

    info!("Web server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(pipeline))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Web server error")?;

    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// GET /stream — one session per connection, ended by client disconnect
async fn stream(
    State(pipeline): State<Arc<Pipeline>>,
    Query(params): Query<StreamParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (backlog, subscription) = if params.backlog {
        pipeline.subscribe_with_backlog()
    } else {
        (Vec::new(), pipeline.subscribe())
    };
    debug!(
        "Viewer session {} connected (backlog: {} packets)",
        subscription.id(),
        backlog.len()
    );

    let events = tokio_stream::iter(backlog)
        .chain(subscription)
        .filter_map(|packet| encode_event(&packet).map(Ok::<_, Infallible>));

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Frame a packet as an SSE event. A packet that cannot be encoded is
/// skipped for this session only.
fn encode_event(packet: &Packet) -> Option<Event> {
    match Event::default().json_data(packet) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Dropping packet that failed to serialize: {}", e);
            None
        }
    }
}

/// GET /api/packets — stored history, oldest first
async fn api_packets(State(pipeline): State<Arc<Pipeline>>) -> Json<Vec<Arc<Packet>>> {
    Json(pipeline.snapshot())
}

/// GET /api/stats
async fn api_stats(State(pipeline): State<Arc<Pipeline>>) -> Json<PipelineStats> {
    Json(pipeline.stats())
}
