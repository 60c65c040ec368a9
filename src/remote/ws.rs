//! Persistent WebSocket connection to the control plane.
//!
//! The server pushes project-list deltas over this connection; losing it is
//! recovered by reconnecting (forever, with backoff) and triggering a GET
//! refresh to pick up anything missed while disconnected. A keep-alive `{}`
//! frame is written every 25 seconds.
//!
//! Each established connection runs as one `select!` loop; any read error,
//! write error, or close frame breaks the loop exactly once, so exactly one
//! reconnect and one refresh happen per lost connection.

use crate::backoff::ExponentialBackoff;
use crate::error::{WatcherError, WatcherResult};
use crate::models::WatchChangeJson;
use crate::paths::{is_valid_url_base, strip_trailing_forward_slash};
use crate::registry::ProjectRegistry;
use crate::remote::get_poller::HttpGetStatusPoller;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{error, info};

/// Seconds between keep-alive frames.
const KEEP_ALIVE_INTERVAL_SECS: u64 = 25;

/// Handshake timeout for a single connection attempt.
const HANDSHAKE_TIMEOUT_SECS: u64 = 15;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Derive the WebSocket URL from the server base URL and start the
/// connection manager task.
pub fn start_ws_connection_manager(
    base_url: &str,
    registry: ProjectRegistry,
    get_poller: HttpGetStatusPoller,
) -> WatcherResult<()> {
    let base_url = strip_trailing_forward_slash(base_url);

    if !is_valid_url_base(base_url) {
        return Err(WatcherError::InvalidUrl(base_url.to_string()));
    }

    let ws_url_type = if base_url.starts_with("https:") {
        "wss"
    } else {
        "ws"
    };

    let Some(last_slash) = base_url.rfind('/') else {
        return Err(WatcherError::InvalidUrl(format!(
            "Invalid URL format, no slash found: {}",
            base_url
        )));
    };

    let hostname_and_port = &base_url[last_slash + 1..];
    let ws_url = format!(
        "{}://{}/websockets/file-changes/v1",
        ws_url_type, hostname_and_port
    );

    tokio::spawn(event_loop(ws_url, registry, get_poller));

    Ok(())
}

async fn event_loop(ws_url: String, registry: ProjectRegistry, get_poller: HttpGetStatusPoller) {
    loop {
        let stream = connect_until_success(&ws_url).await;

        // We may have missed a watch refresh while disconnected, so
        // reacquire the latest watches.
        get_poller.signal_status_refresh_needed().await;

        run_connection(stream, &registry).await;

        info!("ws: connection lost, reconnecting");
        get_poller.signal_status_refresh_needed().await;
    }
}

/// Keep dialing until a connection is established.
async fn connect_until_success(ws_url: &str) -> WsStream {
    let mut backoff = ExponentialBackoff::new();

    loop {
        info!("ws: connecting to {}", ws_url);

        match dial(ws_url).await {
            Ok(stream) => {
                info!("ws: successfully connected to {}", ws_url);
                return stream;
            }
            Err(e) => {
                error!("ws: error on connecting: {}", e);
            }
        }

        backoff.sleep_after_fail().await;
        backoff.fail_increase();
    }
}

async fn dial(ws_url: &str) -> WatcherResult<WsStream> {
    // Same TLS posture as every other client in the daemon: certificate
    // verification off for self-signed control planes.
    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .map_err(|e| WatcherError::http(e.to_string()))?;

    let attempt = tokio::time::timeout(
        Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        connect_async_tls_with_config(ws_url, None, false, Some(Connector::NativeTls(tls))),
    )
    .await;

    match attempt {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(WatcherError::http(e.to_string())),
        Err(_) => Err(WatcherError::http(format!(
            "handshake timed out after {}s",
            HANDSHAKE_TIMEOUT_SECS
        ))),
    }
}

/// Drive one established connection until it fails or closes.
async fn run_connection(stream: WsStream, registry: &ProjectRegistry) {
    let (mut write, mut read) = stream.split();

    let mut keep_alive = tokio::time::interval(Duration::from_secs(KEEP_ALIVE_INTERVAL_SECS));
    keep_alive.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            _ = keep_alive.tick() => {
                if let Err(e) = write.send(Message::Text("{}".to_string())).await {
                    error!("ws: unable to write keep-alive message: {}", e);
                    return;
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_text_frame(&text, registry).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("ws: close frame received");
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("ws: read error: {}", e);
                        return;
                    }
                    None => {
                        info!("ws: stream ended");
                        return;
                    }
                }
            }
        }
    }
}

async fn handle_text_frame(text: &str, registry: &ProjectRegistry) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            error!("ws: error occurred while unmarshalling frame: {}", e);
            return;
        }
    };

    if value.get("type").and_then(|t| t.as_str()) == Some("debug") {
        // This frame is sent only by automated tests.
        if let Some(msg) = value.get("msg").and_then(|m| m.as_str()) {
            info!("------------------------------------------------------------");
            info!("[Server-Debug] {}", msg);
            info!("------------------------------------------------------------");
        }
        return;
    }

    let watch_change: WatchChangeJson = match serde_json::from_str(text) {
        Ok(change) => change,
        Err(e) => {
            error!("ws: error occurred while unmarshalling JSON: {}", e);
            return;
        }
    };

    info!("Received watch change message from WebSocket: {}", text);

    let project_updates: Vec<String> = watch_change
        .projects
        .iter()
        .map(|p| format!("[{} in {}]", p.project_id, p.path_to_monitor))
        .collect();

    registry
        .update_project_list_from_websocket(watch_change)
        .await;

    info!(
        "Watch list change message received for {{ {} }}",
        project_updates.join(", ")
    );
}
