//! Periodic GET of the server's project watch list.
//!
//! A refresh is requested on startup, every couple of minutes, and whenever
//! the WebSocket connection is lost (it might have missed a push). Once a
//! refresh is requested it is retried until it succeeds, then any requests
//! that piled up in the meantime are drained, since the latest response
//! already covers them.

use crate::backoff::ExponentialBackoff;
use crate::error::{WatcherError, WatcherResult};
use crate::models::{ProjectToWatch, WatchlistEntryList};
use crate::paths::{is_valid_url_base, strip_trailing_forward_slash};
use crate::registry::ProjectRegistry;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info};

/// Seconds between unprompted refreshes of the watch list.
const REFRESH_INTERVAL_SECS: u64 = 120;

/// Handle to the GET poller task.
#[derive(Clone)]
pub struct HttpGetStatusPoller {
    refresh_tx: mpsc::Sender<()>,
}

impl HttpGetStatusPoller {
    pub fn new(base_url: &str, registry: ProjectRegistry) -> WatcherResult<Self> {
        let base_url = strip_trailing_forward_slash(base_url).to_string();

        if !is_valid_url_base(&base_url) {
            return Err(WatcherError::InvalidUrl(base_url));
        }

        // The control plane may use a self-signed certificate.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| WatcherError::http(e.to_string()))?;

        let (refresh_tx, refresh_rx) = mpsc::channel(32);

        tokio::spawn(run_get_status_loop(
            base_url,
            client,
            registry,
            refresh_rx,
        ));

        let poller = Self { refresh_tx };

        // Fetch the initial watch list immediately.
        let startup = poller.clone();
        tokio::spawn(async move {
            startup.signal_status_refresh_needed().await;

            let mut ticker = tokio::time::interval(Duration::from_secs(REFRESH_INTERVAL_SECS));
            ticker.tick().await; // consume the immediate first tick
            loop {
                ticker.tick().await;
                debug!("GET status ticker ticked.");
                startup.signal_status_refresh_needed().await;
            }
        });

        Ok(poller)
    }

    /// Request that a new GET be sent to the server, for example after the
    /// WebSocket connection failed.
    pub async fn signal_status_refresh_needed(&self) {
        debug!("signal_status_refresh_needed called.");
        let _ = self.refresh_tx.send(()).await;
    }
}

async fn run_get_status_loop(
    base_url: String,
    client: reqwest::Client,
    registry: ProjectRegistry,
    mut refresh_rx: mpsc::Receiver<()>,
) {
    info!("HTTP GET status thread started.");

    let mut backoff = ExponentialBackoff::new();

    while refresh_rx.recv().await.is_some() {
        // Once a refresh is requested, keep trying until it succeeds.
        loop {
            match do_get_request(&client, &base_url, backoff.failure_delay()).await {
                Ok(entries) => {
                    backoff.success_reset();
                    registry.update_project_list_from_get_request(entries).await;
                    break;
                }
                Err(e) => {
                    error!("Error from GET request: {}", e);
                    backoff.sleep_after_fail().await;
                    backoff.fail_increase();
                }
            }
        }

        // Drain requests that arrived while this one was in flight.
        while refresh_rx.try_recv().is_ok() {}

        debug!("GET request successfully sent and received.");
    }
}

async fn do_get_request(
    client: &reqwest::Client,
    base_url: &str,
    failure_delay_ms: u64,
) -> WatcherResult<Vec<ProjectToWatch>> {
    // Wait before issuing a request, due to a previous failed request.
    if failure_delay_ms > 0 {
        sleep(Duration::from_millis(failure_delay_ms)).await;
    }

    let url = format!("{}/api/v1/projects/watchlist", base_url);

    info!("Initiating GET request to {}", url);

    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(|e| WatcherError::http(format!("GET request failed for {}: {}", url, e)))?;

    if resp.status() != reqwest::StatusCode::OK {
        return Err(WatcherError::http(format!(
            "GET response failed for {}, response code: {}",
            url,
            resp.status()
        )));
    }

    let body = resp
        .text()
        .await
        .map_err(|e| WatcherError::http(format!("Unable to read body for {}: {}", url, e)))?;

    info!(
        "GET request completed for {}. Response: {}",
        url,
        body.replace(['\r', '\n'], "")
    );

    let entries: WatchlistEntryList = serde_json::from_str(&body).map_err(|e| {
        WatcherError::http(format!("Unable to unmarshal body for {}: {}", url, e))
    })?;

    Ok(entries.projects)
}
