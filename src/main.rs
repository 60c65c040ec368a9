//! Daemon entrypoint: validate arguments, construct the component tasks, and
//! wire them together.

use clap::Parser;
use syncwatchd::cli::Args;
use syncwatchd::debugdump::DebugTimer;
use syncwatchd::paths::{is_valid_url_base, strip_trailing_forward_slash};
use syncwatchd::queue::HttpPostOutputQueue;
use syncwatchd::registry::ProjectRegistry;
use syncwatchd::remote::{start_ws_connection_manager, HttpGetStatusPoller};
use syncwatchd::watch::file_poller::IndividualFileWatchService;
use syncwatchd::watch::WatchService;
use tracing::error;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let base_url = strip_trailing_forward_slash(&args.server_url).to_string();

    if !is_valid_url_base(&base_url) {
        error!("Server URL is invalid: {}", base_url);
        return;
    }

    let post_queue = match HttpPostOutputQueue::new(&base_url) {
        Ok(queue) => queue,
        Err(e) => {
            error!("Unable to create HTTP POST output queue: {}", e);
            return;
        }
    };

    let registry = ProjectRegistry::new(post_queue.clone(), args.sync_command_path.clone());

    let client_uuid = uuid::Uuid::new_v4().simple().to_string();

    let watch_service = WatchService::new(registry.clone(), base_url.clone(), client_uuid);
    registry.set_watch_service(watch_service.clone()).await;

    let file_poller = IndividualFileWatchService::new(registry.clone());
    registry
        .set_individual_file_watch_service(file_poller)
        .await;

    let get_poller = match HttpGetStatusPoller::new(&base_url, registry.clone()) {
        Ok(poller) => poller,
        Err(e) => {
            error!("Unable to create HTTP GET status poller: {}", e);
            return;
        }
    };

    if let Err(e) = start_ws_connection_manager(&base_url, registry.clone(), get_poller) {
        error!("Unable to start WebSocket connection manager: {}", e);
        return;
    }

    DebugTimer::new(watch_service, registry, post_queue).start();

    // The daemon runs until killed.
    std::future::pending::<()>().await;
}
