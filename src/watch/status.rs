//! Reports the outcome of a watch-setup attempt back to the server.

use crate::backoff::ExponentialBackoff;
use crate::models::ProjectToWatch;
use crate::registry::ProjectRegistry;
use tracing::{debug, error, info};

/// Fire-and-forget: PUT the success/failure of establishing a watch to the
/// server, retrying with backoff until a 200 comes back. On success the
/// registry is also poked so a configured sync command can do its first run.
pub fn inform_watch_success_status(
    project: ProjectToWatch,
    success: bool,
    base_url: String,
    client_uuid: String,
    registry: ProjectRegistry,
) {
    tokio::spawn(async move {
        if success {
            registry
                .sync_command_update(project.project_id.clone())
                .await;
        }

        let success_val = if success { "true" } else { "false" };

        let url = format!(
            "{}/api/v1/projects/{}/file-changes/{}/status?clientUuid={}",
            base_url, project.project_id, project.project_watch_state_id, client_uuid
        );

        let client = match reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                error!("Unable to build HTTP client for status PUT: {}", e);
                return;
            }
        };

        let mut backoff = ExponentialBackoff::new();

        loop {
            debug!("Sending PUT request to {}", url);

            let result = client
                .put(&url)
                .json(&serde_json::json!({ "success": success_val }))
                .send()
                .await;

            match result {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => break,
                Ok(resp) => {
                    error!(
                        "Status code from PUT was not 200 - {} for {}",
                        resp.status(),
                        url
                    );
                }
                Err(e) => {
                    error!("Error from PUT request: {}", e);
                }
            }

            backoff.sleep_after_fail().await;
            backoff.fail_increase();
        }

        info!(
            "Successfully informed server of watch state for {}, watch-state-id: {}, success: {}",
            project.project_id, project.project_watch_state_id, success_val
        );
    });
}
