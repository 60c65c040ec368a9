//! HTTP POST output queue.
//!
//! Batched file changes arrive here as lists of compressed chunk payloads and
//! leave as POST requests against the control plane. A single dispatcher task
//! owns the timestamp-ordered group list, a small worker pool, and the shared
//! backoff; workers report each request's outcome back to the dispatcher.
//! Delivery is best-effort-forever: failed chunks are retried until the
//! process exits.

pub mod group;

use crate::backoff::ExponentialBackoff;
use crate::error::{WatcherError, WatcherResult};
use crate::paths::{is_valid_url_base, strip_trailing_forward_slash};
use group::{ChunkGroupPriorityList, PostQueueChunk, PostQueueChunkGroup};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, error, info};

const MAX_WORKERS: usize = 3;

enum QueueMsg {
    AddToQueue {
        project_id: String,
        timestamp: i64,
        base64_compressed: Vec<String>,
    },
    Debug(oneshot::Sender<String>),
}

struct WorkResult {
    chunk_id: usize,
    group_id: u64,
    success: bool,
}

/// Handle to the POST output queue. Cheap to clone; all operations are
/// forwarded to the dispatcher task.
#[derive(Clone)]
pub struct HttpPostOutputQueue {
    tx: mpsc::Sender<QueueMsg>,
}

impl HttpPostOutputQueue {
    pub fn new(base_url: &str) -> WatcherResult<Self> {
        let base_url = strip_trailing_forward_slash(base_url).to_string();

        if !is_valid_url_base(&base_url) {
            return Err(WatcherError::InvalidUrl(base_url));
        }

        // Certificate verification is intentionally disabled: the control
        // plane commonly runs with a self-signed certificate.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| WatcherError::http(e.to_string()))?;

        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(work_manager(base_url, client, rx));

        Ok(Self { tx })
    }

    /// Split `base64_compressed` into a chunk group and queue it for
    /// delivery.
    pub async fn add_to_queue(
        &self,
        project_id: &str,
        timestamp: i64,
        base64_compressed: Vec<String>,
    ) {
        let count = base64_compressed.len();
        let _ = self
            .tx
            .send(QueueMsg::AddToQueue {
                project_id: project_id.to_string(),
                timestamp,
                base64_compressed,
            })
            .await;
        debug!("Added file changes to queue: {} {}", count, project_id);
    }

    pub async fn request_debug_message(&self) -> String {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(QueueMsg::Debug(reply_tx)).await.is_err() {
            return String::new();
        }
        reply_rx.await.unwrap_or_default()
    }
}

async fn work_manager(base_url: String, client: reqwest::Client, mut rx: mpsc::Receiver<QueueMsg>) {
    info!("HTTP POST output queue started for {}", base_url);

    let mut priority_list = ChunkGroupPriorityList::new();
    let mut active_workers: usize = 0;
    let mut backoff = ExponentialBackoff::new();
    let mut next_group_id: u64 = 0;

    let (complete_tx, mut complete_rx) = mpsc::channel::<WorkResult>(MAX_WORKERS + 1);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(QueueMsg::AddToQueue { project_id, timestamp, base64_compressed }) => {
                        next_group_id += 1;
                        priority_list.add_to_list(PostQueueChunkGroup::new(
                            next_group_id,
                            &project_id,
                            timestamp,
                            base64_compressed,
                        ));
                        debug!("Added new work to HTTP POST output queue");

                        queue_more_work_if_needed(
                            &base_url,
                            &client,
                            &mut priority_list,
                            &mut active_workers,
                            &backoff,
                            &complete_tx,
                        );
                    }
                    Some(QueueMsg::Debug(reply)) => {
                        let _ = reply.send(debug_summary(&priority_list, active_workers));
                    }
                    None => break,
                }
            }
            Some(result) = complete_rx.recv() => {
                active_workers -= 1;

                match priority_list.find_mut(result.group_id) {
                    Some(group) => {
                        if result.success {
                            backoff.success_reset();
                            group.inform_chunk_sent(result.chunk_id);
                        } else {
                            debug!("Existing work failed, requeueing in HTTP POST output queue");
                            backoff.fail_increase();
                            group.inform_chunk_failed_to_send(result.chunk_id);
                        }
                    }
                    None => {
                        error!(
                            "Worker completion for unknown chunk group: {}",
                            result.group_id
                        );
                    }
                }

                queue_more_work_if_needed(
                    &base_url,
                    &client,
                    &mut priority_list,
                    &mut active_workers,
                    &backoff,
                    &complete_tx,
                );
            }
        }
    }
}

/// Spawn POST workers while there is work at the front of the list and a
/// free worker slot. Only the front group is ever drained, which is what
/// guarantees ascending-timestamp delivery.
fn queue_more_work_if_needed(
    base_url: &str,
    client: &reqwest::Client,
    priority_list: &mut ChunkGroupPriorityList,
    active_workers: &mut usize,
    backoff: &ExponentialBackoff,
    complete_tx: &mpsc::Sender<WorkResult>,
) {
    while *active_workers < MAX_WORKERS {
        let Some(front) = priority_list.peek_mut() else {
            break;
        };

        if front.is_group_complete() {
            priority_list.pop();
            continue;
        }

        match front.acquire_next_chunk_available_to_send() {
            Some(chunk) => {
                tokio::spawn(do_request(
                    base_url.to_string(),
                    client.clone(),
                    chunk,
                    complete_tx.clone(),
                    backoff.failure_delay(),
                ));
                *active_workers += 1;
            }
            // Chunks remain but all are in flight; wait for a completion.
            None => break,
        }
    }
}

fn debug_summary(priority_list: &ChunkGroupPriorityList, active_workers: usize) -> String {
    let mut result = format!(
        "- active-workers: {}  chunkGroupList-size: {}\n",
        active_workers,
        priority_list.len()
    );

    if !priority_list.is_empty() {
        result.push_str("- HTTP POST chunk group list:\n");
        for group in priority_list.iter() {
            result.push_str(&format!(
                "  - projectID: {}  timestamp: {}\n",
                group.project_id().unwrap_or(""),
                group.timestamp()
            ));
        }
    }

    result
}

/// One worker: wait out the current failure delay, send the POST, report the
/// outcome, and terminate.
async fn do_request(
    base_url: String,
    client: reqwest::Client,
    chunk: PostQueueChunk,
    complete_tx: mpsc::Sender<WorkResult>,
    failure_delay_ms: u64,
) {
    if failure_delay_ms > 0 {
        sleep(Duration::from_millis(failure_delay_ms)).await;
    }

    let success = match send_post(&client, &base_url, &chunk).await {
        Ok(()) => true,
        Err(e) => {
            error!("Error occurred on send: {}", e);
            false
        }
    };

    let _ = complete_tx
        .send(WorkResult {
            chunk_id: chunk.chunk_id,
            group_id: chunk.group_id,
            success,
        })
        .await;
}

async fn send_post(
    client: &reqwest::Client,
    base_url: &str,
    chunk: &PostQueueChunk,
) -> WatcherResult<()> {
    let url = format!(
        "{}/api/v1/projects/{}/file-changes?timestamp={}&chunk={}&chunk_total={}",
        base_url, chunk.project_id, chunk.timestamp, chunk.chunk_id, chunk.chunk_total
    );

    info!(
        "Sending POST request to {} with payload size {}",
        url,
        chunk.base64_compressed.len()
    );

    let resp = client
        .post(&url)
        .json(&serde_json::json!({ "msg": chunk.base64_compressed }))
        .send()
        .await
        .map_err(|e| WatcherError::http(e.to_string()))?;

    if resp.status() != reqwest::StatusCode::OK {
        return Err(WatcherError::http(format!(
            "Response code was {} for {}",
            resp.status(),
            url
        )));
    }

    Ok(())
}
