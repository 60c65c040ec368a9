//! Watch service: aggregates the per-project recursive watchers.
//!
//! The project registry asks this service to start or stop watching project
//! roots. Requests become channel messages consumed by a single task, which
//! is the only writer of the watcher map. Establishing a watch is two-phase:
//! a waiter task first polls for the project directory to exist (it may not
//! yet), and only then is the kernel watcher opened and the tree walked.

pub mod file_poller;
pub mod status;
pub mod watcher;

use crate::models::ProjectToWatch;
use crate::registry::ProjectRegistry;
use status::inform_watch_success_status;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Instant};
use tracing::{error, info};
use watcher::ProjectWatcher;

/// How long phase 1 waits for a project directory to appear.
const DIRECTORY_WAIT_TIMEOUT_SECS: u64 = 300;

/// Poll interval while waiting for the project directory.
const DIRECTORY_WAIT_POLL_MS: u64 = 100;

enum WatchMsg {
    AddRootPath {
        path: PathBuf,
        project: ProjectToWatch,
    },
    RemoveRootPath {
        path: PathBuf,
        project: ProjectToWatch,
    },
    DirectoryWaitResult {
        path: PathBuf,
        project: ProjectToWatch,
        success: bool,
    },
    Debug(oneshot::Sender<String>),
}

/// Handle to the watch service task.
#[derive(Clone)]
pub struct WatchService {
    tx: mpsc::Sender<WatchMsg>,
}

impl WatchService {
    pub fn new(registry: ProjectRegistry, base_url: String, client_uuid: String) -> Self {
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(watch_service_event_loop(
            rx,
            tx.clone(),
            registry,
            base_url,
            client_uuid,
        ));

        Self { tx }
    }

    /// Start watching a project root (replacing any previous watcher for the
    /// project, e.g. after a filter change). `path` is the local OS path.
    pub async fn add_root_path(&self, path: PathBuf, project: ProjectToWatch) {
        let _ = self.tx.send(WatchMsg::AddRootPath { path, project }).await;
    }

    pub async fn remove_root_path(&self, path: PathBuf, project: ProjectToWatch) {
        let _ = self
            .tx
            .send(WatchMsg::RemoveRootPath { path, project })
            .await;
    }

    pub async fn request_debug_message(&self) -> String {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(WatchMsg::Debug(reply_tx)).await.is_err() {
            return String::new();
        }
        reply_rx.await.unwrap_or_default()
    }
}

async fn watch_service_event_loop(
    mut rx: mpsc::Receiver<WatchMsg>,
    self_tx: mpsc::Sender<WatchMsg>,
    registry: ProjectRegistry,
    base_url: String,
    client_uuid: String,
) {
    // project id -> watcher entry
    let mut watched_projects: HashMap<String, ProjectWatcher> = HashMap::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            WatchMsg::AddRootPath { path, project } => {
                info!(
                    "Starting to add root path {} for project {}",
                    path.display(),
                    project.project_id
                );

                if let Some(existing) = watched_projects.get(&project.project_id) {
                    // A new add for a known project means the old watcher
                    // (and its filters) is stale.
                    existing.close_if_needed();
                }

                watched_projects.insert(project.project_id.clone(), ProjectWatcher::new(path.clone()));

                tokio::spawn(wait_for_watched_path_success(
                    path,
                    project,
                    self_tx.clone(),
                ));
            }
            WatchMsg::RemoveRootPath { path, project } => {
                match watched_projects.remove(&project.project_id) {
                    Some(existing) => {
                        info!(
                            "Removing project {} with root path {}",
                            project.project_id,
                            path.display()
                        );
                        existing.close_if_needed();
                    }
                    None => {
                        error!(
                            "Attempted to remove project {} with root path {} but it was not found",
                            project.project_id,
                            path.display()
                        );
                    }
                }
            }
            WatchMsg::DirectoryWaitResult {
                path,
                project,
                success,
            } => {
                info!(
                    "Processing directory wait result message: {} {} {}",
                    path.display(),
                    project.project_id,
                    success
                );

                if success {
                    // The watcher may have been removed while we waited.
                    let Some(entry) = watched_projects.get(&project.project_id) else {
                        continue;
                    };

                    let started = match entry.start_watcher(project.clone(), registry.clone()) {
                        Ok(()) => true,
                        Err(e) => {
                            error!("Error on establishing watch: {}", e);
                            false
                        }
                    };

                    inform_watch_success_status(
                        project,
                        started,
                        base_url.clone(),
                        client_uuid.clone(),
                        registry.clone(),
                    );
                } else {
                    inform_watch_success_status(
                        project,
                        false,
                        base_url.clone(),
                        client_uuid.clone(),
                        registry.clone(),
                    );
                }
            }
            WatchMsg::Debug(reply) => {
                let mut result = String::new();
                for (project_id, entry) in &watched_projects {
                    let (open, closed, snapshot) = entry.shared().debug_state();
                    result.push_str(&format!(
                        "- {} | {} | {}\n",
                        project_id,
                        entry.root_path().display(),
                        if closed { "(closed)" } else { "(open)" }
                    ));
                    if open {
                        result.push_str(&snapshot);
                    }
                }
                let _ = reply.send(result);
            }
        }
    }
}

/// Phase 1 of watch establishment: poll until the project directory exists
/// (it may not have been created yet), then report the outcome back to the
/// service loop.
async fn wait_for_watched_path_success(
    path: PathBuf,
    project: ProjectToWatch,
    tx: mpsc::Sender<WatchMsg>,
) {
    let expire_time = Instant::now() + Duration::from_secs(DIRECTORY_WAIT_TIMEOUT_SECS);
    let mut next_output_time: Option<Instant> = None;

    let mut watch_success = false;

    loop {
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => {
                watch_success = true;
                break;
            }
            _ => {
                match next_output_time {
                    None => next_output_time = Some(Instant::now() + Duration::from_secs(10)),
                    Some(t) if Instant::now() > t => {
                        next_output_time = None;
                        info!("Waiting for {} to exist", path.display());
                    }
                    _ => {}
                }
            }
        }

        if Instant::now() > expire_time {
            break;
        }

        sleep(Duration::from_millis(DIRECTORY_WAIT_POLL_MS)).await;
    }

    info!(
        "wait_for_watched_path_success completed for project {} with watch_success: {}",
        project.project_id, watch_success
    );

    let _ = tx
        .send(WatchMsg::DirectoryWaitResult {
            path,
            project,
            success: watch_success,
        })
        .await;
}
