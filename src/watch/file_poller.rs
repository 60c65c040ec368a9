//! Individual-file poller.
//!
//! Watches a small number of individual files, for example linked files named
//! by the `refPaths` field of a watched project. These may live outside any
//! project root, so the recursive watcher can't see them; instead they are
//! polled by mtime every couple of seconds. Files watched here do not need to
//! exist. A single instance exists per daemon.

use crate::models::{now_millis, ChangedFileEntry, EventType};
use crate::paths::{canonicalize_local_path, convert_absolute_unix_style_normalized_path_to_local_file};
use crate::registry::ProjectRegistry;
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info};

/// Delay between poll passes, measured from the end of the previous pass.
const POLL_INTERVAL_SECS: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollEntryStatus {
    /// Just subscribed; the first tick only records a baseline and reports
    /// nothing, so a pre-existing file is not announced as created.
    RecentlyAdded,
    Exists,
    DoesNotExist,
}

struct PollEntry {
    last_observed_status: PollEntryStatus,
    /// Local OS path, used for stat calls.
    local_path: String,
    /// Canonical form, used in reported entries.
    canonical_path: String,
    /// 0 when the file does not exist.
    last_modified_time: i64,
}

enum FilePollerMsg {
    SetFilesToWatch {
        project_id: String,
        paths: Vec<String>,
    },
    TimerTick,
}

/// Handle to the poller task.
#[derive(Clone)]
pub struct IndividualFileWatchService {
    tx: mpsc::Sender<FilePollerMsg>,
}

impl IndividualFileWatchService {
    pub fn new(registry: ProjectRegistry) -> Self {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(command_receiver(rx, tx.clone(), registry));
        Self { tx }
    }

    /// Replace the set of files watched for a project. Paths are canonical;
    /// an empty list unsubscribes the project.
    pub async fn set_files_to_watch(&self, project_id: &str, paths: Vec<String>) {
        let _ = self
            .tx
            .send(FilePollerMsg::SetFilesToWatch {
                project_id: project_id.to_string(),
                paths,
            })
            .await;
    }
}

async fn command_receiver(
    mut rx: mpsc::Receiver<FilePollerMsg>,
    self_tx: mpsc::Sender<FilePollerMsg>,
    registry: ProjectRegistry,
) {
    // project id -> (local path -> poll entry)
    let mut files_to_watch_map: HashMap<String, HashMap<String, PollEntry>> = HashMap::new();

    schedule_tick(self_tx.clone());

    while let Some(msg) = rx.recv().await {
        match msg {
            FilePollerMsg::SetFilesToWatch { project_id, paths } => {
                handle_set_files_to_watch(&project_id, paths, &mut files_to_watch_map);
            }
            FilePollerMsg::TimerTick => {
                timer_tick(&mut files_to_watch_map, &registry).await;
                schedule_tick(self_tx.clone());
            }
        }
    }
}

/// The next poll pass starts a fixed delay after the previous one finishes.
fn schedule_tick(tx: mpsc::Sender<FilePollerMsg>) {
    tokio::spawn(async move {
        sleep(Duration::from_secs(POLL_INTERVAL_SECS)).await;
        let _ = tx.send(FilePollerMsg::TimerTick).await;
    });
}

async fn timer_tick(
    files_to_watch_map: &mut HashMap<String, HashMap<String, PollEntry>>,
    registry: &ProjectRegistry,
) {
    // project id -> changes observed this pass
    let mut file_changes_detected: HashMap<String, Vec<ChangedFileEntry>> = HashMap::new();

    for (project_id, files_to_watch) in files_to_watch_map.iter_mut() {
        for entry in files_to_watch.values_mut() {
            let (file_exists, file_modified_time) = match std::fs::metadata(&entry.local_path) {
                Ok(metadata) => {
                    let mtime = metadata
                        .modified()
                        .ok()
                        .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
                        .map(|d| d.as_millis() as i64)
                        .unwrap_or(0);
                    (true, mtime)
                }
                Err(_) => (false, 0),
            };

            let new_status = if file_exists {
                PollEntryStatus::Exists
            } else {
                PollEntryStatus::DoesNotExist
            };

            if entry.last_observed_status != PollEntryStatus::RecentlyAdded {
                if entry.last_observed_status != new_status {
                    let event_type = if file_exists {
                        info!("Watched file now exists: {}", entry.local_path);
                        EventType::Create
                    } else {
                        info!("Watched file has been deleted: {}", entry.local_path);
                        EventType::Delete
                    };

                    match ChangedFileEntry::new(
                        entry.canonical_path.clone(),
                        event_type,
                        now_millis(),
                        false,
                    ) {
                        Ok(changed) => file_changes_detected
                            .entry(project_id.clone())
                            .or_default()
                            .push(changed),
                        Err(e) => error!("Unable to create changed file entry: {}", e),
                    }
                }

                if file_modified_time > 0
                    && entry.last_modified_time > 0
                    && file_modified_time != entry.last_modified_time
                {
                    info!(
                        "Watched file change detected: {} {} {}",
                        entry.local_path, file_modified_time, entry.last_modified_time
                    );

                    match ChangedFileEntry::new(
                        entry.canonical_path.clone(),
                        EventType::Modify,
                        now_millis(),
                        false,
                    ) {
                        Ok(changed) => file_changes_detected
                            .entry(project_id.clone())
                            .or_default()
                            .push(changed),
                        Err(e) => error!("Unable to create changed file entry: {}", e),
                    }
                }
            }

            entry.last_observed_status = new_status;
            entry.last_modified_time = file_modified_time;
        }
    }

    for (project_id, entries) in file_changes_detected {
        if entries.is_empty() {
            continue;
        }
        registry
            .receive_individual_changes_file_list(project_id, entries)
            .await;
    }
}

/// Synchronize a project's watched-file set with the latest list from the
/// server: new paths start as RecentlyAdded, absent paths are dropped.
fn handle_set_files_to_watch(
    project_id: &str,
    paths_from_ptw: Vec<String>,
    files_to_watch_map: &mut HashMap<String, HashMap<String, PollEntry>>,
) {
    let mut paths: Vec<(String, String)> = Vec::new();
    for path_from_ptw in paths_from_ptw {
        let local = match convert_absolute_unix_style_normalized_path_to_local_file(&path_from_ptw)
        {
            Ok(local) => local,
            Err(e) => {
                error!("Unable to convert path {}: {}", path_from_ptw, e);
                continue;
            }
        };

        // Directories are not supported here.
        if std::fs::metadata(&local).map(|m| m.is_dir()).unwrap_or(false) {
            error!(
                "Project '{}' was asked to watch a directory, which is not supported: {}",
                project_id, local
            );
            continue;
        }

        let canonical = match canonicalize_local_path(Path::new(&local)) {
            Ok(canonical) => canonical,
            Err(e) => {
                error!("Unable to canonicalize path {}: {}", local, e);
                continue;
            }
        };

        paths.push((local, canonical));
    }

    if paths.is_empty() {
        if files_to_watch_map.remove(project_id).is_some() {
            info!("Files to watch - project unsubscribed: {}", project_id);
        }
        return;
    }

    match files_to_watch_map.get_mut(project_id) {
        None => {
            let mut new_files = HashMap::new();
            for (local, canonical) in paths {
                info!("Files to watch - recently added for new project: {}", local);
                new_files.insert(
                    local.clone(),
                    PollEntry {
                        last_observed_status: PollEntryStatus::RecentlyAdded,
                        local_path: local,
                        canonical_path: canonical,
                        last_modified_time: 0,
                    },
                );
            }
            files_to_watch_map.insert(project_id.to_string(), new_files);
        }
        Some(curr_project_state) => {
            for (local, canonical) in &paths {
                if !curr_project_state.contains_key(local) {
                    info!(
                        "Files to watch - recently added for existing project: {}",
                        local
                    );
                    curr_project_state.insert(
                        local.clone(),
                        PollEntry {
                            last_observed_status: PollEntryStatus::RecentlyAdded,
                            local_path: local.clone(),
                            canonical_path: canonical.clone(),
                            last_modified_time: 0,
                        },
                    );
                }
            }

            // Paths we WERE watching but are no longer.
            let keys_to_remove: Vec<String> = curr_project_state
                .keys()
                .filter(|existing| !paths.iter().any(|(local, _)| local == *existing))
                .cloned()
                .collect();

            for key in keys_to_remove {
                info!("Files to watch - removing from watch list: {}", key);
                curr_project_state.remove(&key);
            }

            if curr_project_state.is_empty() {
                files_to_watch_map.remove(project_id);
            }
        }
    }
}
