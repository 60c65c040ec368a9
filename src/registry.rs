//! Project registry: the single writer of the live project set.
//!
//! Both control-plane feeds (the periodic GET poll and the WebSocket push)
//! submit their desired watch state here; the registry reconciles it with
//! the running set of projects, creating and destroying per-project
//! pipelines and instructing the watch service to start or stop watching
//! each root. It also owns the filtering step that decides which raw watch
//! events are reportable.

use crate::batch::FileChangeBatcher;
use crate::filter::PathFilter;
use crate::models::{
    merge_project_creation_time, now_millis, ChangedFileEntry, ProjectToWatch, WatchChangeJson,
    WatchEventEntry,
};
use crate::paths::{
    absolute_to_project_relative, convert_absolute_unix_style_normalized_path_to_local_file,
    split_relative_path_into_component_paths, strip_trailing_forward_slash,
};
use crate::queue::HttpPostOutputQueue;
use crate::synccmd::SyncCommandState;
use crate::watch::file_poller::IndividualFileWatchService;
use crate::watch::WatchService;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

enum RegistryMsg {
    SetWatchService(WatchService),
    SetIndividualFileWatchService(IndividualFileWatchService),
    UpdateFromGet(Vec<ProjectToWatch>),
    UpdateFromWebSocket(WatchChangeJson),
    WatchEvent {
        entry: WatchEventEntry,
        project: ProjectToWatch,
    },
    IndividualFileChanges {
        project_id: String,
        entries: Vec<ChangedFileEntry>,
    },
    SyncCommandUpdate {
        project_id: String,
    },
    Debug(oneshot::Sender<String>),
}

/// Per-project pipeline: the latest server snapshot, the batcher, and the
/// optional sync-command launcher.
struct ProjectState {
    project: ProjectToWatch,
    batcher: FileChangeBatcher,
    sync_command: Option<SyncCommandState>,
}

/// Handle to the registry task. Cheap to clone.
#[derive(Clone)]
pub struct ProjectRegistry {
    tx: mpsc::Sender<RegistryMsg>,
}

impl ProjectRegistry {
    /// `installer_path` is the external sync command, when one was given on
    /// the command line; without it, changes go out over HTTP POST.
    pub fn new(post_queue: HttpPostOutputQueue, installer_path: Option<String>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(channel_listener(rx, post_queue, installer_path));
        Self { tx }
    }

    pub async fn set_watch_service(&self, watch_service: WatchService) {
        let _ = self
            .tx
            .send(RegistryMsg::SetWatchService(watch_service))
            .await;
    }

    pub async fn set_individual_file_watch_service(&self, poller: IndividualFileWatchService) {
        let _ = self
            .tx
            .send(RegistryMsg::SetIndividualFileWatchService(poller))
            .await;
    }

    /// Full desired state from the GET poll.
    pub async fn update_project_list_from_get_request(&self, entries: Vec<ProjectToWatch>) {
        let _ = self.tx.send(RegistryMsg::UpdateFromGet(entries)).await;
    }

    /// Delta update pushed over the WebSocket.
    pub async fn update_project_list_from_websocket(&self, change: WatchChangeJson) {
        let _ = self.tx.send(RegistryMsg::UpdateFromWebSocket(change)).await;
    }

    /// Raw event from a project watcher.
    pub async fn receive_watch_event(&self, entry: WatchEventEntry, project: ProjectToWatch) {
        let _ = self
            .tx
            .send(RegistryMsg::WatchEvent { entry, project })
            .await;
    }

    /// Changes observed by the individual-file poller.
    pub async fn receive_individual_changes_file_list(
        &self,
        project_id: String,
        entries: Vec<ChangedFileEntry>,
    ) {
        let _ = self
            .tx
            .send(RegistryMsg::IndividualFileChanges {
                project_id,
                entries,
            })
            .await;
    }

    /// Poke the project's sync command (watch established, or batch flushed).
    pub async fn sync_command_update(&self, project_id: String) {
        let _ = self
            .tx
            .send(RegistryMsg::SyncCommandUpdate { project_id })
            .await;
    }

    pub async fn request_debug_message(&self) -> String {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(RegistryMsg::Debug(reply_tx)).await.is_err() {
            return String::new();
        }
        reply_rx.await.unwrap_or_default()
    }
}

async fn channel_listener(
    mut rx: mpsc::Receiver<RegistryMsg>,
    post_queue: HttpPostOutputQueue,
    installer_path: Option<String>,
) {
    // project id -> most recent state for the project
    let mut projects_map: HashMap<String, ProjectState> = HashMap::new();
    let mut watch_service: Option<WatchService> = None;
    let mut file_poller: Option<IndividualFileWatchService> = None;

    while let Some(msg) = rx.recv().await {
        match msg {
            RegistryMsg::SetWatchService(service) => {
                watch_service = Some(service);
            }
            RegistryMsg::SetIndividualFileWatchService(poller) => {
                file_poller = Some(poller);
            }
            RegistryMsg::UpdateFromGet(entries) => {
                handle_update_from_get_request(
                    entries,
                    &mut projects_map,
                    watch_service.as_ref(),
                    file_poller.as_ref(),
                    &post_queue,
                    installer_path.as_deref(),
                )
                .await;
            }
            RegistryMsg::UpdateFromWebSocket(change) => {
                handle_update_from_websocket(
                    change,
                    &mut projects_map,
                    watch_service.as_ref(),
                    file_poller.as_ref(),
                    &post_queue,
                    installer_path.as_deref(),
                )
                .await;
            }
            RegistryMsg::WatchEvent { entry, project } => {
                handle_receive_new_watch_event(entry, project, &projects_map).await;
            }
            RegistryMsg::IndividualFileChanges {
                project_id,
                entries,
            } => {
                handle_individual_changes(project_id, entries, &projects_map).await;
            }
            RegistryMsg::SyncCommandUpdate { project_id } => {
                handle_sync_command_update(&project_id, &projects_map, installer_path.as_deref())
                    .await;
            }
            RegistryMsg::Debug(reply) => {
                let _ = reply.send(debug_summary(&projects_map));
            }
        }
    }
}

/// Synchronize with the full desired state from a GET response. Projects
/// absent from the response are removed first, so a subsequent create that
/// reuses the same path is not disturbed.
async fn handle_update_from_get_request(
    entries: Vec<ProjectToWatch>,
    projects_map: &mut HashMap<String, ProjectState>,
    watch_service: Option<&WatchService>,
    file_poller: Option<&IndividualFileWatchService>,
    post_queue: &HttpPostOutputQueue,
    installer_path: Option<&str>,
) {
    let mut ids_in_result: HashSet<String> = HashSet::new();
    for project in &entries {
        if !ids_in_result.insert(project.project_id.clone()) {
            error!(
                "Multiple projects in the project list share the same project ID: {}",
                project.project_id
            );
        }
    }

    let removed_ids: Vec<String> = projects_map
        .keys()
        .filter(|id| !ids_in_result.contains(*id))
        .cloned()
        .collect();

    for id in removed_ids {
        let Some(removed) = projects_map.remove(&id) else {
            continue;
        };
        info!(
            "Removing project from watch list from GET: {} {}",
            removed.project.project_id, removed.project.path_to_monitor
        );
        remove_project_watches(&removed.project, watch_service, file_poller).await;
    }

    for project in entries {
        process_project(
            project,
            projects_map,
            watch_service,
            file_poller,
            post_queue,
            installer_path,
        )
        .await;
    }
}

/// Apply a delta update from the WebSocket. Unlike the GET path, the message
/// says how the list changed: `changeType == "delete"` removes the project,
/// anything else is add-or-update.
async fn handle_update_from_websocket(
    change: WatchChangeJson,
    projects_map: &mut HashMap<String, ProjectState>,
    watch_service: Option<&WatchService>,
    file_poller: Option<&IndividualFileWatchService>,
    post_queue: &HttpPostOutputQueue,
    installer_path: Option<&str>,
) {
    info!("Processing a received file watch state from WebSocket");

    for project_from_ws in change.projects {
        if project_from_ws.change_type == "delete" {
            // Prefer the stored snapshot's path; the delete message may omit
            // everything but the id.
            let to_remove = match projects_map.remove(&project_from_ws.project_id) {
                Some(state) => {
                    info!(
                        "Removing project from watch list: {} {}",
                        state.project.project_id, state.project.path_to_monitor
                    );
                    state.project
                }
                None => {
                    error!(
                        "Unable to find deleted project from WebSocket in project map: {}",
                        project_from_ws.project_id
                    );
                    project_from_ws
                }
            };

            remove_project_watches(&to_remove, watch_service, file_poller).await;
        } else {
            process_project(
                project_from_ws,
                projects_map,
                watch_service,
                file_poller,
                post_queue,
                installer_path,
            )
            .await;
        }
    }
}

async fn remove_project_watches(
    project: &ProjectToWatch,
    watch_service: Option<&WatchService>,
    file_poller: Option<&IndividualFileWatchService>,
) {
    if let Some(poller) = file_poller {
        poller.set_files_to_watch(&project.project_id, Vec::new()).await;
    }

    let file_to_monitor =
        match convert_absolute_unix_style_normalized_path_to_local_file(&project.path_to_monitor) {
            Ok(path) => path,
            Err(e) => {
                error!("Unable to convert path after project remove: {}", e);
                return;
            }
        };

    debug!(
        "Calling watch service removePath with file: {}",
        file_to_monitor
    );

    match watch_service {
        Some(service) => {
            service
                .remove_root_path(PathBuf::from(file_to_monitor), project.clone())
                .await;
        }
        None => {
            error!(
                "Watch service is not set and a remove_root_path was missed: {}",
                file_to_monitor
            );
        }
    }
}

/// Synchronize one project in the map with a new snapshot from the server,
/// creating it if this is the first time the id has been seen.
async fn process_project(
    project_to_process: ProjectToWatch,
    projects_map: &mut HashMap<String, ProjectState>,
    watch_service: Option<&WatchService>,
    file_poller: Option<&IndividualFileWatchService>,
    post_queue: &HttpPostOutputQueue,
    installer_path: Option<&str>,
) {
    if let Some(curr_state) = projects_map.get_mut(&project_to_process.project_id) {
        // Once set, a project's monitored path never changes for its id.
        if curr_state.project.path_to_monitor != project_to_process.path_to_monitor {
            error!("The path to monitor of a project cannot be changed once it is set, for a particular project id");
            return;
        }

        let file_to_monitor = match convert_absolute_unix_style_normalized_path_to_local_file(
            &project_to_process.path_to_monitor,
        ) {
            Ok(path) => path,
            Err(e) => {
                error!(
                    "Unable to convert from absolute unix style normalized path {}: {}",
                    project_to_process.path_to_monitor, e
                );
                return;
            }
        };

        let merged_creation_time = merge_project_creation_time(
            curr_state.project.project_creation_time,
            project_to_process.project_creation_time,
        );

        let ref_paths_changed = curr_state.project.ref_paths != project_to_process.ref_paths;

        if curr_state.project.project_watch_state_id != project_to_process.project_watch_state_id {
            info!(
                "The project watch state has changed: {} {} for project {}",
                curr_state.project.project_watch_state_id,
                project_to_process.project_watch_state_id,
                project_to_process.project_id
            );

            // Store the new snapshot; changeType describes the message, not
            // the project, so it is not retained.
            let mut updated = project_to_process.clone();
            updated.change_type = String::new();
            updated.project_creation_time = merged_creation_time;
            curr_state.project = updated;

            // The filters may have changed, so the watcher is rebuilt:
            // remove, then add.
            match watch_service {
                Some(service) => {
                    service
                        .remove_root_path(
                            PathBuf::from(&file_to_monitor),
                            curr_state.project.clone(),
                        )
                        .await;
                    info!(
                        "From update, removed project with path '{}' from watch list",
                        curr_state.project.path_to_monitor
                    );

                    service
                        .add_root_path(PathBuf::from(&file_to_monitor), curr_state.project.clone())
                        .await;
                    info!(
                        "From update, added new project with path '{}' to watch list",
                        curr_state.project.path_to_monitor
                    );
                }
                None => {
                    error!(
                        "Watch service is not set and a watcher rebuild was missed: {}",
                        file_to_monitor
                    );
                }
            }
        } else {
            info!(
                "The project watch state has not changed for project {}",
                project_to_process.project_id
            );

            if curr_state.project.project_creation_time != merged_creation_time {
                let mut updated = curr_state.project.clone();
                updated.project_creation_time = merged_creation_time;
                curr_state.project = updated;
            }

            if ref_paths_changed {
                let mut updated = curr_state.project.clone();
                updated.ref_paths = project_to_process.ref_paths.clone();
                curr_state.project = updated;
            }
        }

        if ref_paths_changed {
            if let Some(poller) = file_poller {
                poller
                    .set_files_to_watch(
                        &curr_state.project.project_id,
                        curr_state.project.ref_path_sources(),
                    )
                    .await;
            }
        }
    } else {
        // First time this project id has been seen.
        let new_state = match new_project_state(&project_to_process, post_queue, installer_path) {
            Ok(state) => state,
            Err(e) => {
                error!("Error on creation of new project state: {}", e);
                return;
            }
        };

        let ref_path_sources = project_to_process.ref_path_sources();
        projects_map.insert(project_to_process.project_id.clone(), new_state);

        if !ref_path_sources.is_empty() {
            if let Some(poller) = file_poller {
                poller
                    .set_files_to_watch(&project_to_process.project_id, ref_path_sources)
                    .await;
            }
        }

        // The server sends paths like '/c/Users/Administrator'; the watcher
        // needs the local form.
        let file_to_monitor = match convert_absolute_unix_style_normalized_path_to_local_file(
            &project_to_process.path_to_monitor,
        ) {
            Ok(path) => path,
            Err(e) => {
                error!(
                    "Unable to convert from absolute unix style normalized path {}: {}",
                    project_to_process.path_to_monitor, e
                );
                return;
            }
        };

        match watch_service {
            Some(service) => {
                debug!(
                    "Added new project with path '{}' to watch list, with watch directory: '{}'",
                    project_to_process.path_to_monitor, file_to_monitor
                );
                service
                    .add_root_path(PathBuf::from(file_to_monitor), project_to_process)
                    .await;
            }
            None => {
                error!(
                    "Watch service is not set and an add_root_path was missed: {}",
                    file_to_monitor
                );
            }
        }
    }
}

fn new_project_state(
    project: &ProjectToWatch,
    post_queue: &HttpPostOutputQueue,
    installer_path: Option<&str>,
) -> crate::error::WatcherResult<ProjectState> {
    let sync_command = match installer_path {
        Some(installer) if !installer.trim().is_empty() => {
            // The sync command wants the project path in local OS form.
            let local_path = convert_absolute_unix_style_normalized_path_to_local_file(
                &project.path_to_monitor,
            )?;
            Some(SyncCommandState::new(
                project.project_id.clone(),
                installer.to_string(),
                local_path,
            )?)
        }
        _ => None,
    };

    Ok(ProjectState {
        project: project.clone(),
        batcher: FileChangeBatcher::new(
            project.project_id.clone(),
            post_queue.clone(),
            sync_command.clone(),
        ),
        sync_command,
    })
}

/// Filter a raw watch event against the project's ignore lists; survivors
/// are stamped and handed to the project's batcher.
async fn handle_receive_new_watch_event(
    entry: WatchEventEntry,
    project: ProjectToWatch,
    projects_map: &HashMap<String, ProjectState>,
) {
    debug!(
        "Received new watch entry: {} {} {}",
        entry.event_type, entry.path, project.project_id
    );

    let filter = match PathFilter::new(&project) {
        Ok(filter) => filter,
        Err(e) => {
            error!(
                "Could not create filter for {}: {}",
                project.project_id, e
            );
            return;
        }
    };

    let Some(path) = absolute_to_project_relative(&entry.path, &project.path_to_monitor) else {
        return;
    };

    if filter.has_path_patterns() {
        if filter.is_filtered_out_by_path(&path) {
            debug!("Filtered out '{}' due to path filter", path);
            return;
        }
        // Apply the path filter against parent paths as well: if the path is
        // /a/b/c, also try /a/b and /a, so ignoring a directory ignores its
        // descendants.
        for component in split_relative_path_into_component_paths(&path) {
            if filter.is_filtered_out_by_path(&component) {
                return;
            }
        }
    }

    if filter.has_filename_patterns() && filter.is_filtered_out_by_filename(&path) {
        debug!("Filtered out '{}' due to filename filter", path);
        return;
    }

    let Some(state) = projects_map.get(&project.project_id) else {
        error!(
            "Could not locate event processing for project id {}",
            project.project_id
        );
        return;
    };

    match ChangedFileEntry::new(path, entry.event_type, now_millis(), entry.is_dir) {
        Ok(changed) => {
            state.batcher.add_changed_files(vec![changed]).await;
        }
        Err(e) => {
            error!("Error in creating new changed file entry: {}", e);
        }
    }
}

/// Forward poller-observed changes, dropping any that are already covered by
/// a recursive watcher (their path lies under a live project root).
async fn handle_individual_changes(
    project_id: String,
    entries: Vec<ChangedFileEntry>,
    projects_map: &HashMap<String, ProjectState>,
) {
    let Some(state) = projects_map.get(&project_id) else {
        error!(
            "Received individual file changes for an unknown project: {}",
            project_id
        );
        return;
    };

    let roots: Vec<String> = projects_map
        .values()
        .map(|s| strip_trailing_forward_slash(&s.project.path_to_monitor).to_string())
        .collect();

    let entries: Vec<ChangedFileEntry> = entries
        .into_iter()
        .filter(|entry| {
            let covered = roots
                .iter()
                .any(|root| entry.path.starts_with(&format!("{}/", root)));
            if covered {
                debug!(
                    "Dropping individual file change under a project root: {}",
                    entry.path
                );
            }
            !covered
        })
        .collect();

    if !entries.is_empty() {
        state.batcher.add_changed_files(entries).await;
    }
}

async fn handle_sync_command_update(
    project_id: &str,
    projects_map: &HashMap<String, ProjectState>,
    installer_path: Option<&str>,
) {
    if installer_path.map(|p| p.trim().is_empty()).unwrap_or(true) {
        debug!("Skipping invocation of sync command due to no installer path.");
        return;
    }

    let Some(state) = projects_map.get(project_id) else {
        error!(
            "Asked to invoke the sync command on a project that wasn't in the projects map: {}",
            project_id
        );
        return;
    };

    if let Some(sync_command) = &state.sync_command {
        sync_command.on_file_change_event().await;
    }
}

/// Overview of the project list for the periodic status dump.
fn debug_summary(projects_map: &HashMap<String, ProjectState>) -> String {
    let mut result = String::new();

    for (project_id, state) in projects_map {
        result.push_str(&format!(
            "- {} -> {}",
            project_id, state.project.path_to_monitor
        ));

        let batch_debug = state.batcher.request_debug_message();
        if !batch_debug.is_empty() {
            result.push_str(&format!(" | {}", batch_debug.trim()));
        }

        if !state.project.ignored_paths.is_empty() {
            result.push_str(" | ignoredPaths: ");
            for val in &state.project.ignored_paths {
                result.push_str(&format!("'{}' ", val));
            }
        }

        result.push('\n');
    }

    result
}
