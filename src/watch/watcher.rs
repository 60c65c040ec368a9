//! Per-project recursive directory watcher.
//!
//! Watches are installed per directory (non-recursive) and the tree is walked
//! explicitly, because between installing a watch on a new directory and
//! listing its contents, children may appear that will never fire an event.
//! Walking every newly seen directory and reporting its contents as CREATE
//! entries closes that race (the classic inotify problem, lwn 605128).

use crate::models::{EventType, ProjectToWatch, WatchEventEntry};
use crate::paths::canonicalize_local_path;
use crate::registry::ProjectRegistry;
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// How often the event task snapshots its watched-directory set for the
/// debug dump.
const DEBUG_SNAPSHOT_INTERVAL_SECS: u64 = 600;

/// Max number of watched directories included in a debug snapshot.
const DEBUG_SNAPSHOT_MAX_PATHS: usize = 20;

#[derive(Default)]
struct WatcherFlags {
    /// Set exactly once; a closed watcher discards all further events.
    closed: bool,
    /// True once the kernel watcher has been opened (the project directory
    /// exists).
    open: bool,
    /// Periodically refreshed summary of the watched-directory set.
    latest_debug_state: String,
}

/// The only state shared between the watch-service loop and the event task:
/// the closed/open flags and the debug snapshot, behind one mutex.
pub struct WatcherShared {
    flags: Mutex<WatcherFlags>,
}

impl WatcherShared {
    fn new() -> Self {
        Self {
            flags: Mutex::new(WatcherFlags::default()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.flags.lock().map(|f| f.closed).unwrap_or(true)
    }

    fn set_open(&self) {
        if let Ok(mut flags) = self.flags.lock() {
            flags.open = true;
        }
    }

    /// Mark closed. Returns false if the watcher was already closed.
    fn close(&self) -> bool {
        let Ok(mut flags) = self.flags.lock() else {
            return false;
        };
        if flags.closed {
            return false;
        }
        flags.closed = true;
        flags.open = false;
        flags.latest_debug_state = String::new();
        true
    }

    fn set_debug_state_if_open(&self, state: String) {
        if let Ok(mut flags) = self.flags.lock() {
            if !flags.closed {
                flags.latest_debug_state = state;
            }
        }
    }

    /// (open, closed, latest debug snapshot) for the service's debug dump.
    pub fn debug_state(&self) -> (bool, bool, String) {
        match self.flags.lock() {
            Ok(flags) => (flags.open, flags.closed, flags.latest_debug_state.clone()),
            Err(_) => (false, true, String::new()),
        }
    }
}

/// One project's watcher entry, owned by the watch service. Created in an
/// unopened state before the project directory is known to exist; closed
/// exactly once.
pub struct ProjectWatcher {
    root_path: PathBuf,
    id: String,
    shared: Arc<WatcherShared>,
    /// The notify handle, shared with the event task so directory watches
    /// can be added/removed as the tree changes. Dropping it (on close)
    /// ends the raw-event stream.
    handle: Arc<Mutex<Option<RecommendedWatcher>>>,
}

impl ProjectWatcher {
    pub fn new(root_path: PathBuf) -> Self {
        Self {
            root_path,
            id: uuid::Uuid::new_v4().simple().to_string(),
            shared: Arc::new(WatcherShared::new()),
            handle: Arc::new(Mutex::new(None)),
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn shared(&self) -> &WatcherShared {
        &self.shared
    }

    /// Close the watcher, either because the project is no longer watched or
    /// because its filters changed. Idempotence violations are a bug: a
    /// closed entry must never remain in the live watcher map.
    pub fn close_if_needed(&self) {
        if self.shared.close() {
            info!(
                "Existing watcher found, so closing old watcher {}",
                self.root_path.display()
            );
        } else {
            error!("A closed entry should not exist in the watcher map.");
        }

        // Drop the notify handle outside the flags lock; this stops the
        // kernel watcher and closes the raw-event channel.
        if let Ok(mut slot) = self.handle.lock() {
            *slot = None;
        }
    }

    /// Open the kernel watcher, perform the initial recursive walk, and
    /// start the event-translation task. Everything found by the initial
    /// walk is reported upstream as CREATE entries.
    pub fn start_watcher(
        &self,
        project: ProjectToWatch,
        registry: ProjectRegistry,
    ) -> crate::error::WatcherResult<()> {
        let (raw_tx, raw_rx) = mpsc::channel::<Result<Event, notify::Error>>(100);

        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.blocking_send(res);
            },
            Config::default(),
        )?;

        self.shared.set_open();

        if let Ok(mut slot) = self.handle.lock() {
            *slot = Some(watcher);
        }

        let mut watched_dir_map: HashSet<PathBuf> = HashSet::new();
        let mut is_dir_map: HashMap<PathBuf, bool> = HashMap::new();

        let mut new_files = Vec::new();
        let mut new_dirs = Vec::new();
        {
            let Ok(mut slot) = self.handle.lock() else {
                return Err(crate::error::WatcherError::invalid_path(
                    "watcher handle poisoned",
                ));
            };
            let Some(watcher) = slot.as_mut() else {
                return Err(crate::error::WatcherError::invalid_path(
                    "watcher closed during startup",
                ));
            };
            walk_path_and_add(
                &self.root_path,
                watcher,
                &mut watched_dir_map,
                &mut new_files,
                &mut new_dirs,
            );
        }

        info!(
            "Initial path walk complete for {}, addedFiles: {}, addedDirs: {}",
            self.root_path.display(),
            new_files.len(),
            new_dirs.len()
        );

        let initial_entries = build_create_entries(&new_files, &new_dirs, &mut is_dir_map);

        tokio::spawn(watcher_event_loop(
            raw_rx,
            self.handle.clone(),
            self.shared.clone(),
            watched_dir_map,
            is_dir_map,
            self.root_path.clone(),
            project,
            registry,
            self.id.clone(),
            initial_entries,
        ));

        Ok(())
    }
}

/// Recursively watch `path` and every directory beneath it, collecting the
/// files and directories seen. Failures on individual entries are logged and
/// skipped; the watcher keeps whatever coverage it managed to establish.
fn walk_path_and_add(
    path: &Path,
    watcher: &mut RecommendedWatcher,
    watched_dir_map: &mut HashSet<PathBuf>,
    new_files: &mut Vec<PathBuf>,
    new_dirs: &mut Vec<PathBuf>,
) {
    if watched_dir_map.contains(path) {
        return;
    }

    watched_dir_map.insert(path.to_path_buf());
    if let Err(e) = watcher.watch(path, RecursiveMode::NonRecursive) {
        error!("Unable to watch path {}: {}", path.display(), e);
    }
    debug!("Added watch: {}", path.display());
    new_dirs.push(path.to_path_buf());

    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) => {
            error!("Unable to read directory {}: {}", path.display(), e);
            return;
        }
    };

    for entry in entries {
        let Ok(entry) = entry else {
            continue;
        };
        let child = entry.path();
        match entry.file_type() {
            Ok(file_type) if file_type.is_dir() => {
                walk_path_and_add(&child, watcher, watched_dir_map, new_files, new_dirs);
            }
            Ok(_) => new_files.push(child),
            Err(e) => {
                error!("Unable to stat {}: {}", child.display(), e);
            }
        }
    }
}

/// Convert walk results into upstream CREATE entries, recording each path's
/// kind for later delete handling.
fn build_create_entries(
    new_files: &[PathBuf],
    new_dirs: &[PathBuf],
    is_dir_map: &mut HashMap<PathBuf, bool>,
) -> Vec<WatchEventEntry> {
    let mut entries = Vec::with_capacity(new_files.len() + new_dirs.len());

    for file in new_files {
        is_dir_map.insert(file.clone(), false);
        match new_watch_event_entry(EventType::Create, file, false) {
            Ok(entry) => entries.push(entry),
            Err(e) => error!("Unexpected watch event entry error: {}", e),
        }
    }

    for dir in new_dirs {
        is_dir_map.insert(dir.clone(), true);
        match new_watch_event_entry(EventType::Create, dir, true) {
            Ok(entry) => entries.push(entry),
            Err(e) => error!("Unexpected watch event entry error: {}", e),
        }
    }

    entries
}

fn new_watch_event_entry(
    event_type: EventType,
    path: &Path,
    is_dir: bool,
) -> crate::error::WatcherResult<WatchEventEntry> {
    Ok(WatchEventEntry {
        event_type,
        path: canonicalize_local_path(path)?,
        is_dir,
    })
}

/// Map a raw notify event kind to the daemon's three logical kinds. Renames
/// become delete (old name) and create (new name); when the platform can't
/// say which side a path is on, existence decides. Metadata-only changes are
/// ignored.
fn classify_event(kind: &EventKind, path: &Path) -> Option<EventType> {
    match kind {
        EventKind::Create(_) => Some(EventType::Create),
        EventKind::Remove(_) => Some(EventType::Delete),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => Some(EventType::Delete),
            RenameMode::To => Some(EventType::Create),
            _ => {
                if path.exists() {
                    Some(EventType::Create)
                } else {
                    Some(EventType::Delete)
                }
            }
        },
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(EventType::Modify),
        _ => None,
    }
}

#[allow(clippy::too_many_arguments)]
async fn watcher_event_loop(
    mut raw_rx: mpsc::Receiver<Result<Event, notify::Error>>,
    handle: Arc<Mutex<Option<RecommendedWatcher>>>,
    shared: Arc<WatcherShared>,
    mut watched_dir_map: HashSet<PathBuf>,
    mut is_dir_map: HashMap<PathBuf, bool>,
    root_path: PathBuf,
    project: ProjectToWatch,
    registry: ProjectRegistry,
    watcher_id: String,
    initial_entries: Vec<WatchEventEntry>,
) {
    for entry in initial_entries {
        registry.receive_watch_event(entry, project.clone()).await;
    }

    let mut debug_interval =
        tokio::time::interval(Duration::from_secs(DEBUG_SNAPSHOT_INTERVAL_SECS));
    debug_interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            maybe = raw_rx.recv() => {
                match maybe {
                    None => {
                        if shared.is_closed() {
                            debug!("Raw event channel closed after the watcher was closed.");
                        } else {
                            error!("Raw event channel closed while the watcher was still open: {}", watcher_id);
                        }
                        return;
                    }
                    Some(Err(e)) => {
                        if shared.is_closed() {
                            info!(
                                "Ignoring an error received after the watcher was closed, for project {}: {}",
                                project.project_id, e
                            );
                            return;
                        }
                        error!("Watcher error: {}", e);
                    }
                    Some(Ok(event)) => {
                        if shared.is_closed() {
                            debug!("Ignoring event on closed watcher: {:?}", event);
                            continue;
                        }
                        handle_raw_event(
                            event,
                            &handle,
                            &mut watched_dir_map,
                            &mut is_dir_map,
                            &root_path,
                            &project,
                            &registry,
                            &watcher_id,
                        )
                        .await;
                    }
                }
            }
            _ = debug_interval.tick() => {
                let mut snapshot = String::new();
                for path in watched_dir_map.iter().take(DEBUG_SNAPSHOT_MAX_PATHS) {
                    snapshot.push_str(&format!("  - {}\n", path.display()));
                }
                shared.set_debug_state_if_open(snapshot);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_raw_event(
    event: Event,
    handle: &Arc<Mutex<Option<RecommendedWatcher>>>,
    watched_dir_map: &mut HashSet<PathBuf>,
    is_dir_map: &mut HashMap<PathBuf, bool>,
    root_path: &Path,
    project: &ProjectToWatch,
    registry: &ProjectRegistry,
    watcher_id: &str,
) {
    debug!(
        "Raw watch event: {:?} id: {} watch state id: {}",
        event, watcher_id, project.project_watch_state_id
    );

    for path in &event.paths {
        let Some(change_type) = classify_event(&event.kind, path) else {
            debug!("Ignoring: {}", path.display());
            continue;
        };

        // A deleted path can't be stat-ed, so fall back to the kind we last
        // saw for it.
        let (file_exists, is_dir) = match std::fs::metadata(path) {
            Ok(metadata) => (true, metadata.is_dir()),
            Err(_) => (false, is_dir_map.get(path).copied().unwrap_or(false)),
        };

        let mut subtree_entries: Vec<WatchEventEntry> = Vec::new();

        if is_dir {
            match change_type {
                EventType::Create => {
                    debug!("Adding new directory watch: {}", path.display());

                    let mut new_files = Vec::new();
                    let mut new_dirs = Vec::new();
                    if let Ok(mut slot) = handle.lock() {
                        if let Some(watcher) = slot.as_mut() {
                            walk_path_and_add(
                                path,
                                watcher,
                                watched_dir_map,
                                &mut new_files,
                                &mut new_dirs,
                            );
                        }
                    }

                    // Everything found under the new directory is reported as
                    // created; events for these may never fire otherwise.
                    subtree_entries = build_create_entries(&new_files, &new_dirs, is_dir_map);
                }
                EventType::Delete => {
                    debug!("Removing directory watch: {}", path.display());
                    if let Ok(mut slot) = handle.lock() {
                        if let Some(watcher) = slot.as_mut() {
                            let _ = watcher.unwatch(path);
                        }
                    }
                    watched_dir_map.remove(path);

                    if path == root_path {
                        if file_exists {
                            error!(
                                "The watch service has nothing to watch, but the root still exists. This shouldn't happen. Path: {}",
                                path.display()
                            );
                        } else {
                            info!(
                                "REMOVED - the watch service has nothing to watch: {}",
                                path.display()
                            );
                        }
                    }
                }
                EventType::Modify => {
                    debug!("Ignoring: {}", path.display());
                    continue;
                }
            }
        }

        // The directory walked above contributes its own CREATE entry below,
        // after its contents.
        for entry in subtree_entries {
            debug!(
                "WatchEventEntry (dir): {} {} {}",
                entry.event_type, entry.path, entry.is_dir
            );
            registry.receive_watch_event(entry, project.clone()).await;
        }

        // Skip the directory's own entry if it was already reported by the
        // walk (the walk includes the directory itself).
        if is_dir && change_type == EventType::Create {
            continue;
        }

        if change_type != EventType::Delete {
            is_dir_map.insert(path.clone(), is_dir);
        }

        match new_watch_event_entry(change_type, path, is_dir) {
            Ok(entry) => {
                debug!(
                    "WatchEventEntry: {} {} {} {}",
                    entry.event_type, entry.path, entry.is_dir, watcher_id
                );
                registry.receive_watch_event(entry, project.clone()).await;
            }
            Err(e) => {
                error!("Unexpected file path conversion error: {}", e);
            }
        }
    }
}
