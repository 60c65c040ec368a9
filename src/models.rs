//! Wire model shared with the sync control plane, plus the internal
//! changed-file record that flows from the watchers to the batchers.

use crate::error::{WatcherError, WatcherResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, the timestamp unit used on the wire.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// An out-of-tree file reference attached to a project: `from` is the
/// absolute canonical path of the real file, `to` is where the project
/// expects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefPathEntry {
    pub from: String,
    #[serde(default)]
    pub to: String,
}

/// The server's description of one project to watch.
///
/// Instances are snapshots: they are replaced wholesale on every server
/// update, never mutated in place. The one exception mirrors the original
/// protocol handling: `change_type` is cleared before an updated snapshot is
/// stored, since it describes the message rather than the project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectToWatch {
    #[serde(rename = "ignoredFilenames", default)]
    pub ignored_filenames: Vec<String>,

    #[serde(rename = "ignoredPaths", default)]
    pub ignored_paths: Vec<String>,

    #[serde(rename = "pathToMonitor", default)]
    pub path_to_monitor: String,

    #[serde(rename = "projectID", default)]
    pub project_id: String,

    #[serde(rename = "changeType", default)]
    pub change_type: String,

    #[serde(rename = "projectWatchStateId", default)]
    pub project_watch_state_id: String,

    #[serde(rename = "type", default)]
    pub project_type: String,

    #[serde(rename = "projectCreationTime", default)]
    pub project_creation_time: i64,

    #[serde(rename = "refPaths", default)]
    pub ref_paths: Vec<RefPathEntry>,
}

impl ProjectToWatch {
    /// The absolute canonical paths of the project's reference files.
    pub fn ref_path_sources(&self) -> Vec<String> {
        self.ref_paths.iter().map(|r| r.from.clone()).collect()
    }
}

/// Merge the project-creation-time field of an existing snapshot with an
/// incoming one. A known (non-zero) value is never overwritten by an unknown
/// (zero) one; a non-zero incoming value always wins.
pub fn merge_project_creation_time(existing: i64, incoming: i64) -> i64 {
    if incoming != 0 {
        incoming
    } else {
        existing
    }
}

/// Body of `GET /api/v1/projects/watchlist`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchlistEntryList {
    #[serde(default)]
    pub projects: Vec<ProjectToWatch>,
}

/// A project-list update pushed over the WebSocket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchChangeJson {
    #[serde(rename = "type", default)]
    pub msg_type: String,

    #[serde(default)]
    pub projects: Vec<ProjectToWatch>,
}

/// The kind of a filesystem change, in wire spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Create,
    Modify,
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Create => f.write_str("CREATE"),
            EventType::Modify => f.write_str("MODIFY"),
            EventType::Delete => f.write_str("DELETE"),
        }
    }
}

/// Boundary type emitted by a project watcher: the canonical absolute path
/// that changed and how.
#[derive(Debug, Clone)]
pub struct WatchEventEntry {
    pub event_type: EventType,
    pub path: String,
    pub is_dir: bool,
}

/// One filesystem change, project-relative, as consumed by the batch engine
/// and serialized into POST chunks. Immutable after construction.
#[derive(Debug, Clone, Serialize)]
pub struct ChangedFileEntry {
    pub path: String,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub directory: bool,
}

impl ChangedFileEntry {
    pub fn new(
        path: String,
        event_type: EventType,
        timestamp: i64,
        directory: bool,
    ) -> WatcherResult<Self> {
        if path.trim().is_empty() || timestamp <= 0 {
            return Err(WatcherError::InvalidEntry(format!(
                "{} {} {}",
                path, event_type, timestamp
            )));
        }

        Ok(Self {
            path,
            timestamp,
            event_type,
            directory,
        })
    }

    pub fn to_debug_string(&self) -> String {
        format!(
            "{} {} {} {}",
            self.path, self.timestamp, self.event_type, self.directory
        )
    }
}
