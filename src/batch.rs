//! Per-project debounce and batching engine.
//!
//! Change events that land within milliseconds of each other usually belong
//! to one logical operation (a refactor, a build, a save-all). To avoid
//! kicking off a downstream build per file, each project's batcher collects
//! events until the stream has been quiet for a full second, then flushes
//! them as a single batch: sorted, deduplicated, chunked, compressed, and
//! handed to the POST output queue (or, when an external sync command is
//! configured, coalesced into a single poke of its launcher).

use crate::models::{ChangedFileEntry, EventType};
use crate::queue::HttpPostOutputQueue;
use crate::synccmd::SyncCommandState;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::collections::HashSet;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info};

/// Quiet period after the last received event before a flush.
pub const BATCH_DEBOUNCE_MS: u64 = 1000;

/// Maximum number of entries serialized into a single POST chunk.
pub const MAX_ENTRIES_PER_CHUNK: usize = 625;

/// Handle to one project's batcher task.
#[derive(Clone)]
pub struct FileChangeBatcher {
    tx: mpsc::Sender<Vec<ChangedFileEntry>>,
    debug_state: Arc<Mutex<String>>,
}

impl FileChangeBatcher {
    pub fn new(
        project_id: String,
        post_queue: HttpPostOutputQueue,
        sync_command: Option<SyncCommandState>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let debug_state = Arc::new(Mutex::new(String::new()));

        tokio::spawn(file_change_listener(
            project_id,
            post_queue,
            sync_command,
            rx,
            debug_state.clone(),
        ));

        Self { tx, debug_state }
    }

    pub async fn add_changed_files(&self, entries: Vec<ChangedFileEntry>) {
        let _ = self.tx.send(entries).await;
    }

    pub fn request_debug_message(&self) -> String {
        self.debug_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

async fn file_change_listener(
    project_id: String,
    post_queue: HttpPostOutputQueue,
    sync_command: Option<SyncCommandState>,
    mut rx: mpsc::Receiver<Vec<ChangedFileEntry>>,
    debug_state: Arc<Mutex<String>>,
) {
    info!("Batch listener started for {}", project_id);

    let debounce = Duration::from_millis(BATCH_DEBOUNCE_MS);
    let mut pending: Vec<ChangedFileEntry> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(entries) => {
                        pending.extend(entries);
                        // Any new event restarts the quiet-period timer.
                        deadline = Some(Instant::now() + debounce);
                        update_debug_state(&debug_state, pending.len(), true);
                    }
                    None => break,
                }
            }
            _ = async {
                match deadline {
                    Some(d) => sleep_until(d).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                // The stream has been quiet for the full debounce window.
                deadline = None;
                update_debug_state(&debug_state, pending.len(), false);

                if !pending.is_empty() {
                    let events = std::mem::take(&mut pending);
                    process_and_send_events(
                        events,
                        &project_id,
                        &post_queue,
                        sync_command.as_ref(),
                    )
                    .await;
                }
            }
        }
    }
}

fn update_debug_state(debug_state: &Arc<Mutex<String>>, pending: usize, was_file_change: bool) {
    let line = format!(
        "pending-events: {}  last-event: {}",
        pending,
        if was_file_change {
            "file-change"
        } else {
            "timer"
        }
    );
    if let Ok(mut state) = debug_state.lock() {
        *state = line;
    }
}

/// Sort, dedup, chunk, compress, and hand the batch off.
async fn process_and_send_events(
    mut events: Vec<ChangedFileEntry>,
    project_id: &str,
    post_queue: &HttpPostOutputQueue,
    sync_command: Option<&SyncCommandState>,
) {
    events.sort_by_key(|e| e.timestamp);

    let events = remove_duplicate_events_of_type(events, EventType::Create);
    let events = remove_duplicate_events_of_type(events, EventType::Delete);

    if events.is_empty() {
        return;
    }

    let most_recent_timestamp = events[events.len() - 1].timestamp;

    info!(
        "Batch change summary for {} @ {}: {}",
        project_id,
        most_recent_timestamp,
        generate_change_list_summary(&events)
    );

    if let Some(cli) = sync_command {
        // The sync command rescans the project itself; it only needs to know
        // that something changed.
        cli.on_file_change_event().await;
        return;
    }

    let mut strings_to_send = Vec::new();

    for chunk in events.chunks(MAX_ENTRIES_PER_CHUNK) {
        let json = match serde_json::to_vec(chunk) {
            Ok(json) => json,
            Err(e) => {
                error!("Unable to marshal JSON: {}", e);
                continue;
            }
        };

        match compress_and_convert(&json) {
            Ok(compressed) => strings_to_send.push(compressed),
            Err(e) => {
                error!("Unable to compress JSON: {}", e);
            }
        }
    }

    debug!("Strings to send: {}", strings_to_send.len());
    if !strings_to_send.is_empty() {
        post_queue
            .add_to_queue(project_id, most_recent_timestamp, strings_to_send)
            .await;
    }
}

/// For any given path, remove all but the first of a contiguous run of
/// `change_type` events. A different event kind on the same path ends the
/// run. MODIFY events are never deduplicated.
fn remove_duplicate_events_of_type(
    entries: Vec<ChangedFileEntry>,
    change_type: EventType,
) -> Vec<ChangedFileEntry> {
    if change_type == EventType::Modify {
        error!("Unsupported event type: MODIFY");
        return entries;
    }

    let mut contains_path: HashSet<String> = HashSet::new();
    let mut result = Vec::with_capacity(entries.len());

    for entry in entries {
        if entry.event_type == change_type {
            if contains_path.contains(&entry.path) {
                debug!("Removing duplicate event: {}", entry.to_debug_string());
                continue;
            }
            contains_path.insert(entry.path.clone());
        } else {
            contains_path.remove(&entry.path);
        }
        result.push(entry);
    }

    result
}

/// Compact single-line rendering of a batch for the log:
/// `+` create, `>` modify, `-` delete, followed by the file name.
fn generate_change_list_summary(events: &[ChangedFileEntry]) -> String {
    let mut result = String::from("[ ");

    for event in events {
        result.push(match event.event_type {
            EventType::Create => '+',
            EventType::Modify => '>',
            EventType::Delete => '-',
        });

        let filename = match event.path.rfind('/') {
            Some(idx) => &event.path[idx + 1..],
            None => &event.path,
        };
        result.push_str(filename);
        result.push(' ');

        if result.len() > 256 {
            break;
        }
    }

    if result.len() > 256 {
        result.push_str(" (...) ");
    }

    result.push(']');
    result
}

fn compress_and_convert(bytes: &[u8]) -> std::io::Result<String> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    let compressed = encoder.finish()?;
    Ok(STANDARD.encode(compressed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, event_type: EventType, timestamp: i64) -> ChangedFileEntry {
        ChangedFileEntry::new(path.to_string(), event_type, timestamp, false).unwrap()
    }

    #[test]
    fn contiguous_duplicates_collapse_to_first() {
        let entries = vec![
            entry("/a", EventType::Create, 1),
            entry("/a", EventType::Create, 2),
            entry("/a", EventType::Create, 3),
            entry("/b", EventType::Create, 4),
        ];

        let result = remove_duplicate_events_of_type(entries, EventType::Create);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].path, "/a");
        assert_eq!(result[0].timestamp, 1);
        assert_eq!(result[1].path, "/b");
    }

    #[test]
    fn non_contiguous_duplicates_are_kept() {
        let entries = vec![
            entry("/a", EventType::Create, 1),
            entry("/a", EventType::Delete, 2),
            entry("/a", EventType::Create, 3),
        ];

        let result = remove_duplicate_events_of_type(entries, EventType::Create);
        assert_eq!(result.len(), 3, "delete in between resets the memo");
    }

    #[test]
    fn modify_is_never_deduplicated() {
        let entries = vec![
            entry("/a", EventType::Modify, 1),
            entry("/a", EventType::Modify, 2),
        ];

        let result = remove_duplicate_events_of_type(entries.clone(), EventType::Modify);
        assert_eq!(result.len(), 2);

        // Modify events also survive the create/delete passes untouched.
        let result = remove_duplicate_events_of_type(entries, EventType::Create);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn dedup_is_per_path() {
        let entries = vec![
            entry("/a", EventType::Delete, 1),
            entry("/b", EventType::Delete, 2),
            entry("/a", EventType::Delete, 3),
            entry("/b", EventType::Delete, 4),
        ];

        let result = remove_duplicate_events_of_type(entries, EventType::Delete);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].path, "/a");
        assert_eq!(result[1].path, "/b");
    }

    #[test]
    fn chunking_splits_at_625() {
        let events: Vec<ChangedFileEntry> = (0..1300)
            .map(|i| entry(&format!("/f{}", i), EventType::Create, i + 1))
            .collect();

        let sizes: Vec<usize> = events
            .chunks(MAX_ENTRIES_PER_CHUNK)
            .map(|c| c.len())
            .collect();
        assert_eq!(sizes, vec![625, 625, 50]);
    }

    #[test]
    fn compressed_payload_round_trips() {
        use flate2::read::ZlibDecoder;
        use std::io::Read;

        let events = vec![entry("/a.txt", EventType::Create, 10)];
        let json = serde_json::to_vec(&events).unwrap();
        let encoded = compress_and_convert(&json).unwrap();

        let compressed = STANDARD.decode(encoded).unwrap();
        let mut decoder = ZlibDecoder::new(&compressed[..]);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();

        assert_eq!(decompressed, json);
        let parsed: serde_json::Value = serde_json::from_slice(&decompressed).unwrap();
        assert_eq!(parsed[0]["path"], "/a.txt");
        assert_eq!(parsed[0]["type"], "CREATE");
    }

    #[test]
    fn summary_marks_event_kinds() {
        let events = vec![
            entry("/dir/a.txt", EventType::Create, 1),
            entry("/dir/b.txt", EventType::Modify, 2),
            entry("/dir/c.txt", EventType::Delete, 3),
        ];

        let summary = generate_change_list_summary(&events);
        assert_eq!(summary, "[ +a.txt >b.txt -c.txt ]");
    }
}
