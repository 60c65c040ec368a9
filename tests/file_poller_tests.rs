//! Individual-file poller tests.
//!
//! A project references a file outside its own root; the poller must report
//! its lifecycle by mtime polling: nothing on subscription (baseline),
//! CREATE when it appears, MODIFY on mtime change, DELETE when it goes away.

use axum::extract::{Path, State};
use axum::routing::post;
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use syncwatchd::models::{ProjectToWatch, RefPathEntry};
use syncwatchd::queue::HttpPostOutputQueue;
use syncwatchd::registry::ProjectRegistry;
use syncwatchd::watch::file_poller::IndividualFileWatchService;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

#[derive(Clone, Default)]
struct ServerState {
    entries: Arc<Mutex<Vec<serde_json::Value>>>,
}

async fn file_changes_handler(
    Path(_project_id): Path<String>,
    State(state): State<ServerState>,
    axum::Json(body): axum::Json<serde_json::Value>,
) -> axum::http::StatusCode {
    let compressed = STANDARD
        .decode(body["msg"].as_str().unwrap_or(""))
        .expect("valid base64");
    let mut decoder = flate2::read::ZlibDecoder::new(&compressed[..]);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json).expect("valid zlib");
    let batch: Vec<serde_json::Value> = serde_json::from_slice(&json).expect("a JSON array");

    state.entries.lock().unwrap().extend(batch);
    axum::http::StatusCode::OK
}

async fn spawn_mock_server(state: ServerState) -> String {
    let app = Router::new()
        .route(
            "/api/v1/projects/:id/file-changes",
            post(file_changes_handler),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}", addr)
}

async fn wait_for_entry<F>(state: &ServerState, deadline: Duration, predicate: F)
where
    F: Fn(&serde_json::Value) -> bool,
{
    let check = async {
        loop {
            {
                let entries = state.entries.lock().unwrap();
                if entries.iter().any(&predicate) {
                    return;
                }
            }
            sleep(Duration::from_millis(50)).await;
        }
    };

    if timeout(deadline, check).await.is_err() {
        let entries = state.entries.lock().unwrap();
        panic!("timed out waiting for entry; saw: {:?}", *entries);
    }
}

#[tokio::test]
async fn out_of_tree_file_lifecycle_is_reported() {
    let state = ServerState::default();
    let base_url = spawn_mock_server(state.clone()).await;

    let queue = HttpPostOutputQueue::new(&base_url).unwrap();
    let registry = ProjectRegistry::new(queue, None);
    let poller = IndividualFileWatchService::new(registry.clone());
    registry
        .set_individual_file_watch_service(poller)
        .await;

    let project_root = TempDir::new().unwrap();
    let external_dir = TempDir::new().unwrap();
    let external_file = external_dir.path().join("linked.properties");

    let project = ProjectToWatch {
        project_id: "proj-ref".to_string(),
        path_to_monitor: project_root.path().to_string_lossy().to_string(),
        project_watch_state_id: "ws-1".to_string(),
        ref_paths: vec![RefPathEntry {
            from: external_file.to_string_lossy().to_string(),
            to: "/linked.properties".to_string(),
        }],
        ..ProjectToWatch::default()
    };

    registry
        .update_project_list_from_get_request(vec![project])
        .await;

    // Baseline tick: the file does not exist yet and nothing is reported.
    sleep(Duration::from_millis(2500)).await;
    assert!(
        state.entries.lock().unwrap().is_empty(),
        "the baseline tick must not report anything"
    );

    // The file appears.
    std::fs::write(&external_file, "v1").unwrap();
    let expected_path = external_file.to_string_lossy().to_string();

    let p = expected_path.clone();
    wait_for_entry(&state, Duration::from_secs(10), move |e| {
        e["path"] == p.as_str() && e["type"] == "CREATE"
    })
    .await;

    // Its content changes (different mtime).
    sleep(Duration::from_millis(50)).await;
    std::fs::write(&external_file, "v2 with more content").unwrap();

    let p = expected_path.clone();
    wait_for_entry(&state, Duration::from_secs(10), move |e| {
        e["path"] == p.as_str() && e["type"] == "MODIFY"
    })
    .await;

    // It goes away.
    std::fs::remove_file(&external_file).unwrap();

    let p = expected_path.clone();
    wait_for_entry(&state, Duration::from_secs(10), move |e| {
        e["path"] == p.as_str() && e["type"] == "DELETE"
    })
    .await;
}

#[tokio::test]
async fn files_under_a_project_root_are_not_double_reported() {
    let state = ServerState::default();
    let base_url = spawn_mock_server(state.clone()).await;

    let queue = HttpPostOutputQueue::new(&base_url).unwrap();
    let registry = ProjectRegistry::new(queue, None);
    let poller = IndividualFileWatchService::new(registry.clone());
    registry
        .set_individual_file_watch_service(poller)
        .await;

    let project_root = TempDir::new().unwrap();
    // The referenced file lies INSIDE the project root, so the recursive
    // watcher already covers it and the poller's reports must be dropped.
    let inside_file = project_root.path().join("inside.txt");

    let project = ProjectToWatch {
        project_id: "proj-inside".to_string(),
        path_to_monitor: project_root.path().to_string_lossy().to_string(),
        project_watch_state_id: "ws-1".to_string(),
        ref_paths: vec![RefPathEntry {
            from: inside_file.to_string_lossy().to_string(),
            to: "/inside.txt".to_string(),
        }],
        ..ProjectToWatch::default()
    };

    registry
        .update_project_list_from_get_request(vec![project])
        .await;

    // Let the baseline tick pass, then create the file.
    sleep(Duration::from_millis(2500)).await;
    std::fs::write(&inside_file, "x").unwrap();

    // Give the poller time to observe it; the report must be filtered out.
    sleep(Duration::from_secs(5)).await;
    let entries = state.entries.lock().unwrap();
    assert!(
        entries.is_empty(),
        "poller reports under a project root must be dropped: {:?}",
        *entries
    );
}
