//! Project registry reconciliation tests.
//!
//! These drive the registry through its public handle and observe the
//! resulting project set via the debug summary. No watch service is
//! attached: these tests exercise the bookkeeping, not the filesystem.

use axum::Router;
use std::time::Duration;
use syncwatchd::models::{ProjectToWatch, WatchChangeJson};
use syncwatchd::queue::HttpPostOutputQueue;
use syncwatchd::registry::ProjectRegistry;
use tokio::time::{sleep, timeout};

/// A server that accepts nothing; the registry never has to talk to it in
/// these tests, but the POST queue wants a URL at construction.
async fn idle_server_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, Router::new()).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn spawn_registry() -> ProjectRegistry {
    let base_url = idle_server_url().await;
    let queue = HttpPostOutputQueue::new(&base_url).unwrap();
    ProjectRegistry::new(queue, None)
}

fn project(id: &str, path: &str, watch_state_id: &str) -> ProjectToWatch {
    ProjectToWatch {
        project_id: id.to_string(),
        path_to_monitor: path.to_string(),
        project_watch_state_id: watch_state_id.to_string(),
        ..ProjectToWatch::default()
    }
}

async fn wait_for_debug<F>(registry: &ProjectRegistry, predicate: F) -> String
where
    F: Fn(&str) -> bool,
{
    let check = async {
        loop {
            let debug = registry.request_debug_message().await;
            if predicate(&debug) {
                return debug;
            }
            sleep(Duration::from_millis(20)).await;
        }
    };

    match timeout(Duration::from_secs(5), check).await {
        Ok(debug) => debug,
        Err(_) => panic!("timed out waiting for registry state"),
    }
}

#[tokio::test]
async fn get_update_creates_and_removes_projects() {
    let registry = spawn_registry().await;

    registry
        .update_project_list_from_get_request(vec![
            project("p1", "/tmp/one", "ws-1"),
            project("p2", "/tmp/two", "ws-1"),
        ])
        .await;

    let debug = wait_for_debug(&registry, |d| d.contains("p1") && d.contains("p2")).await;
    assert!(debug.contains("p1 -> /tmp/one"));
    assert!(debug.contains("p2 -> /tmp/two"));

    // A full refresh that omits p2 removes it.
    registry
        .update_project_list_from_get_request(vec![project("p1", "/tmp/one", "ws-1")])
        .await;

    let debug = wait_for_debug(&registry, |d| !d.contains("p2")).await;
    assert!(debug.contains("p1 -> /tmp/one"));
}

#[tokio::test]
async fn monitored_path_cannot_change_for_a_project_id() {
    let registry = spawn_registry().await;

    registry
        .update_project_list_from_get_request(vec![project("p1", "/tmp/original", "ws-1")])
        .await;
    wait_for_debug(&registry, |d| d.contains("/tmp/original")).await;

    // An update that tries to move the project is rejected.
    registry
        .update_project_list_from_get_request(vec![project("p1", "/tmp/elsewhere", "ws-2")])
        .await;

    let debug = wait_for_debug(&registry, |d| d.contains("p1")).await;
    assert!(debug.contains("p1 -> /tmp/original"));
    assert!(!debug.contains("/tmp/elsewhere"));
}

#[tokio::test]
async fn websocket_delete_removes_the_project() {
    let registry = spawn_registry().await;

    registry
        .update_project_list_from_get_request(vec![
            project("p1", "/tmp/one", "ws-1"),
            project("p2", "/tmp/two", "ws-1"),
        ])
        .await;
    wait_for_debug(&registry, |d| d.contains("p1") && d.contains("p2")).await;

    let mut delete = project("p2", "/tmp/two", "ws-1");
    delete.change_type = "delete".to_string();
    registry
        .update_project_list_from_websocket(WatchChangeJson {
            msg_type: "watchChanged".to_string(),
            projects: vec![delete],
        })
        .await;

    let debug = wait_for_debug(&registry, |d| !d.contains("p2")).await;
    assert!(debug.contains("p1"));
}

#[tokio::test]
async fn websocket_update_adds_unknown_projects() {
    let registry = spawn_registry().await;

    registry
        .update_project_list_from_websocket(WatchChangeJson {
            msg_type: "watchChanged".to_string(),
            projects: vec![project("p-new", "/tmp/new", "ws-1")],
        })
        .await;

    let debug = wait_for_debug(&registry, |d| d.contains("p-new")).await;
    assert!(debug.contains("p-new -> /tmp/new"));
}

#[tokio::test]
async fn ignored_paths_appear_in_the_debug_summary() {
    let registry = spawn_registry().await;

    let mut p = project("p1", "/tmp/one", "ws-1");
    p.ignored_paths = vec!["/build".to_string(), "/target".to_string()];
    registry.update_project_list_from_get_request(vec![p]).await;

    let debug = wait_for_debug(&registry, |d| d.contains("ignoredPaths")).await;
    assert!(debug.contains("'/build'"));
    assert!(debug.contains("'/target'"));
}
