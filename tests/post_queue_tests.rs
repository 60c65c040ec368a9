//! POST output queue integration tests.
//!
//! These tests run a mock control-plane server on an ephemeral port and
//! verify the queue's delivery contract: chunk numbering, payload shape, and
//! strict ascending-timestamp ordering even when the server fails requests.

use axum::extract::{Path, Query, State};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use syncwatchd::queue::HttpPostOutputQueue;
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone)]
struct RecordedPost {
    project_id: String,
    timestamp: i64,
    chunk: usize,
    chunk_total: usize,
    msg: String,
    accepted: bool,
}

#[derive(Clone, Default)]
struct ServerState {
    posts: Arc<Mutex<Vec<RecordedPost>>>,
    /// timestamp -> number of requests to reject with a 500 before accepting
    failures_remaining: Arc<Mutex<HashMap<i64, usize>>>,
}

#[derive(Deserialize)]
struct FileChangeQuery {
    timestamp: i64,
    chunk: usize,
    chunk_total: usize,
}

#[derive(Deserialize)]
struct FileChangeBody {
    msg: String,
}

async fn file_changes_handler(
    Path(project_id): Path<String>,
    Query(query): Query<FileChangeQuery>,
    State(state): State<ServerState>,
    axum::Json(body): axum::Json<FileChangeBody>,
) -> axum::http::StatusCode {
    let mut accepted = true;

    {
        let mut failures = state.failures_remaining.lock().unwrap();
        if let Some(remaining) = failures.get_mut(&query.timestamp) {
            if *remaining > 0 {
                *remaining -= 1;
                accepted = false;
            }
        }
    }

    state.posts.lock().unwrap().push(RecordedPost {
        project_id,
        timestamp: query.timestamp,
        chunk: query.chunk,
        chunk_total: query.chunk_total,
        msg: body.msg,
        accepted,
    });

    if accepted {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::INTERNAL_SERVER_ERROR
    }
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

/// Wait until `predicate` holds over the recorded posts, or panic after the
/// deadline.
async fn wait_for_posts<F>(state: &ServerState, deadline: Duration, predicate: F)
where
    F: Fn(&[RecordedPost]) -> bool,
{
    let check = async {
        loop {
            {
                let posts = state.posts.lock().unwrap();
                if predicate(&posts) {
                    return;
                }
            }
            sleep(Duration::from_millis(20)).await;
        }
    };

    if timeout(deadline, check).await.is_err() {
        let posts = state.posts.lock().unwrap();
        panic!("timed out waiting for posts; saw: {:?}", *posts);
    }
}

#[tokio::test]
async fn chunks_carry_ids_totals_and_payloads() {
    let state = ServerState::default();
    let base_url = spawn_mock_server(state.clone()).await;

    let queue = HttpPostOutputQueue::new(&base_url).unwrap();
    queue
        .add_to_queue(
            "proj-a",
            1000,
            vec!["one".to_string(), "two".to_string(), "three".to_string()],
        )
        .await;

    wait_for_posts(&state, Duration::from_secs(5), |posts| posts.len() == 3).await;

    let mut posts = state.posts.lock().unwrap().clone();
    posts.sort_by_key(|p| p.chunk);

    for (i, post) in posts.iter().enumerate() {
        assert_eq!(post.project_id, "proj-a");
        assert_eq!(post.timestamp, 1000);
        assert_eq!(post.chunk, i + 1);
        assert_eq!(post.chunk_total, 3);
    }
    assert_eq!(posts[0].msg, "one");
    assert_eq!(posts[2].msg, "three");
}

#[tokio::test]
async fn later_group_waits_for_earlier_group_to_succeed() {
    let state = ServerState::default();
    state.failures_remaining.lock().unwrap().insert(100, 3);

    let base_url = spawn_mock_server(state.clone()).await;
    let queue = HttpPostOutputQueue::new(&base_url).unwrap();

    queue
        .add_to_queue("proj-a", 100, vec!["early".to_string()])
        .await;
    queue
        .add_to_queue("proj-a", 200, vec!["late".to_string()])
        .await;

    // 3 failures + 1 success for ts=100, then 1 success for ts=200.
    wait_for_posts(&state, Duration::from_secs(15), |posts| {
        posts.iter().any(|p| p.timestamp == 200 && p.accepted)
    })
    .await;

    let posts = state.posts.lock().unwrap().clone();

    let first_200 = posts
        .iter()
        .position(|p| p.timestamp == 200)
        .expect("ts=200 was attempted");
    let accepted_100 = posts
        .iter()
        .position(|p| p.timestamp == 100 && p.accepted)
        .expect("ts=100 eventually succeeded");

    assert_eq!(
        posts.iter().filter(|p| p.timestamp == 100).count(),
        4,
        "ts=100 should be attempted 4 times (3 failures + 1 success)"
    );
    assert!(
        accepted_100 < first_200,
        "no ts=200 chunk may be attempted before ts=100 succeeds; saw: {:?}",
        posts
    );
}

#[tokio::test]
async fn groups_submitted_out_of_order_deliver_in_timestamp_order() {
    let state = ServerState::default();
    // Hold the front group back briefly so the later-submitted earlier
    // timestamp can overtake it in the queue.
    state.failures_remaining.lock().unwrap().insert(500, 1);

    let base_url = spawn_mock_server(state.clone()).await;
    let queue = HttpPostOutputQueue::new(&base_url).unwrap();

    queue
        .add_to_queue("proj-a", 500, vec!["second".to_string()])
        .await;
    queue
        .add_to_queue("proj-a", 400, vec!["first".to_string()])
        .await;

    wait_for_posts(&state, Duration::from_secs(10), |posts| {
        posts.iter().filter(|p| p.accepted).count() == 2
    })
    .await;

    let posts = state.posts.lock().unwrap().clone();
    let accepted: Vec<i64> = posts
        .iter()
        .filter(|p| p.accepted)
        .map(|p| p.timestamp)
        .collect();

    // 400 was queued while 500's first attempt was failing; after the
    // failure the dispatcher must pick 400 first.
    assert_eq!(accepted, vec![400, 500], "all posts: {:?}", posts);
}

#[tokio::test]
async fn invalid_base_url_is_rejected() {
    assert!(HttpPostOutputQueue::new("localhost:9090").is_err());
    assert!(HttpPostOutputQueue::new("ftp://example.com").is_err());
    assert!(HttpPostOutputQueue::new("http://localhost:9090/").is_ok());
}
