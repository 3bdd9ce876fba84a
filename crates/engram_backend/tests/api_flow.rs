//! Hook ingress over HTTP: dedup on enqueue, secret-filter skips, and
//! offline capture-and-replay through the hook client.

use engram_backend::api::{self, AppState};
use engram_backend::db::hubs::HubStore;
use engram_backend::db::queue::TaskQueue;
use engram_backend::db::sessions::SessionStore;
use engram_backend::db::tokens::TokenStore;
use engram_backend::events::EventBus;
use engram_backend::hub::WorkerHub;
use engram_backend::registry::HubRegistry;
use engram_backend::tokens::TokenService;
use engram_db::EngramDb;
use engram_hook::{BackendClient, ClientConfig, Delivery, OfflineQueue};
use engram_protocol::TraceContext;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Notify;

async fn build_state() -> (AppState, TaskQueue) {
    let db = EngramDb::open_memory().await.unwrap();
    let bus = EventBus::new();
    let signal = Arc::new(Notify::new());
    let queue = TaskQueue::new(db.clone(), bus.clone());
    let sessions = SessionStore::new(db.clone(), bus.clone());
    let tokens = TokenService::new(TokenStore::new(db.clone()));
    let registry = HubRegistry::new(HubStore::new(db.clone()));
    registry.initialize().await.unwrap();
    let hub = Arc::new(WorkerHub::new(
        queue.clone(),
        tokens.clone(),
        bus.clone(),
        Arc::clone(&signal),
    ));

    let state = AppState {
        queue: queue.clone(),
        sessions,
        tokens,
        registry,
        hub,
        bus,
        dispatch_signal: signal,
        api_token: None,
        hub_token: None,
        version: "test",
    };
    (state, queue)
}

async fn serve(state: AppState) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, api::router(state)).await.unwrap();
    });
    addr
}

fn hook_client(dir: &TempDir, base_url: &str) -> BackendClient {
    let queue = OfflineQueue::open(&dir.path().join("offline.jsonl")).unwrap();
    BackendClient::new(
        ClientConfig {
            base_url: base_url.to_string(),
            api_token: None,
            slow_host: false,
        },
        queue,
    )
    .unwrap()
}

fn observation_payload(n: i64) -> serde_json::Value {
    serde_json::json!({
        "content_session_id": "c-1",
        "project": "demo",
        "prompt_number": n,
        "tool_name": "Edit",
        "tool_input": {"file_path": format!("/work/{}.rs", n)},
        "tool_output": {"ok": true},
    })
}

#[tokio::test]
async fn test_observation_dedup_over_http() {
    let (state, queue) = build_state().await;
    let addr = serve(state).await;
    let dir = TempDir::new().unwrap();
    let client = hook_client(&dir, &addr);
    let trace = TraceContext::new_root();

    // Back-to-back identical posts: one task row, same id, was_new flips.
    let first = client
        .send_or_enqueue("observation", "/api/hooks/observation", observation_payload(1), &trace)
        .await
        .unwrap();
    let Delivery::Sent(first_body) = first else {
        panic!("expected live delivery")
    };
    assert_eq!(first_body["was_new"], true);

    let second = client
        .send_or_enqueue("observation", "/api/hooks/observation", observation_payload(1), &trace)
        .await
        .unwrap();
    let Delivery::Sent(second_body) = second else {
        panic!("expected live delivery")
    };
    assert_eq!(second_body["was_new"], false);
    assert_eq!(second_body["task_id"], first_body["task_id"]);

    let stats = queue.count_by_status().await.unwrap();
    assert_eq!(stats.pending, 1);
}

#[tokio::test]
async fn test_skipped_observation_stores_nothing() {
    let (state, queue) = build_state().await;
    let addr = serve(state).await;
    let dir = TempDir::new().unwrap();
    let client = hook_client(&dir, &addr);

    let mut payload = observation_payload(1);
    payload["skipped"] = serde_json::json!(true);
    let delivery = client
        .send_or_enqueue(
            "observation",
            "/api/hooks/observation",
            payload,
            &TraceContext::new_root(),
        )
        .await
        .unwrap();

    let Delivery::Sent(body) = delivery else {
        panic!("expected live delivery")
    };
    assert_eq!(body["skipped"], true);
    assert!(body.get("task_id").is_none());

    let stats = queue.count_by_status().await.unwrap();
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn test_offline_capture_then_fifo_replay() {
    let (state, queue) = build_state().await;
    let dir = TempDir::new().unwrap();

    // Reserve an address, then release it so the backend is "down".
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let base_url = format!("http://{}", addr);

    let client = hook_client(&dir, &base_url);
    let trace = TraceContext::new_root();
    for n in 0..3 {
        let delivery = client
            .send_or_enqueue("observation", "/api/hooks/observation", observation_payload(n), &trace)
            .await
            .unwrap();
        assert!(matches!(delivery, Delivery::Queued(_)));
    }
    assert_eq!(client.queue().len(), 3);

    // Backend comes up on the same address.
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api::router(state)).await.unwrap();
    });

    let report = client.sync().await.unwrap();
    assert_eq!(report.delivered, 3);
    assert_eq!(report.failed, 0);
    assert!(client.queue().is_empty());

    // Replay preserved enqueue order: tasks appear oldest-first.
    let ready = queue
        .next_ready_batch(chrono::Utc::now(), 10)
        .await
        .unwrap();
    let prompts: Vec<i64> = ready
        .iter()
        .map(|t| t.payload["prompt_number"].as_i64().unwrap())
        .collect();
    assert_eq!(prompts, vec![0, 1, 2]);

    // Live events after sync bypass the queue.
    let delivery = client
        .send_or_enqueue("observation", "/api/hooks/observation", observation_payload(9), &trace)
        .await
        .unwrap();
    assert!(matches!(delivery, Delivery::Sent(_)));
    assert!(client.queue().is_empty());
}

#[tokio::test]
async fn test_session_init_roundtrip() {
    let (state, _) = build_state().await;
    let addr = serve(state).await;
    let dir = TempDir::new().unwrap();
    let client = hook_client(&dir, &addr);
    let trace = TraceContext::new_root();

    let payload = serde_json::json!({
        "content_session_id": "c-9",
        "project": "demo",
        "git_branch": "main",
    });
    let Delivery::Sent(first) = client
        .send_or_enqueue("session-init", "/api/hooks/session-init", payload.clone(), &trace)
        .await
        .unwrap()
    else {
        panic!("expected live delivery")
    };
    assert_eq!(first["created"], true);

    let Delivery::Sent(second) = client
        .send_or_enqueue("session-init", "/api/hooks/session-init", payload, &trace)
        .await
        .unwrap()
    else {
        panic!("expected live delivery")
    };
    assert_eq!(second["created"], false);
    assert_eq!(second["session_id"], first["session_id"]);
}
