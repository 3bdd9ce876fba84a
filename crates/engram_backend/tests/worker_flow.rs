//! End-to-end worker flow over a real WebSocket: auth handshake, task
//! assignment, completion, and retry-not-before-backoff.

use chrono::Utc;
use engram_backend::api::{self, AppState};
use engram_backend::db::hubs::HubStore;
use engram_backend::db::queue::{NewTask, TaskQueue};
use engram_backend::db::sessions::SessionStore;
use engram_backend::db::tokens::TokenStore;
use engram_backend::dispatcher::Dispatcher;
use engram_backend::events::EventBus;
use engram_backend::hub::WorkerHub;
use engram_backend::registry::HubRegistry;
use engram_backend::router::FederatedRouter;
use engram_backend::tokens::{default_create_request, TokenService};
use engram_db::EngramDb;
use engram_protocol::{TaskId, TaskStatus, TaskType};
use engram_worker::{HandlerRegistry, LifecycleLimits, Worker, WorkerConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

struct TestBackend {
    addr: String,
    queue: TaskQueue,
    dispatcher: Arc<Dispatcher>,
    plain_token: String,
}

async fn start_backend() -> TestBackend {
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
    let dispatcher = Arc::new(Dispatcher::new(
        queue.clone(),
        FederatedRouter::new(registry.clone()),
        Arc::clone(&hub),
        None,
        Arc::clone(&signal),
    ));

    let (_, plain_token) = tokens.create(&default_create_request("test")).await.unwrap();

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

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, api::router(state)).await.unwrap();
    });

    TestBackend {
        addr,
        queue,
        dispatcher,
        plain_token,
    }
}

fn worker_config(backend: &TestBackend, system_id: &str) -> WorkerConfig {
    WorkerConfig {
        backend_url: backend.addr.clone(),
        token: backend.plain_token.clone(),
        labels: HashMap::new(),
        metadata: serde_json::Value::Null,
        system_id: system_id.to_string(),
    }
}

async fn wait_for_status(queue: &TaskQueue, task_id: &TaskId, status: TaskStatus) {
    for _ in 0..100 {
        let record = queue.get(task_id).await.unwrap().unwrap();
        if record.status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let record = queue.get(task_id).await.unwrap().unwrap();
    panic!("task never reached {:?}; stuck at {:?}", status, record.status);
}

#[tokio::test]
async fn test_worker_processes_observation_task() {
    let backend = start_backend().await;

    let registry = Arc::new(HandlerRegistry::with_builtin_handlers());
    let config = worker_config(&backend, "test-host:1");
    let mut worker = Worker::connect(&config, registry).await.unwrap();

    let limits = LifecycleLimits {
        idle_timeout: Duration::from_secs(30),
        max_runtime: Duration::from_secs(60),
    };
    tokio::spawn(async move {
        let _ = worker.run(&limits).await;
    });

    let (task_id, was_new) = backend
        .queue
        .enqueue(NewTask::new(
            TaskType::Observation,
            "observation:basic",
            serde_json::json!({
                "session_id": "s1",
                "project": "demo",
                "tool_name": "Edit",
                "tool_input": {"file_path": "/work/demo/src/lib.rs"},
            }),
        ))
        .await
        .unwrap();
    assert!(was_new);

    backend.dispatcher.pump().await.unwrap();
    wait_for_status(&backend.queue, &task_id, TaskStatus::Completed).await;

    let record = backend.queue.get(&task_id).await.unwrap().unwrap();
    let files = record.result.unwrap()["observation"]["files_touched"].clone();
    assert_eq!(files, serde_json::json!(["/work/demo/src/lib.rs"]));
}

#[tokio::test]
async fn test_invalid_token_is_rejected_at_handshake() {
    let backend = start_backend().await;

    let registry = Arc::new(HandlerRegistry::with_builtin_handlers());
    let mut config = worker_config(&backend, "test-host:2");
    config.token = "egt_0000000000000000000000000000000000000000".to_string();

    let result = Worker::connect(&config, registry).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_fatal_handler_error_fails_task_without_retry() {
    let backend = start_backend().await;

    let registry = Arc::new(HandlerRegistry::with_builtin_handlers());
    let config = worker_config(&backend, "test-host:3");
    let mut worker = Worker::connect(&config, registry).await.unwrap();
    let limits = LifecycleLimits {
        idle_timeout: Duration::from_secs(30),
        max_runtime: Duration::from_secs(60),
    };
    tokio::spawn(async move {
        let _ = worker.run(&limits).await;
    });

    // Missing tool_name: the observation handler reports a fatal error.
    let (task_id, _) = backend
        .queue
        .enqueue(NewTask::new(
            TaskType::Observation,
            "observation:basic",
            serde_json::json!({"session_id": "s1", "project": "demo"}),
        ))
        .await
        .unwrap();

    backend.dispatcher.pump().await.unwrap();
    wait_for_status(&backend.queue, &task_id, TaskStatus::Failed).await;

    let record = backend.queue.get(&task_id).await.unwrap().unwrap();
    assert_eq!(record.retry_count, 0);
}

#[tokio::test]
async fn test_retryable_failure_respects_backoff_window() {
    let backend = start_backend().await;

    // No worker connected: fail the claim path manually to exercise the
    // backoff schedule end to end.
    let (task_id, _) = backend
        .queue
        .enqueue(NewTask::new(
            TaskType::Observation,
            "observation:basic",
            serde_json::json!({"session_id": "s1", "project": "demo"}),
        ))
        .await
        .unwrap();

    let worker_id = engram_protocol::WorkerId::new();
    assert!(backend
        .queue
        .claim(&task_id, &worker_id, Utc::now())
        .await
        .unwrap());
    backend
        .queue
        .fail(&task_id, "upstream hiccup", true)
        .await
        .unwrap();

    // Inside the backoff window the task is invisible to claimers.
    let ready = backend
        .queue
        .next_ready_batch(Utc::now(), 10)
        .await
        .unwrap();
    assert!(ready.iter().all(|t| t.id != task_id));

    // Past the window (attempt 0: <= base + jitter <= 2s) it is ready.
    let later = Utc::now() + chrono::Duration::seconds(3);
    let ready = backend.queue.next_ready_batch(later, 10).await.unwrap();
    assert!(ready.iter().any(|t| t.id == task_id));
}
