//! Integration tests for the broker: server recording, the sync loop,
//! deferred authorship, and server push.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use common::{
    CreateTask, FakeServerAdapter, RenameTask, StaticAuthAdapter, Task, ToggleConnectionAdapter,
    remote_event, task_config,
};
use everlog::store::in_memory::InMemoryEventsRepository;
use everlog::store::in_memory_snapshot::InMemoryAggregateRepository;
use everlog::{AggregateRepository, Broker, EventsRepository, Operation};

struct SyncHarness {
    auth: Arc<StaticAuthAdapter>,
    events: Arc<InMemoryEventsRepository>,
    snapshots: Arc<InMemoryAggregateRepository<Task>>,
    server: Arc<FakeServerAdapter>,
    connection: Arc<ToggleConnectionAdapter>,
}

impl SyncHarness {
    fn new() -> Self {
        Self {
            auth: Arc::new(StaticAuthAdapter::new("device-1")),
            events: Arc::new(InMemoryEventsRepository::new()),
            snapshots: Arc::new(InMemoryAggregateRepository::new()),
            server: Arc::new(FakeServerAdapter::new()),
            connection: Arc::new(ToggleConnectionAdapter::new()),
        }
    }

    async fn broker(&self, retry_sync_interval: Duration) -> Broker<String> {
        Broker::<String>::builder(self.auth.clone())
            .events_repository(self.events.clone())
            .event_server(self.server.clone())
            .connection_status(self.connection.clone())
            .retry_sync_interval(retry_sync_interval)
            .build()
            .await
    }
}

#[tokio::test(start_paused = true)]
async fn startup_sync_fetches_the_full_remote_history() {
    let harness = SyncHarness::new();
    harness.auth.sign_in("account-1");
    harness.server.seed_remote(vec![
        remote_event(
            "r1",
            Operation::Create,
            "G",
            "task.create",
            json!({ "title": "s" }),
            "device-2",
            None,
        ),
        remote_event(
            "r2",
            Operation::Update,
            "G",
            "task.rename",
            json!({ "title": "s2" }),
            "device-2",
            Some("r1"),
        ),
    ]);

    let broker = harness.broker(Duration::from_secs(300)).await;
    let store = broker.register(task_config(harness.snapshots.clone())).unwrap();

    let observed: Arc<Mutex<Vec<usize>>> = Arc::default();
    let sink = observed.clone();
    store.subscribe(move |collection| {
        sink.lock().unwrap().push(collection.len());
    });

    // Let the startup tick of the sync loop run.
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(
        harness.server.fetch_after().first(),
        Some(&None),
        "the first fetch asks for the full history"
    );
    let state = store.state();
    assert_eq!(state["G"].state.title, "s2");
    assert_eq!(state["G"].version, 2);
    assert_eq!(
        harness.events.events().len(),
        2,
        "remote events are persisted locally"
    );
    assert!(
        observed.lock().unwrap().contains(&1),
        "subscribers were notified with the ingested aggregate"
    );
}

#[tokio::test(start_paused = true)]
async fn offline_burst_is_recorded_within_one_retry_window() {
    let harness = SyncHarness::new();
    harness.auth.sign_in("account-1");
    let broker = harness.broker(Duration::from_secs(10)).await;
    let store = broker.register(task_config(harness.snapshots.clone())).unwrap();

    harness.server.set_offline(true);
    harness.connection.set(false);

    let id = store
        .create("task.create", CreateTask { title: "x".to_string() })
        .await
        .unwrap();
    store
        .update("task.rename", &id, RenameTask { title: "y".to_string() })
        .await
        .unwrap();
    assert!(harness.server.recorded().is_empty());
    assert_eq!(harness.events.unrecorded().await.unwrap().len(), 2);

    harness.server.set_offline(false);
    harness.connection.set(true);
    tokio::time::sleep(Duration::from_secs(11)).await;

    let recorded = harness.server.recorded();
    assert_eq!(recorded.len(), 2, "both offline events reach the server");
    assert_ne!(recorded[0].id, recorded[1].id);
    assert!(
        harness.events.unrecorded().await.unwrap().is_empty(),
        "the log reflects the recordings"
    );
    let snapshot = store.get(&id).unwrap();
    assert!(snapshot.last_recorded_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn connectivity_recovery_triggers_a_sync() {
    let harness = SyncHarness::new();
    harness.auth.sign_in("account-1");
    let _broker = harness.broker(Duration::from_secs(10)).await;

    // Past the startup sync and the throttle window, before the next tick.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let fetches = harness.server.fetch_after().len();

    harness.connection.set(true);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(
        harness.server.fetch_after().len(),
        fetches + 1,
        "the online transition alone triggered a sync"
    );
}

#[tokio::test]
async fn deferred_authorship_is_stamped_on_sync() {
    let harness = SyncHarness::new();
    let broker = harness.broker(Duration::from_secs(300)).await;
    let store = broker.register(task_config(harness.snapshots.clone())).unwrap();

    // Signed out: the event is persisted locally but not recorded.
    let id = store
        .create("task.create", CreateTask { title: "x".to_string() })
        .await
        .unwrap();
    assert!(harness.server.recorded().is_empty());
    let log = harness.events.events();
    assert_eq!(log.len(), 1);
    assert!(log[0].created_by.is_none());
    assert!(store.get(&id).unwrap().created_by.is_none());

    harness.auth.sign_in("A2");
    harness.server.resolve_account(Some("A2"));
    broker.sync().await;

    assert_eq!(harness.server.recorded().len(), 1);
    let log = harness.events.events();
    assert_eq!(log[0].created_by.as_deref(), Some("A2"));
    assert!(log[0].recorded_at.is_some());
    let snapshot = store.get(&id).unwrap();
    assert_eq!(snapshot.created_by.as_deref(), Some("A2"));
    assert!(snapshot.last_recorded_at.is_some());
}

#[tokio::test]
async fn pushed_events_are_applied_and_own_echoes_skipped() {
    let harness = SyncHarness::new();
    harness.auth.sign_in("account-1");
    let broker = harness.broker(Duration::from_secs(300)).await;
    let store = broker.register(task_config(harness.snapshots.clone())).unwrap();

    let observed: Arc<Mutex<Vec<usize>>> = Arc::default();
    let sink = observed.clone();
    store.subscribe(move |collection| {
        sink.lock().unwrap().push(collection.len());
    });

    harness
        .server
        .push_event(remote_event(
            "p1",
            Operation::Create,
            "X",
            "task.create",
            json!({ "title": "pushed" }),
            "device-2",
            None,
        ))
        .await;

    assert_eq!(store.state()["X"].state.title, "pushed");
    assert!(harness.events.events().iter().any(|e| e.id == "p1"));
    assert_eq!(
        *observed.lock().unwrap(),
        vec![0, 1],
        "one notification beyond the immediate delivery"
    );

    // An echo of an event this device produced is ignored.
    harness
        .server
        .push_event(remote_event(
            "p2",
            Operation::Create,
            "Y",
            "task.create",
            json!({ "title": "echo" }),
            "device-1",
            None,
        ))
        .await;
    assert!(!store.state().contains_key("Y"));
}

#[tokio::test(start_paused = true)]
async fn sync_is_single_flight_and_idempotent_when_quiescent() {
    let harness = SyncHarness::new();
    harness.auth.sign_in("account-1");
    let broker = harness.broker(Duration::from_secs(300)).await;
    broker.register(task_config(harness.snapshots.clone())).unwrap();

    // Let the startup sync settle before counting.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let fetches = harness.server.fetch_after().len();

    harness.server.set_slow(true);
    tokio::join!(broker.sync(), broker.sync());
    assert_eq!(
        harness.server.fetch_after().len(),
        fetches + 1,
        "concurrent callers share one in-flight sync"
    );

    harness.server.set_slow(false);
    broker.sync().await;
    broker.sync().await;
    assert_eq!(
        harness.server.record_calls(),
        0,
        "quiescent syncs produce no server writes"
    );
    assert!(harness.server.recorded().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_the_loop_but_leaves_data_and_manual_sync() {
    let harness = SyncHarness::new();
    harness.auth.sign_in("account-1");
    let broker = harness.broker(Duration::from_secs(10)).await;
    let store = broker.register(task_config(harness.snapshots.clone())).unwrap();
    let id = store
        .create("task.create", CreateTask { title: "a".to_string() })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    broker.shutdown();
    let fetches = harness.server.fetch_after().len();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(
        harness.server.fetch_after().len(),
        fetches,
        "no loop-driven syncs after shutdown"
    );
    assert_eq!(store.state().len(), 1, "data is left intact");

    broker.sync().await;
    assert_eq!(harness.server.fetch_after().len(), fetches + 1);
    assert!(store.get(&id).unwrap().last_recorded_at.is_some());
}

#[tokio::test]
async fn reset_clears_the_runtime_but_keeps_it_usable() {
    let harness = SyncHarness::new();
    harness.auth.sign_in("account-1");
    let broker = harness.broker(Duration::from_secs(300)).await;
    let store = broker.register(task_config(harness.snapshots.clone())).unwrap();

    store
        .create("task.create", CreateTask { title: "a".to_string() })
        .await
        .unwrap();
    assert_eq!(store.state().len(), 1);

    broker.reset().await.unwrap();

    assert!(store.state().is_empty());
    assert!(harness.events.events().is_empty());
    assert!(harness.snapshots.get_all().await.unwrap().is_empty());
    assert!(!broker.bus().is_terminated());

    // The runtime keeps working after the wipe.
    let id = store
        .create("task.create", CreateTask { title: "b".to_string() })
        .await
        .unwrap();
    assert_eq!(store.get(&id).unwrap().state.title, "b");
}
