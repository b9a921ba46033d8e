use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;

use super::*;
use crate::lifecycle::StateObserver;
use crate::storage::FailureReason;
use crate::sync::{ConflictDecision, ConflictResolution, RealtimeEnvelope};
use crate::testing::{patch, test_config, wait_until, MockService, TestItem};

async fn setup(
    config: StateManagerConfig,
    items: Vec<TestItem>,
) -> (RealtimeStateManager<TestItem>, Arc<MockService>) {
    let service = MockService::with_items(items);
    let manager = RealtimeStateManager::new(config, service.clone()).unwrap();
    manager.initialize().await.unwrap();
    (manager, service)
}

fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn count(events: &[SyncEvent], event_type: &str) -> usize {
    events.iter().filter(|e| e.event_type() == event_type).count()
}

fn id(n: i64) -> EntityId {
    EntityId::Num(n)
}

struct Decider {
    decision: Option<ConflictDecision>,
    confirmed: AtomicUsize,
    failed: AtomicUsize,
}

impl Decider {
    fn new(decision: Option<ConflictDecision>) -> Arc<Self> {
        Arc::new(Self {
            decision,
            confirmed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl StateObserver<TestItem> for Decider {
    async fn on_operation_confirmed(&self, _operation: &PendingOperation<TestItem>) -> Result<()> {
        self.confirmed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_operation_failed(&self, _failed: &FailedOperation<TestItem>) -> Result<()> {
        self.failed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_conflict_detected(&self, _conflict: &ConflictInfo<TestItem>) -> Option<ConflictDecision> {
        self.decision
    }
}

#[tokio::test]
async fn test_initialize_loads_server_snapshot() {
    let (manager, _service) = setup(test_config(), vec![TestItem::new(1, "rent", 1), TestItem::new(2, "food", 2)]).await;

    assert!(manager.is_initialized());
    assert_eq!(manager.local_state().len(), 2);
    assert_eq!(manager.local_state(), manager.server_state());
    assert_eq!(manager.sync_status(), SyncStatus::Idle);
    assert!(manager.last_sync().is_some());
    assert!(!manager.has_changes());

    let stats = manager.get_sync_stats();
    assert_eq!(stats.local_count, 2);
    assert_eq!(stats.server_count, 2);
    assert_eq!(stats.pending_count, 0);
}

#[tokio::test]
async fn test_single_active_operation_per_entity() {
    let (manager, service) = setup(test_config(), vec![TestItem::new(1, "rent", 1)]).await;
    service.pause();

    let first = manager.optimistic_update(&id(1), patch(&[("qty", json!(2))])).await.unwrap();
    let second = manager.optimistic_update(&id(1), patch(&[("qty", json!(3))])).await.unwrap();
    let third = manager.optimistic_update(&id(1), patch(&[("name", json!("mortgage"))])).await.unwrap();
    assert_eq!(third.entity.qty, 3);
    assert_eq!(third.entity.name, "mortgage");

    assert!(wait_until(|| service.call_count("update") == 1).await);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(service.call_count("update"), 1);
    assert_eq!(manager.pending_operations().len(), 3);
    assert_eq!(manager.queue_stats().in_flight_operations, 1);

    let local = manager.get_entity(&id(1)).unwrap();
    assert_eq!((local.name.as_str(), local.qty), ("mortgage", 3));
    assert_eq!(manager.server_state()[0].qty, 1);

    service.resume();
    assert_eq!(first.confirmation.confirmed().await.unwrap().unwrap().qty, 2);
    assert_eq!(second.confirmation.confirmed().await.unwrap().unwrap().qty, 3);
    let last = third.confirmation.confirmed().await.unwrap().unwrap();
    assert_eq!(last.name, "mortgage");

    assert_eq!(service.call_count("update:1"), 3);
    assert_eq!(service.max_in_flight(), 1);
    assert!(wait_until(|| !manager.has_pending_operations()).await);
    assert_eq!(manager.local_state(), manager.server_state());
}

#[tokio::test]
async fn test_concurrency_is_bounded_across_entities() {
    let config = StateManagerConfig {
        max_concurrent_requests: 2,
        ..test_config()
    };
    let items = (1..=5).map(|n| TestItem::new(n, "item", n)).collect();
    let (manager, service) = setup(config, items).await;
    service.pause();

    let mut confirmations = Vec::new();
    for n in 1..=5 {
        let optimistic = manager.optimistic_update(&id(n), patch(&[("qty", json!(n * 10))])).await.unwrap();
        confirmations.push(optimistic.confirmation.confirmed());
    }

    assert!(wait_until(|| service.call_count("update") == 2).await);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(service.call_count("update"), 2);

    service.resume();
    let results = futures::future::join_all(confirmations).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(service.call_count("update"), 5);
    assert!(service.max_in_flight() <= 2);
}

#[tokio::test]
async fn test_create_replaces_temporary_id() {
    let (manager, service) = setup(test_config(), vec![]).await;
    let mut rx = manager.subscribe();

    let optimistic = manager
        .optimistic_create(patch(&[("name", json!("rent")), ("qty", json!(1))]))
        .await
        .unwrap();
    assert!(optimistic.entity.id.is_temporary());
    assert_eq!(optimistic.confirmation.entity_id(), &optimistic.entity.id);

    let created = optimistic.confirmation.confirmed().await.unwrap().unwrap();
    assert_eq!(created.id, id(100));
    assert_eq!(service.server_items(), vec![created.clone()]);

    let local = manager.local_state();
    assert_eq!(local, vec![created]);
    assert!(local.iter().all(|item| !item.id.is_temporary()));

    let events = drain(&mut rx);
    assert_eq!(count(&events, "operation_enqueued"), 1);
    assert_eq!(count(&events, "temporary_id_replaced"), 1);
    assert_eq!(count(&events, "operation_confirmed"), 1);
}

#[tokio::test]
async fn test_update_behind_create_follows_server_id() {
    let (manager, service) = setup(test_config(), vec![]).await;
    service.pause();

    let created = manager
        .optimistic_create(patch(&[("name", json!("rent")), ("qty", json!(1))]))
        .await
        .unwrap();
    let temp_id = created.entity.id.clone();
    let updated = manager.optimistic_update(&temp_id, patch(&[("qty", json!(5))])).await.unwrap();
    assert_eq!(updated.entity.qty, 5);
    assert_eq!(manager.local_state().len(), 1);

    service.resume();
    created.confirmation.confirmed().await.unwrap();
    let confirmed = updated.confirmation.confirmed().await.unwrap().unwrap();
    assert_eq!(confirmed.id, id(100));
    assert_eq!(confirmed.qty, 5);

    let calls = service.calls();
    assert_eq!(&calls[calls.len() - 2..], &["create".to_string(), "update:100".to_string()]);
    assert_eq!(manager.local_state(), vec![confirmed]);
}

#[tokio::test]
async fn test_permanent_failure_rolls_back_without_retry() {
    let (manager, service) = setup(test_config(), vec![TestItem::new(1, "rent", 1)]).await;
    let observer = Decider::new(None);
    manager.register_hook(observer.clone());
    service.fail_next("update", RealtimeStateError::Validation("qty must be positive".to_string()));

    let optimistic = manager.optimistic_update(&id(1), patch(&[("qty", json!(-3))])).await.unwrap();
    assert_eq!(optimistic.entity.qty, -3);

    let result = optimistic.confirmation.confirmed().await;
    assert!(matches!(result, Err(RealtimeStateError::Validation(_))));
    assert_eq!(service.call_count("update"), 1);
    assert_eq!(manager.local_state(), manager.server_state());
    assert_eq!(manager.get_entity(&id(1)).unwrap().qty, 1);

    let failed = manager.failed_operations();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].reason, FailureReason::Validation);
    assert_eq!(failed[0].operation.attempts, 1);
    assert!(manager.last_error().is_some());
    assert!(wait_until(|| observer.failed.load(Ordering::SeqCst) == 1).await);
}

#[tokio::test]
async fn test_transient_failure_retries_then_succeeds() {
    let (manager, service) = setup(test_config(), vec![TestItem::new(1, "rent", 1)]).await;
    let mut rx = manager.subscribe();
    for _ in 0..2 {
        service.fail_next(
            "update",
            RealtimeStateError::Server {
                status: 503,
                message: "unavailable".to_string(),
            },
        );
    }

    let optimistic = manager.optimistic_update(&id(1), patch(&[("qty", json!(7))])).await.unwrap();
    let confirmed = optimistic.confirmation.confirmed().await.unwrap().unwrap();
    assert_eq!(confirmed.qty, 7);
    assert_eq!(service.call_count("update"), 3);
    assert!(manager.failed_operations().is_empty());

    let events = drain(&mut rx);
    assert_eq!(count(&events, "operation_retrying"), 2);
    assert_eq!(count(&events, "operation_dispatched"), 3);
}

#[tokio::test]
async fn test_exhausted_retries_roll_back() {
    let (manager, service) = setup(test_config(), vec![TestItem::new(1, "rent", 1)]).await;
    for _ in 0..3 {
        service.fail_next("delete", RealtimeStateError::Transport("connection reset".to_string()));
    }

    let confirmation = manager.optimistic_delete(&id(1)).await.unwrap();
    assert!(manager.get_entity(&id(1)).is_none());

    let result = confirmation.confirmed().await;
    assert!(matches!(result, Err(RealtimeStateError::Transport(_))));
    assert_eq!(service.call_count("delete"), 3);
    assert_eq!(manager.get_entity(&id(1)).unwrap().name, "rent");
    assert_eq!(manager.failed_operations()[0].operation.attempts, 3);
}

#[tokio::test]
async fn test_failed_create_cascades_to_queued_operations() {
    let (manager, service) = setup(test_config(), vec![]).await;
    service.pause();
    service.fail_next("create", RealtimeStateError::Validation("name required".to_string()));

    let created = manager.optimistic_create(patch(&[("name", json!("")), ("qty", json!(1))])).await.unwrap();
    let updated = manager
        .optimistic_update(&created.entity.id, patch(&[("qty", json!(2))]))
        .await
        .unwrap();
    service.resume();

    assert!(matches!(created.confirmation.confirmed().await, Err(RealtimeStateError::Validation(_))));
    assert!(matches!(updated.confirmation.confirmed().await, Err(RealtimeStateError::Cancelled(_))));
    assert!(manager.local_state().is_empty());
    assert!(!manager.has_pending_operations());
    assert_eq!(manager.failed_operations().len(), 2);
    assert_eq!(service.call_count("update"), 0);
}

#[tokio::test]
async fn test_delete_not_found_counts_as_success() {
    let (manager, service) = setup(test_config(), vec![TestItem::new(1, "rent", 1)]).await;
    service.fail_next("delete", RealtimeStateError::NotFound("1".to_string()));

    let confirmation = manager.optimistic_delete(&id(1)).await.unwrap();
    assert_eq!(confirmation.confirmed().await.unwrap(), None);
    assert!(manager.local_state().is_empty());
    assert!(manager.server_state().is_empty());
    assert!(manager.failed_operations().is_empty());
}

#[tokio::test]
async fn test_deleting_unsent_create_never_reaches_server() {
    let config = StateManagerConfig {
        debounce_ms: 200,
        ..test_config()
    };
    let (manager, service) = setup(config, vec![]).await;

    let created = manager.optimistic_create(patch(&[("name", json!("rent")), ("qty", json!(1))])).await.unwrap();
    let deleted = manager.optimistic_delete(&created.entity.id).await.unwrap();

    assert!(deleted.operation_id().is_none());
    assert_eq!(deleted.confirmed().await.unwrap(), None);
    assert!(matches!(created.confirmation.confirmed().await, Err(RealtimeStateError::Cancelled(_))));
    assert!(manager.local_state().is_empty());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(service.call_count("create"), 0);
}

#[tokio::test]
async fn test_remote_events_are_idempotent() {
    let (manager, _service) = setup(test_config(), vec![TestItem::new(1, "rent", 1)]).await;
    let mut rx = manager.subscribe();

    let remote = TestItem::new(1, "rent", 5);
    manager.on_entity_updated(remote.clone()).await.unwrap();
    let after_first = manager.local_state();
    manager.on_entity_updated(remote.clone()).await.unwrap();
    assert_eq!(manager.local_state(), after_first);
    assert_eq!(manager.get_entity(&id(1)).unwrap().qty, 5);

    let added = TestItem::new(2, "food", 1);
    manager.on_entity_created(added.clone()).await.unwrap();
    manager.on_entity_created(added).await.unwrap();
    assert_eq!(manager.local_state().len(), 2);

    manager.on_entity_deleted(&id(2)).await.unwrap();
    manager.on_entity_deleted(&id(2)).await.unwrap();
    assert_eq!(manager.local_state(), vec![remote]);

    let events = drain(&mut rx);
    assert_eq!(count(&events, "remote_change_applied"), 3);
    assert_eq!(count(&events, "server_event_ignored"), 3);

    let connection = manager.connection_state();
    assert_eq!(connection.stats.events_applied, 3);
    assert_eq!(connection.stats.events_ignored, 3);
}

#[tokio::test]
async fn test_conflict_defaults_to_accept_server() {
    let config = StateManagerConfig {
        debounce_ms: 10_000,
        ..test_config()
    };
    let (manager, service) = setup(config, vec![TestItem::new(1, "rent", 1)]).await;
    let mut rx = manager.subscribe();

    let optimistic = manager.optimistic_update(&id(1), patch(&[("qty", json!(2))])).await.unwrap();
    let remote = TestItem::new(1, "housing", 1);
    manager.on_entity_updated(remote.clone()).await.unwrap();

    assert!(matches!(optimistic.confirmation.confirmed().await, Err(RealtimeStateError::Conflict(_))));
    assert_eq!(manager.local_state(), vec![remote]);
    assert!(!manager.has_conflicts());
    assert!(!manager.has_pending_operations());
    assert_eq!(service.call_count("update"), 0);

    let events = drain(&mut rx);
    assert_eq!(count(&events, "conflict_detected"), 1);
    let resolved: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::ConflictResolved { resolution, .. } => Some(resolution.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(resolved, vec!["accept_server"]);
}

#[tokio::test]
async fn test_echo_of_own_write_is_not_a_conflict() {
    let config = StateManagerConfig {
        debounce_ms: 10_000,
        ..test_config()
    };
    let (manager, _service) = setup(config, vec![TestItem::new(1, "rent", 1)]).await;

    manager.optimistic_update(&id(1), patch(&[("qty", json!(2))])).await.unwrap();
    let mut echo = TestItem::new(1, "rent", 2);
    echo.updated_at = Some("2024-01-01T00:00:00Z".to_string());
    manager.on_entity_updated(echo).await.unwrap();

    assert!(!manager.has_conflicts());
    assert!(manager.has_pending_operations());
    assert_eq!(manager.get_entity(&id(1)).unwrap().qty, 2);
}

#[tokio::test]
async fn test_accept_local_reissues_on_server_version() {
    let config = StateManagerConfig {
        debounce_ms: 10_000,
        ..test_config()
    };
    let (manager, service) = setup(config, vec![TestItem::new(1, "rent", 1)]).await;
    manager.register_hook(Decider::new(Some(ConflictDecision::AcceptLocal)));

    let optimistic = manager.optimistic_update(&id(1), patch(&[("qty", json!(2))])).await.unwrap();
    let remote = TestItem::new(1, "housing", 1);
    service.set_server_item(remote.clone());
    manager.on_entity_updated(remote).await.unwrap();

    let confirmed = optimistic.confirmation.confirmed().await.unwrap().unwrap();
    assert_eq!((confirmed.name.as_str(), confirmed.qty), ("housing", 2));
    assert!(!manager.has_conflicts());
    assert_eq!(manager.local_state(), manager.server_state());
}

#[tokio::test]
async fn test_merge_into_pending_delete_is_rejected() {
    let config = StateManagerConfig {
        debounce_ms: 10_000,
        ..test_config()
    };
    let (manager, service) = setup(config, vec![TestItem::new(1, "rent", 1)]).await;
    manager.register_hook(Decider::new(Some(ConflictDecision::Defer)));

    let delete = manager.optimistic_delete(&id(1)).await.unwrap();
    let remote = TestItem::new(1, "housing", 1);
    manager.on_entity_updated(remote.clone()).await.unwrap();
    assert!(manager.has_conflicts());
    assert!(manager.get_entity(&id(1)).is_none());

    let merge = manager
        .resolve_conflict(&id(1), ConflictResolution::merge_with(|_| patch(&[("qty", json!(3))])))
        .await;
    assert!(matches!(merge, Err(RealtimeStateError::InvalidOperation(_))));
    assert!(manager.has_conflicts());

    manager.resolve_conflict(&id(1), ConflictResolution::AcceptServer).await.unwrap();
    assert!(matches!(delete.confirmed().await, Err(RealtimeStateError::Conflict(_))));
    assert_eq!(manager.local_state(), vec![remote]);
    assert_eq!(service.call_count("delete"), 0);
    assert!(manager.resolve_conflict(&id(1), ConflictResolution::AcceptLocal).await.is_err());
}

#[tokio::test]
async fn test_manual_conflict_resolution() {
    let config = StateManagerConfig {
        debounce_ms: 10_000,
        ..test_config()
    };
    let (manager, service) = setup(config, vec![TestItem::new(1, "rent", 1)]).await;
    manager.register_hook(Decider::new(Some(ConflictDecision::Defer)));

    let optimistic = manager.optimistic_update(&id(1), patch(&[("qty", json!(9))])).await.unwrap();
    let remote = TestItem::new(1, "housing", 1);
    service.set_server_item(remote.clone());
    manager.on_entity_updated(remote).await.unwrap();

    let conflict = manager.conflict_for(&id(1)).unwrap();
    assert_eq!(conflict.conflicted_fields, vec!["name".to_string()]);
    assert_eq!(conflict.local_version.qty, 9);
    assert_eq!(conflict.server_version.name, "housing");
    assert_eq!(manager.get_entity(&id(1)).unwrap().qty, 9);

    manager
        .resolve_conflict(&id(1), ConflictResolution::merge_prefer_local())
        .await
        .unwrap();
    let merged = optimistic.confirmation.confirmed().await.unwrap().unwrap();
    assert_eq!((merged.name.as_str(), merged.qty), ("housing", 9));
    assert!(!manager.has_conflicts());
}

#[tokio::test]
async fn test_in_flight_result_supersedes_conflict() {
    let (manager, service) = setup(test_config(), vec![TestItem::new(1, "rent", 1)]).await;
    manager.register_hook(Decider::new(Some(ConflictDecision::Defer)));
    let mut rx = manager.subscribe();
    service.pause();

    let optimistic = manager.optimistic_update(&id(1), patch(&[("qty", json!(2))])).await.unwrap();
    assert!(wait_until(|| service.call_count("update") == 1).await);
    manager.on_entity_updated(TestItem::new(1, "housing", 1)).await.unwrap();
    assert!(manager.has_conflicts());

    service.resume();
    let confirmed = optimistic.confirmation.confirmed().await.unwrap().unwrap();
    assert_eq!(confirmed.qty, 2);
    assert!(!manager.has_conflicts());

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, SyncEvent::ConflictResolved { resolution, .. } if resolution == "superseded")));
}

#[tokio::test]
async fn test_sync_failure_leaves_state_untouched() {
    let config = StateManagerConfig {
        debounce_ms: 10_000,
        ..test_config()
    };
    let (manager, service) = setup(config, vec![TestItem::new(1, "rent", 1), TestItem::new(2, "food", 2)]).await;
    manager.optimistic_update(&id(1), patch(&[("qty", json!(8))])).await.unwrap();
    let before_local = manager.local_state();
    let before_server = manager.server_state();

    service.fail_next("fetch_all", RealtimeStateError::Transport("offline".to_string()));
    assert!(manager.sync_with_server().await.is_err());

    assert_eq!(manager.sync_status(), SyncStatus::Error);
    assert!(manager.last_error().unwrap().contains("offline"));
    assert_eq!(manager.local_state(), before_local);
    assert_eq!(manager.server_state(), before_server);
    assert_eq!(manager.pending_operations().len(), 1);

    manager.refresh().await.unwrap();
    assert_eq!(manager.sync_status(), SyncStatus::Idle);
    assert!(manager.last_error().is_none());
    assert_eq!(manager.get_entity(&id(1)).unwrap().qty, 8);
}

#[tokio::test]
async fn test_reconnect_pushes_queued_create() {
    let (manager, service) = setup(test_config(), vec![]).await;
    manager.on_realtime_disconnected().await;
    assert!(!manager.is_connected());

    let optimistic = manager
        .optimistic_create(patch(&[("name", json!("rent")), ("qty", json!(1))]))
        .await
        .unwrap();
    let temp_id = optimistic.entity.id.clone();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(service.call_count("create"), 0);
    assert_eq!(manager.local_state()[0].id, temp_id);

    manager.on_realtime_connected().await.unwrap();
    let created = optimistic.confirmation.confirmed().await.unwrap().unwrap();

    assert!(manager.is_connected());
    assert_eq!(manager.connection_state().reconnect_count, 1);
    assert_eq!(manager.local_state(), vec![created.clone()]);
    assert!(manager.get_entity(&temp_id).is_none());
    assert!(!created.id.is_temporary());
}

#[tokio::test]
async fn test_retryable_failure_while_offline_parks_operation() {
    let (manager, service) = setup(test_config(), vec![TestItem::new(1, "rent", 1)]).await;
    service.pause();

    let optimistic = manager.optimistic_update(&id(1), patch(&[("qty", json!(4))])).await.unwrap();
    assert!(wait_until(|| service.call_count("update") == 1).await);
    service.fail_next("update", RealtimeStateError::Timeout("no response".to_string()));
    manager.on_realtime_disconnected().await;
    service.resume();

    assert!(wait_until(|| manager.pending_operations().first().map(|op| op.last_error.is_some()).unwrap_or(false)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(service.call_count("update"), 1);
    assert_eq!(manager.pending_operations()[0].attempts, 0);

    manager.on_realtime_connected().await.unwrap();
    assert_eq!(optimistic.confirmation.confirmed().await.unwrap().unwrap().qty, 4);
    assert_eq!(service.call_count("update"), 2);
}

#[tokio::test]
async fn test_remote_delete_settles_pending_operations() {
    let config = StateManagerConfig {
        debounce_ms: 10_000,
        ..test_config()
    };
    let (manager, _service) = setup(config, vec![TestItem::new(1, "rent", 1), TestItem::new(2, "food", 2)]).await;

    let update = manager.optimistic_update(&id(1), patch(&[("qty", json!(3))])).await.unwrap();
    let delete = manager.optimistic_delete(&id(2)).await.unwrap();

    manager.on_entity_deleted(&id(1)).await.unwrap();
    manager.on_entity_deleted(&id(2)).await.unwrap();

    assert!(matches!(update.confirmation.confirmed().await, Err(RealtimeStateError::NotFound(_))));
    assert_eq!(delete.confirmed().await.unwrap(), None);
    assert!(manager.local_state().is_empty());
    assert!(!manager.has_pending_operations());
    assert_eq!(manager.failed_operations().len(), 1);
}

#[tokio::test]
async fn test_realtime_envelopes_route_and_deduplicate() {
    let (manager, service) = setup(test_config(), vec![]).await;

    let created = RealtimeEnvelope::new("entity.created", json!({"id": 7, "name": "rent", "qty": 1})).with_event_id("evt-1");
    manager.handle_realtime_message(created.clone()).await.unwrap();
    manager.handle_realtime_message(created).await.unwrap();
    assert_eq!(manager.local_state(), vec![TestItem::new(7, "rent", 1)]);
    assert_eq!(manager.connection_state().stats.duplicate_events, 1);

    manager
        .handle_realtime_message(RealtimeEnvelope::new(
            "lock.acquired",
            json!({"entityId": 7, "userId": "u-2", "lockType": "edit"}),
        ))
        .await
        .unwrap();
    assert_eq!(manager.lock_for(&id(7)).unwrap().user_id, "u-2");
    manager
        .handle_realtime_message(RealtimeEnvelope::new("lock_released", json!({"entityId": 7, "userId": "u-2"})))
        .await
        .unwrap();
    assert!(manager.entity_locks().is_empty());

    manager
        .handle_realtime_message(RealtimeEnvelope::new("bulk.started", json!({"operationId": "b-1", "total": 3})))
        .await
        .unwrap();
    assert!(manager.is_loading());
    assert_eq!(manager.bulk_operations().len(), 1);
    manager
        .handle_realtime_message(RealtimeEnvelope::new("bulk.progress", json!({"operationId": "b-1", "progress": {"processed": 2}})))
        .await
        .unwrap();
    assert_eq!(manager.bulk_operations()[0].processed, 2);

    let fetches = service.call_count("fetch_all");
    manager
        .handle_realtime_message(RealtimeEnvelope::new("bulk.completed", json!({"operationId": "b-1", "results": []})))
        .await
        .unwrap();
    assert!(manager.bulk_operations().is_empty());
    assert!(!manager.is_loading());
    assert_eq!(service.call_count("fetch_all"), fetches + 1);

    manager
        .handle_realtime_message(RealtimeEnvelope::new("entity.deleted", json!(7)))
        .await
        .unwrap();
    assert!(manager.local_state().is_empty());

    let unknown = manager.handle_realtime_message(RealtimeEnvelope::new("entity.renamed", json!({}))).await;
    assert!(matches!(unknown, Err(RealtimeStateError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_direct_mode_without_optimistic_updates() {
    let config = StateManagerConfig {
        enable_optimistic_updates: false,
        ..test_config()
    };
    let (manager, service) = setup(config, vec![]).await;

    let created = manager
        .optimistic_create(patch(&[("name", json!("rent")), ("qty", json!(1))]))
        .await
        .unwrap();
    assert_eq!(created.entity.id, id(100));
    assert!(created.confirmation.operation_id().is_none());
    assert!(!manager.has_pending_operations());
    assert_eq!(manager.local_state(), vec![created.entity.clone()]);

    let updated = manager.optimistic_update(&id(100), patch(&[("qty", json!(2))])).await.unwrap();
    assert_eq!(updated.confirmation.confirmed().await.unwrap().unwrap().qty, 2);

    service.fail_next("delete", RealtimeStateError::Validation("locked".to_string()));
    assert!(manager.optimistic_delete(&id(100)).await.is_err());
    assert_eq!(manager.local_state().len(), 1);

    manager.optimistic_delete(&id(100)).await.unwrap();
    assert!(manager.local_state().is_empty());
}

#[tokio::test]
async fn test_journal_restores_pending_operations() {
    let dir = tempfile::TempDir::new().unwrap();
    let service = MockService::with_items(vec![TestItem::new(1, "rent", 1)]);

    {
        let config = StateManagerConfig {
            assume_online: false,
            journal_dir: Some(dir.path().to_path_buf()),
            ..test_config()
        };
        let manager = RealtimeStateManager::new(config, service.clone()).unwrap();
        manager.initialize().await.unwrap();
        manager.optimistic_update(&id(1), patch(&[("qty", json!(6))])).await.unwrap();
        assert_eq!(manager.pending_operations().len(), 1);
        // 等待离线通道任务退出，释放 sled 句柄
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(service.call_count("update"), 0);

    let config = StateManagerConfig {
        journal_dir: Some(dir.path().to_path_buf()),
        ..test_config()
    };
    let manager = RealtimeStateManager::new(config, service.clone()).unwrap();
    manager.initialize().await.unwrap();

    assert!(wait_until(|| service.call_count("update:1") == 1).await);
    assert!(wait_until(|| !manager.has_pending_operations()).await);
    assert_eq!(manager.get_entity(&id(1)).unwrap().qty, 6);
    assert_eq!(service.server_items()[0].qty, 6);
}

#[tokio::test]
async fn test_cancel_pending_operations_rolls_back() {
    let config = StateManagerConfig {
        debounce_ms: 10_000,
        ..test_config()
    };
    let (manager, service) = setup(config, vec![TestItem::new(1, "rent", 1)]).await;
    let mut rx = manager.subscribe();

    let update = manager.optimistic_update(&id(1), patch(&[("qty", json!(2))])).await.unwrap();
    let created = manager.optimistic_create(patch(&[("name", json!("food")), ("qty", json!(1))])).await.unwrap();
    assert_eq!(manager.local_state().len(), 2);

    assert_eq!(manager.cancel_pending_operations().await, 2);
    assert!(matches!(update.confirmation.confirmed().await, Err(RealtimeStateError::Cancelled(_))));
    assert!(matches!(created.confirmation.confirmed().await, Err(RealtimeStateError::Cancelled(_))));
    assert_eq!(manager.local_state(), manager.server_state());
    assert_eq!(service.call_count("update") + service.call_count("create"), 0);
    assert_eq!(count(&drain(&mut rx), "operation_cancelled"), 2);
}

#[tokio::test]
async fn test_force_push_skips_backoff() {
    let mut config = test_config();
    config.retry.base_delay_ms = 10_000;
    config.retry.max_delay_ms = 20_000;
    let (manager, service) = setup(config, vec![TestItem::new(1, "rent", 1)]).await;
    service.fail_next("update", RealtimeStateError::Server { status: 500, message: "boom".to_string() });

    let optimistic = manager.optimistic_update(&id(1), patch(&[("qty", json!(2))])).await.unwrap();
    assert!(wait_until(|| manager.pending_operations().first().and_then(|op| op.next_retry_at).is_some()).await);
    assert_eq!(service.call_count("update"), 1);

    manager.force_push().await;
    let confirmed = tokio::time::timeout(Duration::from_secs(2), optimistic.confirmation.confirmed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(confirmed.unwrap().qty, 2);
    assert_eq!(service.call_count("update"), 2);
}

#[tokio::test]
async fn test_reset_clears_state_and_cancels_confirmations() {
    let config = StateManagerConfig {
        debounce_ms: 10_000,
        ..test_config()
    };
    let (manager, _service) = setup(config, vec![TestItem::new(1, "rent", 1)]).await;
    let optimistic = manager.optimistic_update(&id(1), patch(&[("qty", json!(2))])).await.unwrap();

    manager.reset().await;
    assert!(matches!(optimistic.confirmation.confirmed().await, Err(RealtimeStateError::Cancelled(_))));
    assert!(manager.local_state().is_empty());
    assert!(manager.server_state().is_empty());
    assert!(!manager.is_initialized());
    assert!(manager.last_sync().is_none());
    assert_eq!(manager.sync_status(), SyncStatus::Idle);
}

#[tokio::test]
async fn test_state_watch_publishes_changes() {
    let (manager, _service) = setup(test_config(), vec![TestItem::new(1, "rent", 1)]).await;
    let mut state = manager.subscribe_state();
    state.borrow_and_update();

    manager.on_entity_updated(TestItem::new(1, "rent", 4)).await.unwrap();
    state.changed().await.unwrap();
    let snapshot = state.borrow_and_update().clone();
    assert_eq!(snapshot.entities, vec![TestItem::new(1, "rent", 4)]);
    assert_eq!(snapshot.status, SyncStatus::Idle);
    assert_eq!(snapshot.pending_count, 0);
}

#[tokio::test]
async fn test_listeners_receive_events_by_type() {
    let (manager, _service) = setup(test_config(), vec![]).await;
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    manager
        .add_listener("remote_change_applied", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

    manager.on_entity_created(TestItem::new(3, "fuel", 1)).await.unwrap();
    manager.on_entity_updated(TestItem::new(3, "fuel", 2)).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_update_of_unknown_entity_is_rejected() {
    let (manager, _service) = setup(test_config(), vec![]).await;
    let result = manager.optimistic_update(&id(9), patch(&[("qty", json!(1))])).await;
    assert!(matches!(result, Err(RealtimeStateError::NotFound(_))));
    assert!(manager.optimistic_delete(&id(9)).await.is_err());
}

#[tokio::test]
async fn test_create_echo_is_held_until_confirmation() {
    let (manager, service) = setup(test_config(), vec![]).await;
    let mut rx = manager.subscribe();
    service.pause();

    let created = manager
        .optimistic_create(patch(&[("name", json!("rent")), ("qty", json!(1))]))
        .await
        .unwrap();
    assert!(wait_until(|| service.call_count("create") == 1).await);

    manager.on_entity_created(TestItem::new(100, "rent", 1)).await.unwrap();
    assert_eq!(manager.local_state().len(), 1);
    assert!(manager.local_state()[0].id.is_temporary());
    assert!(manager.server_state().is_empty());
    assert_eq!(count(&drain(&mut rx), "server_event_ignored"), 1);

    service.resume();
    let confirmed = created.confirmation.confirmed().await.unwrap().unwrap();
    assert_eq!(confirmed.id, id(100));
    assert_eq!(manager.local_state(), vec![TestItem::new(100, "rent", 1)]);
    assert_eq!(service.call_count("create"), 1);
}

#[tokio::test]
async fn test_held_echo_from_another_client_is_restored() {
    let (manager, service) = setup(test_config(), vec![]).await;
    service.pause();

    let created = manager
        .optimistic_create(patch(&[("name", json!("rent")), ("qty", json!(1))]))
        .await
        .unwrap();
    assert!(wait_until(|| service.call_count("create") == 1).await);
    manager.on_entity_created(TestItem::new(555, "rent", 1)).await.unwrap();
    assert_eq!(manager.local_state().len(), 1);

    service.resume();
    assert_eq!(created.confirmation.confirmed().await.unwrap().unwrap().id, id(100));
    assert_eq!(manager.local_state().len(), 2);
    assert!(manager.get_entity(&id(555)).is_some());
    assert!(manager.get_entity(&id(100)).is_some());
}

#[tokio::test]
async fn test_held_echo_is_restored_when_create_fails() {
    let (manager, service) = setup(test_config(), vec![]).await;
    service.pause();
    service.fail_next("create", RealtimeStateError::Validation("duplicate name".to_string()));

    let created = manager
        .optimistic_create(patch(&[("name", json!("rent")), ("qty", json!(1))]))
        .await
        .unwrap();
    assert!(wait_until(|| service.call_count("create") == 1).await);
    manager.on_entity_created(TestItem::new(555, "rent", 1)).await.unwrap();

    service.resume();
    assert!(matches!(created.confirmation.confirmed().await, Err(RealtimeStateError::Validation(_))));
    assert_eq!(manager.local_state(), vec![TestItem::new(555, "rent", 1)]);
}

#[tokio::test]
async fn test_edit_of_pushed_row_merges_with_create_lane() {
    let (manager, service) = setup(test_config(), vec![]).await;
    service.pause();

    let created = manager
        .optimistic_create(patch(&[("name", json!("rent")), ("qty", json!(1))]))
        .await
        .unwrap();
    assert!(wait_until(|| service.call_count("create") == 1).await);

    // 服务端规范化了名称，推送与创建载荷不一致，按普通远端变更写入
    manager.on_entity_created(TestItem::new(100, "Rent", 1)).await.unwrap();
    assert_eq!(manager.local_state().len(), 2);
    let updated = manager.optimistic_update(&id(100), patch(&[("qty", json!(7))])).await.unwrap();
    assert!(wait_until(|| service.call_count("update:100") == 1).await);

    service.release(1);
    let confirmed = tokio::time::timeout(Duration::from_secs(2), created.confirmation.confirmed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(confirmed.unwrap().id, id(100));
    assert_eq!(manager.queue_stats().in_flight_operations, 1);
    assert_eq!(manager.pending_operations().len(), 1);

    service.resume();
    let edited = tokio::time::timeout(Duration::from_secs(2), updated.confirmation.confirmed())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(edited.qty, 7);
    assert!(wait_until(|| !manager.has_pending_operations()).await);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(service.call_count("create"), 1);
    assert_eq!(manager.local_state(), vec![TestItem::new(100, "rent", 7)]);
}

#[tokio::test]
async fn test_optimistic_update_many_confirms_in_order() {
    let (manager, _service) = setup(test_config(), vec![TestItem::new(1, "rent", 1), TestItem::new(2, "food", 2)]).await;

    let confirmed = manager
        .optimistic_update_many(vec![
            (id(2), patch(&[("qty", json!(20))])),
            (id(1), patch(&[("qty", json!(10))])),
        ])
        .await
        .unwrap();
    let quantities: Vec<i64> = confirmed.iter().map(|item| item.qty).collect();
    assert_eq!(quantities, vec![20, 10]);
    assert!(!manager.has_pending_operations());
}

#[tokio::test]
async fn test_optimistic_update_many_rolls_back_failed_items_only() {
    let (manager, service) = setup(test_config(), vec![TestItem::new(1, "rent", 1), TestItem::new(2, "food", 2)]).await;
    // 只存在于本地快照，服务端更新会返回 404
    manager.on_entity_created(TestItem::new(9, "ghost", 1)).await.unwrap();

    let result = manager
        .optimistic_update_many(vec![
            (id(1), patch(&[("qty", json!(10))])),
            (id(9), patch(&[("qty", json!(90))])),
            (id(2), patch(&[("qty", json!(20))])),
        ])
        .await;

    assert!(matches!(result, Err(RealtimeStateError::NotFound(_))));
    assert_eq!(manager.get_entity(&id(1)).unwrap().qty, 10);
    assert_eq!(manager.get_entity(&id(2)).unwrap().qty, 20);
    assert_eq!(manager.get_entity(&id(9)).unwrap().qty, 1);
    assert_eq!(manager.failed_operations().len(), 1);
    assert_eq!(service.call_count("update"), 3);
}

#[tokio::test]
async fn test_find_where_filters_local_view() {
    let config = StateManagerConfig {
        debounce_ms: 10_000,
        ..test_config()
    };
    let (manager, _service) = setup(config, vec![TestItem::new(1, "rent", 1), TestItem::new(2, "food", 50)]).await;
    manager.optimistic_update(&id(1), patch(&[("qty", json!(80))])).await.unwrap();

    let large = manager.find_where(|item| item.qty > 40);
    assert_eq!(large.len(), 2);
    assert!(manager.find_where(|item| item.name == "fuel").is_empty());
}

#[tokio::test]
async fn test_cache_staleness_follows_ttl() {
    let config = StateManagerConfig {
        cache_ttl_ms: 200,
        ..test_config()
    };
    let service = MockService::with_items(vec![TestItem::new(1, "rent", 1)]);
    let manager = RealtimeStateManager::new(config, service.clone()).unwrap();
    assert!(manager.is_cache_stale());

    manager.initialize().await.unwrap();
    assert!(!manager.is_cache_stale());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(manager.is_cache_stale());

    manager.on_entity_updated(TestItem::new(1, "rent", 2)).await.unwrap();
    assert!(!manager.is_cache_stale());

    manager.reset().await;
    assert!(manager.is_cache_stale());

    let disabled = StateManagerConfig {
        enable_caching: false,
        ..test_config()
    };
    let (uncached, _service) = setup(disabled, vec![]).await;
    assert!(uncached.is_cache_stale());
}

#[tokio::test]
async fn test_has_changes_tracks_unconfirmed_operations() {
    let (manager, service) = setup(test_config(), vec![TestItem::new(1, "rent", 1)]).await;
    assert!(!manager.has_changes());
    service.pause();

    let optimistic = manager.optimistic_update(&id(1), patch(&[("qty", json!(5))])).await.unwrap();
    assert!(manager.has_changes());
    assert!(manager.get_sync_stats().has_changes);

    service.resume();
    optimistic.confirmation.confirmed().await.unwrap();
    manager.on_entity_updated(TestItem::new(1, "rent", 6)).await.unwrap();
    assert!(!manager.has_changes());
    assert!(!manager.get_sync_stats().has_changes);
}

#[test]
fn test_ready_confirmation_resolves_immediately() {
    let confirmation: Confirmation<TestItem> = Confirmation::ready(id(1), Ok(None));
    assert!(confirmation.operation_id().is_none());
    assert_eq!(tokio_test::block_on(confirmation.confirmed()).unwrap(), None);
}
