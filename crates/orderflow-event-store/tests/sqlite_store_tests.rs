//! Integration tests for `SqliteStore`.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use orderflow_core::clock::Clock;
use orderflow_core::delivery::{DeliveryRecord, DeliveryState};
use orderflow_core::event::{EventCursor, EventKind, LogEntry, NewOrderEvent};
use orderflow_core::reader::EventReader;
use orderflow_core::repository::{DeliveryStore, EventStore, SubscriptionStore};
use orderflow_core::subscription::{DeliveryPolicy, Subscription};
use orderflow_event_store::{SqliteStore, SqliteStoreConfig};
use orderflow_test_support::{FixedClock, ManualClock};
use uuid::Uuid;

fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap()
}

async fn memory_store() -> SqliteStore {
    SqliteStore::in_memory(Arc::new(FixedClock(fixed_now())))
        .await
        .unwrap()
}

fn subscription(handler_id: &str, kinds: &[EventKind]) -> Subscription {
    Subscription {
        handler_id: handler_id.to_owned(),
        event_kinds: kinds.iter().copied().collect::<BTreeSet<_>>(),
        delivery_policy: DeliveryPolicy::default(),
        registered_at: fixed_now(),
    }
}

/// Appends events and fans every one of them out to `handler_id`.
async fn append_and_fan_out(
    store: &SqliteStore,
    handler_id: &str,
    events: &[(&str, EventKind)],
) -> Vec<LogEntry> {
    for (order_id, kind) in events {
        store
            .append(NewOrderEvent::new(*order_id, *kind, Vec::new()))
            .await
            .unwrap();
    }
    let cursor = store.fan_out_cursor().await.unwrap();
    let entries = store.read_from(cursor, 100).await.unwrap();
    let records: Vec<DeliveryRecord> = entries
        .iter()
        .map(|entry| DeliveryRecord::pending(entry, handler_id, fixed_now()))
        .collect();
    let head = entries.last().map_or(cursor, LogEntry::cursor);
    store.commit_fan_out(&records, head).await.unwrap();
    entries
}

// --- fan-out ---

#[tokio::test]
async fn test_commit_fan_out_advances_cursor_and_ignores_duplicates() {
    // Arrange
    let store = memory_store().await;
    store
        .save_subscription(&subscription("payment", &[EventKind::Created]))
        .await
        .unwrap();
    let entries = append_and_fan_out(&store, "payment", &[("O1", EventKind::Created)]).await;

    // Act: replaying the same fan-out must not duplicate or reset records.
    let again = vec![DeliveryRecord::pending(&entries[0], "payment", fixed_now())];
    store.commit_fan_out(&again, EventCursor(1)).await.unwrap();

    // Assert
    assert_eq!(store.fan_out_cursor().await.unwrap(), EventCursor(1));
    let records = store
        .deliveries_for_event(entries[0].event.event_id)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, DeliveryState::Pending);
}

// --- claiming ---

#[tokio::test]
async fn test_claim_due_takes_only_the_head_of_each_lane() {
    // Arrange
    let store = memory_store().await;
    store
        .save_subscription(&subscription("payment", &[EventKind::Created]))
        .await
        .unwrap();
    append_and_fan_out(
        &store,
        "payment",
        &[
            ("O1", EventKind::Created),
            ("O1", EventKind::PaymentRequested),
            ("O2", EventKind::Created),
        ],
    )
    .await;

    // Act
    let claimed = store.claim_due(fixed_now(), 10).await.unwrap();

    // Assert: O1 seq 2 waits behind O1 seq 1; O2 is independent.
    let lanes: Vec<(String, u64)> = claimed
        .iter()
        .map(|r| (r.order_id.clone(), r.sequence))
        .collect();
    assert_eq!(lanes, vec![("O1".to_owned(), 1), ("O2".to_owned(), 1)]);
    assert!(claimed.iter().all(|r| r.state == DeliveryState::InFlight));

    // Nothing else is claimable while the heads are in flight.
    assert!(store.claim_due(fixed_now(), 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_claim_due_releases_next_sequence_after_outcome() {
    // Arrange
    let store = memory_store().await;
    store
        .save_subscription(&subscription("payment", &[EventKind::Created]))
        .await
        .unwrap();
    append_and_fan_out(
        &store,
        "payment",
        &[("O1", EventKind::Created), ("O1", EventKind::PaymentRequested)],
    )
    .await;
    let mut first = store.claim_due(fixed_now(), 10).await.unwrap().remove(0);

    // Act
    first.record_success(fixed_now());
    store.save_outcome(&first).await.unwrap();
    let claimed = store.claim_due(fixed_now(), 10).await.unwrap();

    // Assert
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].sequence, 2);
}

#[tokio::test]
async fn test_claim_due_holds_lane_while_head_waits_for_retry() {
    // Arrange
    let store = memory_store().await;
    store
        .save_subscription(&subscription("payment", &[EventKind::Created]))
        .await
        .unwrap();
    append_and_fan_out(
        &store,
        "payment",
        &[("O1", EventKind::Created), ("O1", EventKind::PaymentRequested)],
    )
    .await;
    let mut first = store.claim_due(fixed_now(), 10).await.unwrap().remove(0);
    let retry_at = fixed_now() + Duration::seconds(30);
    first.record_failure("boom", Some(retry_at), fixed_now());
    store.save_outcome(&first).await.unwrap();

    // Act
    let now_claims = store.claim_due(fixed_now(), 10).await.unwrap();
    let next_due = store.next_due_at().await.unwrap();
    let later_claims = store.claim_due(retry_at, 10).await.unwrap();

    // Assert
    assert!(now_claims.is_empty());
    assert_eq!(next_due, Some(retry_at));
    assert_eq!(later_claims.len(), 1);
    assert_eq!(later_claims[0].sequence, 1);
    assert_eq!(later_claims[0].attempts, 1);
}

#[tokio::test]
async fn test_claim_due_respects_limit() {
    let store = memory_store().await;
    store
        .save_subscription(&subscription("payment", &[EventKind::Created]))
        .await
        .unwrap();
    append_and_fan_out(
        &store,
        "payment",
        &[
            ("O1", EventKind::Created),
            ("O2", EventKind::Created),
            ("O3", EventKind::Created),
        ],
    )
    .await;

    let claimed = store.claim_due(fixed_now(), 2).await.unwrap();

    assert_eq!(claimed.len(), 2);
    assert_eq!(claimed[0].order_id, "O1");
    assert_eq!(claimed[1].order_id, "O2");
}

#[tokio::test]
async fn test_fan_out_to_unsubscribed_handler_dead_letters_the_record() {
    // Arrange: the handler was resolved, then unregistered before the commit.
    let store = memory_store().await;
    store
        .save_subscription(&subscription("payment", &[EventKind::Created]))
        .await
        .unwrap();
    store
        .delete_subscription("payment", fixed_now())
        .await
        .unwrap();

    // Act
    let entries = append_and_fan_out(&store, "payment", &[("O1", EventKind::Created)]).await;

    // Assert
    let records = store
        .deliveries_for_event(entries[0].event.event_id)
        .await
        .unwrap();
    assert_eq!(records[0].state, DeliveryState::DeadLettered);
    assert_eq!(records[0].last_error.as_deref(), Some("handler unregistered"));
    assert!(store.claim_due(fixed_now(), 10).await.unwrap().is_empty());
    assert_eq!(store.next_due_at().await.unwrap(), None);
    let dead = store.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].event_id, entries[0].event.event_id);
}

// --- recovery ---

#[tokio::test]
async fn test_requeue_in_flight_returns_claimed_records_to_pending() {
    // Arrange
    let store = memory_store().await;
    store
        .save_subscription(&subscription("payment", &[EventKind::Created]))
        .await
        .unwrap();
    let entries = append_and_fan_out(&store, "payment", &[("O1", EventKind::Created)]).await;
    store.claim_due(fixed_now(), 10).await.unwrap();

    // Act
    let requeued = store.requeue_in_flight(fixed_now()).await.unwrap();

    // Assert
    assert_eq!(requeued, 1);
    let records = store
        .deliveries_for_event(entries[0].event.event_id)
        .await
        .unwrap();
    assert_eq!(records[0].state, DeliveryState::Pending);
    assert_eq!(records[0].attempts, 0);
}

// --- subscriptions ---

#[tokio::test]
async fn test_save_subscription_replaces_existing_registration() {
    let store = memory_store().await;
    store
        .save_subscription(&subscription("payment", &[EventKind::Created]))
        .await
        .unwrap();

    let mut replacement = subscription("payment", &[EventKind::PaymentRequested]);
    replacement.delivery_policy.max_attempts = 9;
    store.save_subscription(&replacement).await.unwrap();

    let loaded = store.load_subscriptions().await.unwrap();
    assert_eq!(loaded, vec![replacement]);
}

#[tokio::test]
async fn test_delete_subscription_dead_letters_pending_records() {
    // Arrange
    let store = memory_store().await;
    store
        .save_subscription(&subscription("payment", &[EventKind::Created]))
        .await
        .unwrap();
    let entries = append_and_fan_out(
        &store,
        "payment",
        &[("O1", EventKind::Created), ("O2", EventKind::Created)],
    )
    .await;
    // O1 is in flight when the handler goes away; O2 is still pending.
    store.claim_due(fixed_now(), 1).await.unwrap();

    // Act
    let drained = store
        .delete_subscription("payment", fixed_now())
        .await
        .unwrap();

    // Assert
    assert_eq!(drained, Some(1));
    let o1 = store
        .deliveries_for_event(entries[0].event.event_id)
        .await
        .unwrap();
    let o2 = store
        .deliveries_for_event(entries[1].event.event_id)
        .await
        .unwrap();
    assert_eq!(o1[0].state, DeliveryState::InFlight);
    assert_eq!(o2[0].state, DeliveryState::DeadLettered);
    assert_eq!(o2[0].last_error.as_deref(), Some("handler unregistered"));
    assert!(store.load_subscriptions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_unknown_subscription_returns_none() {
    let store = memory_store().await;

    let drained = store
        .delete_subscription("nobody", fixed_now())
        .await
        .unwrap();

    assert_eq!(drained, None);
}

// --- dead letters ---

#[tokio::test]
async fn test_retry_dead_letters_resets_attempts() {
    // Arrange
    let store = memory_store().await;
    store
        .save_subscription(&subscription("payment", &[EventKind::Created]))
        .await
        .unwrap();
    let entries = append_and_fan_out(&store, "payment", &[("O1", EventKind::Created)]).await;
    let mut record = store.claim_due(fixed_now(), 1).await.unwrap().remove(0);
    record.attempts = 2;
    record.record_failure("still down", None, fixed_now());
    store.save_outcome(&record).await.unwrap();
    assert_eq!(store.dead_letters(10).await.unwrap().len(), 1);

    // Act
    let later = fixed_now() + Duration::minutes(5);
    let requeued = store
        .retry_dead_letters(entries[0].event.event_id, None, later)
        .await
        .unwrap();

    // Assert
    assert_eq!(requeued, 1);
    assert!(store.dead_letters(10).await.unwrap().is_empty());
    let claimed = store.claim_due(later, 1).await.unwrap();
    assert_eq!(claimed[0].attempts, 0);
    assert_eq!(claimed[0].next_attempt_at, later);
}

#[tokio::test]
async fn test_retry_dead_letters_filters_by_handler() {
    let store = memory_store().await;
    store
        .save_subscription(&subscription("payment", &[EventKind::Created]))
        .await
        .unwrap();
    let entries = append_and_fan_out(&store, "payment", &[("O1", EventKind::Created)]).await;
    let mut record = store.claim_due(fixed_now(), 1).await.unwrap().remove(0);
    record.record_failure("rejected", None, fixed_now());
    store.save_outcome(&record).await.unwrap();

    let other = store
        .retry_dead_letters(entries[0].event.event_id, Some("notification"), fixed_now())
        .await
        .unwrap();

    assert_eq!(other, 0);
    assert_eq!(store.dead_letters(10).await.unwrap().len(), 1);
}

// --- compaction ---

#[tokio::test]
async fn test_compact_keeps_events_with_unfinished_deliveries() {
    // Arrange
    let clock = Arc::new(ManualClock::new(fixed_now()));
    let store = SqliteStore::in_memory(clock.clone()).await.unwrap();
    store
        .save_subscription(&subscription("payment", &[EventKind::Created]))
        .await
        .unwrap();
    let entries = append_and_fan_out(
        &store,
        "payment",
        &[("O1", EventKind::Created), ("O2", EventKind::Created)],
    )
    .await;
    let mut done = store.claim_due(fixed_now(), 1).await.unwrap().remove(0);
    done.record_success(fixed_now());
    store.save_outcome(&done).await.unwrap();
    // Appended after the horizon; must survive regardless.
    clock.advance(Duration::hours(2));
    store
        .append(NewOrderEvent::new("O3", EventKind::Created, Vec::new()))
        .await
        .unwrap();

    // Act
    let removed = store
        .compact(fixed_now() + Duration::hours(1))
        .await
        .unwrap();

    // Assert
    assert_eq!(removed, 1);
    assert!(store.load_event(entries[0].event.event_id).await.unwrap().is_none());
    assert!(store.load_event(entries[1].event.event_id).await.unwrap().is_some());
    assert_eq!(store.read_from(EventCursor::START, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_compact_keeps_dead_lettered_events_for_retry() {
    // Arrange
    let clock = Arc::new(ManualClock::new(fixed_now()));
    let store = SqliteStore::in_memory(clock.clone()).await.unwrap();
    store
        .save_subscription(&subscription("payment", &[EventKind::Created]))
        .await
        .unwrap();
    let entries = append_and_fan_out(&store, "payment", &[("O1", EventKind::Created)]).await;
    let mut record = store.claim_due(fixed_now(), 1).await.unwrap().remove(0);
    record.record_failure("rejected", None, fixed_now());
    store.save_outcome(&record).await.unwrap();
    clock.advance(Duration::days(2));

    // Act
    let removed = store.compact(clock.now()).await.unwrap();

    // Assert
    assert_eq!(removed, 0);
    assert_eq!(store.dead_letters(10).await.unwrap().len(), 1);
    assert!(store.load_event(entries[0].event.event_id).await.unwrap().is_some());
    let requeued = store
        .retry_dead_letters(entries[0].event.event_id, None, clock.now())
        .await
        .unwrap();
    assert_eq!(requeued, 1);
}

#[tokio::test]
async fn test_sequences_continue_after_compaction() {
    let clock = Arc::new(ManualClock::new(fixed_now()));
    let store = SqliteStore::in_memory(clock.clone()).await.unwrap();
    store
        .save_subscription(&subscription("payment", &[EventKind::Created]))
        .await
        .unwrap();
    append_and_fan_out(&store, "payment", &[("O1", EventKind::Created)]).await;
    let mut done = store.claim_due(fixed_now(), 1).await.unwrap().remove(0);
    done.record_success(fixed_now());
    store.save_outcome(&done).await.unwrap();
    clock.advance(Duration::days(2));

    let removed = store.compact(clock.now()).await.unwrap();
    let next = store
        .append(NewOrderEvent::new("O1", EventKind::PaymentRequested, Vec::new()))
        .await
        .unwrap();

    assert_eq!(removed, 1);
    assert_eq!(next.sequence, 2);
}

// --- reader ---

#[tokio::test]
async fn test_event_reader_replays_then_stops_at_head() {
    // Arrange
    let store: Arc<dyn EventStore> = Arc::new(memory_store().await);
    for order_id in ["O1", "O2", "O3"] {
        store
            .append(NewOrderEvent::new(order_id, EventKind::Created, Vec::new()))
            .await
            .unwrap();
    }

    // Act
    let mut reader = EventReader::new(Arc::clone(&store), EventCursor::START).with_page_size(2);
    let mut orders = Vec::new();
    while let Some(entry) = reader.next().await.unwrap() {
        orders.push(entry.event.order_id);
    }

    // Assert
    assert_eq!(orders, vec!["O1", "O2", "O3"]);
    assert_eq!(reader.cursor(), EventCursor(3));

    // A reader restarted from an issued cursor resumes where it left off.
    let mut resumed = EventReader::new(Arc::clone(&store), EventCursor(2));
    assert_eq!(resumed.next().await.unwrap().unwrap().event.order_id, "O3");
}

#[tokio::test]
async fn test_event_reader_tails_live_appends() {
    // Arrange
    let store: Arc<dyn EventStore> = Arc::new(memory_store().await);
    let mut reader = EventReader::new(Arc::clone(&store), EventCursor::START);

    // Act
    let writer = Arc::clone(&store);
    let append = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        writer
            .append(NewOrderEvent::new("late", EventKind::Created, Vec::new()))
            .await
            .unwrap()
    });
    let entry = tokio::time::timeout(std::time::Duration::from_secs(5), reader.next_live())
        .await
        .expect("reader should wake on append")
        .unwrap();

    // Assert
    assert_eq!(entry.event.event_id, append.await.unwrap().event_id);
}

// --- durability ---

#[tokio::test]
async fn test_committed_state_survives_reopen() {
    // Arrange
    let path = std::env::temp_dir().join(format!("orderflow-{}.db", Uuid::new_v4()));
    let config = SqliteStoreConfig {
        database_url: format!("sqlite://{}", path.display()),
        ..SqliteStoreConfig::default()
    };
    let clock = Arc::new(FixedClock(fixed_now()));

    let store = SqliteStore::connect(&config, clock.clone()).await.unwrap();
    store
        .save_subscription(&subscription("payment", &[EventKind::Created]))
        .await
        .unwrap();
    let entries = append_and_fan_out(&store, "payment", &[("O1", EventKind::Created)]).await;
    store.claim_due(fixed_now(), 1).await.unwrap();
    store.close().await;

    // Act
    let reopened = SqliteStore::connect(&config, clock).await.unwrap();

    // Assert
    assert_eq!(reopened.head().await.unwrap(), EventCursor(1));
    assert_eq!(reopened.fan_out_cursor().await.unwrap(), EventCursor(1));
    assert_eq!(reopened.load_subscriptions().await.unwrap().len(), 1);
    let records = reopened
        .deliveries_for_event(entries[0].event.event_id)
        .await
        .unwrap();
    assert_eq!(records[0].state, DeliveryState::InFlight);
    let next = reopened
        .append(NewOrderEvent::new("O1", EventKind::PaymentRequested, Vec::new()))
        .await
        .unwrap();
    assert_eq!(next.sequence, 2);

    reopened.close().await;
    let _ = std::fs::remove_file(&path);
}
