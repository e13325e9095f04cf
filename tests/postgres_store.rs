use chrono::{Duration, Utc};
use sqlx::PgPool;

use points_backend::error::LedgerError;
use points_backend::models::{EntryKind, NewEntry, OrderStatus};
use points_backend::store::{
    LedgerStore, OpScope, PgStore, Reservation, SettlementOutcome, SettlementRequest,
};

// key: pg-tests -> row-locks,unique-keys,settlement

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn apply_entry_enforces_floor_and_key_uniqueness(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgStore::new(pool);

    let entry = store
        .apply_entry(&NewEntry {
            user_id: "alice".to_string(),
            kind: EntryKind::Grant,
            amount: 10,
            idempotency_key: "g1".to_string(),
            ref_id: None,
        })
        .await
        .unwrap();
    assert_eq!(entry.balance_after, 10);

    let err = store
        .apply_entry(&NewEntry {
            user_id: "alice".to_string(),
            kind: EntryKind::Grant,
            amount: 10,
            idempotency_key: "g1".to_string(),
            ref_id: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::IdempotencyConflict { .. }));

    let err = store
        .apply_entry(&NewEntry {
            user_id: "alice".to_string(),
            kind: EntryKind::AdminAdjust,
            amount: -11,
            idempotency_key: "a1".to_string(),
            ref_id: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientCredits { .. }));
    assert_eq!(store.balance("alice").await.unwrap(), 10);
    assert_eq!(store.rebuild_balance("alice").await.unwrap(), 10);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn hold_lifecycle_round_trip(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgStore::new(pool);

    store
        .apply_entry(&NewEntry {
            user_id: "alice".to_string(),
            kind: EntryKind::Grant,
            amount: 10,
            idempotency_key: "g1".to_string(),
            ref_id: None,
        })
        .await
        .unwrap();

    let now = Utc::now();
    let hold = store
        .insert_hold("alice", "summarize", 6, now, now + Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(store.active_hold_total("alice").await.unwrap(), 6);

    let err = store
        .insert_hold("alice", "translate", 5, now, now + Duration::seconds(60))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientCredits { .. }));

    let (consumed, entry) = store.consume_hold(hold.id, 4, "req-1", now).await.unwrap();
    assert_eq!(entry.balance_after, 6);
    assert_eq!(store.active_hold_total("alice").await.unwrap(), 0);

    // Replay under the same key returns the original debit.
    let (_, replayed) = store.consume_hold(consumed.id, 4, "req-1", now).await.unwrap();
    assert_eq!(replayed.id, entry.id);
    assert_eq!(store.balance("alice").await.unwrap(), 6);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn settlement_is_exactly_once(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgStore::new(pool);

    let pack = store.pack("standard").await.unwrap().unwrap();
    let order = points_backend::models::Order {
        id: uuid::Uuid::new_v4(),
        user_id: "alice".to_string(),
        pack_id: pack.id.clone(),
        amount: pack.price_cents,
        currency: pack.currency.clone(),
        status: OrderStatus::Pending,
        provider_order_ref: "ord_test".to_string(),
        created_at: Utc::now(),
        paid_at: None,
    };
    store.insert_order(&order).await.unwrap();

    let request = SettlementRequest {
        provider_txn_id: "txn-1".to_string(),
        order_ref: "ord_test".to_string(),
        success: true,
        amount: order.amount,
        currency: order.currency.clone(),
    };
    let first = store.settle_order(&request, Utc::now()).await.unwrap();
    assert!(!first.replayed);
    assert!(matches!(
        first.outcome,
        SettlementOutcome::Applied {
            credited_points: 1000,
            ..
        }
    ));

    let second = store.settle_order(&request, Utc::now()).await.unwrap();
    assert!(second.replayed);
    assert_eq!(store.balance("alice").await.unwrap(), 1000);

    let stored = store.order_by_ref("ord_test").await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Paid);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn free_quota_counter_caps_out(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgStore::new(pool);

    assert!(store
        .try_consume_free("alice", "summarize", "2025-03", 2)
        .await
        .unwrap());
    assert!(store
        .try_consume_free("alice", "summarize", "2025-03", 2)
        .await
        .unwrap());
    assert!(!store
        .try_consume_free("alice", "summarize", "2025-03", 2)
        .await
        .unwrap());

    let usage = store
        .quota_usage("alice", "summarize", "2025-03")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(usage.used_count, 2);

    assert_eq!(store.refresh_free_caps("alice", "2025-03", 5).await.unwrap(), 1);
    assert!(store
        .try_consume_free("alice", "summarize", "2025-03", 2)
        .await
        .unwrap());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn refused_free_charge_still_creates_quota_row(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgStore::new(pool);

    assert!(!store
        .try_consume_free("alice", "summarize", "2025-03", 0)
        .await
        .unwrap());

    // The default-cap row survives the refusal, as with the in-memory store.
    let usage = store
        .quota_usage("alice", "summarize", "2025-03")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(usage.used_count, 0);
    assert_eq!(usage.free_cap, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn charge_free_records_outcome_with_the_unit(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgStore::new(pool);

    let outcome = serde_json::json!({"charged": true, "source": "free_quota"});
    assert!(store
        .charge_free(
            OpScope::Charge,
            "alice:summarize:r1",
            "alice",
            "summarize",
            "2025-03",
            2,
            outcome.clone(),
            Utc::now(),
        )
        .await
        .unwrap());

    // The done record committed with the unit, so a retry replays.
    match store
        .begin_operation(
            OpScope::Charge,
            "alice:summarize:r1",
            Utc::now(),
            Duration::seconds(60),
        )
        .await
        .unwrap()
    {
        Reservation::Replay(value) => assert_eq!(value, outcome),
        other => panic!("expected replay, got {other:?}"),
    }
    let usage = store
        .quota_usage("alice", "summarize", "2025-03")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(usage.used_count, 1);
}
