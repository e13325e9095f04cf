use std::sync::Arc;

use chrono::Duration;

use points_backend::error::LedgerError;
use points_backend::ledger::holds::AuthorizationHoldManager;
use points_backend::ledger::wallet::WalletStore;
use points_backend::models::{EntryKind, HoldStatus, NewEntry};
use points_backend::store::retry::RetryPolicy;
use points_backend::store::{LedgerStore, MemoryStore};

// key: ledger-tests -> authorize,consume,release,expiry

fn setup() -> (Arc<dyn LedgerStore>, WalletStore, AuthorizationHoldManager) {
    let store: Arc<dyn LedgerStore> = Arc::new(MemoryStore::new());
    let retry = RetryPolicy::default();
    let wallet = WalletStore::new(store.clone(), retry);
    let holds = AuthorizationHoldManager::new(store.clone(), retry);
    (store, wallet, holds)
}

async fn grant(wallet: &WalletStore, user_id: &str, amount: i64, key: &str) {
    wallet
        .apply_entry(&NewEntry {
            user_id: user_id.to_string(),
            kind: EntryKind::Grant,
            amount,
            idempotency_key: key.to_string(),
            ref_id: None,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn holds_reserve_against_available_not_balance() {
    let (_, wallet, holds) = setup();
    grant(&wallet, "alice", 10, "g1").await;

    let h1 = holds
        .authorize("alice", "summarize", 5, Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(h1.status, HoldStatus::Active);

    // 5 of 10 are reserved, so a second hold for 6 must fail even though the
    // wallet balance alone would cover it.
    let err = holds
        .authorize("alice", "translate", 6, Duration::seconds(60))
        .await
        .unwrap_err();
    match err {
        LedgerError::InsufficientCredits {
            required,
            available,
        } => {
            assert_eq!(required, 6);
            assert_eq!(available, 5);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn consume_debits_actual_amount_and_replays_idempotently() {
    let (_, wallet, holds) = setup();
    grant(&wallet, "alice", 10, "g1").await;

    let hold = holds
        .authorize("alice", "summarize", 5, Duration::seconds(60))
        .await
        .unwrap();
    let (consumed, entry) = holds.consume(hold.id, 3, "req-1").await.unwrap();
    assert_eq!(consumed.status, HoldStatus::Consumed);
    assert_eq!(entry.amount, -3);
    assert_eq!(entry.balance_after, 7);
    assert_eq!(wallet.balance("alice").await.unwrap(), 7);

    // Same key: the original entry comes back, no second debit.
    let (_, replayed) = holds.consume(hold.id, 3, "req-1").await.unwrap();
    assert_eq!(replayed.id, entry.id);
    assert_eq!(wallet.balance("alice").await.unwrap(), 7);
}

#[tokio::test]
async fn consume_above_authorized_is_rejected() {
    let (_, wallet, holds) = setup();
    grant(&wallet, "alice", 10, "g1").await;

    let hold = holds
        .authorize("alice", "summarize", 5, Duration::seconds(60))
        .await
        .unwrap();
    let err = holds.consume(hold.id, 6, "req-1").await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidConsumption { .. }));
    // The hold is untouched and can still settle.
    let (_, entry) = holds.consume(hold.id, 5, "req-2").await.unwrap();
    assert_eq!(entry.balance_after, 5);
}

#[tokio::test]
async fn balance_always_equals_ledger_sum() {
    let (_, wallet, holds) = setup();
    grant(&wallet, "alice", 100, "g1").await;

    let hold = holds
        .authorize("alice", "summarize", 40, Duration::seconds(60))
        .await
        .unwrap();
    holds.consume(hold.id, 25, "req-1").await.unwrap();
    grant(&wallet, "alice", 7, "g2").await;

    let entries = wallet.entries("alice").await.unwrap();
    let sum: i64 = entries.iter().map(|entry| entry.amount).sum();
    assert_eq!(wallet.balance("alice").await.unwrap(), sum);
    assert_eq!(wallet.rebuild_balance("alice").await.unwrap(), sum);
}

#[tokio::test]
async fn concurrent_authorizations_never_over_reserve() {
    let (store, wallet, holds) = setup();
    grant(&wallet, "alice", 10, "g1").await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let holds = holds.clone();
        tasks.push(tokio::spawn(async move {
            holds
                .authorize("alice", "summarize", 3, Duration::seconds(60))
                .await
        }));
    }
    let mut granted = 0;
    for task in tasks {
        if task.await.unwrap().is_ok() {
            granted += 1;
        }
    }
    // floor(10 / 3) concurrent holds can succeed, never more.
    assert!(granted <= 3, "granted {granted} holds over a balance of 10");
    assert!(store.active_hold_total("alice").await.unwrap() <= 10);
}

#[tokio::test]
async fn expired_hold_cannot_be_consumed_and_frees_reservation() {
    let (_, wallet, holds) = setup();
    grant(&wallet, "alice", 10, "g1").await;

    let hold = holds
        .authorize("alice", "summarize", 10, Duration::milliseconds(50))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;

    let err = holds.consume(hold.id, 10, "req-1").await.unwrap_err();
    assert!(matches!(err, LedgerError::HoldExpired(_)));
    assert_eq!(wallet.balance("alice").await.unwrap(), 10);

    // The expired hold no longer counts against availability.
    holds
        .authorize("alice", "summarize", 10, Duration::seconds(60))
        .await
        .unwrap();
}

#[tokio::test]
async fn released_hold_frees_reservation_and_rejects_consume() {
    let (_, wallet, holds) = setup();
    grant(&wallet, "alice", 10, "g1").await;

    let hold = holds
        .authorize("alice", "summarize", 10, Duration::seconds(60))
        .await
        .unwrap();
    let released = holds.release(hold.id).await.unwrap();
    assert_eq!(released.status, HoldStatus::Released);

    let err = holds.consume(hold.id, 1, "req-1").await.unwrap_err();
    assert!(matches!(err, LedgerError::HoldReleased(_)));

    holds
        .authorize("alice", "summarize", 10, Duration::seconds(60))
        .await
        .unwrap();
}

#[tokio::test]
async fn debit_below_zero_is_rejected() {
    let (_, wallet, _) = setup();
    grant(&wallet, "alice", 5, "g1").await;

    let err = wallet
        .apply_entry(&NewEntry {
            user_id: "alice".to_string(),
            kind: EntryKind::AdminAdjust,
            amount: -6,
            idempotency_key: "adj-1".to_string(),
            ref_id: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientCredits { .. }));
    assert_eq!(wallet.balance("alice").await.unwrap(), 5);
}

#[tokio::test]
async fn reused_idempotency_key_carries_prior_entry() {
    let (_, wallet, _) = setup();
    grant(&wallet, "alice", 5, "g1").await;

    let err = wallet
        .apply_entry(&NewEntry {
            user_id: "alice".to_string(),
            kind: EntryKind::Grant,
            amount: 5,
            idempotency_key: "g1".to_string(),
            ref_id: None,
        })
        .await
        .unwrap_err();
    match err {
        LedgerError::IdempotencyConflict { prior, .. } => {
            let prior = prior.expect("prior entry");
            assert_eq!(prior.amount, 5);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(wallet.balance("alice").await.unwrap(), 5);
}
