use crate::errors::EngineError;
use crate::ledger;
use crate::test_support::{balance, fund, setup, ALICE, BOB};
use crate::types::{Money, TransactionKind};

#[tokio::test]
async fn test_unknown_owner_has_empty_wallet() {
    let (_dir, pool) = setup().await;
    let wallet = ledger::wallet(&pool, ALICE).await.unwrap();
    assert_eq!(wallet.owner_id, ALICE);
    assert_eq!(wallet.balance, Money::ZERO);
    assert!(ledger::transactions(&pool, ALICE).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deposit_then_withdraw() {
    let (_dir, pool) = setup().await;

    let dep = ledger::deposit(&pool, ALICE, Money::from_minor(10_000), None)
        .await
        .unwrap();
    assert_eq!(dep.kind, TransactionKind::Deposit);
    assert_eq!(dep.amount, Money::from_minor(10_000));

    let wd = ledger::withdraw(&pool, ALICE, Money::from_minor(2_550), None)
        .await
        .unwrap();
    assert_eq!(wd.kind, TransactionKind::Withdrawal);
    assert_eq!(wd.amount, Money::from_minor(-2_550));

    assert_eq!(balance(&pool, ALICE).await, Money::from_minor(7_450));
    assert_eq!(balance(&pool, BOB).await, Money::ZERO);
}

#[tokio::test]
async fn test_withdraw_above_balance_leaves_wallet_untouched() {
    let (_dir, pool) = setup().await;
    fund(&pool, ALICE, 5_000).await;

    let err = ledger::withdraw(&pool, ALICE, Money::from_minor(5_001), None)
        .await
        .unwrap_err();
    match err {
        EngineError::InsufficientBalance {
            available,
            required,
        } => {
            assert_eq!(available, Money::from_minor(5_000));
            assert_eq!(required, Money::from_minor(5_001));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(balance(&pool, ALICE).await, Money::from_minor(5_000));
    assert_eq!(ledger::transactions(&pool, ALICE).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_withdraw_without_wallet_is_insufficient() {
    let (_dir, pool) = setup().await;
    let err = ledger::withdraw(&pool, BOB, Money::from_minor(1), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientBalance { .. }));
}

#[tokio::test]
async fn test_non_positive_amounts_are_rejected() {
    let (_dir, pool) = setup().await;
    for minor in [0, -100] {
        let err = ledger::deposit(&pool, ALICE, Money::from_minor(minor), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidAmount(_)));
    }
    let err = ledger::withdraw(&pool, ALICE, Money::ZERO, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidAmount(_)));
}

#[tokio::test]
async fn test_idempotent_deposit_replays_original_entry() {
    let (_dir, pool) = setup().await;

    let first = ledger::deposit(&pool, ALICE, Money::from_minor(2_000), Some("dep-1"))
        .await
        .unwrap();
    let replay = ledger::deposit(&pool, ALICE, Money::from_minor(2_000), Some("dep-1"))
        .await
        .unwrap();

    assert_eq!(first, replay);
    assert_eq!(balance(&pool, ALICE).await, Money::from_minor(2_000));
    assert_eq!(ledger::transactions(&pool, ALICE).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_idempotency_key_reuse_with_other_amount_conflicts() {
    let (_dir, pool) = setup().await;
    fund(&pool, ALICE, 10_000).await;

    ledger::withdraw(&pool, ALICE, Money::from_minor(1_000), Some("wd-7"))
        .await
        .unwrap();
    let err = ledger::withdraw(&pool, ALICE, Money::from_minor(1_500), Some("wd-7"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::IdempotencyConflict(_)));

    // Same key, different kind.
    let err = ledger::deposit(&pool, ALICE, Money::from_minor(1_000), Some("wd-7"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::IdempotencyConflict(_)));

    assert_eq!(balance(&pool, ALICE).await, Money::from_minor(9_000));
}

#[tokio::test]
async fn test_idempotency_keys_are_scoped_per_owner() {
    let (_dir, pool) = setup().await;
    ledger::deposit(&pool, ALICE, Money::from_minor(100), Some("k"))
        .await
        .unwrap();
    ledger::deposit(&pool, BOB, Money::from_minor(300), Some("k"))
        .await
        .unwrap();
    assert_eq!(balance(&pool, ALICE).await, Money::from_minor(100));
    assert_eq!(balance(&pool, BOB).await, Money::from_minor(300));
}

#[tokio::test]
async fn test_balance_equals_ledger_sum() {
    let (_dir, pool) = setup().await;
    fund(&pool, ALICE, 12_345).await;
    ledger::withdraw(&pool, ALICE, Money::from_minor(345), None)
        .await
        .unwrap();
    fund(&pool, ALICE, 1).await;

    let sum = ledger::transactions(&pool, ALICE)
        .await
        .unwrap()
        .iter()
        .fold(Money::ZERO, |acc, t| acc.checked_add(t.amount).unwrap());
    assert_eq!(sum, balance(&pool, ALICE).await);
    assert_eq!(sum, Money::from_minor(12_001));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_withdrawals_never_overdraw() {
    let (_dir, pool) = setup().await;
    fund(&pool, ALICE, 1_000).await;

    // Ten withdrawals of 3.00 against a balance of 10.00: exactly three fit.
    let mut handles = Vec::new();
    for _ in 0..10 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            ledger::withdraw(&pool, ALICE, Money::from_minor(300), None).await
        }));
    }

    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::InsufficientBalance { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(ok, 3);
    assert_eq!(balance(&pool, ALICE).await, Money::from_minor(100));
}
