//! Shared fixtures for the integration-style test modules.

use std::time::Duration;

use rust_decimal_macros::dec;
use sqlx::SqlitePool;
use tempfile::TempDir;

use crate::capacity;
use crate::db;
use crate::ledger;
use crate::types::{Batch, BatchStatus, BatchTerms, Money, ProductKind};

pub const ALICE: i64 = 1;
pub const BOB: i64 = 2;

/// A migrated database in a fresh temporary directory. The directory lives
/// as long as the returned guard.
pub async fn setup() -> (TempDir, SqlitePool) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settlement.db");
    let pool = db::init_pool(
        &format!("sqlite:{}", path.display()),
        8,
        Duration::from_secs(10),
    )
    .await
    .unwrap();
    (dir, pool)
}

/// Target 100 units at 50.00, ROI 10 %, mortality 5 %.
pub fn reference_terms() -> BatchTerms {
    BatchTerms {
        unit_price: Money::from_minor(5_000),
        target_units: 100,
        feed_price: Money::from_minor(1_200),
        mortality_rate: dec!(0.05),
        expected_roi: dec!(0.10),
    }
}

pub async fn open_batch(pool: &SqlitePool, kind: ProductKind) -> Batch {
    capacity::create_batch(pool, kind, &reference_terms())
        .await
        .unwrap()
}

/// Walk a batch forward until it reaches `target`.
pub async fn advance_to(pool: &SqlitePool, batch_id: i64, target: BatchStatus) -> Batch {
    let mut batch = capacity::get_batch(pool, batch_id).await.unwrap();
    for step in [BatchStatus::Active, BatchStatus::Harvested, BatchStatus::Closed] {
        if batch.status >= target {
            break;
        }
        batch = capacity::transition(pool, batch_id, step).await.unwrap();
    }
    batch
}

pub async fn fund(pool: &SqlitePool, owner_id: i64, minor: i64) {
    ledger::deposit(pool, owner_id, Money::from_minor(minor), None)
        .await
        .unwrap();
}

pub async fn balance(pool: &SqlitePool, owner_id: i64) -> Money {
    ledger::wallet(pool, owner_id).await.unwrap().balance
}
