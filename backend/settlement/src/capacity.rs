//! Batch capacity manager — the single source of truth for how many units of
//! a batch remain investable.
//!
//! `units_placed` is only changed by [`reserve`] and [`release`]. Both are
//! single conditional UPDATEs: the capacity check and the increment happen in
//! one statement under SQLite's writer lock, so concurrent reservations are
//! linearizable and can never oversell a batch.

use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::db::{self, BatchRow, BATCH_COLUMNS};
use crate::errors::{EngineError, Result};
use crate::types::{Batch, BatchStatus, BatchTerms, Money, Overview, ProductKind};

/// Proof that `units` of `batch_id` are held for the current transaction.
///
/// Carries the price snapshot the reservation was made at so the allocator
/// charges exactly what was checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a reservation must be turned into an investment or released"]
pub struct ReservationToken {
    pub batch_id: i64,
    pub units: i64,
    pub unit_price: Money,
}

// ─────────────────────────────────────────────────────────
// Batch lifecycle
// ─────────────────────────────────────────────────────────

/// Register a new batch in status OPEN.
pub async fn create_batch(pool: &SqlitePool, kind: ProductKind, terms: &BatchTerms) -> Result<Batch> {
    terms.validate()?;
    let now = db::now();

    let sql = format!(
        r#"
        INSERT INTO batches
            (product_kind, unit_price, target_units, units_placed, feed_price,
             mortality_rate, expected_roi, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, 'OPEN', ?7, ?7)
        RETURNING {BATCH_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, BatchRow>(&sql)
        .bind(kind.as_str())
        .bind(terms.unit_price.minor())
        .bind(terms.target_units)
        .bind(terms.feed_price.minor())
        .bind(terms.mortality_rate.to_string())
        .bind(terms.expected_roi.to_string())
        .bind(now)
        .fetch_one(pool)
        .await?;
    let batch = Batch::try_from(row)?;

    info!(
        batch_id = batch.id,
        kind = kind.as_str(),
        target_units = batch.target_units,
        unit_price = %batch.unit_price,
        "Batch created"
    );
    Ok(batch)
}

/// Amend the economic terms of a batch nobody has invested in yet.
///
/// Once a unit is placed the terms are part of every investor's contract
/// and are rejected with `TermsLocked`.
pub async fn update_terms(pool: &SqlitePool, batch_id: i64, terms: &BatchTerms) -> Result<Batch> {
    terms.validate()?;

    let sql = format!(
        r#"
        UPDATE batches
        SET    unit_price = ?2, target_units = ?3, feed_price = ?4,
               mortality_rate = ?5, expected_roi = ?6, updated_at = ?7
        WHERE  id = ?1 AND status = 'OPEN' AND units_placed = 0
        RETURNING {BATCH_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, BatchRow>(&sql)
        .bind(batch_id)
        .bind(terms.unit_price.minor())
        .bind(terms.target_units)
        .bind(terms.feed_price.minor())
        .bind(terms.mortality_rate.to_string())
        .bind(terms.expected_roi.to_string())
        .bind(db::now())
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => {
            let batch = Batch::try_from(row)?;
            info!(batch_id, "Batch terms updated");
            Ok(batch)
        }
        None => {
            db::require_batch(pool, batch_id).await?;
            Err(EngineError::TermsLocked(batch_id))
        }
    }
}

/// Move a batch one step forward along OPEN → ACTIVE → HARVESTED → CLOSED.
///
/// Applied as a compare-and-set on the predecessor status, so two operators
/// racing on the same batch cannot both succeed.
pub async fn transition(pool: &SqlitePool, batch_id: i64, to: BatchStatus) -> Result<Batch> {
    let Some(from) = to.predecessor() else {
        let current = db::require_batch(pool, batch_id).await?;
        return Err(EngineError::InvalidTransition {
            batch_id,
            from: current.status,
            to,
        });
    };

    let sql = format!(
        r#"
        UPDATE batches
        SET    status = ?2, updated_at = ?4
        WHERE  id = ?1 AND status = ?3
        RETURNING {BATCH_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, BatchRow>(&sql)
        .bind(batch_id)
        .bind(to.as_str())
        .bind(from.as_str())
        .bind(db::now())
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => {
            let batch = Batch::try_from(row)?;
            info!(batch_id, from = from.as_str(), to = to.as_str(), "Batch transitioned");
            Ok(batch)
        }
        None => {
            let current = db::require_batch(pool, batch_id).await?;
            warn!(
                batch_id,
                current = current.status.as_str(),
                requested = to.as_str(),
                "Rejected batch transition"
            );
            Err(EngineError::InvalidTransition {
                batch_id,
                from: current.status,
                to,
            })
        }
    }
}

pub async fn get_batch(pool: &SqlitePool, batch_id: i64) -> Result<Batch> {
    db::require_batch(pool, batch_id).await
}

pub async fn list_batches(pool: &SqlitePool) -> Result<Vec<Batch>> {
    db::list_batches(pool).await
}

/// The public product listing: batches still accepting investment.
pub async fn list_open_batches(pool: &SqlitePool) -> Result<Vec<Batch>> {
    db::list_open_batches(pool).await
}

pub async fn overview(pool: &SqlitePool) -> Result<Overview> {
    db::overview(pool).await
}

// ─────────────────────────────────────────────────────────
// Capacity
// ─────────────────────────────────────────────────────────

/// Atomically check `units_placed + units <= target_units` on an OPEN batch
/// and claim the units.
///
/// Runs on the caller's connection so the claim commits or rolls back with
/// the rest of the caller's transaction.
pub async fn reserve(
    conn: &mut SqliteConnection,
    batch_id: i64,
    units: i64,
) -> Result<ReservationToken> {
    if units <= 0 {
        return Err(EngineError::InvalidUnits(units));
    }

    let claimed: Option<(i64, i64)> = sqlx::query_as(
        r#"
        UPDATE batches
        SET    units_placed = units_placed + ?2, updated_at = ?3
        WHERE  id = ?1
          AND  status = 'OPEN'
          AND  units_placed + ?2 <= target_units
        RETURNING unit_price, units_placed
        "#,
    )
    .bind(batch_id)
    .bind(units)
    .bind(db::now())
    .fetch_optional(&mut *conn)
    .await?;

    if let Some((unit_price, units_placed)) = claimed {
        debug!(batch_id, units, units_placed, "Capacity reserved");
        return Ok(ReservationToken {
            batch_id,
            units,
            unit_price: Money::from_minor(unit_price),
        });
    }

    // Nothing matched: work out which precondition failed.
    let batch = db::require_batch(&mut *conn, batch_id).await?;
    if batch.status != BatchStatus::Open {
        return Err(EngineError::BatchNotOpen {
            batch_id,
            status: batch.status,
        });
    }
    Err(EngineError::CapacityExceeded {
        batch_id,
        requested: units,
        available: batch.units_available(),
    })
}

/// Return reserved units to the batch.
pub async fn release(conn: &mut SqliteConnection, token: ReservationToken) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE batches
        SET    units_placed = units_placed - ?2, updated_at = ?3
        WHERE  id = ?1 AND units_placed >= ?2
        "#,
    )
    .bind(token.batch_id)
    .bind(token.units)
    .bind(db::now())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::CapacityUnderflow {
            batch_id: token.batch_id,
            units: token.units,
        });
    }
    debug!(batch_id = token.batch_id, units = token.units, "Capacity released");
    Ok(())
}
