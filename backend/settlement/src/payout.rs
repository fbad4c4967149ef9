//! Payout engine — computes (`simulate`) and commits (`execute`) returns for
//! every ACTIVE investment of a batch in one settlement cycle.
//!
//! ## Payout rule
//!
//! ```text
//! amount = units × unit_price × roi × (1 − mortality_rate)
//! ```
//!
//! `roi` is the batch's `expected_roi` unless the operator settles at a
//! realized rate via `roi_override`. The product is rounded to minor units
//! with banker's rounding.
//!
//! ## Idempotency
//!
//! A payout is keyed by `(investment_id, cycle_id)` with a unique index. The
//! insert, the wallet credit and the status change share one transaction, so
//! re-running `execute` for a cycle (sequentially or concurrently) only ever
//! pays investments that have not been paid for it yet.

use rust_decimal::Decimal;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::db;
use crate::errors::{EngineError, Result};
use crate::ledger;
use crate::types::{
    validate_cycle_id, Batch, Money, PayoutLine, PayoutPlan, PayoutSummary, TransactionKind,
};

/// The canonical payout rule for one investment.
pub fn payout_amount(
    units: i64,
    unit_price: Money,
    roi: Decimal,
    mortality_rate: Decimal,
) -> Result<Money> {
    let survival = Decimal::ONE
        .checked_sub(mortality_rate)
        .ok_or(EngineError::Overflow("survival rate"))?;
    let raw = Decimal::from(units)
        .checked_mul(unit_price.to_decimal())
        .and_then(|principal| principal.checked_mul(roi))
        .and_then(|gross| gross.checked_mul(survival))
        .ok_or(EngineError::Overflow("payout amount"))?;
    Money::from_decimal_rounded(raw)
}

fn effective_roi(batch: &Batch, roi_override: Option<Decimal>) -> Result<Decimal> {
    match roi_override {
        Some(roi) if roi < Decimal::ZERO => Err(EngineError::InvalidTerms(
            "roi_override must not be negative".into(),
        )),
        Some(roi) => Ok(roi),
        None => Ok(batch.expected_roi),
    }
}

/// Project the payouts for `cycle_id` without writing anything.
pub async fn simulate(
    pool: &SqlitePool,
    batch_id: i64,
    cycle_id: &str,
    roi_override: Option<Decimal>,
) -> Result<PayoutPlan> {
    validate_cycle_id(cycle_id)?;

    // Read-only transaction: all three reads see the same snapshot.
    let mut tx = pool.begin().await?;
    let batch = db::require_batch(&mut *tx, batch_id).await?;
    let roi = effective_roi(&batch, roi_override)?;
    let investments = db::active_investments(&mut *tx, batch_id).await?;
    let settled = db::settled_investments(&mut *tx, batch_id, cycle_id).await?;
    tx.rollback().await?;

    let mut per_investment = Vec::with_capacity(investments.len());
    let mut total = Money::ZERO;
    let mut pending_total = Money::ZERO;

    for inv in investments {
        let amount = payout_amount(inv.units, batch.unit_price, roi, batch.mortality_rate)?;
        let already_settled = settled.contains(&inv.id);
        total = total.checked_add(amount)?;
        if !already_settled {
            pending_total = pending_total.checked_add(amount)?;
        }
        per_investment.push(PayoutLine {
            investment_id: inv.id,
            owner_id: inv.owner_id,
            units: inv.units,
            amount,
            already_settled,
        });
    }

    debug!(
        batch_id,
        cycle_id,
        investments = per_investment.len(),
        total = %total,
        "Simulated payout"
    );

    Ok(PayoutPlan {
        batch_id,
        cycle_id: cycle_id.to_string(),
        roi,
        per_investment,
        total,
        pending_total,
    })
}

/// Commit the payouts for `cycle_id`, crediting owners' wallets.
///
/// Investments already paid for this cycle are skipped silently; the summary
/// only counts payouts created by this call.
pub async fn execute(
    pool: &SqlitePool,
    batch_id: i64,
    cycle_id: &str,
    roi_override: Option<Decimal>,
) -> Result<PayoutSummary> {
    validate_cycle_id(cycle_id)?;
    let now = db::now();

    let mut tx = pool.begin().await?;

    // First statement is a write: it takes the writer lock and serializes
    // concurrent executions of the same cycle.
    let run: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO settlement_runs (batch_id, cycle_id, runs, first_run_at, last_run_at)
        SELECT id, ?2, 1, ?3, ?3 FROM batches WHERE id = ?1
        ON CONFLICT (batch_id, cycle_id) DO UPDATE
            SET runs = runs + 1, last_run_at = excluded.last_run_at
        RETURNING runs
        "#,
    )
    .bind(batch_id)
    .bind(cycle_id)
    .bind(now)
    .fetch_optional(&mut *tx)
    .await?;
    let Some((runs,)) = run else {
        return Err(EngineError::BatchNotFound(batch_id));
    };

    let batch = db::require_batch(&mut *tx, batch_id).await?;
    if !batch.status.accepts_payouts() {
        warn!(batch_id, cycle_id, status = batch.status.as_str(), "Payout refused");
        return Err(EngineError::BatchNotHarvestable {
            batch_id,
            status: batch.status,
        });
    }
    let roi = effective_roi(&batch, roi_override)?;
    let one_off = !batch.product_kind.is_recurring();

    let investments = db::active_investments(&mut *tx, batch_id).await?;
    let mut count = 0u64;
    let mut total = Money::ZERO;

    for inv in investments {
        let amount = payout_amount(inv.units, batch.unit_price, roi, batch.mortality_rate)?;

        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO payouts (investment_id, batch_id, cycle_id, amount, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (investment_id, cycle_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(inv.id)
        .bind(batch_id)
        .bind(cycle_id)
        .bind(amount.minor())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((payout_id,)) = inserted else {
            debug!(investment_id = inv.id, cycle_id, "Already settled, skipping");
            continue;
        };

        if amount.is_positive() {
            let reference = format!("investment:{}", inv.id);
            ledger::post_entry(
                &mut *tx,
                inv.owner_id,
                TransactionKind::PayoutCredit,
                amount,
                Some(&reference),
                None,
            )
            .await?;
            ledger::apply_delta(&mut *tx, inv.owner_id, amount).await?;
        }

        if one_off {
            sqlx::query("UPDATE investments SET status = 'PAID' WHERE id = ?1 AND status = 'ACTIVE'")
                .bind(inv.id)
                .execute(&mut *tx)
                .await?;
        }

        debug!(payout_id, investment_id = inv.id, amount = %amount, "Payout recorded");
        count += 1;
        total = total.checked_add(amount)?;
    }

    sqlx::query(
        r#"
        UPDATE settlement_runs
        SET    payouts_created = payouts_created + ?3, total_paid = total_paid + ?4
        WHERE  batch_id = ?1 AND cycle_id = ?2
        "#,
    )
    .bind(batch_id)
    .bind(cycle_id)
    .bind(count as i64)
    .bind(total.minor())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    info!(
        batch_id,
        cycle_id,
        run = runs,
        count,
        total = %total,
        "Payout executed"
    );
    Ok(PayoutSummary { count, total })
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
