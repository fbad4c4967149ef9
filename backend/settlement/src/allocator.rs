//! Investment allocator — turns a purchase request into an Investment, a
//! capacity reservation and a wallet debit, or into nothing at all.

use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::capacity;
use crate::db::{self, InvestmentRow, INVESTMENT_COLUMNS};
use crate::errors::{EngineError, Result};
use crate::ledger;
use crate::types::{Investment, Payout, TransactionKind};

/// Buy `units` of `batch_id` for `owner_id`.
///
/// Capacity and ledger share one SQLite database, so the reserve → record →
/// debit sequence runs in a single transaction. The reservation is the first
/// statement, which takes the writer lock before anything is read.
pub async fn invest(
    pool: &SqlitePool,
    owner_id: i64,
    batch_id: i64,
    units: i64,
) -> Result<Investment> {
    if units <= 0 {
        return Err(EngineError::InvalidUnits(units));
    }

    let mut tx = pool.begin().await?;

    let reservation = match capacity::reserve(&mut *tx, batch_id, units).await {
        Ok(token) => token,
        Err(e) => {
            warn!(owner_id, batch_id, units, "Investment rejected: {e}");
            return Err(e);
        }
    };
    let amount = reservation.unit_price.checked_times(units)?;

    let sql = format!(
        r#"
        INSERT INTO investments (owner_id, batch_id, units, amount, status, created_at)
        VALUES (?1, ?2, ?3, ?4, 'ACTIVE', ?5)
        RETURNING {INVESTMENT_COLUMNS}
        "#
    );
    let investment = Investment::try_from(
        sqlx::query_as::<_, InvestmentRow>(&sql)
            .bind(owner_id)
            .bind(batch_id)
            .bind(units)
            .bind(amount.minor())
            .bind(db::now())
            .fetch_one(&mut *tx)
            .await?,
    )?;

    let reference = format!("investment:{}", investment.id);
    let debit = ledger::post_entry(
        &mut *tx,
        owner_id,
        TransactionKind::InvestmentDebit,
        amount,
        Some(&reference),
        None,
    )
    .await?
    .ok_or_else(|| EngineError::Corrupt("unkeyed ledger entry was not inserted".into()))?;

    if let Err(e) = ledger::apply_delta(&mut *tx, owner_id, debit.amount).await {
        warn!(owner_id, batch_id, units, amount = %amount, "Investment rejected: {e}");
        capacity::release(&mut *tx, reservation).await?;
        tx.rollback().await?;
        return Err(e);
    }

    tx.commit().await?;

    info!(
        investment_id = investment.id,
        owner_id,
        batch_id,
        units,
        amount = %amount,
        "Investment placed"
    );
    Ok(investment)
}

/// An owner's investments, newest first.
pub async fn list_investments(pool: &SqlitePool, owner_id: i64) -> Result<Vec<Investment>> {
    db::investments_for_owner(pool, owner_id).await
}

/// Payouts received by one of the owner's investments. Investments that
/// belong to someone else are reported as not found.
pub async fn investment_payouts(
    pool: &SqlitePool,
    owner_id: i64,
    investment_id: i64,
) -> Result<Vec<Payout>> {
    match db::fetch_investment(pool, investment_id).await? {
        Some(inv) if inv.owner_id == owner_id => db::payouts_for_investment(pool, investment_id).await,
        _ => Err(EngineError::InvestmentNotFound(investment_id)),
    }
}
