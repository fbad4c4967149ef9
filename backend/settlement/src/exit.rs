//! Early-exit requests — an investor's recorded intent to sell units before
//! the batch completes.
//!
//! Recording a request moves no funds and releases no capacity; matching a
//! buyer and completing the exit happens outside this service.

use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::db::{self, ExitRow, EXIT_COLUMNS};
use crate::errors::{EngineError, Result};
use crate::types::{EarlyExitRequest, InvestmentStatus};

/// Record a PENDING request to sell `units` of an investment.
///
/// Several requests may be pending at once as long as together they do not
/// pledge more units than the investment holds. The holding check and the
/// insert are one statement, so concurrent requests cannot over-pledge.
pub async fn request_exit(
    pool: &SqlitePool,
    owner_id: i64,
    investment_id: i64,
    units: i64,
) -> Result<EarlyExitRequest> {
    if units <= 0 {
        return Err(EngineError::InvalidUnits(units));
    }
    let now = db::now();

    let sql = format!(
        r#"
        INSERT INTO exit_requests (investment_id, owner_id, units, status, created_at, updated_at)
        SELECT i.id, i.owner_id, ?3, 'PENDING', ?4, ?4
        FROM   investments i
        WHERE  i.id = ?1
          AND  i.owner_id = ?2
          AND  i.status = 'ACTIVE'
          AND  ?3 + (SELECT COALESCE(SUM(e.units), 0)
                     FROM   exit_requests e
                     WHERE  e.investment_id = i.id AND e.status = 'PENDING') <= i.units
        RETURNING {EXIT_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, ExitRow>(&sql)
        .bind(investment_id)
        .bind(owner_id)
        .bind(units)
        .bind(now)
        .fetch_optional(pool)
        .await?;

    if let Some(row) = row {
        let request = EarlyExitRequest::try_from(row)?;
        info!(
            request_id = request.id,
            investment_id,
            owner_id,
            units,
            "Early exit requested"
        );
        return Ok(request);
    }

    // Nothing inserted: report which precondition failed.
    let err = match db::fetch_investment(pool, investment_id).await? {
        Some(inv) if inv.owner_id == owner_id => {
            if inv.status != InvestmentStatus::Active {
                EngineError::InvestmentNotActive(investment_id)
            } else {
                let pledged = db::pending_exit_units(pool, investment_id).await?;
                EngineError::UnitsExceedHolding {
                    investment_id,
                    requested: units,
                    available: inv.units - pledged,
                }
            }
        }
        _ => EngineError::InvestmentNotFound(investment_id),
    };
    warn!(investment_id, owner_id, units, "Early exit rejected: {err}");
    Err(err)
}

/// Withdraw a PENDING request, freeing its units for new requests.
pub async fn cancel_exit(
    pool: &SqlitePool,
    owner_id: i64,
    request_id: i64,
) -> Result<EarlyExitRequest> {
    let sql = format!(
        r#"
        UPDATE exit_requests
        SET    status = 'CANCELLED', updated_at = ?3
        WHERE  id = ?1 AND owner_id = ?2 AND status = 'PENDING'
        RETURNING {EXIT_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, ExitRow>(&sql)
        .bind(request_id)
        .bind(owner_id)
        .bind(db::now())
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => {
            let request = EarlyExitRequest::try_from(row)?;
            info!(request_id, owner_id, "Early exit cancelled");
            Ok(request)
        }
        None => match db::fetch_exit(pool, request_id).await? {
            Some(req) if req.owner_id == owner_id => Err(EngineError::ExitNotPending(request_id)),
            _ => Err(EngineError::ExitNotFound(request_id)),
        },
    }
}

/// An owner's exit requests, newest first.
pub async fn list_exits(pool: &SqlitePool, owner_id: i64) -> Result<Vec<EarlyExitRequest>> {
    db::exits_for_owner(pool, owner_id).await
}
