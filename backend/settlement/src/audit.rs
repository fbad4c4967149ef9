//! Background reconciliation of the engine's invariants.
//!
//! Every check is a read-only query over one snapshot. The engine never
//! relies on these checks for correctness; they exist to surface drift
//! caused by manual database edits or bugs.
//!
//! | Invariant            | Meaning                                                    |
//! |----------------------|------------------------------------------------------------|
//! | `capacity_bounds`    | `0 <= units_placed <= target_units`                        |
//! | `capacity_placement` | `units_placed == Σ units of non-EXITED investments`        |
//! | `wallet_ledger`      | `wallet.balance == Σ transactions.amount` per owner        |
//! | `wallet_non_negative`| `wallet.balance >= 0`                                      |
//! | `exit_pledges`       | pending exit units never exceed the investment's units     |
//! | `payout_unique`      | at most one payout per `(investment, cycle)`               |
//! | `payout_credited`    | one PAYOUT_CREDIT per positive payout of an investment     |

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::db;
use crate::errors::Result;

pub struct AuditState {
    pub pool: SqlitePool,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub invariant: &'static str,
    pub subject: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub checked_at: i64,
    pub violations: Vec<Violation>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Run the reconciliation loop until `shutdown` fires.
pub async fn run(state: Arc<AuditState>, shutdown: CancellationToken) {
    if state.interval_secs == 0 {
        info!("Ledger audit disabled");
        return;
    }
    info!("Ledger audit every {}s", state.interval_secs);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Ledger audit stopping");
                return;
            }
            _ = tokio::time::sleep(Duration::from_secs(state.interval_secs)) => {}
        }

        match audit_once(&state.pool).await {
            Ok(report) if report.is_clean() => info!("Ledger audit clean"),
            Ok(report) => {
                for v in &report.violations {
                    error!(
                        invariant = v.invariant,
                        subject = %v.subject,
                        "Invariant violated: {}",
                        v.detail
                    );
                }
            }
            Err(e) => error!("Ledger audit error: {e}"),
        }
    }
}

/// Check every invariant once against a single snapshot.
pub async fn audit_once(pool: &SqlitePool) -> Result<AuditReport> {
    let mut tx = pool.begin().await?;
    let mut violations = Vec::new();

    let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
        "SELECT id, units_placed, target_units FROM batches \
         WHERE units_placed < 0 OR units_placed > target_units",
    )
    .fetch_all(&mut *tx)
    .await?;
    for (id, placed, target) in rows {
        violations.push(Violation {
            invariant: "capacity_bounds",
            subject: format!("batch:{id}"),
            detail: format!("units_placed {placed} outside [0, {target}]"),
        });
    }

    let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
        r#"
        SELECT b.id, b.units_placed, COALESCE(SUM(i.units), 0) AS held
        FROM   batches b
        LEFT JOIN investments i ON i.batch_id = b.id AND i.status != 'EXITED'
        GROUP  BY b.id
        HAVING b.units_placed != held
        "#,
    )
    .fetch_all(&mut *tx)
    .await?;
    for (id, placed, held) in rows {
        violations.push(Violation {
            invariant: "capacity_placement",
            subject: format!("batch:{id}"),
            detail: format!("units_placed {placed} but investments hold {held}"),
        });
    }

    let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
        r#"
        SELECT o.owner_id,
               COALESCE(w.balance, 0) AS balance,
               COALESCE(t.total, 0)   AS total
        FROM   (SELECT owner_id FROM wallets UNION SELECT owner_id FROM transactions) o
        LEFT JOIN wallets w ON w.owner_id = o.owner_id
        LEFT JOIN (SELECT owner_id, SUM(amount) AS total
                   FROM transactions GROUP BY owner_id) t ON t.owner_id = o.owner_id
        WHERE  COALESCE(w.balance, 0) != COALESCE(t.total, 0)
        "#,
    )
    .fetch_all(&mut *tx)
    .await?;
    for (owner, balance, total) in rows {
        violations.push(Violation {
            invariant: "wallet_ledger",
            subject: format!("owner:{owner}"),
            detail: format!("balance {balance} != ledger sum {total} (minor units)"),
        });
    }

    let rows: Vec<(i64, i64)> =
        sqlx::query_as("SELECT owner_id, balance FROM wallets WHERE balance < 0")
            .fetch_all(&mut *tx)
            .await?;
    for (owner, balance) in rows {
        violations.push(Violation {
            invariant: "wallet_non_negative",
            subject: format!("owner:{owner}"),
            detail: format!("balance {balance} (minor units)"),
        });
    }

    let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
        r#"
        SELECT i.id, i.units, SUM(e.units) AS pledged
        FROM   investments i
        JOIN   exit_requests e ON e.investment_id = i.id AND e.status = 'PENDING'
        GROUP  BY i.id
        HAVING pledged > i.units
        "#,
    )
    .fetch_all(&mut *tx)
    .await?;
    for (id, units, pledged) in rows {
        violations.push(Violation {
            invariant: "exit_pledges",
            subject: format!("investment:{id}"),
            detail: format!("{pledged} units pledged against a holding of {units}"),
        });
    }

    let rows: Vec<(i64, String, i64)> = sqlx::query_as(
        "SELECT investment_id, cycle_id, COUNT(*) AS n FROM payouts \
         GROUP BY investment_id, cycle_id HAVING n > 1",
    )
    .fetch_all(&mut *tx)
    .await?;
    for (id, cycle, n) in rows {
        violations.push(Violation {
            invariant: "payout_unique",
            subject: format!("investment:{id}"),
            detail: format!("{n} payouts for cycle {cycle}"),
        });
    }

    let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
        r#"
        SELECT id, paid, credited FROM (
            SELECT i.id,
                   (SELECT COUNT(*) FROM payouts p
                    WHERE p.investment_id = i.id AND p.amount > 0) AS paid,
                   (SELECT COUNT(*) FROM transactions t
                    WHERE t.kind = 'PAYOUT_CREDIT'
                      AND t.reference = 'investment:' || i.id) AS credited
            FROM   investments i
        )
        WHERE  paid != credited
        "#,
    )
    .fetch_all(&mut *tx)
    .await?;
    for (id, paid, credited) in rows {
        violations.push(Violation {
            invariant: "payout_credited",
            subject: format!("investment:{id}"),
            detail: format!("{paid} payouts but {credited} payout credits"),
        });
    }

    tx.rollback().await?;

    Ok(AuditReport {
        checked_at: db::now(),
        violations,
    })
}
