//! Database layer — pool setup, migrations, row mapping and shared reads.
//!
//! Mutating statements live with the component that owns them
//! (`ledger`, `capacity`, `allocator`, `payout`, `exit`). Everything here is
//! read-only and generic over [`Executor`] so the same query runs against the
//! pool or inside an open transaction.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Executor, Sqlite, SqlitePool};
use tracing::info;

use crate::errors::{EngineError, Result};
use crate::types::{
    Batch, EarlyExitRequest, Investment, Money, Overview, Payout, Transaction, Wallet,
};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(
    database_url: &str,
    max_connections: u32,
    busy_timeout: Duration,
) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    // WAL lets readers proceed while a writer holds the lock; the busy
    // timeout makes competing writers queue instead of failing.
    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(busy_timeout)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

/// Current Unix time in seconds.
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn parse_decimal(column: &str, raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw)
        .map_err(|e| EngineError::Corrupt(format!("{column} = {raw:?}: {e}")))
}

// ─────────────────────────────────────────────────────────
// Row shapes
// ─────────────────────────────────────────────────────────

pub const BATCH_COLUMNS: &str = "id, product_kind, unit_price, target_units, units_placed, \
     feed_price, mortality_rate, expected_roi, status, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
pub struct BatchRow {
    pub id: i64,
    pub product_kind: String,
    pub unit_price: i64,
    pub target_units: i64,
    pub units_placed: i64,
    pub feed_price: i64,
    pub mortality_rate: String,
    pub expected_roi: String,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<BatchRow> for Batch {
    type Error = EngineError;

    fn try_from(row: BatchRow) -> Result<Self> {
        Ok(Batch {
            id: row.id,
            product_kind: row.product_kind.parse()?,
            unit_price: Money::from_minor(row.unit_price),
            target_units: row.target_units,
            units_placed: row.units_placed,
            feed_price: Money::from_minor(row.feed_price),
            mortality_rate: parse_decimal("mortality_rate", &row.mortality_rate)?,
            expected_roi: parse_decimal("expected_roi", &row.expected_roi)?,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub const INVESTMENT_COLUMNS: &str =
    "id, owner_id, batch_id, units, amount, status, created_at";

#[derive(Debug, sqlx::FromRow)]
pub struct InvestmentRow {
    pub id: i64,
    pub owner_id: i64,
    pub batch_id: i64,
    pub units: i64,
    pub amount: i64,
    pub status: String,
    pub created_at: i64,
}

impl TryFrom<InvestmentRow> for Investment {
    type Error = EngineError;

    fn try_from(row: InvestmentRow) -> Result<Self> {
        Ok(Investment {
            id: row.id,
            owner_id: row.owner_id,
            batch_id: row.batch_id,
            units: row.units,
            amount: Money::from_minor(row.amount),
            status: row.status.parse()?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct WalletRow {
    pub owner_id: i64,
    pub balance: i64,
    pub updated_at: i64,
}

impl From<WalletRow> for Wallet {
    fn from(row: WalletRow) -> Self {
        Wallet {
            owner_id: row.owner_id,
            balance: Money::from_minor(row.balance),
            updated_at: row.updated_at,
        }
    }
}

pub const TRANSACTION_COLUMNS: &str =
    "id, owner_id, kind, amount, reference, idempotency_key, created_at";

#[derive(Debug, sqlx::FromRow)]
pub struct TransactionRow {
    pub id: i64,
    pub owner_id: i64,
    pub kind: String,
    pub amount: i64,
    pub reference: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: i64,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = EngineError;

    fn try_from(row: TransactionRow) -> Result<Self> {
        Ok(Transaction {
            id: row.id,
            owner_id: row.owner_id,
            kind: row.kind.parse()?,
            amount: Money::from_minor(row.amount),
            reference: row.reference,
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
        })
    }
}

pub const PAYOUT_COLUMNS: &str = "id, investment_id, batch_id, cycle_id, amount, created_at";

#[derive(Debug, sqlx::FromRow)]
pub struct PayoutRow {
    pub id: i64,
    pub investment_id: i64,
    pub batch_id: i64,
    pub cycle_id: String,
    pub amount: i64,
    pub created_at: i64,
}

impl From<PayoutRow> for Payout {
    fn from(row: PayoutRow) -> Self {
        Payout {
            id: row.id,
            investment_id: row.investment_id,
            batch_id: row.batch_id,
            cycle_id: row.cycle_id,
            amount: Money::from_minor(row.amount),
            created_at: row.created_at,
        }
    }
}

pub const EXIT_COLUMNS: &str =
    "id, investment_id, owner_id, units, status, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
pub struct ExitRow {
    pub id: i64,
    pub investment_id: i64,
    pub owner_id: i64,
    pub units: i64,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<ExitRow> for EarlyExitRequest {
    type Error = EngineError;

    fn try_from(row: ExitRow) -> Result<Self> {
        Ok(EarlyExitRequest {
            id: row.id,
            investment_id: row.investment_id,
            owner_id: row.owner_id,
            units: row.units,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = EngineError>,
{
    rows.into_iter().map(T::try_from).collect()
}

// ─────────────────────────────────────────────────────────
// Batch reads
// ─────────────────────────────────────────────────────────

pub async fn fetch_batch<'e, E>(executor: E, batch_id: i64) -> Result<Option<Batch>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = ?1");
    let row = sqlx::query_as::<_, BatchRow>(&sql)
        .bind(batch_id)
        .fetch_optional(executor)
        .await?;
    row.map(Batch::try_from).transpose()
}

/// Like [`fetch_batch`] but a missing batch is an error.
pub async fn require_batch<'e, E>(executor: E, batch_id: i64) -> Result<Batch>
where
    E: Executor<'e, Database = Sqlite>,
{
    fetch_batch(executor, batch_id)
        .await?
        .ok_or(EngineError::BatchNotFound(batch_id))
}

/// All batches, newest first.
pub async fn list_batches(pool: &SqlitePool) -> Result<Vec<Batch>> {
    let sql = format!("SELECT {BATCH_COLUMNS} FROM batches ORDER BY id DESC");
    let rows = sqlx::query_as::<_, BatchRow>(&sql).fetch_all(pool).await?;
    convert_all(rows)
}

/// Batches currently accepting investment, newest first.
pub async fn list_open_batches(pool: &SqlitePool) -> Result<Vec<Batch>> {
    let sql = format!(
        "SELECT {BATCH_COLUMNS} FROM batches WHERE status = 'OPEN' ORDER BY id DESC"
    );
    let rows = sqlx::query_as::<_, BatchRow>(&sql).fetch_all(pool).await?;
    convert_all(rows)
}

pub async fn overview(pool: &SqlitePool) -> Result<Overview> {
    let (batches_egg, batches_chicken, open_batches): (i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(product_kind = 'EGG'), 0),
               COALESCE(SUM(product_kind = 'CHICKEN'), 0),
               COALESCE(SUM(status = 'OPEN'), 0)
        FROM   batches
        "#,
    )
    .fetch_one(pool)
    .await?;
    Ok(Overview {
        batches_egg,
        batches_chicken,
        open_batches,
    })
}

// ─────────────────────────────────────────────────────────
// Investment reads
// ─────────────────────────────────────────────────────────

pub async fn fetch_investment<'e, E>(executor: E, investment_id: i64) -> Result<Option<Investment>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {INVESTMENT_COLUMNS} FROM investments WHERE id = ?1");
    let row = sqlx::query_as::<_, InvestmentRow>(&sql)
        .bind(investment_id)
        .fetch_optional(executor)
        .await?;
    row.map(Investment::try_from).transpose()
}

/// ACTIVE investments of a batch in creation order.
pub async fn active_investments<'e, E>(executor: E, batch_id: i64) -> Result<Vec<Investment>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {INVESTMENT_COLUMNS} FROM investments \
         WHERE batch_id = ?1 AND status = 'ACTIVE' ORDER BY id ASC"
    );
    let rows = sqlx::query_as::<_, InvestmentRow>(&sql)
        .bind(batch_id)
        .fetch_all(executor)
        .await?;
    convert_all(rows)
}

/// An owner's investments, newest first.
pub async fn investments_for_owner(pool: &SqlitePool, owner_id: i64) -> Result<Vec<Investment>> {
    let sql = format!(
        "SELECT {INVESTMENT_COLUMNS} FROM investments WHERE owner_id = ?1 ORDER BY id DESC"
    );
    let rows = sqlx::query_as::<_, InvestmentRow>(&sql)
        .bind(owner_id)
        .fetch_all(pool)
        .await?;
    convert_all(rows)
}

// ─────────────────────────────────────────────────────────
// Payout reads
// ─────────────────────────────────────────────────────────

pub async fn payouts_for_investment(pool: &SqlitePool, investment_id: i64) -> Result<Vec<Payout>> {
    let sql = format!(
        "SELECT {PAYOUT_COLUMNS} FROM payouts WHERE investment_id = ?1 ORDER BY id ASC"
    );
    let rows = sqlx::query_as::<_, PayoutRow>(&sql)
        .bind(investment_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(Payout::from).collect())
}

/// Investment ids that already hold a payout for `cycle_id`.
pub async fn settled_investments<'e, E>(
    executor: E,
    batch_id: i64,
    cycle_id: &str,
) -> Result<HashSet<i64>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(i64,)> =
        sqlx::query_as("SELECT investment_id FROM payouts WHERE batch_id = ?1 AND cycle_id = ?2")
            .bind(batch_id)
            .bind(cycle_id)
            .fetch_all(executor)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

// ─────────────────────────────────────────────────────────
// Ledger reads
// ─────────────────────────────────────────────────────────

pub async fn fetch_wallet<'e, E>(executor: E, owner_id: i64) -> Result<Option<Wallet>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, WalletRow>(
        "SELECT owner_id, balance, updated_at FROM wallets WHERE owner_id = ?1",
    )
    .bind(owner_id)
    .fetch_optional(executor)
    .await?;
    Ok(row.map(Wallet::from))
}

/// Current balance; an owner without a wallet holds nothing.
pub async fn wallet_balance<'e, E>(executor: E, owner_id: i64) -> Result<Money>
where
    E: Executor<'e, Database = Sqlite>,
{
    Ok(fetch_wallet(executor, owner_id)
        .await?
        .map(|w| w.balance)
        .unwrap_or(Money::ZERO))
}

pub async fn fetch_transaction_by_key<'e, E>(
    executor: E,
    owner_id: i64,
    idempotency_key: &str,
) -> Result<Option<Transaction>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions \
         WHERE owner_id = ?1 AND idempotency_key = ?2"
    );
    let row = sqlx::query_as::<_, TransactionRow>(&sql)
        .bind(owner_id)
        .bind(idempotency_key)
        .fetch_optional(executor)
        .await?;
    row.map(Transaction::try_from).transpose()
}

/// An owner's ledger in posting order.
pub async fn transactions_for_owner(pool: &SqlitePool, owner_id: i64) -> Result<Vec<Transaction>> {
    let sql = format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE owner_id = ?1 ORDER BY id ASC"
    );
    let rows = sqlx::query_as::<_, TransactionRow>(&sql)
        .bind(owner_id)
        .fetch_all(pool)
        .await?;
    convert_all(rows)
}

// ─────────────────────────────────────────────────────────
// Early-exit reads
// ─────────────────────────────────────────────────────────

pub async fn fetch_exit<'e, E>(executor: E, request_id: i64) -> Result<Option<EarlyExitRequest>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {EXIT_COLUMNS} FROM exit_requests WHERE id = ?1");
    let row = sqlx::query_as::<_, ExitRow>(&sql)
        .bind(request_id)
        .fetch_optional(executor)
        .await?;
    row.map(EarlyExitRequest::try_from).transpose()
}

pub async fn exits_for_owner(pool: &SqlitePool, owner_id: i64) -> Result<Vec<EarlyExitRequest>> {
    let sql = format!(
        "SELECT {EXIT_COLUMNS} FROM exit_requests WHERE owner_id = ?1 ORDER BY id DESC"
    );
    let rows = sqlx::query_as::<_, ExitRow>(&sql)
        .bind(owner_id)
        .fetch_all(pool)
        .await?;
    convert_all(rows)
}

/// Units already pledged by PENDING exit requests against an investment.
pub async fn pending_exit_units<'e, E>(executor: E, investment_id: i64) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let (units,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(units), 0) FROM exit_requests \
         WHERE investment_id = ?1 AND status = 'PENDING'",
    )
    .bind(investment_id)
    .fetch_one(executor)
    .await?;
    Ok(units)
}
