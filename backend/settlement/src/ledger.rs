//! Ledger store — wallets and the append-only transaction log.
//!
//! A wallet balance is a cached running total. It is only ever changed by
//! [`apply_delta`], and every caller pairs that with exactly one
//! [`post_entry`] inside the same database transaction, so
//! `balance == Σ transactions.amount` holds for every owner at every commit.

use sqlx::{SqliteConnection, SqlitePool};
use tracing::{info, warn};

use crate::db::{self, TransactionRow, TRANSACTION_COLUMNS};
use crate::errors::{EngineError, Result};
use crate::types::{Money, Transaction, TransactionKind, Wallet};

const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

// ─────────────────────────────────────────────────────────
// Building blocks (used inside an open transaction)
// ─────────────────────────────────────────────────────────

/// Append one ledger entry. `magnitude` is positive; the stored sign follows
/// `kind`.
///
/// Returns `None` when `idempotency_key` was already used by this owner, in
/// which case nothing was written.
pub async fn post_entry(
    conn: &mut SqliteConnection,
    owner_id: i64,
    kind: TransactionKind,
    magnitude: Money,
    reference: Option<&str>,
    idempotency_key: Option<&str>,
) -> Result<Option<Transaction>> {
    let sql = format!(
        r#"
        INSERT INTO transactions (owner_id, kind, amount, reference, idempotency_key, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT (owner_id, idempotency_key) DO NOTHING
        RETURNING {TRANSACTION_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, TransactionRow>(&sql)
        .bind(owner_id)
        .bind(kind.as_str())
        .bind(kind.signed(magnitude).minor())
        .bind(reference)
        .bind(idempotency_key)
        .bind(db::now())
        .fetch_optional(&mut *conn)
        .await?;
    row.map(Transaction::try_from).transpose()
}

/// Move an owner's cached balance by `delta`, refusing to go below zero.
///
/// Credits create the wallet on first use. The debit is a single
/// conditional UPDATE, so two concurrent debits can never both pass a
/// balance check only one of them can satisfy.
pub async fn apply_delta(conn: &mut SqliteConnection, owner_id: i64, delta: Money) -> Result<Money> {
    let now = db::now();

    if delta >= Money::ZERO {
        let (balance,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO wallets (owner_id, balance, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (owner_id) DO UPDATE
                SET balance = balance + excluded.balance,
                    updated_at = excluded.updated_at
            RETURNING balance
            "#,
        )
        .bind(owner_id)
        .bind(delta.minor())
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;
        return Ok(Money::from_minor(balance));
    }

    let updated: Option<(i64,)> = sqlx::query_as(
        r#"
        UPDATE wallets
        SET    balance = balance + ?2, updated_at = ?3
        WHERE  owner_id = ?1 AND balance + ?2 >= 0
        RETURNING balance
        "#,
    )
    .bind(owner_id)
    .bind(delta.minor())
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    match updated {
        Some((balance,)) => Ok(Money::from_minor(balance)),
        None => Err(EngineError::InsufficientBalance {
            available: db::wallet_balance(&mut *conn, owner_id).await?,
            required: delta.negated(),
        }),
    }
}

fn normalize_key(key: Option<&str>) -> Result<Option<&str>> {
    match key.map(str::trim) {
        None | Some("") => Ok(None),
        Some(k) if k.len() > MAX_IDEMPOTENCY_KEY_LEN => Err(EngineError::InvalidIdempotencyKey(
            format!("longer than {MAX_IDEMPOTENCY_KEY_LEN} bytes"),
        )),
        Some(k) => Ok(Some(k)),
    }
}

// ─────────────────────────────────────────────────────────
// Operations
// ─────────────────────────────────────────────────────────

/// Credit an owner's wallet from outside the engine.
pub async fn deposit(
    pool: &SqlitePool,
    owner_id: i64,
    amount: Money,
    idempotency_key: Option<&str>,
) -> Result<Transaction> {
    external_transfer(pool, owner_id, TransactionKind::Deposit, amount, idempotency_key).await
}

/// Debit an owner's wallet to outside the engine. Fails with
/// `InsufficientBalance` and leaves the balance untouched when it would go
/// negative.
pub async fn withdraw(
    pool: &SqlitePool,
    owner_id: i64,
    amount: Money,
    idempotency_key: Option<&str>,
) -> Result<Transaction> {
    external_transfer(pool, owner_id, TransactionKind::Withdrawal, amount, idempotency_key).await
}

async fn external_transfer(
    pool: &SqlitePool,
    owner_id: i64,
    kind: TransactionKind,
    amount: Money,
    idempotency_key: Option<&str>,
) -> Result<Transaction> {
    if !amount.is_positive() {
        return Err(EngineError::InvalidAmount(amount));
    }
    let idempotency_key = normalize_key(idempotency_key)?;

    let mut tx = pool.begin().await?;

    let Some(entry) = post_entry(&mut *tx, owner_id, kind, amount, None, idempotency_key).await?
    else {
        // Replay of a key we have seen: hand back the original entry.
        let key = idempotency_key.unwrap_or_default();
        let original = db::fetch_transaction_by_key(&mut *tx, owner_id, key)
            .await?
            .ok_or_else(|| EngineError::Corrupt(format!("idempotency key {key:?} vanished")))?;
        if original.kind != kind || original.amount != kind.signed(amount) {
            warn!(owner_id, key, "idempotency key reused for a different request");
            return Err(EngineError::IdempotencyConflict(key.to_string()));
        }
        info!(owner_id, key, transaction_id = original.id, "replayed {}", kind.as_str());
        return Ok(original);
    };

    let balance = apply_delta(&mut *tx, owner_id, entry.amount).await?;
    tx.commit().await?;

    info!(
        owner_id,
        transaction_id = entry.id,
        amount = %entry.amount,
        balance = %balance,
        "{} posted",
        kind.as_str()
    );
    Ok(entry)
}

/// Current wallet; an owner who never transacted holds a zero balance.
pub async fn wallet(pool: &SqlitePool, owner_id: i64) -> Result<Wallet> {
    Ok(db::fetch_wallet(pool, owner_id).await?.unwrap_or(Wallet {
        owner_id,
        balance: Money::ZERO,
        updated_at: 0,
    }))
}

/// Every entry for an owner, oldest first. Summing `amount` reproduces the
/// wallet balance.
pub async fn transactions(pool: &SqlitePool, owner_id: i64) -> Result<Vec<Transaction>> {
    db::transactions_for_owner(pool, owner_id).await
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
