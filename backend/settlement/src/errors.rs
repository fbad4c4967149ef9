//! Application-wide error types.

use thiserror::Error;

use crate::types::{BatchStatus, Money};

#[derive(Debug, Error)]
pub enum EngineError {
    // ── Validation ─────────────────────────────────────────
    #[error("Units must be positive, got {0}")]
    InvalidUnits(i64),

    #[error("Amount must be positive, got {0}")]
    InvalidAmount(Money),

    #[error("Invalid batch terms: {0}")]
    InvalidTerms(String),

    #[error("Invalid cycle id: {0}")]
    InvalidCycle(String),

    #[error("Invalid idempotency key: {0}")]
    InvalidIdempotencyKey(String),

    // ── Not found ──────────────────────────────────────────
    #[error("Batch {0} not found")]
    BatchNotFound(i64),

    #[error("Investment {0} not found")]
    InvestmentNotFound(i64),

    #[error("Exit request {0} not found")]
    ExitNotFound(i64),

    // ── State ──────────────────────────────────────────────
    #[error("Batch {batch_id} is {status}, not open for investment")]
    BatchNotOpen { batch_id: i64, status: BatchStatus },

    #[error("Batch {batch_id} cannot move from {from} to {to}")]
    InvalidTransition {
        batch_id: i64,
        from: BatchStatus,
        to: BatchStatus,
    },

    #[error("Investment {0} is not active")]
    InvestmentNotActive(i64),

    #[error("Batch {batch_id} is {status}; payouts require ACTIVE or HARVESTED")]
    BatchNotHarvestable { batch_id: i64, status: BatchStatus },

    #[error("Batch {0} terms are locked once units are placed")]
    TermsLocked(i64),

    #[error("Exit request {0} is no longer pending")]
    ExitNotPending(i64),

    // ── Resources ──────────────────────────────────────────
    #[error("Batch {batch_id} has {available} units available, {requested} requested")]
    CapacityExceeded {
        batch_id: i64,
        requested: i64,
        available: i64,
    },

    #[error("Insufficient wallet balance: {available} available, {required} required")]
    InsufficientBalance { available: Money, required: Money },

    #[error("Investment {investment_id} holds {available} unpledged units, {requested} requested")]
    UnitsExceedHolding {
        investment_id: i64,
        requested: i64,
        available: i64,
    },

    #[error("Cannot release {units} units from batch {batch_id}")]
    CapacityUnderflow { batch_id: i64, units: i64 },

    // ── Idempotency ────────────────────────────────────────
    #[error("Idempotency key {0:?} was already used for a different request")]
    IdempotencyConflict(String),

    // ── Infrastructure ─────────────────────────────────────
    #[error("Arithmetic overflow computing {0}")]
    Overflow(&'static str),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

impl EngineError {
    /// Stable, machine-readable failure reason.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidUnits(_) => "invalid_units",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::InvalidTerms(_) => "invalid_terms",
            Self::InvalidCycle(_) => "invalid_cycle",
            Self::InvalidIdempotencyKey(_) => "invalid_idempotency_key",
            Self::BatchNotFound(_) => "batch_not_found",
            Self::InvestmentNotFound(_) => "investment_not_found",
            Self::ExitNotFound(_) => "exit_not_found",
            Self::BatchNotOpen { .. } => "batch_not_open",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvestmentNotActive(_) => "investment_not_active",
            Self::BatchNotHarvestable { .. } => "batch_not_harvestable",
            Self::TermsLocked(_) => "terms_locked",
            Self::ExitNotPending(_) => "exit_not_pending",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::UnitsExceedHolding { .. } => "units_exceed_holding",
            Self::CapacityUnderflow { .. } => "capacity_underflow",
            Self::IdempotencyConflict(_) => "idempotency_conflict",
            Self::Overflow(_) => "overflow",
            Self::Database(_) => "database",
            Self::Migrate(_) => "migration",
            Self::Config(_) => "config",
            Self::Corrupt(_) => "corrupt",
        }
    }

    /// Transient storage failures (lock contention, pool exhaustion, I/O)
    /// the caller may retry; domain rejections are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) => true,
            Self::Database(sqlx::Error::Database(db)) => db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                // Primary result code: SQLITE_BUSY (5) or SQLITE_LOCKED (6).
                .is_some_and(|code| matches!(code & 0xff, 5 | 6)),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
