//! # Types
//!
//! Shared data structures used across the settlement engine.
//!
//! ## Money
//!
//! [`Money`] is a signed count of minor currency units (two decimal places).
//! Every balance, price and payout is carried as `Money` so that ledger sums
//! are exact integer additions. Rates (`mortality_rate`, `expected_roi`) are
//! exact [`Decimal`]s and only meet `Money` inside the payout rule, where the
//! product is rounded back to minor units.
//!
//! ## Batch status as a finite-state machine
//!
//! [`BatchStatus`] enforces a strict forward-only lifecycle:
//!
//! ```text
//! Open ──► Active ──► Harvested ──► Closed
//! ```
//!
//! Only `Open` accepts new investments. Payouts are settled while `Active`
//! (monthly egg cycles) or `Harvested` (broiler harvest).

use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{EngineError, Result};

/// Number of fractional digits carried by [`Money`].
pub const MONEY_SCALE: u32 = 2;

// ─────────────────────────────────────────────────────────
// Money
// ─────────────────────────────────────────────────────────

/// Fixed-point amount in minor units (1/100 of the currency unit).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_minor(minor: i64) -> Self {
        Money(minor)
    }

    pub const fn minor(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn to_decimal(self) -> Decimal {
        Decimal::new(self.0, MONEY_SCALE)
    }

    /// Exact conversion; rejects values with more than two fractional digits.
    pub fn from_decimal(value: Decimal) -> Result<Self> {
        let normalized = value.normalize();
        if normalized.scale() > MONEY_SCALE {
            return Err(EngineError::InvalidTerms(format!(
                "{value} has more than {MONEY_SCALE} decimal places"
            )));
        }
        Self::from_rounded(normalized)
    }

    /// Round to minor units with banker's rounding (midpoint to even).
    pub fn from_decimal_rounded(value: Decimal) -> Result<Self> {
        Self::from_rounded(
            value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointNearestEven),
        )
    }

    fn from_rounded(value: Decimal) -> Result<Self> {
        let scaled = value
            .checked_mul(Decimal::from(10i64.pow(MONEY_SCALE)))
            .ok_or(EngineError::Overflow("money"))?;
        scaled
            .trunc()
            .to_i64()
            .map(Money)
            .ok_or(EngineError::Overflow("money"))
    }

    pub fn checked_add(self, other: Money) -> Result<Money> {
        self.0
            .checked_add(other.0)
            .map(Money)
            .ok_or(EngineError::Overflow("money sum"))
    }

    /// `self × units`, e.g. unit price times purchased units.
    pub fn checked_times(self, units: i64) -> Result<Money> {
        self.0
            .checked_mul(units)
            .map(Money)
            .ok_or(EngineError::Overflow("units × unit_price"))
    }

    pub fn negated(self) -> Money {
        Money(-self.0)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = <Decimal as Deserialize>::deserialize(deserializer)?;
        Money::from_decimal(value).map_err(serde::de::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────
// Enumerations
// ─────────────────────────────────────────────────────────

/// What a batch produces, which decides how it pays out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductKind {
    /// Layers: monthly yield, the investment stays active across cycles.
    Egg,
    /// Broilers: one lump-sum return at harvest.
    Chicken,
}

impl ProductKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Egg => "EGG",
            Self::Chicken => "CHICKEN",
        }
    }

    /// Recurring kinds keep paying every cycle; one-off kinds pay once.
    pub fn is_recurring(&self) -> bool {
        matches!(self, Self::Egg)
    }
}

impl FromStr for ProductKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "EGG" => Ok(Self::Egg),
            "CHICKEN" => Ok(Self::Chicken),
            other => Err(EngineError::Corrupt(format!("unknown product kind {other:?}"))),
        }
    }
}

/// Lifecycle status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// Accepting investments.
    Open,
    /// Flock placed; egg batches pay monthly from here.
    Active,
    /// Birds sold; broiler batches settle here.
    Harvested,
    /// Terminal.
    Closed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Active => "ACTIVE",
            Self::Harvested => "HARVESTED",
            Self::Closed => "CLOSED",
        }
    }

    /// The single status that may precede `self`, or `None` for `Open`.
    pub fn predecessor(&self) -> Option<BatchStatus> {
        match self {
            Self::Open => None,
            Self::Active => Some(Self::Open),
            Self::Harvested => Some(Self::Active),
            Self::Closed => Some(Self::Harvested),
        }
    }

    pub fn accepts_payouts(&self) -> bool {
        matches!(self, Self::Active | Self::Harvested)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "OPEN" => Ok(Self::Open),
            "ACTIVE" => Ok(Self::Active),
            "HARVESTED" => Ok(Self::Harvested),
            "CLOSED" => Ok(Self::Closed),
            other => Err(EngineError::Corrupt(format!("unknown batch status {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvestmentStatus {
    Active,
    Paid,
    Exited,
}

impl InvestmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Paid => "PAID",
            Self::Exited => "EXITED",
        }
    }
}

impl FromStr for InvestmentStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "PAID" => Ok(Self::Paid),
            "EXITED" => Ok(Self::Exited),
            other => Err(EngineError::Corrupt(format!(
                "unknown investment status {other:?}"
            ))),
        }
    }
}

/// Ledger entry kinds. The sign of the amount is fixed per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    InvestmentDebit,
    PayoutCredit,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "DEPOSIT",
            Self::Withdrawal => "WITHDRAWAL",
            Self::InvestmentDebit => "INVESTMENT_DEBIT",
            Self::PayoutCredit => "PAYOUT_CREDIT",
        }
    }

    /// `true` when entries of this kind increase the balance.
    pub fn is_credit(&self) -> bool {
        matches!(self, Self::Deposit | Self::PayoutCredit)
    }

    /// Apply this kind's sign to a positive magnitude.
    pub fn signed(&self, magnitude: Money) -> Money {
        if self.is_credit() {
            magnitude
        } else {
            magnitude.negated()
        }
    }
}

impl FromStr for TransactionKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DEPOSIT" => Ok(Self::Deposit),
            "WITHDRAWAL" => Ok(Self::Withdrawal),
            "INVESTMENT_DEBIT" => Ok(Self::InvestmentDebit),
            "PAYOUT_CREDIT" => Ok(Self::PayoutCredit),
            other => Err(EngineError::Corrupt(format!(
                "unknown transaction kind {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitStatus {
    Pending,
    Fulfilled,
    Cancelled,
}

impl ExitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Fulfilled => "FULFILLED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl FromStr for ExitStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "FULFILLED" => Ok(Self::Fulfilled),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(EngineError::Corrupt(format!("unknown exit status {other:?}"))),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Entities
// ─────────────────────────────────────────────────────────

/// Economic terms of a batch, supplied by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTerms {
    pub unit_price: Money,
    pub target_units: i64,
    #[serde(default)]
    pub feed_price: Money,
    pub mortality_rate: Decimal,
    pub expected_roi: Decimal,
}

impl BatchTerms {
    pub fn validate(&self) -> Result<()> {
        if !self.unit_price.is_positive() {
            return Err(EngineError::InvalidTerms("unit_price must be positive".into()));
        }
        if self.target_units <= 0 {
            return Err(EngineError::InvalidTerms("target_units must be positive".into()));
        }
        if self.feed_price < Money::ZERO {
            return Err(EngineError::InvalidTerms("feed_price must not be negative".into()));
        }
        if self.mortality_rate < Decimal::ZERO || self.mortality_rate >= Decimal::ONE {
            return Err(EngineError::InvalidTerms(
                "mortality_rate must be in [0, 1)".into(),
            ));
        }
        if self.expected_roi < Decimal::ZERO {
            return Err(EngineError::InvalidTerms(
                "expected_roi must not be negative".into(),
            ));
        }
        Ok(())
    }
}

/// A production run with finite investable capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    pub id: i64,
    pub product_kind: ProductKind,
    pub unit_price: Money,
    pub target_units: i64,
    pub units_placed: i64,
    pub feed_price: Money,
    pub mortality_rate: Decimal,
    pub expected_roi: Decimal,
    pub status: BatchStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Batch {
    pub fn units_available(&self) -> i64 {
        self.target_units - self.units_placed
    }
}

/// Ownership of N units of one batch by one investor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Investment {
    pub id: i64,
    pub owner_id: i64,
    pub batch_id: i64,
    pub units: i64,
    /// `units × unit_price` at purchase time.
    pub amount: Money,
    pub status: InvestmentStatus,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Wallet {
    pub owner_id: i64,
    pub balance: Money,
    pub updated_at: i64,
}

/// Immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transaction {
    pub id: i64,
    pub owner_id: i64,
    pub kind: TransactionKind,
    pub amount: Money,
    pub reference: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Payout {
    pub id: i64,
    pub investment_id: i64,
    pub batch_id: i64,
    pub cycle_id: String,
    pub amount: Money,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EarlyExitRequest {
    pub id: i64,
    pub investment_id: i64,
    pub owner_id: i64,
    pub units: i64,
    pub status: ExitStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

// ─────────────────────────────────────────────────────────
// Payout results
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayoutLine {
    pub investment_id: i64,
    pub owner_id: i64,
    pub units: i64,
    pub amount: Money,
    /// A payout for this cycle already exists.
    pub already_settled: bool,
}

/// Read-only projection produced by `simulate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayoutPlan {
    pub batch_id: i64,
    pub cycle_id: String,
    pub roi: Decimal,
    pub per_investment: Vec<PayoutLine>,
    pub total: Money,
    /// Sum over lines that `execute` would still pay.
    pub pending_total: Money,
}

/// Newly created payouts reported by `execute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PayoutSummary {
    pub count: u64,
    pub total: Money,
}

/// Public batch statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Overview {
    pub batches_egg: i64,
    pub batches_chicken: i64,
    pub open_batches: i64,
}

/// Cycle labels are short operator-chosen identifiers such as `2025-03`.
pub fn validate_cycle_id(cycle_id: &str) -> Result<()> {
    let valid = !cycle_id.is_empty()
        && cycle_id.len() <= 64
        && cycle_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidCycle(cycle_id.to_string()))
    }
}
