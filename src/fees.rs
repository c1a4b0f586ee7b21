use serde::Serialize;
use thiserror::Error;

/// Ordered from least to most settled, so `>=` reads as "at least".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeStatus {
    Unpaid,
    Partial,
    Paid,
}

impl FeeStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unpaid" => Some(Self::Unpaid),
            "partial" => Some(Self::Partial),
            "paid" => Some(Self::Paid),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unpaid => "unpaid",
            Self::Partial => "partial",
            Self::Paid => "paid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Transfer,
    Card,
    Online,
}

impl PaymentMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cash" => Some(Self::Cash),
            "transfer" | "bank_transfer" => Some(Self::Transfer),
            "card" => Some(Self::Card),
            "online" => Some(Self::Online),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cash => "cash",
            Self::Transfer => "transfer",
            Self::Card => "card",
            Self::Online => "online",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeeError {
    #[error("amount must be a positive number, got {0}")]
    NonPositiveAmount(f64),
    #[error("fee total must be a non-negative number, got {0}")]
    InvalidFeeTotal(f64),
}

pub fn round_money(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub fn validate_payment_amount(amount: f64) -> Result<f64, FeeError> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(FeeError::NonPositiveAmount(amount));
    }
    Ok(round_money(amount))
}

pub fn validate_fee_total(total: f64) -> Result<f64, FeeError> {
    if !total.is_finite() || total < 0.0 {
        return Err(FeeError::InvalidFeeTotal(total));
    }
    Ok(round_money(total))
}

/// Nothing required counts as settled.
pub fn fee_status(amount_paid: f64, total_fee_required: f64) -> FeeStatus {
    if amount_paid >= total_fee_required {
        FeeStatus::Paid
    } else if amount_paid > 0.0 {
        FeeStatus::Partial
    } else {
        FeeStatus::Unpaid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeLedger {
    pub required: f64,
    pub paid: f64,
    pub balance: f64,
    pub credit: f64,
    pub status: FeeStatus,
}

/// Only completed payments count toward what has been paid.
pub fn ledger<I>(payments: I, required: f64) -> FeeLedger
where
    I: IntoIterator<Item = (f64, PaymentStatus)>,
{
    let paid = round_money(
        payments
            .into_iter()
            .filter(|(_, status)| *status == PaymentStatus::Completed)
            .map(|(amount, _)| amount)
            .sum(),
    );
    let balance = round_money((required - paid).max(0.0));
    let credit = round_money((paid - required).max(0.0));
    FeeLedger {
        required,
        paid,
        balance,
        credit,
        status: fee_status(paid, required),
    }
}
