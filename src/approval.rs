use crate::fees::FeeStatus;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Pending,
    Approved,
    Blocked,
}

impl ResultStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Blocked => "blocked",
        }
    }
}

/// Minimum settlement a student needs before the gate approves their results.
/// `unpaid` is never enough.
pub fn parse_minimum_fee_status(s: &str) -> Option<FeeStatus> {
    match FeeStatus::parse(s)? {
        FeeStatus::Unpaid => None,
        other => Some(other),
    }
}

pub fn visible_to_parent(status: ResultStatus, fee: FeeStatus) -> bool {
    status == ResultStatus::Approved && fee != FeeStatus::Unpaid
}

/// Manual toggles may disagree with the ledger; these rows want a human look.
pub fn needs_review(status: ResultStatus, fee: FeeStatus) -> bool {
    match status {
        ResultStatus::Approved => fee == FeeStatus::Unpaid,
        ResultStatus::Blocked => fee == FeeStatus::Paid,
        ResultStatus::Pending => false,
    }
}

/// Outcome of the bulk gate for one result. Only pending results move.
pub fn gate_decision(
    current: ResultStatus,
    fee: FeeStatus,
    minimum: FeeStatus,
) -> Option<ResultStatus> {
    if current != ResultStatus::Pending {
        return None;
    }
    if fee != FeeStatus::Unpaid && fee >= minimum {
        Some(ResultStatus::Approved)
    } else {
        Some(ResultStatus::Blocked)
    }
}
