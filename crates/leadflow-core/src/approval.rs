//! Incentive approval state machine.
//!
//! ```text
//!   Calculate ──> calculating ──Submit──> pending_review
//!                    │  ^                    │   │
//!                    │  └────Recalculate─────┘   │
//!                    │                           │
//!                    ├──Approve──> approved <────┤ Approve
//!                    └──Reject───> rejected <────┘ Reject
//!                                     │
//!                approved ──MarkPaid──> paid      rejected ──Recalculate──> calculating
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IncentiveStatus {
    Calculating,
    PendingReview,
    Approved,
    Rejected,
    Paid,
}

impl IncentiveStatus {
    pub const ALL: [IncentiveStatus; 5] = [
        Self::Calculating,
        Self::PendingReview,
        Self::Approved,
        Self::Rejected,
        Self::Paid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Calculating => "calculating",
            Self::PendingReview => "pending_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Paid => "paid",
        }
    }

    /// Statuses that carry a final approved amount.
    pub fn has_final_amount(&self) -> bool {
        matches!(self, Self::Approved | Self::Paid)
    }

    /// Approved and paid records are never recalculated.
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Approved | Self::Paid)
    }

    /// The next status after `event`, or an error when the event is not
    /// allowed from this status.
    pub fn apply(self, event: IncentiveEvent) -> Result<IncentiveStatus, CoreError> {
        use IncentiveEvent as E;
        use IncentiveStatus as S;

        let next = match (self, event) {
            (S::Calculating, E::Submit) => S::PendingReview,
            (S::Calculating | S::PendingReview | S::Rejected, E::Recalculate) => S::Calculating,
            (S::Calculating | S::PendingReview, E::Approve) => S::Approved,
            (S::Calculating | S::PendingReview, E::Reject) => S::Rejected,
            (S::Approved, E::MarkPaid) => S::Paid,
            (from, event) => return Err(CoreError::InvalidTransition { from, event }),
        };
        Ok(next)
    }

    /// Statuses from which `event` is allowed.
    pub fn sources_for(event: IncentiveEvent) -> Vec<IncentiveStatus> {
        Self::ALL
            .iter()
            .copied()
            .filter(|s| s.apply(event).is_ok())
            .collect()
    }
}

impl fmt::Display for IncentiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncentiveStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "calculating" => Ok(Self::Calculating),
            "pending_review" => Ok(Self::PendingReview),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "paid" => Ok(Self::Paid),
            _ => Err(CoreError::InvalidStatus {
                kind: "incentive status",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IncentiveEvent {
    Submit,
    Recalculate,
    Approve,
    Reject,
    MarkPaid,
}

impl fmt::Display for IncentiveEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Submit => "submit",
            Self::Recalculate => "recalculate",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::MarkPaid => "mark paid",
        };
        f.write_str(name)
    }
}

/// Resolve the amount a reviewer approves.
///
/// Without an override the capped amount is approved as-is. An override may
/// reduce the payout but never exceed the cap or go negative.
pub fn resolve_approved_amount(capped_amount: i64, requested: Option<i64>) -> Result<i64, CoreError> {
    match requested {
        None => Ok(capped_amount),
        Some(amount) if (0..=capped_amount).contains(&amount) => Ok(amount),
        Some(amount) => Err(CoreError::AmountOutOfRange {
            amount,
            max: capped_amount,
        }),
    }
}

/// `final_approved_amount` must be present exactly when the status is
/// approved or paid.
pub fn check_final_amount_invariant(status: IncentiveStatus, final_amount: Option<i64>) -> bool {
    status.has_final_amount() == final_amount.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use IncentiveEvent as E;
    use IncentiveStatus as S;

    #[test]
    fn happy_path_reaches_paid() {
        let status = S::Calculating
            .apply(E::Submit)
            .and_then(|s| s.apply(E::Approve))
            .and_then(|s| s.apply(E::MarkPaid))
            .unwrap();
        assert_eq!(status, S::Paid);
    }

    #[test]
    fn approval_only_from_pending_review_or_calculating() {
        assert_eq!(
            S::sources_for(E::Approve),
            vec![S::Calculating, S::PendingReview]
        );
        assert_eq!(S::sources_for(E::Reject), vec![S::Calculating, S::PendingReview]);
        for from in [S::Approved, S::Rejected, S::Paid] {
            assert!(matches!(
                from.apply(E::Approve),
                Err(CoreError::InvalidTransition { .. })
            ));
        }
    }

    #[test]
    fn mark_paid_only_from_approved() {
        assert_eq!(S::sources_for(E::MarkPaid), vec![S::Approved]);
        assert!(S::PendingReview.apply(E::MarkPaid).is_err());
        assert!(S::Paid.apply(E::MarkPaid).is_err());
    }

    #[test]
    fn locked_statuses_refuse_recalculation() {
        for from in [S::Approved, S::Paid] {
            assert!(from.is_locked());
            assert!(from.apply(E::Recalculate).is_err());
        }
        assert_eq!(S::Rejected.apply(E::Recalculate).unwrap(), S::Calculating);
    }

    #[test]
    fn paid_is_terminal() {
        for event in [E::Submit, E::Recalculate, E::Approve, E::Reject, E::MarkPaid] {
            assert!(S::Paid.apply(event).is_err());
        }
    }

    #[test]
    fn approved_amount_defaults_to_capped() {
        assert_eq!(resolve_approved_amount(12_000, None).unwrap(), 12_000);
        assert_eq!(resolve_approved_amount(12_000, Some(10_000)).unwrap(), 10_000);
        assert_eq!(resolve_approved_amount(12_000, Some(0)).unwrap(), 0);
        assert!(resolve_approved_amount(12_000, Some(12_001)).is_err());
        assert!(resolve_approved_amount(12_000, Some(-1)).is_err());
    }

    #[test]
    fn final_amount_invariant() {
        for status in S::ALL {
            let expected = matches!(status, S::Approved | S::Paid);
            assert_eq!(check_final_amount_invariant(status, Some(1)), expected);
            assert_eq!(check_final_amount_invariant(status, None), !expected);
        }
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in S::ALL {
            assert_eq!(status.as_str().parse::<S>().unwrap(), status);
        }
        assert!("done".parse::<S>().is_err());
    }
}
