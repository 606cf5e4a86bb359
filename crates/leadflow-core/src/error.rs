//! Typed errors for the domain rules.

use thiserror::Error;

use crate::approval::{IncentiveEvent, IncentiveStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("Invalid month '{0}': expected YYYY-MM")]
    InvalidMonth(String),

    #[error("Invalid role '{0}'")]
    InvalidRole(String),

    #[error("Invalid {kind} '{value}'")]
    InvalidStatus { kind: &'static str, value: String },

    #[error("Cannot {event} an incentive in status {from}")]
    InvalidTransition {
        from: IncentiveStatus,
        event: IncentiveEvent,
    },

    #[error("Amount {amount} is outside the allowed range 0..={max}")]
    AmountOutOfRange { amount: i64, max: i64 },

    #[error("Invalid incentive rules: {0}")]
    InvalidRules(String),
}
