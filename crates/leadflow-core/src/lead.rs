use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Contacted,
    Qualified,
    Won,
    Lost,
    Refunded,
}

impl LeadStatus {
    pub const ALL: [LeadStatus; 6] = [
        Self::New,
        Self::Contacted,
        Self::Qualified,
        Self::Won,
        Self::Lost,
        Self::Refunded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Contacted => "contacted",
            Self::Qualified => "qualified",
            Self::Won => "won",
            Self::Lost => "lost",
            Self::Refunded => "refunded",
        }
    }

    /// Whether a lead may move from `self` to `next`.
    ///
    /// Refunds apply only to closed sales, and a refunded sale is final. A won
    /// lead cannot be won again, which would move its sale date.
    pub fn can_move_to(&self, next: LeadStatus) -> bool {
        match (self, next) {
            (Self::Refunded, _) => false,
            (Self::Won, Self::Won) => false,
            (Self::Won, Self::Refunded) => true,
            (_, Self::Refunded) => false,
            _ => true,
        }
    }

    /// Closed sales carry a sale date and feed incentive calculation.
    pub fn is_sale(&self) -> bool {
        matches!(self, Self::Won | Self::Refunded)
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "contacted" => Ok(Self::Contacted),
            "qualified" => Ok(Self::Qualified),
            "won" => Ok(Self::Won),
            "lost" => Ok(Self::Lost),
            "refunded" => Ok(Self::Refunded),
            _ => Err(CoreError::InvalidStatus {
                kind: "lead status",
                value: s.to_string(),
            }),
        }
    }
}

/// Customer review state attached to a lead.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    #[default]
    NotRequested,
    Requested,
    Positive,
    Negative,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRequested => "not_requested",
            Self::Requested => "requested",
            Self::Positive => "positive",
            Self::Negative => "negative",
        }
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_requested" => Ok(Self::NotRequested),
            "requested" => Ok(Self::Requested),
            "positive" => Ok(Self::Positive),
            "negative" => Ok(Self::Negative),
            _ => Err(CoreError::InvalidStatus {
                kind: "review status",
                value: s.to_string(),
            }),
        }
    }
}
