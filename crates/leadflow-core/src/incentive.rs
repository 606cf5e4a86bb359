//! Monthly incentive calculation.
//!
//! [`calculate_monthly_incentive`] is pure: it takes the rules in force, the
//! month, and the sales rep's closed sales, and returns the full breakdown.
//! Persistence and approval live elsewhere.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::lead::ReviewStatus;
use crate::money::{BPS_DENOMINATOR, apply_bps, clamp_to_i64, div_round};
use crate::month::Month;

/// A streak tier: a longest daily streak of at least `min_days` earns
/// `bonus_bps` of gross commission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreakTier {
    pub min_days: u32,
    pub bonus_bps: u32,
}

/// Business rules for a month's incentive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IncentiveRules {
    /// Commission on a sale whose category has no rate of its own.
    #[serde(default = "default_commission_bps")]
    pub commission_bps: u32,
    #[serde(default = "default_streak_tiers")]
    pub streak_tiers: Vec<StreakTier>,
    /// Positive reviews needed before any review bonus is paid.
    #[serde(default = "default_review_min_count")]
    pub review_min_count: u32,
    #[serde(default = "default_review_bonus_per_review")]
    pub review_bonus_per_review: i64,
    #[serde(default = "default_negative_review_penalty")]
    pub negative_review_penalty: i64,
    #[serde(default = "default_refund_penalty_bps")]
    pub refund_penalty_bps: u32,
    /// Upper bound on the payout. `None` leaves it uncapped.
    #[serde(default = "default_monthly_cap")]
    pub monthly_cap: Option<i64>,
}

fn default_commission_bps() -> u32 {
    500
}

fn default_streak_tiers() -> Vec<StreakTier> {
    vec![
        StreakTier {
            min_days: 3,
            bonus_bps: 500,
        },
        StreakTier {
            min_days: 7,
            bonus_bps: 1_000,
        },
    ]
}

fn default_review_min_count() -> u32 {
    3
}

fn default_review_bonus_per_review() -> i64 {
    10_000
}

fn default_negative_review_penalty() -> i64 {
    5_000
}

fn default_refund_penalty_bps() -> u32 {
    1_000
}

fn default_monthly_cap() -> Option<i64> {
    Some(5_000_000)
}

impl Default for IncentiveRules {
    fn default() -> Self {
        Self {
            commission_bps: default_commission_bps(),
            streak_tiers: default_streak_tiers(),
            review_min_count: default_review_min_count(),
            review_bonus_per_review: default_review_bonus_per_review(),
            negative_review_penalty: default_negative_review_penalty(),
            refund_penalty_bps: default_refund_penalty_bps(),
            monthly_cap: default_monthly_cap(),
        }
    }
}

impl IncentiveRules {
    pub fn validate(&self) -> Result<(), CoreError> {
        let max_bps = BPS_DENOMINATOR as u32;
        if self.commission_bps > max_bps {
            return Err(CoreError::InvalidRules(format!(
                "commission_bps {} exceeds {}",
                self.commission_bps, max_bps
            )));
        }
        if self.refund_penalty_bps > max_bps {
            return Err(CoreError::InvalidRules(format!(
                "refund_penalty_bps {} exceeds {}",
                self.refund_penalty_bps, max_bps
            )));
        }
        if self.review_bonus_per_review < 0 || self.negative_review_penalty < 0 {
            return Err(CoreError::InvalidRules(
                "bonus and penalty amounts must not be negative".into(),
            ));
        }
        if let Some(cap) = self.monthly_cap {
            if cap <= 0 {
                return Err(CoreError::InvalidRules(format!(
                    "monthly_cap must be positive, got {}",
                    cap
                )));
            }
        }
        if let Some(tier) = self.streak_tiers.iter().find(|t| t.min_days == 0) {
            return Err(CoreError::InvalidRules(format!(
                "streak tier with bonus {} bps has min_days = 0",
                tier.bonus_bps
            )));
        }
        Ok(())
    }

    /// Best tier reached by a streak of `days`.
    pub fn streak_tier(&self, days: u32) -> Option<&StreakTier> {
        self.streak_tiers
            .iter()
            .filter(|t| t.min_days <= days)
            .max_by_key(|t| (t.min_days, t.bonus_bps))
    }
}

/// One closed sale as seen by the calculator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SaleRecord {
    pub deal_size: i64,
    pub sale_date: NaiveDate,
    /// Category commission rate, if the category sets one.
    pub commission_bps: Option<u32>,
    pub review: ReviewStatus,
    pub refunded: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IncentiveBreakdown {
    pub sales_count: u32,
    pub gross_commission: i64,
    pub streak_days: u32,
    pub streak_bonus: i64,
    pub review_count: u32,
    pub review_bonus: i64,
    pub penalty_amount: i64,
    pub net_incentive: i64,
    pub capped_amount: i64,
}

pub fn calculate_monthly_incentive(
    rules: &IncentiveRules,
    month: Month,
    sales: &[SaleRecord],
) -> IncentiveBreakdown {
    let in_month: Vec<&SaleRecord> = sales
        .iter()
        .filter(|s| month.contains(s.sale_date))
        .collect();
    let (refunded, qualifying): (Vec<&SaleRecord>, Vec<&SaleRecord>) =
        in_month.into_iter().partition(|s| s.refunded);

    let weighted: i128 = qualifying
        .iter()
        .map(|s| s.deal_size as i128 * s.commission_bps.unwrap_or(rules.commission_bps) as i128)
        .sum();
    let gross_commission = div_round(weighted, BPS_DENOMINATOR as i128);

    let streak_days = longest_daily_streak(qualifying.iter().map(|s| s.sale_date));
    let streak_bonus = rules
        .streak_tier(streak_days)
        .map(|tier| apply_bps(gross_commission, tier.bonus_bps))
        .unwrap_or(0);

    let review_count = qualifying
        .iter()
        .filter(|s| s.review == ReviewStatus::Positive)
        .count() as u32;
    let review_bonus = if review_count > 0 && review_count >= rules.review_min_count {
        clamp_to_i64(review_count as i128 * rules.review_bonus_per_review as i128)
    } else {
        0
    };

    let negative_reviews = qualifying
        .iter()
        .filter(|s| s.review == ReviewStatus::Negative)
        .count() as i128;
    let refund_penalty: i128 = refunded
        .iter()
        .map(|s| apply_bps(s.deal_size, rules.refund_penalty_bps) as i128)
        .sum();
    let penalty_amount =
        clamp_to_i64(negative_reviews * rules.negative_review_penalty as i128 + refund_penalty);

    let net_incentive = clamp_to_i64(
        (gross_commission as i128 + streak_bonus as i128 + review_bonus as i128
            - penalty_amount as i128)
            .max(0),
    );
    let capped_amount = match rules.monthly_cap {
        Some(cap) => net_incentive.min(cap),
        None => net_incentive,
    };

    IncentiveBreakdown {
        sales_count: qualifying.len() as u32,
        gross_commission,
        streak_days,
        streak_bonus,
        review_count,
        review_bonus,
        penalty_amount,
        net_incentive,
        capped_amount,
    }
}

/// Length of the longest run of consecutive calendar days present in `dates`.
pub fn longest_daily_streak(dates: impl IntoIterator<Item = NaiveDate>) -> u32 {
    let days: BTreeSet<NaiveDate> = dates.into_iter().collect();
    let mut best = 0;
    let mut current = 0;
    let mut previous: Option<NaiveDate> = None;
    for day in days {
        current = match previous.and_then(|p| p.succ_opt()) {
            Some(expected) if expected == day => current + 1,
            _ => 1,
        };
        best = best.max(current);
        previous = Some(day);
    }
    best
}
