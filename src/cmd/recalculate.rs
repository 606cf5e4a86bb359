//! Month-start incentive run (`leadflow recalculate`).

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use leadflow::crm::incentives::{self, CalculationOutcome};
use leadflow::crm::server;
use leadflow_core::{IncentiveRules, Month};

/// Settings key recording the last month calculated for an organization.
pub fn last_recalculated_key(organization_id: i64) -> String {
    format!("last_recalculated_month.{}", organization_id)
}

pub fn cmd_recalculate(
    db_path: &std::path::Path,
    defaults: &IncentiveRules,
    organization_id: i64,
    month: Option<Month>,
    user_id: Option<i64>,
) -> Result<()> {
    defaults
        .validate()
        .context("Invalid [incentives] section in leadflow.toml")?;
    let db = server::open_database(db_path)?;
    let month = month.unwrap_or_else(|| Month::of(Utc::now().date_naive()).previous());

    let outcomes = match user_id {
        Some(user_id) => {
            let incentive = incentives::calculate(&db, defaults, organization_id, user_id, month)?;
            vec![CalculationOutcome::Calculated { incentive }]
        }
        None => incentives::calculate_all(&db, defaults, organization_id, month)?,
    };

    println!();
    println!("Incentives for organization {} ({})", organization_id, month);
    println!();
    if outcomes.is_empty() {
        println!("No active sales reps.");
    }
    let mut calculated = 0;
    let mut failed = 0;
    for outcome in &outcomes {
        match outcome {
            CalculationOutcome::Calculated { incentive } => {
                calculated += 1;
                println!(
                    "  user {:>6}  {:>4} sales  net {:>12}  payable {:>12}  {}",
                    incentive.user_id,
                    incentive.breakdown.sales_count,
                    incentive.breakdown.net_incentive,
                    incentive.breakdown.capped_amount,
                    incentive.status
                );
            }
            CalculationOutcome::Skipped { user_id, status } => {
                println!("  user {:>6}  skipped ({})", user_id, status);
            }
            CalculationOutcome::Failed { user_id, error } => {
                failed += 1;
                println!("  user {:>6}  FAILED: {}", user_id, error);
            }
        }
    }
    println!();
    if failed > 0 {
        anyhow::bail!("{} of {} sales reps failed to calculate", failed, outcomes.len());
    }

    db.set_setting(&last_recalculated_key(organization_id), &month.to_string())
        .context("Failed to record recalculation")?;
    info!(
        organization_id,
        %month,
        calculated,
        skipped = outcomes.len() - calculated,
        "recalculation finished"
    );
    Ok(())
}
