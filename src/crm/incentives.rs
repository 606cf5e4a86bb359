//! Monthly incentive workflow: calculate, review, pay.
//!
//! Every function here runs synchronously against a `CrmDb` and is meant to be
//! called inside `DbHandle::call`, so one workflow step holds the connection
//! for its whole read-check-write sequence. State changes go through the
//! approval state machine first and are then written with a status-guarded
//! UPDATE.

use chrono::NaiveDate;
use tracing::{info, warn};

use leadflow_core::approval::{check_final_amount_invariant, resolve_approved_amount};
use leadflow_core::{
    IncentiveBreakdown, IncentiveEvent, IncentiveRules, IncentiveStatus, LeadStatus, Month, Role,
    SaleRecord, calculate_monthly_incentive,
};

use super::db::CrmDb;
use super::models::{Lead, MonthlyIncentive, Organization, SaleRow};
use crate::errors::{CrmError, CrmResult};

/// Result of calculating one sales rep's month as part of a batch.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CalculationOutcome {
    Calculated { incentive: MonthlyIncentive },
    Skipped { user_id: i64, status: IncentiveStatus },
    Failed { user_id: i64, error: String },
}

/// The organization's rule override, or `defaults` when it has none.
pub fn effective_rules(
    db: &CrmDb,
    organization_id: i64,
    defaults: &IncentiveRules,
) -> CrmResult<IncentiveRules> {
    let org = load_organization(db, organization_id)?;
    Ok(org.incentive_rules.unwrap_or_else(|| defaults.clone()))
}

fn load_organization(db: &CrmDb, organization_id: i64) -> CrmResult<Organization> {
    db.get_organization(organization_id)
        .map_err(CrmError::Database)?
        .ok_or_else(|| CrmError::not_found("Organization", organization_id))
}

fn parse_sale_date(lead_id: i64, sale_date: &str) -> CrmResult<NaiveDate> {
    NaiveDate::parse_from_str(sale_date, "%Y-%m-%d").map_err(|e| {
        anyhow::anyhow!("Lead {} has malformed sale_date '{}': {}", lead_id, sale_date, e).into()
    })
}

fn sale_records(rows: &[SaleRow]) -> CrmResult<Vec<SaleRecord>> {
    rows.iter()
        .map(|row| {
            let sale_date = parse_sale_date(row.lead_id, &row.sale_date)?;
            Ok(SaleRecord {
                deal_size: row.deal_size,
                sale_date,
                commission_bps: row.category_commission_bps,
                review: row.review_status,
                refunded: row.status == LeadStatus::Refunded,
            })
        })
        .collect()
}

fn ensure_sales_rep(db: &CrmDb, organization_id: i64, user_id: i64) -> CrmResult<()> {
    let user = db
        .get_user(organization_id, user_id)
        .map_err(CrmError::Database)?
        .ok_or_else(|| CrmError::not_found("User", user_id))?;
    if user.role != Role::SalesRep {
        return Err(CrmError::validation(format!(
            "User {} is a {}; incentives are calculated for sales reps only",
            user_id, user.role
        )));
    }
    Ok(())
}

/// Refuse to change sales dated in `month` once the rep's incentive for that
/// month is approved or paid.
pub fn ensure_month_open(db: &CrmDb, sales_rep_id: i64, month: Month) -> CrmResult<()> {
    match db
        .find_incentive(sales_rep_id, month)
        .map_err(CrmError::Database)?
    {
        Some(record) if record.status.is_locked() => Err(CrmError::validation(format!(
            "The {} incentive for user {} is {}; its sales can no longer change",
            month, sales_rep_id, record.status
        ))),
        _ => Ok(()),
    }
}

/// `ensure_month_open` for the month a closed sale counts in. Leads that are
/// not sales always pass.
pub fn ensure_sale_open(db: &CrmDb, lead: &Lead) -> CrmResult<()> {
    match (&lead.sale_date, lead.status.is_sale()) {
        (Some(sale_date), true) => {
            let date = parse_sale_date(lead.id, sale_date)?;
            ensure_month_open(db, lead.sales_rep_id, Month::of(date))
        }
        _ => Ok(()),
    }
}

/// Compute a month's breakdown without persisting anything.
pub fn preview(
    db: &CrmDb,
    defaults: &IncentiveRules,
    organization_id: i64,
    user_id: i64,
    month: Month,
) -> CrmResult<IncentiveBreakdown> {
    ensure_sales_rep(db, organization_id, user_id)?;
    let rules = effective_rules(db, organization_id, defaults)?;
    let rows = db
        .sales_for_month(organization_id, user_id, month)
        .map_err(CrmError::Database)?;
    Ok(calculate_monthly_incentive(&rules, month, &sale_records(&rows)?))
}

/// Calculate and persist a month's incentive, leaving it in `pending_review`.
///
/// A new record starts in `calculating`; an existing one must accept the
/// `Recalculate` event, which refuses approved and paid records.
pub fn calculate(
    db: &CrmDb,
    defaults: &IncentiveRules,
    organization_id: i64,
    user_id: i64,
    month: Month,
) -> CrmResult<MonthlyIncentive> {
    let breakdown = preview(db, defaults, organization_id, user_id, month)?;

    let id = match db.find_incentive(user_id, month).map_err(CrmError::Database)? {
        None => {
            db.insert_incentive(organization_id, user_id, month)
                .map_err(|e| {
                    CrmError::from_db(e, "An incentive for this user and month already exists")
                })?
                .id
        }
        Some(existing) => {
            existing.status.apply(IncentiveEvent::Recalculate)?;
            let from = IncentiveStatus::sources_for(IncentiveEvent::Recalculate);
            if !db.reset_incentive(existing.id, &from).map_err(CrmError::Database)? {
                return Err(concurrent_change(existing.id));
            }
            existing.id
        }
    };

    let next = IncentiveStatus::Calculating.apply(IncentiveEvent::Submit)?;
    if !db
        .store_breakdown(id, &breakdown, next)
        .map_err(CrmError::Database)?
    {
        return Err(concurrent_change(id));
    }

    info!(
        incentive_id = id,
        user_id,
        %month,
        capped_amount = breakdown.capped_amount,
        "incentive calculated"
    );
    load(db, organization_id, id)
}

/// Calculate the month for every active sales rep in the organization.
/// Reps whose record is already approved or paid are reported as skipped;
/// a rep whose calculation errors is reported as failed and the batch goes on.
pub fn calculate_all(
    db: &CrmDb,
    defaults: &IncentiveRules,
    organization_id: i64,
    month: Month,
) -> CrmResult<Vec<CalculationOutcome>> {
    load_organization(db, organization_id)?;
    let reps = db
        .list_active_sales_reps(organization_id)
        .map_err(CrmError::Database)?;
    let mut outcomes = Vec::with_capacity(reps.len());
    for rep in reps {
        let outcome = calculate_one(db, defaults, organization_id, rep.id, month)
            .unwrap_or_else(|e| {
                warn!(user_id = rep.id, %month, error = %e, "incentive calculation failed");
                CalculationOutcome::Failed {
                    user_id: rep.id,
                    error: e.to_string(),
                }
            });
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

fn calculate_one(
    db: &CrmDb,
    defaults: &IncentiveRules,
    organization_id: i64,
    user_id: i64,
    month: Month,
) -> CrmResult<CalculationOutcome> {
    let existing = db.find_incentive(user_id, month).map_err(CrmError::Database)?;
    if let Some(record) = existing.filter(|r| r.status.is_locked()) {
        return Ok(CalculationOutcome::Skipped {
            user_id,
            status: record.status,
        });
    }
    let incentive = calculate(db, defaults, organization_id, user_id, month)?;
    Ok(CalculationOutcome::Calculated { incentive })
}

pub fn approve(
    db: &CrmDb,
    organization_id: i64,
    reviewer_id: i64,
    id: i64,
    amount: Option<i64>,
    notes: Option<&str>,
) -> CrmResult<MonthlyIncentive> {
    let record = load_for_review(db, organization_id, reviewer_id, id)?;
    let next = record.status.apply(IncentiveEvent::Approve)?;
    let amount = resolve_approved_amount(record.breakdown.capped_amount, amount)?;
    ensure_invariant(next, Some(amount))?;

    let from = IncentiveStatus::sources_for(IncentiveEvent::Approve);
    if !db
        .record_approval(id, &from, reviewer_id, amount, notes)
        .map_err(CrmError::Database)?
    {
        return Err(concurrent_change(id));
    }
    info!(incentive_id = id, reviewer_id, amount, "incentive approved");
    load(db, organization_id, id)
}

pub fn reject(
    db: &CrmDb,
    organization_id: i64,
    reviewer_id: i64,
    id: i64,
    reason: &str,
) -> CrmResult<MonthlyIncentive> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(CrmError::validation("A rejection reason is required"));
    }
    let record = load_for_review(db, organization_id, reviewer_id, id)?;
    let next = record.status.apply(IncentiveEvent::Reject)?;
    ensure_invariant(next, None)?;

    let from = IncentiveStatus::sources_for(IncentiveEvent::Reject);
    if !db
        .record_rejection(id, &from, reviewer_id, reason)
        .map_err(CrmError::Database)?
    {
        return Err(concurrent_change(id));
    }
    info!(incentive_id = id, reviewer_id, "incentive rejected");
    load(db, organization_id, id)
}

pub fn mark_paid(
    db: &CrmDb,
    organization_id: i64,
    reviewer_id: i64,
    id: i64,
    payment_reference: &str,
) -> CrmResult<MonthlyIncentive> {
    let payment_reference = payment_reference.trim();
    if payment_reference.is_empty() {
        return Err(CrmError::validation("A payment reference is required"));
    }
    let record = load_for_review(db, organization_id, reviewer_id, id)?;
    let next = record.status.apply(IncentiveEvent::MarkPaid)?;
    ensure_invariant(next, record.final_approved_amount)?;

    let from = IncentiveStatus::sources_for(IncentiveEvent::MarkPaid);
    if !db
        .record_payment(id, &from, payment_reference)
        .map_err(CrmError::Database)?
    {
        return Err(concurrent_change(id));
    }
    info!(incentive_id = id, reviewer_id, payment_reference, "incentive paid");
    load(db, organization_id, id)
}

fn load(db: &CrmDb, organization_id: i64, id: i64) -> CrmResult<MonthlyIncentive> {
    db.get_incentive(organization_id, id)
        .map_err(CrmError::Database)?
        .ok_or_else(|| CrmError::not_found("Incentive", id))
}

fn load_for_review(
    db: &CrmDb,
    organization_id: i64,
    reviewer_id: i64,
    id: i64,
) -> CrmResult<MonthlyIncentive> {
    let record = load(db, organization_id, id)?;
    if record.user_id == reviewer_id {
        return Err(CrmError::forbidden("You cannot review your own incentive"));
    }
    Ok(record)
}

fn ensure_invariant(status: IncentiveStatus, final_amount: Option<i64>) -> CrmResult<()> {
    if check_final_amount_invariant(status, final_amount) {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "Refusing to write status {} with final amount {:?}",
            status,
            final_amount
        )
        .into())
    }
}

fn concurrent_change(id: i64) -> CrmError {
    CrmError::validation(format!(
        "Incentive {} was modified by another request; reload and retry",
        id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::models::NewLead;
    use leadflow_core::{CoreError, ReviewStatus, Role};

    struct Fixture {
        db: CrmDb,
        org: i64,
        rep: i64,
        manager: i64,
    }

    fn fixture() -> Fixture {
        let db = CrmDb::new_in_memory().unwrap();
        let org = db.create_organization("Acme").unwrap().id;
        let rep = db
            .create_user(org, "Asha", "+919800000001", None, Role::SalesRep)
            .unwrap()
            .id;
        let manager = db
            .create_user(org, "Meera", "+919800000002", None, Role::Manager)
            .unwrap()
            .id;
        Fixture { db, org, rep, manager }
    }

    fn june() -> Month {
        "2024-06".parse().unwrap()
    }

    fn won_sale(f: &Fixture, deal_size: i64, date: &str, review: ReviewStatus) -> i64 {
        let lead = f
            .db
            .create_lead(
                f.org,
                &NewLead {
                    sales_rep_id: f.rep,
                    customer_name: "Customer".into(),
                    customer_phone: "9811111111".into(),
                    deal_size,
                    ..NewLead::default()
                },
            )
            .unwrap();
        f.db
            .set_lead_status(f.org, lead.id, LeadStatus::Won, Some(date))
            .unwrap();
        f.db.set_review_status(f.org, lead.id, review).unwrap();
        lead.id
    }

    #[test]
    fn zero_sales_month_calculates_to_zero() {
        let f = fixture();
        let inc = calculate(&f.db, &IncentiveRules::default(), f.org, f.rep, june()).unwrap();
        assert_eq!(inc.status, IncentiveStatus::PendingReview);
        assert_eq!(inc.breakdown.gross_commission, 0);
        assert_eq!(inc.breakdown.capped_amount, 0);
        assert!(inc.final_approved_amount.is_none());
    }

    #[test]
    fn calculation_uses_default_commission_rate() {
        let f = fixture();
        won_sale(&f, 200_000, "2024-06-10", ReviewStatus::NotRequested);
        let inc = calculate(&f.db, &IncentiveRules::default(), f.org, f.rep, june()).unwrap();
        // 5% of 200_000
        assert_eq!(inc.breakdown.gross_commission, 10_000);
        assert_eq!(inc.breakdown.sales_count, 1);
    }

    #[test]
    fn organization_override_replaces_defaults() {
        let f = fixture();
        won_sale(&f, 200_000, "2024-06-10", ReviewStatus::NotRequested);
        let rules = IncentiveRules {
            commission_bps: 1_000,
            ..IncentiveRules::default()
        };
        f.db.set_incentive_rules(f.org, Some(&rules)).unwrap();
        let breakdown = preview(&f.db, &IncentiveRules::default(), f.org, f.rep, june()).unwrap();
        assert_eq!(breakdown.gross_commission, 20_000);
        // Preview does not persist.
        assert!(f.db.find_incentive(f.rep, june()).unwrap().is_none());
    }

    #[test]
    fn full_lifecycle_to_paid() {
        let f = fixture();
        won_sale(&f, 100_000, "2024-06-03", ReviewStatus::Positive);
        let inc = calculate(&f.db, &IncentiveRules::default(), f.org, f.rep, june()).unwrap();

        let approved = approve(&f.db, f.org, f.manager, inc.id, None, Some("looks right")).unwrap();
        assert_eq!(approved.status, IncentiveStatus::Approved);
        assert_eq!(approved.final_approved_amount, Some(inc.breakdown.capped_amount));
        assert_eq!(approved.review_notes.as_deref(), Some("looks right"));

        let paid = mark_paid(&f.db, f.org, f.manager, inc.id, "UTR-991").unwrap();
        assert_eq!(paid.status, IncentiveStatus::Paid);
        assert_eq!(paid.final_approved_amount, approved.final_approved_amount);
    }

    #[test]
    fn approve_with_override_amount_within_cap() {
        let f = fixture();
        won_sale(&f, 100_000, "2024-06-03", ReviewStatus::NotRequested);
        let inc = calculate(&f.db, &IncentiveRules::default(), f.org, f.rep, june()).unwrap();
        let over = approve(&f.db, f.org, f.manager, inc.id, Some(inc.breakdown.capped_amount + 1), None);
        assert!(matches!(
            over,
            Err(CrmError::Core(CoreError::AmountOutOfRange { .. }))
        ));
        let approved = approve(&f.db, f.org, f.manager, inc.id, Some(1_000), None).unwrap();
        assert_eq!(approved.final_approved_amount, Some(1_000));
    }

    #[test]
    fn reviewer_cannot_review_own_incentive() {
        let f = fixture();
        let inc = calculate(&f.db, &IncentiveRules::default(), f.org, f.rep, june()).unwrap();
        let result = approve(&f.db, f.org, f.rep, inc.id, None, None);
        assert!(matches!(result, Err(CrmError::Forbidden(_))));
    }

    #[test]
    fn mark_paid_requires_approval() {
        let f = fixture();
        let inc = calculate(&f.db, &IncentiveRules::default(), f.org, f.rep, june()).unwrap();
        let result = mark_paid(&f.db, f.org, f.manager, inc.id, "UTR-1");
        assert!(matches!(
            result,
            Err(CrmError::Core(CoreError::InvalidTransition { .. }))
        ));
        let unchanged = f.db.get_incentive(f.org, inc.id).unwrap().unwrap();
        assert_eq!(unchanged.status, IncentiveStatus::PendingReview);
    }

    #[test]
    fn rejected_incentive_can_be_recalculated() {
        let f = fixture();
        let inc = calculate(&f.db, &IncentiveRules::default(), f.org, f.rep, june()).unwrap();
        let rejected = reject(&f.db, f.org, f.manager, inc.id, "missing sale").unwrap();
        assert_eq!(rejected.status, IncentiveStatus::Rejected);
        assert_eq!(rejected.review_notes.as_deref(), Some("missing sale"));

        won_sale(&f, 100_000, "2024-06-20", ReviewStatus::NotRequested);
        let again = calculate(&f.db, &IncentiveRules::default(), f.org, f.rep, june()).unwrap();
        assert_eq!(again.id, inc.id);
        assert_eq!(again.status, IncentiveStatus::PendingReview);
        assert_eq!(again.breakdown.sales_count, 1);
        assert!(again.review_notes.is_none());
    }

    #[test]
    fn approved_incentive_cannot_be_recalculated() {
        let f = fixture();
        let inc = calculate(&f.db, &IncentiveRules::default(), f.org, f.rep, june()).unwrap();
        approve(&f.db, f.org, f.manager, inc.id, None, None).unwrap();
        let result = calculate(&f.db, &IncentiveRules::default(), f.org, f.rep, june());
        assert!(matches!(
            result,
            Err(CrmError::Core(CoreError::InvalidTransition { .. }))
        ));
    }

    #[test]
    fn calculate_all_skips_locked_records() {
        let f = fixture();
        let second = f
            .db
            .create_user(f.org, "Ravi", "+919800000003", None, Role::SalesRep)
            .unwrap()
            .id;
        let first = calculate(&f.db, &IncentiveRules::default(), f.org, f.rep, june()).unwrap();
        approve(&f.db, f.org, f.manager, first.id, None, None).unwrap();

        let outcomes = calculate_all(&f.db, &IncentiveRules::default(), f.org, june()).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().any(|o| matches!(
            o,
            CalculationOutcome::Skipped { user_id, status: IncentiveStatus::Approved } if *user_id == f.rep
        )));
        assert!(outcomes.iter().any(|o| matches!(
            o,
            CalculationOutcome::Calculated { incentive } if incentive.user_id == second
        )));
    }

    #[test]
    fn calculate_all_reports_failed_rep_and_continues() {
        let f = fixture();
        let second = f
            .db
            .create_user(f.org, "Ravi", "+919800000003", None, Role::SalesRep)
            .unwrap()
            .id;
        won_sale(&f, 100_000, "2024-06-10", ReviewStatus::NotRequested);
        let broken = f
            .db
            .create_lead(
                f.org,
                &NewLead {
                    sales_rep_id: second,
                    customer_name: "Customer".into(),
                    customer_phone: "9811111112".into(),
                    deal_size: 50_000,
                    ..NewLead::default()
                },
            )
            .unwrap();
        f.db
            .set_lead_status(f.org, broken.id, LeadStatus::Won, Some("2024-06-1x"))
            .unwrap();

        let outcomes = calculate_all(&f.db, &IncentiveRules::default(), f.org, june()).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().any(|o| matches!(
            o,
            CalculationOutcome::Failed { user_id, error } if *user_id == second && error.contains("2024-06-1x")
        )));
        assert!(outcomes.iter().any(|o| matches!(
            o,
            CalculationOutcome::Calculated { incentive } if incentive.user_id == f.rep
        )));
        assert!(f.db.find_incentive(second, june()).unwrap().is_none());
    }

    #[test]
    fn incentives_are_for_sales_reps_only() {
        let f = fixture();
        let result = calculate(&f.db, &IncentiveRules::default(), f.org, f.manager, june());
        assert!(matches!(result, Err(CrmError::Validation(msg)) if msg.contains("sales reps only")));
        assert!(f.db.find_incentive(f.manager, june()).unwrap().is_none());

        let result = preview(&f.db, &IncentiveRules::default(), f.org, f.rep + 100, june());
        assert!(matches!(result, Err(CrmError::NotFound { entity: "User", .. })));
    }

    #[test]
    fn locked_month_freezes_its_sales() {
        let f = fixture();
        let lead_id = won_sale(&f, 100_000, "2024-06-10", ReviewStatus::NotRequested);
        let lead = f.db.get_lead(f.org, lead_id).unwrap().unwrap();
        assert!(ensure_sale_open(&f.db, &lead).is_ok());

        let inc = calculate(&f.db, &IncentiveRules::default(), f.org, f.rep, june()).unwrap();
        // Pending review is still open to change.
        assert!(ensure_sale_open(&f.db, &lead).is_ok());
        approve(&f.db, f.org, f.manager, inc.id, None, None).unwrap();
        assert!(matches!(
            ensure_sale_open(&f.db, &lead),
            Err(CrmError::Validation(msg)) if msg.contains("approved")
        ));
        assert!(ensure_month_open(&f.db, f.rep, "2024-07".parse().unwrap()).is_ok());
    }

    #[test]
    fn calculate_all_unknown_organization() {
        let f = fixture();
        let result = calculate_all(&f.db, &IncentiveRules::default(), f.org + 100, june());
        assert!(matches!(
            result,
            Err(CrmError::NotFound { entity: "Organization", .. })
        ));
    }

    #[test]
    fn reject_requires_reason() {
        let f = fixture();
        let inc = calculate(&f.db, &IncentiveRules::default(), f.org, f.rep, june()).unwrap();
        let result = reject(&f.db, f.org, f.manager, inc.id, "   ");
        assert!(matches!(result, Err(CrmError::Validation(_))));
    }

    #[test]
    fn other_organization_sees_not_found() {
        let f = fixture();
        let inc = calculate(&f.db, &IncentiveRules::default(), f.org, f.rep, june()).unwrap();
        let other = f.db.create_organization("Other").unwrap().id;
        let result = approve(&f.db, other, f.manager, inc.id, None, None);
        assert!(matches!(result, Err(CrmError::NotFound { .. })));
    }

    #[test]
    fn refunded_sale_adds_penalty() {
        let f = fixture();
        let kept = won_sale(&f, 1_000_000, "2024-06-01", ReviewStatus::NotRequested);
        let refunded = won_sale(&f, 100_000, "2024-06-02", ReviewStatus::NotRequested);
        f.db
            .set_lead_status(f.org, refunded, LeadStatus::Refunded, Some("2024-06-02"))
            .unwrap();
        let breakdown = preview(&f.db, &IncentiveRules::default(), f.org, f.rep, june()).unwrap();
        assert_eq!(breakdown.sales_count, 1);
        assert_eq!(breakdown.gross_commission, 50_000);
        // 10% of the refunded deal
        assert_eq!(breakdown.penalty_amount, 10_000);
        assert!(kept > 0);
    }
}
