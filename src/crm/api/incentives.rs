use axum::extract::State;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use leadflow_core::{Action, IncentiveBreakdown, IncentiveStatus, Month, Scope};

use super::{ApiError, ApiJson, ApiPath, ApiQuery, ApiResponse, ApiResult, SharedState};
use crate::crm::auth::Identity;
use crate::crm::incentives::{self as workflow, CalculationOutcome};
use crate::crm::models::{IncentiveFilter, MonthlyIncentive};
use crate::crm::ws::{WsMessage, broadcast_message};
use crate::errors::CrmError;

#[derive(Debug, Default, Deserialize)]
pub struct IncentiveQuery {
    pub month: Option<Month>,
    pub status: Option<IncentiveStatus>,
    pub user_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PreviewQuery {
    pub user_id: Option<i64>,
    pub month: Option<Month>,
}

#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub user_id: i64,
    pub month: Month,
    #[serde(flatten)]
    pub breakdown: IncentiveBreakdown,
}

#[derive(Debug, Default, Deserialize)]
pub struct CalculateRequest {
    /// Defaults to the previous month.
    pub month: Option<Month>,
    /// Only this sales rep; every active sales rep when omitted.
    pub user_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApproveRequest {
    /// Amount to approve; the capped amount when omitted.
    pub amount: Option<i64>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct MarkPaidRequest {
    pub payment_reference: String,
}

fn current_month() -> Month {
    Month::of(Utc::now().date_naive())
}

/// The user an `Own`-scoped caller may act on is always themselves.
fn target_user(identity: &Identity, scope: Scope, requested: Option<i64>) -> Result<i64, ApiError> {
    match (scope, requested) {
        (Scope::Own, Some(id)) if id != identity.user_id => Err(ApiError::NotFound(format!(
            "User {} not found",
            id
        ))),
        (Scope::Own, _) => Ok(identity.user_id),
        (_, Some(id)) => Ok(id),
        (_, None) => Err(ApiError::BadRequest("user_id is required".into())),
    }
}

pub(super) async fn list_incentives(
    State(state): State<SharedState>,
    identity: Identity,
    ApiQuery(query): ApiQuery<IncentiveQuery>,
) -> ApiResult<Vec<MonthlyIncentive>> {
    let owner = identity.owner_filter(Action::ViewIncentives)?;
    let filter = IncentiveFilter {
        user_id: owner.or(query.user_id),
        month: query.month,
        status: query.status,
    };
    let org = identity.organization_id;
    let incentives = state
        .with_db(move |db| db.list_incentives(org, &filter).map_err(CrmError::Database))
        .await?;
    Ok(ApiResponse::ok(incentives))
}

pub(super) async fn preview_incentive(
    State(state): State<SharedState>,
    identity: Identity,
    ApiQuery(query): ApiQuery<PreviewQuery>,
) -> ApiResult<PreviewResponse> {
    let scope = identity.require(Action::ViewIncentives)?;
    let user_id = target_user(&identity, scope, query.user_id)?;
    let month = query.month.unwrap_or_else(current_month);
    let org = identity.organization_id;
    let defaults = state.default_rules.clone();
    let breakdown = state
        .with_db(move |db| workflow::preview(db, &defaults, org, user_id, month))
        .await?;
    Ok(ApiResponse::ok(PreviewResponse {
        user_id,
        month,
        breakdown,
    }))
}

pub(super) async fn calculate_incentives(
    State(state): State<SharedState>,
    identity: Identity,
    ApiJson(req): ApiJson<CalculateRequest>,
) -> ApiResult<Vec<CalculationOutcome>> {
    identity.require(Action::CalculateIncentives)?;
    let month = req.month.unwrap_or_else(|| current_month().previous());
    let org = identity.organization_id;
    let defaults = state.default_rules.clone();
    let outcomes = state
        .with_db(move |db| match req.user_id {
            Some(user_id) => {
                let incentive = workflow::calculate(db, &defaults, org, user_id, month)?;
                Ok(vec![CalculationOutcome::Calculated { incentive }])
            }
            None => workflow::calculate_all(db, &defaults, org, month),
        })
        .await?;
    for outcome in &outcomes {
        if let CalculationOutcome::Calculated { incentive } = outcome {
            broadcast_message(
                &state.events,
                org,
                &WsMessage::IncentiveCalculated {
                    incentive: incentive.clone(),
                },
            );
        }
    }
    Ok(ApiResponse::ok(outcomes))
}

pub(super) async fn get_incentive(
    State(state): State<SharedState>,
    identity: Identity,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<MonthlyIncentive> {
    let scope = identity.require(Action::ViewIncentives)?;
    let org = identity.organization_id;
    let incentive = state
        .with_db(move |db| {
            db.get_incentive(org, id)
                .map_err(CrmError::Database)?
                .filter(|i| scope != Scope::Own || i.user_id == identity.user_id)
                .ok_or_else(|| CrmError::not_found("Incentive", id))
        })
        .await?;
    Ok(ApiResponse::ok(incentive))
}

pub(super) async fn approve_incentive(
    State(state): State<SharedState>,
    identity: Identity,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<ApproveRequest>,
) -> ApiResult<MonthlyIncentive> {
    identity.require(Action::ApproveIncentives)?;
    let org = identity.organization_id;
    let reviewer = identity.user_id;
    let notes = req
        .notes
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());
    let incentive = state
        .with_db(move |db| workflow::approve(db, org, reviewer, id, req.amount, notes.as_deref()))
        .await?;
    broadcast_message(
        &state.events,
        org,
        &WsMessage::IncentiveApproved {
            incentive: incentive.clone(),
        },
    );
    Ok(ApiResponse::ok(incentive))
}

pub(super) async fn reject_incentive(
    State(state): State<SharedState>,
    identity: Identity,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<RejectRequest>,
) -> ApiResult<MonthlyIncentive> {
    identity.require(Action::ApproveIncentives)?;
    let org = identity.organization_id;
    let reviewer = identity.user_id;
    let incentive = state
        .with_db(move |db| workflow::reject(db, org, reviewer, id, &req.reason))
        .await?;
    broadcast_message(
        &state.events,
        org,
        &WsMessage::IncentiveRejected {
            incentive: incentive.clone(),
        },
    );
    Ok(ApiResponse::ok(incentive))
}

pub(super) async fn mark_incentive_paid(
    State(state): State<SharedState>,
    identity: Identity,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<MarkPaidRequest>,
) -> ApiResult<MonthlyIncentive> {
    identity.require(Action::MarkIncentivePaid)?;
    let org = identity.organization_id;
    let reviewer = identity.user_id;
    let incentive = state
        .with_db(move |db| workflow::mark_paid(db, org, reviewer, id, &req.payment_reference))
        .await?;
    broadcast_message(
        &state.events,
        org,
        &WsMessage::IncentivePaid {
            incentive: incentive.clone(),
        },
    );
    Ok(ApiResponse::ok(incentive))
}
