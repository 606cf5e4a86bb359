use axum::extract::State;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use tracing::info;

use leadflow_core::{Action, LeadStatus, Month, ReviewStatus, Role, Scope, permission};

use super::{
    ApiError, ApiJson, ApiPath, ApiQuery, ApiResponse, ApiResult, SharedState, double_option,
    required_text, valid_deal_size, valid_phone,
};
use crate::crm::auth::Identity;
use crate::crm::db::CrmDb;
use crate::crm::incentives::{ensure_month_open, ensure_sale_open};
use crate::crm::models::{Lead, LeadFilter, LeadUpdate, NewLead};
use crate::crm::ws::{WsMessage, broadcast_message};
use crate::errors::{CrmError, CrmResult};

const MAX_PAGE: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct LeadQuery {
    pub status: Option<LeadStatus>,
    pub sales_rep_id: Option<i64>,
    pub category_id: Option<i64>,
    pub month: Option<Month>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateLeadRequest {
    pub customer_name: String,
    pub customer_phone: String,
    #[serde(default)]
    pub deal_size: i64,
    pub category_id: Option<i64>,
    /// Defaults to the caller when the caller is a sales rep.
    pub sales_rep_id: Option<i64>,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateLeadRequest {
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub deal_size: Option<i64>,
    #[serde(default, deserialize_with = "double_option")]
    pub category_id: Option<Option<i64>>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: LeadStatus,
    /// Closing date for a won lead; today when omitted.
    pub sale_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateReviewRequest {
    pub review_status: ReviewStatus,
}

/// Load a lead the caller may see. Leads owned by another rep are reported
/// as missing to `Own`-scoped callers.
fn load_visible(db: &CrmDb, identity: &Identity, scope: Scope, id: i64) -> CrmResult<Lead> {
    let lead = db
        .get_lead(identity.organization_id, id)
        .map_err(CrmError::Database)?
        .ok_or_else(|| CrmError::not_found("Lead", id))?;
    if scope == Scope::Own && lead.sales_rep_id != identity.user_id {
        return Err(CrmError::not_found("Lead", id));
    }
    Ok(lead)
}

fn check_sales_rep(db: &CrmDb, organization_id: i64, sales_rep_id: i64) -> CrmResult<()> {
    let user = db
        .get_user(organization_id, sales_rep_id)
        .map_err(CrmError::Database)?
        .ok_or_else(|| CrmError::validation(format!("Sales rep {} does not exist", sales_rep_id)))?;
    if user.role != Role::SalesRep || !user.is_active {
        return Err(CrmError::validation(format!(
            "User {} is not an active sales rep",
            sales_rep_id
        )));
    }
    Ok(())
}

fn check_category(db: &CrmDb, organization_id: i64, category_id: i64) -> CrmResult<()> {
    match db
        .get_category(organization_id, category_id)
        .map_err(CrmError::Database)?
    {
        Some(category) if category.is_active => Ok(()),
        _ => Err(CrmError::validation(format!(
            "Category {} does not exist or is inactive",
            category_id
        ))),
    }
}

pub(super) async fn list_leads(
    State(state): State<SharedState>,
    identity: Identity,
    ApiQuery(query): ApiQuery<LeadQuery>,
) -> ApiResult<Vec<Lead>> {
    let owner = identity.owner_filter(Action::ViewLeads)?;
    let filter = LeadFilter {
        sales_rep_id: owner.or(query.sales_rep_id),
        status: query.status,
        category_id: query.category_id,
        month: query.month,
        limit: Some(query.limit.unwrap_or(100).clamp(1, MAX_PAGE)),
    };
    let org = identity.organization_id;
    let leads = state
        .with_db(move |db| db.list_leads(org, &filter).map_err(CrmError::Database))
        .await?;
    Ok(ApiResponse::ok(leads))
}

pub(super) async fn create_lead(
    State(state): State<SharedState>,
    identity: Identity,
    ApiJson(req): ApiJson<CreateLeadRequest>,
) -> ApiResult<Lead> {
    let scope = identity.require(Action::CreateLead)?;
    let sales_rep_id = match (scope, req.sales_rep_id) {
        (Scope::Own, Some(id)) if id != identity.user_id => {
            return Err(ApiError::Forbidden(
                "Sales reps can only create leads for themselves".into(),
            ));
        }
        (Scope::Own, _) => identity.user_id,
        (_, Some(id)) => id,
        (_, None) if identity.role == Role::SalesRep => identity.user_id,
        (_, None) => return Err(ApiError::BadRequest("sales_rep_id is required".into())),
    };
    let new_lead = NewLead {
        sales_rep_id,
        category_id: req.category_id,
        customer_name: required_text("customer_name", &req.customer_name)?,
        customer_phone: valid_phone("customer_phone", &req.customer_phone)?,
        deal_size: valid_deal_size(req.deal_size)?,
        notes: req.notes.trim().to_string(),
    };

    let org = identity.organization_id;
    let lead = state
        .with_db(move |db| {
            check_sales_rep(db, org, new_lead.sales_rep_id)?;
            if let Some(category_id) = new_lead.category_id {
                check_category(db, org, category_id)?;
            }
            db.create_lead(org, &new_lead).map_err(CrmError::Database)
        })
        .await?;
    info!(lead_id = lead.id, sales_rep_id = lead.sales_rep_id, "lead created");
    broadcast_message(&state.events, org, &WsMessage::LeadCreated { lead: lead.clone() });
    Ok(ApiResponse::created(lead))
}

pub(super) async fn get_lead(
    State(state): State<SharedState>,
    identity: Identity,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<Lead> {
    let scope = identity.require(Action::ViewLeads)?;
    let lead = state
        .with_db(move |db| load_visible(db, &identity, scope, id))
        .await?;
    Ok(ApiResponse::ok(lead))
}

pub(super) async fn update_lead(
    State(state): State<SharedState>,
    identity: Identity,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<UpdateLeadRequest>,
) -> ApiResult<Lead> {
    let scope = identity.require(Action::UpdateLead)?;
    let update = LeadUpdate {
        category_id: req.category_id,
        customer_name: req
            .customer_name
            .as_deref()
            .map(|v| required_text("customer_name", v))
            .transpose()?,
        customer_phone: req
            .customer_phone
            .as_deref()
            .map(|v| valid_phone("customer_phone", v))
            .transpose()?,
        deal_size: req.deal_size.map(valid_deal_size).transpose()?,
        notes: req.notes.map(|n| n.trim().to_string()),
    };

    let org = identity.organization_id;
    let lead = state
        .with_db(move |db| {
            let current = load_visible(db, &identity, scope, id)?;
            if update.deal_size.is_some() || update.category_id.is_some() {
                ensure_sale_open(db, &current)?;
            }
            if let Some(Some(category_id)) = update.category_id {
                check_category(db, org, category_id)?;
            }
            db.update_lead(org, id, &update)
                .map_err(CrmError::Database)?
                .ok_or_else(|| CrmError::not_found("Lead", id))
        })
        .await?;
    broadcast_message(&state.events, org, &WsMessage::LeadUpdated { lead: lead.clone() });
    Ok(ApiResponse::ok(lead))
}

pub(super) async fn update_lead_status(
    State(state): State<SharedState>,
    identity: Identity,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<UpdateStatusRequest>,
) -> ApiResult<Lead> {
    let scope = identity.require(Action::UpdateLead)?;
    let org = identity.organization_id;
    let next = req.status;
    let today = Utc::now().date_naive();
    let lead = state
        .with_db(move |db| {
            let current = load_visible(db, &identity, scope, id)?;
            if !current.status.can_move_to(next) {
                return Err(CrmError::validation(format!(
                    "Cannot move a lead from {} to {}",
                    current.status, next
                )));
            }
            ensure_sale_open(db, &current)?;
            let sale_date = match next {
                LeadStatus::Won => {
                    let date = req.sale_date.unwrap_or(today);
                    ensure_month_open(db, current.sales_rep_id, Month::of(date))?;
                    Some(date.to_string())
                }
                LeadStatus::Refunded => current.sale_date.clone(),
                _ => None,
            };
            db.set_lead_status(org, id, next, sale_date.as_deref())
                .map_err(CrmError::Database)?
                .ok_or_else(|| CrmError::not_found("Lead", id))
        })
        .await?;
    info!(lead_id = id, status = %next, "lead status changed");
    broadcast_message(&state.events, org, &WsMessage::LeadUpdated { lead: lead.clone() });
    Ok(ApiResponse::ok(lead))
}

/// Positive and negative reviews feed the incentive calculation.
fn is_outcome(review: ReviewStatus) -> bool {
    matches!(review, ReviewStatus::Positive | ReviewStatus::Negative)
}

pub(super) async fn update_lead_review(
    State(state): State<SharedState>,
    identity: Identity,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<UpdateReviewRequest>,
) -> ApiResult<Lead> {
    let scope = identity.require(Action::UpdateLead)?;
    if is_outcome(req.review_status) {
        identity.require(Action::RecordReview)?;
    }
    let can_record = permission(identity.role, Action::RecordReview).is_some();
    let org = identity.organization_id;
    let lead = state
        .with_db(move |db| {
            let current = load_visible(db, &identity, scope, id)?;
            if is_outcome(current.review_status) && !can_record {
                return Err(CrmError::forbidden(format!(
                    "Lead {} already has a {} review",
                    id, current.review_status
                )));
            }
            ensure_sale_open(db, &current)?;
            db.set_review_status(org, id, req.review_status)
                .map_err(CrmError::Database)?
                .ok_or_else(|| CrmError::not_found("Lead", id))
        })
        .await?;
    broadcast_message(&state.events, org, &WsMessage::LeadUpdated { lead: lead.clone() });
    Ok(ApiResponse::ok(lead))
}

pub(super) async fn delete_lead(
    State(state): State<SharedState>,
    identity: Identity,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<serde_json::Value> {
    let scope = identity.require(Action::DeleteLead)?;
    let org = identity.organization_id;
    let lead = state
        .with_db(move |db| {
            let lead = load_visible(db, &identity, scope, id)?;
            ensure_sale_open(db, &lead)?;
            db.delete_lead(org, id).map_err(CrmError::Database)?;
            Ok(lead)
        })
        .await?;
    info!(lead_id = id, "lead deleted");
    broadcast_message(
        &state.events,
        org,
        &WsMessage::LeadDeleted {
            lead_id: id,
            sales_rep_id: lead.sales_rep_id,
        },
    );
    Ok(ApiResponse::ok(serde_json::json!({ "id": id, "deleted": true })))
}
