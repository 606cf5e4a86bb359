use axum::extract::State;
use chrono::Utc;
use serde::Deserialize;

use leadflow_core::{Action, Month, permission};

use super::{ApiQuery, ApiResponse, ApiResult, SharedState};
use crate::crm::auth::Identity;
use crate::crm::models::DashboardView;
use crate::errors::CrmError;

#[derive(Debug, Default, Deserialize)]
pub struct DashboardQuery {
    pub month: Option<Month>,
}

/// Monthly summary. Sales reps see only their own numbers; roles without
/// incentive access get no incentive totals.
pub(super) async fn get_dashboard(
    State(state): State<SharedState>,
    identity: Identity,
    ApiQuery(query): ApiQuery<DashboardQuery>,
) -> ApiResult<DashboardView> {
    let owner = identity.owner_filter(Action::ViewDashboard)?;
    let sees_incentives = permission(identity.role, Action::ViewIncentives).is_some();
    let month = query
        .month
        .unwrap_or_else(|| Month::of(Utc::now().date_naive()));
    let org = identity.organization_id;
    let view = state
        .with_db(move |db| {
            let leads_by_status = db
                .lead_status_counts(org, owner, month)
                .map_err(CrmError::Database)?;
            let (won_count, won_revenue) = db
                .won_totals(org, owner, month)
                .map_err(CrmError::Database)?;
            let incentives = if sees_incentives {
                db.incentive_totals(org, owner, month)
                    .map_err(CrmError::Database)?
            } else {
                Vec::new()
            };
            Ok(DashboardView {
                month,
                leads_by_status,
                won_count,
                won_revenue,
                incentives,
            })
        })
        .await?;
    Ok(ApiResponse::ok(view))
}
