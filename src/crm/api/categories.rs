use axum::extract::State;
use serde::Deserialize;
use tracing::info;

use leadflow_core::Action;
use leadflow_core::money::BPS_DENOMINATOR;

use super::{
    ApiError, ApiJson, ApiPath, ApiQuery, ApiResponse, ApiResult, SharedState, double_option,
    required_text,
};
use crate::crm::auth::Identity;
use crate::crm::models::Category;
use crate::errors::CrmError;

#[derive(Debug, Default, Deserialize)]
pub struct CategoryQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateCategoryRequest {
    pub name: String,
    pub commission_bps: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCategoryRequest {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub commission_bps: Option<Option<u32>>,
    pub is_active: Option<bool>,
}

fn valid_bps(bps: Option<u32>) -> Result<Option<u32>, ApiError> {
    match bps {
        Some(b) if i64::from(b) > BPS_DENOMINATOR => Err(ApiError::BadRequest(format!(
            "commission_bps must be at most {}",
            BPS_DENOMINATOR
        ))),
        other => Ok(other),
    }
}

pub(super) async fn list_categories(
    State(state): State<SharedState>,
    identity: Identity,
    ApiQuery(query): ApiQuery<CategoryQuery>,
) -> ApiResult<Vec<Category>> {
    identity.require(Action::ViewCategories)?;
    // Inactive categories are only listed for those who can manage them.
    let include_inactive =
        query.include_inactive && identity.require(Action::ManageCategories).is_ok();
    let org = identity.organization_id;
    let categories = state
        .with_db(move |db| {
            db.list_categories(org, include_inactive)
                .map_err(CrmError::Database)
        })
        .await?;
    Ok(ApiResponse::ok(categories))
}

pub(super) async fn create_category(
    State(state): State<SharedState>,
    identity: Identity,
    ApiJson(req): ApiJson<CreateCategoryRequest>,
) -> ApiResult<Category> {
    identity.require(Action::ManageCategories)?;
    let name = required_text("name", &req.name)?;
    let bps = valid_bps(req.commission_bps)?;
    let org = identity.organization_id;
    let category = state
        .with_db(move |db| {
            db.create_category(org, &name, bps)
                .map_err(|e| CrmError::from_db(e, "A category with this name already exists"))
        })
        .await?;
    info!(category_id = category.id, "category created");
    Ok(ApiResponse::created(category))
}

pub(super) async fn update_category(
    State(state): State<SharedState>,
    identity: Identity,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<UpdateCategoryRequest>,
) -> ApiResult<Category> {
    identity.require(Action::ManageCategories)?;
    let name = req
        .name
        .as_deref()
        .map(|n| required_text("name", n))
        .transpose()?;
    let bps = req.commission_bps.map(valid_bps).transpose()?;
    let org = identity.organization_id;
    let category = state
        .with_db(move |db| {
            if db.get_category(org, id).map_err(CrmError::Database)?.is_none() {
                return Err(CrmError::not_found("Category", id));
            }
            db.update_category(org, id, name.as_deref(), bps, req.is_active)
                .map_err(|e| CrmError::from_db(e, "A category with this name already exists"))?
                .ok_or_else(|| CrmError::not_found("Category", id))
        })
        .await?;
    Ok(ApiResponse::ok(category))
}

/// Soft delete: the category stays referenced by existing leads.
pub(super) async fn delete_category(
    State(state): State<SharedState>,
    identity: Identity,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<Category> {
    identity.require(Action::ManageCategories)?;
    let org = identity.organization_id;
    let category = state
        .with_db(move |db| {
            if db.get_category(org, id).map_err(CrmError::Database)?.is_none() {
                return Err(CrmError::not_found("Category", id));
            }
            db.update_category(org, id, None, None, Some(false))
                .map_err(CrmError::Database)?
                .ok_or_else(|| CrmError::not_found("Category", id))
        })
        .await?;
    info!(category_id = id, "category deactivated");
    Ok(ApiResponse::ok(category))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::test_app;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_admin_manages_categories() {
        let app = test_app();
        let (status, created) = app
            .send(
                &app.admin,
                "POST",
                "/api/categories",
                Some(json!({"name": " SUVs ", "commission_bps": 700})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["data"]["name"], "SUVs");
        let uri = format!("/api/categories/{}", created["data"]["id"]);

        let (status, updated) = app
            .send(&app.admin, "PATCH", &uri, Some(json!({"commission_bps": null})))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(updated["data"]["commission_bps"].is_null());

        let (status, _) = app.send(&app.admin, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, listed) = app.send(&app.rep, "GET", "/api/categories", None).await;
        assert!(listed["data"].as_array().unwrap().is_empty());
        let (_, listed) = app
            .send(&app.admin, "GET", "/api/categories?include_inactive=true", None)
            .await;
        assert_eq!(listed["data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_name_is_bad_request() {
        let app = test_app();
        let body = json!({"name": "Sedans"});
        app.send(&app.admin, "POST", "/api/categories", Some(body.clone()))
            .await;
        let (status, json) = app
            .send(&app.admin, "POST", "/api/categories", Some(body))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("already exists"));
    }

    #[tokio::test]
    async fn test_manager_cannot_manage_categories() {
        let app = test_app();
        let (status, _) = app
            .send(&app.manager, "POST", "/api/categories", Some(json!({"name": "X"})))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_commission_above_full_rate_rejected() {
        let app = test_app();
        let (status, _) = app
            .send(
                &app.admin,
                "POST",
                "/api/categories",
                Some(json!({"name": "X", "commission_bps": 10001})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
