use axum::extract::State;
use serde::{Deserialize, Serialize};
use tracing::info;

use leadflow_core::{Action, IncentiveRules};

use super::{ApiJson, ApiResponse, ApiResult, SharedState, required_text, valid_phone};
use crate::crm::auth::Identity;
use crate::crm::models::{Organization, User};
use crate::errors::{CrmError, CrmResult};

#[derive(Debug, Deserialize)]
pub struct NewAdmin {
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrganizationRequest {
    pub name: String,
    /// First admin of the new organization.
    pub admin: Option<NewAdmin>,
}

#[derive(Debug, Serialize)]
pub struct CreatedOrganization {
    pub organization: Organization,
    pub admin: Option<User>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateOrganizationRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct OrganizationSettings {
    pub incentive_rules: IncentiveRules,
    /// False when the organization overrides the service defaults.
    pub uses_defaults: bool,
}

fn load_org(db: &crate::crm::db::CrmDb, id: i64) -> CrmResult<Organization> {
    db.get_organization(id)
        .map_err(CrmError::Database)?
        .ok_or_else(|| CrmError::not_found("Organization", id))
}

fn settings_for(org: &Organization, defaults: &IncentiveRules) -> OrganizationSettings {
    OrganizationSettings {
        incentive_rules: org
            .incentive_rules
            .clone()
            .unwrap_or_else(|| defaults.clone()),
        uses_defaults: org.incentive_rules.is_none(),
    }
}

pub(super) async fn create_organization(
    State(state): State<SharedState>,
    identity: Identity,
    ApiJson(req): ApiJson<CreateOrganizationRequest>,
) -> ApiResult<CreatedOrganization> {
    identity.require(Action::CreateOrganization)?;
    let name = required_text("name", &req.name)?;
    let admin = match req.admin {
        Some(a) => Some((
            required_text("admin.name", &a.name)?,
            valid_phone("admin.phone", &a.phone)?,
            a.email.map(|e| e.trim().to_string()).filter(|e| !e.is_empty()),
        )),
        None => None,
    };
    let created = state
        .with_db(move |db| {
            let admin = admin.as_ref().map(|(admin_name, phone, email)| {
                (admin_name.as_str(), phone.as_str(), email.as_deref())
            });
            let (organization, admin) = db
                .create_organization_with_admin(&name, admin)
                .map_err(CrmError::Database)?;
            Ok(CreatedOrganization {
                organization,
                admin,
            })
        })
        .await?;
    info!(organization_id = created.organization.id, "organization created");
    Ok(ApiResponse::created(created))
}

pub(super) async fn get_organization(
    State(state): State<SharedState>,
    identity: Identity,
) -> ApiResult<Organization> {
    identity.require(Action::ViewOrganization)?;
    let org_id = identity.organization_id;
    let org = state.with_db(move |db| load_org(db, org_id)).await?;
    Ok(ApiResponse::ok(org))
}

pub(super) async fn update_organization(
    State(state): State<SharedState>,
    identity: Identity,
    ApiJson(req): ApiJson<UpdateOrganizationRequest>,
) -> ApiResult<Organization> {
    identity.require(Action::ManageOrganization)?;
    let name = required_text("name", &req.name)?;
    let org_id = identity.organization_id;
    let org = state
        .with_db(move |db| {
            load_org(db, org_id)?;
            db.rename_organization(org_id, &name)
                .map_err(CrmError::Database)?
                .ok_or_else(|| CrmError::not_found("Organization", org_id))
        })
        .await?;
    Ok(ApiResponse::ok(org))
}

pub(super) async fn get_settings(
    State(state): State<SharedState>,
    identity: Identity,
) -> ApiResult<OrganizationSettings> {
    identity.require(Action::ViewOrganization)?;
    let org_id = identity.organization_id;
    let org = state.with_db(move |db| load_org(db, org_id)).await?;
    Ok(ApiResponse::ok(settings_for(&org, &state.default_rules)))
}

pub(super) async fn put_settings(
    State(state): State<SharedState>,
    identity: Identity,
    ApiJson(rules): ApiJson<IncentiveRules>,
) -> ApiResult<OrganizationSettings> {
    identity.require(Action::ManageOrganization)?;
    rules.validate().map_err(CrmError::from)?;
    let org_id = identity.organization_id;
    let org = state
        .with_db(move |db| {
            load_org(db, org_id)?;
            db.set_incentive_rules(org_id, Some(&rules))
                .map_err(CrmError::Database)?
                .ok_or_else(|| CrmError::not_found("Organization", org_id))
        })
        .await?;
    info!(organization_id = org_id, "incentive rules overridden");
    Ok(ApiResponse::ok(settings_for(&org, &state.default_rules)))
}

pub(super) async fn reset_settings(
    State(state): State<SharedState>,
    identity: Identity,
) -> ApiResult<OrganizationSettings> {
    identity.require(Action::ManageOrganization)?;
    let org_id = identity.organization_id;
    let org = state
        .with_db(move |db| {
            load_org(db, org_id)?;
            db.set_incentive_rules(org_id, None)
                .map_err(CrmError::Database)?
                .ok_or_else(|| CrmError::not_found("Organization", org_id))
        })
        .await?;
    info!(organization_id = org_id, "incentive rules reset to defaults");
    Ok(ApiResponse::ok(settings_for(&org, &state.default_rules)))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::test_app;
    use crate::crm::models::User;
    use axum::http::StatusCode;
    use leadflow_core::Role;
    use serde_json::json;

    #[tokio::test]
    async fn test_only_super_admin_creates_organizations() {
        let app = test_app();
        let body = json!({"name": "Beta Cars", "admin": {"name": "Ira", "phone": "+919600000001"}});
        let (status, _) = app
            .send(&app.admin, "POST", "/api/organizations", Some(body.clone()))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let root = User {
            role: Role::SuperAdmin,
            ..app.admin.clone()
        };
        let (status, json) = app
            .send(&root, "POST", "/api/organizations", Some(body))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["data"]["organization"]["name"], "Beta Cars");
        assert_eq!(json["data"]["admin"]["role"], "admin");
        assert_ne!(json["data"]["organization"]["id"], app.org.id);
    }

    #[tokio::test]
    async fn test_rename_organization() {
        let app = test_app();
        let (status, json) = app
            .send(&app.admin, "PATCH", "/api/organization", Some(json!({"name": "Acme Auto"})))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["name"], "Acme Auto");

        let (status, _) = app
            .send(&app.manager, "PATCH", "/api/organization", Some(json!({"name": "Nope"})))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_settings_override_and_reset() {
        let app = test_app();
        let (_, json) = app
            .send(&app.rep, "GET", "/api/organization/settings", None)
            .await;
        assert_eq!(json["data"]["uses_defaults"], true);
        assert_eq!(json["data"]["incentive_rules"]["commission_bps"], 500);

        let (status, json) = app
            .send(
                &app.admin,
                "PUT",
                "/api/organization/settings",
                Some(json!({"commission_bps": 800, "monthly_cap": null})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["uses_defaults"], false);
        assert_eq!(json["data"]["incentive_rules"]["commission_bps"], 800);
        assert!(json["data"]["incentive_rules"]["monthly_cap"].is_null());

        let (status, json) = app
            .send(&app.admin, "DELETE", "/api/organization/settings", None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["uses_defaults"], true);
    }

    #[tokio::test]
    async fn test_invalid_rules_rejected() {
        let app = test_app();
        let (status, json) = app
            .send(
                &app.admin,
                "PUT",
                "/api/organization/settings",
                Some(json!({"commission_bps": 20000})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("commission_bps"));
    }
}
