use axum::extract::State;
use serde::Deserialize;
use tracing::info;

use leadflow_core::{Action, Role};

use super::{
    ApiError, ApiJson, ApiPath, ApiQuery, ApiResponse, ApiResult, SharedState, double_option,
    required_text, valid_phone,
};
use crate::crm::auth::Identity;
use crate::crm::models::User;
use crate::errors::CrmError;

#[derive(Debug, Default, Deserialize)]
pub struct UserQuery {
    pub role: Option<Role>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub role: Role,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub email: Option<Option<String>>,
    pub role: Option<Role>,
    pub is_active: Option<bool>,
}

fn check_grant(identity: &Identity, role: Role) -> Result<(), ApiError> {
    if identity.role.can_grant(role) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!(
            "Role {} may not assign role {}",
            identity.role, role
        )))
    }
}

fn clean_email(email: Option<&str>) -> Result<Option<String>, ApiError> {
    match email.map(str::trim) {
        None | Some("") => Ok(None),
        Some(e) if e.contains('@') => Ok(Some(e.to_string())),
        Some(_) => Err(ApiError::BadRequest("email is not a valid address".into())),
    }
}

pub(super) async fn list_users(
    State(state): State<SharedState>,
    identity: Identity,
    ApiQuery(query): ApiQuery<UserQuery>,
) -> ApiResult<Vec<User>> {
    identity.require(Action::ViewUsers)?;
    let org = identity.organization_id;
    let users = state
        .with_db(move |db| db.list_users(org, query.role).map_err(CrmError::Database))
        .await?;
    Ok(ApiResponse::ok(users))
}

pub(super) async fn create_user(
    State(state): State<SharedState>,
    identity: Identity,
    ApiJson(req): ApiJson<CreateUserRequest>,
) -> ApiResult<User> {
    identity.require(Action::ManageUsers)?;
    check_grant(&identity, req.role)?;
    let name = required_text("name", &req.name)?;
    let phone = valid_phone("phone", &req.phone)?;
    let email = clean_email(req.email.as_deref())?;
    let role = req.role;
    let org = identity.organization_id;
    let user = state
        .with_db(move |db| {
            db.create_user(org, &name, &phone, email.as_deref(), role)
                .map_err(|e| CrmError::from_db(e, "A user with this phone number already exists"))
        })
        .await?;
    info!(user_id = user.id, role = %user.role, "user created");
    Ok(ApiResponse::created(user))
}

pub(super) async fn get_user(
    State(state): State<SharedState>,
    identity: Identity,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<User> {
    // Anyone may look themselves up.
    if id != identity.user_id {
        identity.require(Action::ViewUsers)?;
    }
    let org = identity.organization_id;
    let user = state
        .with_db(move |db| {
            db.get_user(org, id)
                .map_err(CrmError::Database)?
                .ok_or_else(|| CrmError::not_found("User", id))
        })
        .await?;
    Ok(ApiResponse::ok(user))
}

pub(super) async fn update_user(
    State(state): State<SharedState>,
    identity: Identity,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<UpdateUserRequest>,
) -> ApiResult<User> {
    identity.require(Action::ManageUsers)?;
    if let Some(role) = req.role {
        check_grant(&identity, role)?;
    }
    if id == identity.user_id && (req.role.is_some() || req.is_active == Some(false)) {
        return Err(ApiError::BadRequest(
            "You cannot change your own role or deactivate yourself".into(),
        ));
    }
    let name = req
        .name
        .as_deref()
        .map(|n| required_text("name", n))
        .transpose()?;
    let email = match req.email {
        Some(e) => Some(clean_email(e.as_deref())?),
        None => None,
    };
    let org = identity.organization_id;
    let caller_role = identity.role;
    let user = state
        .with_db(move |db| {
            let existing = db
                .get_user(org, id)
                .map_err(CrmError::Database)?
                .ok_or_else(|| CrmError::not_found("User", id))?;
            // Editing someone requires being able to grant their current role.
            if !caller_role.can_grant(existing.role) {
                return Err(CrmError::forbidden(format!(
                    "Role {} may not modify a {}",
                    caller_role, existing.role
                )));
            }
            db.update_user(
                org,
                id,
                name.as_deref(),
                email.as_ref().map(|e| e.as_deref()),
                req.role,
                req.is_active,
            )
            .map_err(CrmError::Database)?
            .ok_or_else(|| CrmError::not_found("User", id))
        })
        .await?;
    info!(user_id = id, "user updated");
    Ok(ApiResponse::ok(user))
}
