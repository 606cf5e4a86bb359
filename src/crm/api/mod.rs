//! HTTP JSON API.
//!
//! Every `/api` response uses the same envelope:
//! `{"success": bool, "data": T | null, "error": string | null}`.
//! Handlers are grouped by resource in the submodules; this module holds the
//! shared state, the envelope, error mapping, and the router.

mod categories;
mod dashboard;
mod incentives;
mod leads;
mod organization;
mod users;

use std::sync::{Arc, LazyLock};

use axum::{
    Json, Router,
    extract::{FromRequest, FromRequestParts, rejection::{JsonRejection, PathRejection, QueryRejection}},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::error;

use leadflow_core::money::MAX_DEAL_SIZE;
use leadflow_core::{Action, IncentiveRules, Role, Scope, role::permissions_for};

use super::auth::Identity;
use super::db::{CrmDb, DbHandle};
use super::ws::EventSender;
use crate::errors::{CrmError, CrmResult};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub events: EventSender,
    /// Incentive rules for organizations without an override.
    pub default_rules: IncentiveRules,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Run a service-layer closure on the blocking pool.
    pub async fn with_db<F, R>(&self, f: F) -> Result<R, ApiError>
    where
        F: FnOnce(&CrmDb) -> CrmResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let result = self
            .db
            .call(move |db| Ok(f(db)))
            .await
            .map_err(CrmError::Database)?;
        Ok(result?)
    }
}

// ── Envelope ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

/// A successful response wrapped in the envelope.
pub struct ApiResponse<T> {
    status: StatusCode,
    data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            status: StatusCode::OK,
            data,
        }
    }

    pub fn created(data: T) -> Self {
        Self {
            status: StatusCode::CREATED,
            data,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let body = Envelope {
            success: true,
            data: Some(self.data),
            error: None,
        };
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<ApiResponse<T>, ApiError>;

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::BadRequest(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg) => msg,
            ApiError::Internal(msg) => {
                error!(error = %msg, "request failed");
                msg
            }
        };
        let body: Envelope<()> = Envelope {
            success: false,
            data: None,
            error: Some(message),
        };
        (status, Json(body)).into_response()
    }
}

impl From<CrmError> for ApiError {
    fn from(err: CrmError) -> Self {
        match err {
            CrmError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            CrmError::Forbidden(_) => ApiError::Forbidden(err.to_string()),
            CrmError::Validation(msg) => ApiError::BadRequest(msg),
            CrmError::Core(e) => ApiError::BadRequest(e.to_string()),
            CrmError::Database(e) => ApiError::Internal(format!("Database error: {:#}", e)),
            CrmError::Other(e) => ApiError::Internal(format!("{:#}", e)),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

// ── Extractors ────────────────────────────────────────────────────────

/// `Json` whose rejection uses the envelope.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

/// `Query` whose rejection uses the envelope.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

/// `Path` whose rejection uses the envelope.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
pub struct ApiPath<T>(pub T);

// ── Validation helpers ────────────────────────────────────────────────

static PHONE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\+?[0-9]{7,15}$").unwrap());

/// Trimmed, non-empty text field.
pub(crate) fn required_text(field: &str, value: &str) -> Result<String, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::BadRequest(format!("{} must not be empty", field)));
    }
    Ok(trimmed.to_string())
}

pub(crate) fn valid_phone(field: &str, value: &str) -> Result<String, ApiError> {
    let trimmed = value.trim();
    if !PHONE_REGEX.is_match(trimmed) {
        return Err(ApiError::BadRequest(format!(
            "{} must be 7-15 digits with an optional leading '+'",
            field
        )));
    }
    Ok(trimmed.to_string())
}

/// Distinguishes an absent field (`None`) from an explicit `null`
/// (`Some(None)`) in PATCH bodies.
pub(crate) fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

pub(crate) fn valid_deal_size(value: i64) -> Result<i64, ApiError> {
    if value < 0 {
        return Err(ApiError::BadRequest("deal_size must not be negative".into()));
    }
    if value > MAX_DEAL_SIZE {
        return Err(ApiError::BadRequest(format!(
            "deal_size must not exceed {}",
            MAX_DEAL_SIZE
        )));
    }
    Ok(value)
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/me", get(me))
        .route("/api/organizations", post(organization::create_organization))
        .route(
            "/api/organization",
            get(organization::get_organization).patch(organization::update_organization),
        )
        .route(
            "/api/organization/settings",
            get(organization::get_settings)
                .put(organization::put_settings)
                .delete(organization::reset_settings),
        )
        .route("/api/users", get(users::list_users).post(users::create_user))
        .route("/api/users/{id}", get(users::get_user).patch(users::update_user))
        .route(
            "/api/categories",
            get(categories::list_categories).post(categories::create_category),
        )
        .route(
            "/api/categories/{id}",
            patch(categories::update_category).delete(categories::delete_category),
        )
        .route("/api/leads", get(leads::list_leads).post(leads::create_lead))
        .route(
            "/api/leads/{id}",
            get(leads::get_lead)
                .patch(leads::update_lead)
                .delete(leads::delete_lead),
        )
        .route("/api/leads/{id}/status", patch(leads::update_lead_status))
        .route("/api/leads/{id}/review", patch(leads::update_lead_review))
        .route("/api/incentives", get(incentives::list_incentives))
        .route("/api/incentives/preview", get(incentives::preview_incentive))
        .route("/api/incentives/calculate", post(incentives::calculate_incentives))
        .route("/api/incentives/{id}", get(incentives::get_incentive))
        .route("/api/incentives/{id}/approve", post(incentives::approve_incentive))
        .route("/api/incentives/{id}/reject", post(incentives::reject_incentive))
        .route("/api/incentives/{id}/mark-paid", post(incentives::mark_incentive_paid))
        .route("/api/dashboard", get(dashboard::get_dashboard))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct PermissionEntry {
    action: Action,
    scope: Scope,
}

#[derive(Serialize)]
struct MeResponse {
    user_id: i64,
    role: Role,
    organization_id: i64,
    permissions: Vec<PermissionEntry>,
}

async fn me(identity: Identity) -> ApiResult<MeResponse> {
    let permissions = permissions_for(identity.role)
        .into_iter()
        .map(|(action, scope)| PermissionEntry { action, scope })
        .collect();
    Ok(ApiResponse::ok(MeResponse {
        user_id: identity.user_id,
        role: identity.role,
        organization_id: identity.organization_id,
        permissions,
    }))
}

// ── Test support ──────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tokio::sync::broadcast;
    use tower::ServiceExt;

    use crate::crm::models::{Organization, User};

    pub struct TestApp {
        pub router: Router,
        pub state: SharedState,
        pub org: Organization,
        pub admin: User,
        pub manager: User,
        pub staff: User,
        pub rep: User,
        pub other_rep: User,
    }

    pub fn test_app() -> TestApp {
        let db = CrmDb::new_in_memory().unwrap();
        let org = db.create_organization("Acme Motors").unwrap();
        let admin = db
            .create_user(org.id, "Admin", "+919700000001", None, Role::Admin)
            .unwrap();
        let manager = db
            .create_user(org.id, "Meera", "+919700000002", None, Role::Manager)
            .unwrap();
        let staff = db
            .create_user(org.id, "Sam", "+919700000003", None, Role::Staff)
            .unwrap();
        let rep = db
            .create_user(org.id, "Asha", "+919700000004", None, Role::SalesRep)
            .unwrap();
        let other_rep = db
            .create_user(org.id, "Ravi", "+919700000005", None, Role::SalesRep)
            .unwrap();
        let (events, _) = broadcast::channel(16);
        let state = Arc::new(AppState {
            db: DbHandle::new(db),
            events,
            default_rules: IncentiveRules::default(),
        });
        TestApp {
            router: api_router().with_state(state.clone()),
            state,
            org,
            admin,
            manager,
            staff,
            rep,
            other_rep,
        }
    }

    impl TestApp {
        pub async fn send(
            &self,
            as_user: &User,
            method: &str,
            uri: &str,
            body: Option<serde_json::Value>,
        ) -> (StatusCode, serde_json::Value) {
            let mut builder = Request::builder()
                .method(method)
                .uri(uri)
                .header("x-user-id", as_user.id.to_string())
                .header("x-user-role", as_user.role.as_str())
                .header("x-organization-id", as_user.organization_id.to_string());
            let body = match body {
                Some(json) => {
                    builder = builder.header("content-type", "application/json");
                    Body::from(json.to_string())
                }
                None => Body::empty(),
            };
            let response = self
                .router
                .clone()
                .oneshot(builder.body(body).unwrap())
                .await
                .unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
            (status, json)
        }
    }
}
