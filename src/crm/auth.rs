//! Caller identity from gateway-injected headers.
//!
//! The gateway in front of the service authenticates the user and forwards
//! `x-user-id`, `x-user-role` and `x-organization-id`. They are trusted as
//! given; a missing or malformed header is a 401.

use axum::extract::FromRequestParts;
use axum::http::{HeaderMap, request::Parts};
use tracing::warn;

use leadflow_core::{Action, Role, Scope, permission};

use super::api::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const ORGANIZATION_ID_HEADER: &str = "x-organization-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
    pub role: Role,
    pub organization_id: i64,
}

impl Identity {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
        let user_id = header_str(headers, USER_ID_HEADER)?
            .parse::<i64>()
            .map_err(|_| ApiError::Unauthorized(format!("Malformed {} header", USER_ID_HEADER)))?;
        let role = header_str(headers, USER_ROLE_HEADER)?
            .parse::<Role>()
            .map_err(|e| ApiError::Unauthorized(e.to_string()))?;
        let organization_id = header_str(headers, ORGANIZATION_ID_HEADER)?
            .parse::<i64>()
            .map_err(|_| {
                ApiError::Unauthorized(format!("Malformed {} header", ORGANIZATION_ID_HEADER))
            })?;
        Ok(Self {
            user_id,
            role,
            organization_id,
        })
    }

    /// Scope granted for `action`, or 403.
    pub fn require(&self, action: Action) -> Result<Scope, ApiError> {
        match permission(self.role, action) {
            Some(scope) => Ok(scope),
            None => {
                warn!(
                    user_id = self.user_id,
                    role = %self.role,
                    %action,
                    "permission denied"
                );
                Err(ApiError::Forbidden(format!(
                    "Role {} may not {}",
                    self.role, action
                )))
            }
        }
    }

    /// The sales rep id a query must be limited to, if the caller only has
    /// `Own` scope for `action`.
    pub fn owner_filter(&self, action: Action) -> Result<Option<i64>, ApiError> {
        Ok(match self.require(action)? {
            Scope::Own => Some(self.user_id),
            Scope::Org | Scope::Global => None,
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ApiError> {
    let value = headers
        .get(name)
        .ok_or_else(|| ApiError::Unauthorized(format!("Missing {} header", name)))?;
    value
        .to_str()
        .map(str::trim)
        .map_err(|_| ApiError::Unauthorized(format!("Malformed {} header", name)))
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Identity::from_headers(&parts.headers)
    }
}
