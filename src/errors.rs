//! Typed errors for the Leadflow service layer.
//!
//! `CrmError` is what the incentive workflow and request validation return.
//! The HTTP layer maps each variant onto a status code; the storage layer
//! stays on `anyhow` and is wrapped as `Database` at the boundary.

use leadflow_core::CoreError;
use thiserror::Error;

use crate::crm::db::is_constraint_violation;

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CrmError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Wrap a storage error. Unique/check constraint failures are caller
    /// mistakes (duplicate phone, duplicate month) and become `Validation`.
    pub fn from_db(err: anyhow::Error, conflict: &str) -> Self {
        if is_constraint_violation(&err) {
            Self::Validation(conflict.to_string())
        } else {
            Self::Database(err)
        }
    }
}

pub type CrmResult<T> = Result<T, CrmError>;
