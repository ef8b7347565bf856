//! Categorized storage errors.
//!
//! # Purpose
//! Every backend operation returns one of a small set of error categories so
//! the HTTP glue can translate them into Kubernetes status responses without
//! inspecting backend internals.

use crate::meta::GroupResource;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{group_resource} \"{name}\" not found")]
    NotFound {
        group_resource: GroupResource,
        name: String,
    },
    #[error("conflict on {group_resource} \"{name}\": {reason}")]
    Conflict {
        group_resource: GroupResource,
        name: String,
        reason: String,
    },
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub fn not_found(group_resource: &GroupResource, name: &str) -> Self {
        StorageError::NotFound {
            group_resource: group_resource.clone(),
            name: name.to_string(),
        }
    }

    pub fn conflict(group_resource: &GroupResource, name: &str, reason: impl Into<String>) -> Self {
        StorageError::Conflict {
            group_resource: group_resource.clone(),
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Conflict raised when a create hits an existing record.
    pub fn already_exists(group_resource: &GroupResource, name: &str) -> Self {
        Self::conflict(group_resource, name, "item already exists")
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict { .. })
    }
}
