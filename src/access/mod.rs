//! Access control for devices
//!
//! The [`PermissionEvaluator`] decides whether a [`Principal`] may read, use
//! or administer a device. [`AccessAdmin`] manages the grants and sharing
//! agreements it consults.

mod admin;
mod evaluator;

use serde::{Deserialize, Serialize};

use crate::db::PermissionType;

pub use admin::{AccessAdmin, GrantRequest};
pub use evaluator::{Decision, PermissionEvaluator};

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub group_id: String,
    /// Superusers bypass every permission check
    #[serde(default)]
    pub is_admin: bool,
}

impl Principal {
    /// Create a regular principal
    #[must_use]
    pub fn new(id: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            group_id: group_id.into(),
            is_admin: false,
        }
    }

    /// Create a superuser
    #[must_use]
    pub fn admin(id: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            is_admin: true,
            ..Self::new(id, group_id)
        }
    }
}

/// What a principal wants to do with a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// See the device and its status
    Read,
    /// Lease the device or book it
    Use,
    /// Force-disconnect, edit, approve bookings, grant access
    Admin,
}

impl Action {
    /// Minimum grant level that allows this action
    #[must_use]
    pub const fn required(self) -> PermissionType {
        match self {
            Self::Read => PermissionType::Read,
            Self::Use => PermissionType::Use,
            Self::Admin => PermissionType::Admin,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.required().as_str())
    }
}
