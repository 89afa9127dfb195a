use serde::{Deserialize, Serialize};

use crate::api::UserId;

/// Authenticated caller, resolved from an API token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub is_admin: bool,
}

impl Principal {
    /// Owners and admins may update or delete a record.
    pub fn can_modify(&self, owner: UserId) -> bool {
        self.is_admin || self.id == owner
    }
}
