//! User accounts, roles, and the user table.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use llmrouter_core::error::{GatewayError, Result};

use crate::password::hash_password;

/// Account role. Role permissions are a floor; users may carry extras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Operator,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Operator => "operator",
            Self::User => "user",
        }
    }

    /// Permissions granted by the role itself.
    pub fn permissions(&self) -> BTreeSet<String> {
        let list: &[&str] = match self {
            Self::Admin => &["*"],
            Self::Operator => &[
                "inference:invoke",
                "embeddings:invoke",
                "models:*",
                "stats:read",
                "cache:clear",
                "keys:issue",
            ],
            Self::User => &[
                "inference:invoke",
                "embeddings:invoke",
                "models:read",
                "keys:issue",
            ],
        };
        list.iter().map(|s| s.to_string()).collect()
    }
}

/// A stored user account. Password exists only as a bcrypt hash.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub role: Role,
    /// Grants beyond the role floor.
    pub extra_permissions: BTreeSet<String>,
    /// role.permissions() ∪ extra_permissions, kept in sync on role
    /// change by construction.
    pub permissions: BTreeSet<String>,
    pub tier: String,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    fn recompute_permissions(&mut self) {
        self.permissions = self
            .role
            .permissions()
            .union(&self.extra_permissions)
            .cloned()
            .collect();
    }
}

/// Concurrent user table. Read-mostly; writes are row-local.
pub struct UserStore {
    by_id: DashMap<String, UserRecord>,
    /// username → user id.
    by_username: DashMap<String, String>,
    bcrypt_rounds: u32,
}

impl UserStore {
    pub fn new(bcrypt_rounds: u32) -> Self {
        Self {
            by_id: DashMap::new(),
            by_username: DashMap::new(),
            bcrypt_rounds,
        }
    }

    pub fn create(
        &self,
        username: &str,
        password: &str,
        role: Role,
        tier: &str,
    ) -> Result<UserRecord> {
        if self.by_username.contains_key(username) {
            return Err(GatewayError::InvalidRequest {
                message: format!("username '{username}' is taken"),
                details: None,
            });
        }

        let mut record = UserRecord {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            password_hash: hash_password(password, self.bcrypt_rounds)?,
            role,
            extra_permissions: BTreeSet::new(),
            permissions: BTreeSet::new(),
            tier: tier.to_string(),
            verified: false,
            created_at: Utc::now(),
        };
        record.recompute_permissions();

        self.by_username
            .insert(username.to_string(), record.id.clone());
        self.by_id.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Option<UserRecord> {
        self.by_id.get(id).map(|r| r.clone())
    }

    pub fn get_by_username(&self, username: &str) -> Option<UserRecord> {
        let id = self.by_username.get(username)?.clone();
        self.get(&id)
    }

    /// Change a user's role; derived permissions are recomputed.
    pub fn set_role(&self, id: &str, role: Role) -> Result<()> {
        let mut record = self
            .by_id
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(format!("user '{id}'")))?;
        record.role = role;
        record.recompute_permissions();
        Ok(())
    }

    /// Grant an extra permission beyond the role floor.
    pub fn grant(&self, id: &str, permission: &str) -> Result<()> {
        let mut record = self
            .by_id
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(format!("user '{id}'")))?;
        record.extra_permissions.insert(permission.to_string());
        record.recompute_permissions();
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Option<UserRecord> {
        let (_, record) = self.by_id.remove(id)?;
        self.by_username.remove(&record.username);
        Some(record)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::has_permission;

    fn store() -> UserStore {
        UserStore::new(4)
    }

    #[test]
    fn create_hashes_password() {
        let store = store();
        let user = store.create("alice", "hunter2", Role::User, "basic").unwrap();
        assert_ne!(user.password_hash, "hunter2");
        assert!(user.password_hash.starts_with("$2"));
        assert!(store.get_by_username("alice").is_some());
    }

    #[test]
    fn duplicate_username_rejected() {
        let store = store();
        store.create("alice", "x", Role::User, "basic").unwrap();
        assert!(store.create("alice", "y", Role::User, "basic").is_err());
    }

    #[test]
    fn permissions_are_superset_of_role() {
        let store = store();
        let user = store.create("bob", "x", Role::User, "basic").unwrap();
        for p in Role::User.permissions() {
            assert!(user.permissions.contains(&p));
        }
    }

    #[test]
    fn role_change_recomputes_but_keeps_extras() {
        let store = store();
        let user = store.create("carol", "x", Role::User, "pro").unwrap();
        store.grant(&user.id, "billing:read").unwrap();
        store.set_role(&user.id, Role::Operator).unwrap();

        let updated = store.get(&user.id).unwrap();
        assert!(has_permission(&updated.permissions, "models:write"));
        assert!(has_permission(&updated.permissions, "billing:read"));
        // Plain User permissions no longer the ceiling
        assert!(updated.permissions.contains("cache:clear"));
    }

    #[test]
    fn remove_clears_username_index() {
        let store = store();
        let user = store.create("dave", "x", Role::User, "free").unwrap();
        store.remove(&user.id).unwrap();
        assert!(store.get_by_username("dave").is_none());
        assert!(store.is_empty());
    }
}
