//! API key issuance and validation.
//!
//! Keys have the form `llmr_<32 hex>.<64 hex>`: a public lookup prefix
//! and a secret. Only `bcrypt(secret)` is stored; the full key is
//! returned exactly once, at issuance. Deactivation is monotonic and is
//! checked before any hash comparison.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::Serialize;

use llmrouter_core::error::{GatewayError, Result};

use crate::password::{hash_password, verify_password};

const PREFIX_TAG: &str = "llmr_";
const PREFIX_BYTES: usize = 16;
const SECRET_BYTES: usize = 32;

/// Stored key record. Never contains the secret.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub key_id: String,
    pub secret_hash: String,
    pub name: String,
    pub owner_user_id: String,
    pub tier: String,
    pub permissions: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

/// Public key metadata, safe to list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyMeta {
    pub id: String,
    pub name: String,
    pub permissions: Vec<String>,
    pub tier: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl From<&ApiKeyRecord> for ApiKeyMeta {
    fn from(r: &ApiKeyRecord) -> Self {
        Self {
            id: r.key_id.clone(),
            name: r.name.clone(),
            permissions: r.permissions.iter().cloned().collect(),
            tier: r.tier.clone(),
            created_at: r.created_at,
            last_used_at: r.last_used_at,
            expires_at: r.expires_at,
            active: r.active,
        }
    }
}

/// The one-time issuance result carrying the plaintext key.
#[derive(Debug)]
pub struct IssuedKey {
    pub meta: ApiKeyMeta,
    /// `llmr_<32 hex>.<64 hex>` — shown once, never stored.
    pub key: String,
}

/// Concurrent API key table keyed by public prefix.
pub struct ApiKeyStore {
    keys: DashMap<String, ApiKeyRecord>,
    bcrypt_rounds: u32,
}

impl ApiKeyStore {
    pub fn new(bcrypt_rounds: u32) -> Self {
        Self {
            keys: DashMap::new(),
            bcrypt_rounds,
        }
    }

    /// Issue a new key. The returned `IssuedKey.key` is the only copy of
    /// the plaintext that will ever exist.
    pub fn issue(
        &self,
        name: &str,
        owner_user_id: &str,
        tier: &str,
        permissions: BTreeSet<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<IssuedKey> {
        let key_id = format!("{PREFIX_TAG}{}", random_hex(PREFIX_BYTES));
        let secret = random_hex(SECRET_BYTES);
        let secret_hash = hash_password(&secret, self.bcrypt_rounds)?;

        let record = ApiKeyRecord {
            key_id: key_id.clone(),
            secret_hash,
            name: name.to_string(),
            owner_user_id: owner_user_id.to_string(),
            tier: tier.to_string(),
            permissions,
            created_at: Utc::now(),
            last_used_at: None,
            expires_at,
            active: true,
        };
        let meta = ApiKeyMeta::from(&record);
        self.keys.insert(key_id.clone(), record);

        Ok(IssuedKey {
            meta,
            key: format!("{key_id}.{secret}"),
        })
    }

    /// Validate a presented `prefix.secret` key. Revocation and expiry
    /// are checked before the (expensive) hash comparison.
    pub async fn validate(&self, presented: &str) -> Result<ApiKeyRecord> {
        let unauthenticated = || GatewayError::Unauthenticated("invalid API key".into());

        let (key_id, secret) = presented.split_once('.').ok_or_else(unauthenticated)?;
        let (hash, record) = {
            let record = self.keys.get(key_id).ok_or_else(unauthenticated)?;
            if !record.active {
                return Err(unauthenticated());
            }
            if record.expires_at.is_some_and(|at| at < Utc::now()) {
                return Err(unauthenticated());
            }
            (record.secret_hash.clone(), record.clone())
        };

        if !verify_password(secret.to_string(), hash).await? {
            return Err(unauthenticated());
        }

        if let Some(mut entry) = self.keys.get_mut(key_id) {
            entry.last_used_at = Some(Utc::now());
        }
        Ok(record)
    }

    /// Deactivate a key. Monotonic: there is no reactivation.
    pub fn revoke(&self, key_id: &str) -> Result<()> {
        let mut record = self
            .keys
            .get_mut(key_id)
            .ok_or_else(|| GatewayError::NotFound(format!("api key '{key_id}'")))?;
        record.active = false;
        Ok(())
    }

    pub fn list(&self) -> Vec<ApiKeyMeta> {
        let mut out: Vec<ApiKeyMeta> =
            self.keys.iter().map(|r| ApiKeyMeta::from(r.value())).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Deactivate every key owned by a user. Used on user deletion.
    pub fn revoke_owned_by(&self, owner_user_id: &str) -> usize {
        let mut revoked = 0;
        for mut entry in self.keys.iter_mut() {
            if entry.owner_user_id == owner_user_id && entry.active {
                entry.active = false;
                revoked += 1;
            }
        }
        revoked
    }
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ApiKeyStore {
        // bcrypt minimum cost keeps tests fast
        ApiKeyStore::new(4)
    }

    #[tokio::test]
    async fn issued_key_has_documented_shape_and_validates() {
        let store = store();
        let issued = store
            .issue("ci", "u1", "basic", BTreeSet::new(), None)
            .unwrap();

        let (prefix, secret) = issued.key.split_once('.').unwrap();
        assert!(prefix.starts_with("llmr_"));
        assert_eq!(prefix.len(), "llmr_".len() + 32);
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));

        let record = store.validate(&issued.key).await.unwrap();
        assert_eq!(record.key_id, issued.meta.id);
        assert!(record.last_used_at.is_none());
        // last_used_at is stamped on the stored record
        let validated_again = store.validate(&issued.key).await.unwrap();
        assert!(validated_again.last_used_at.is_some());
    }

    #[tokio::test]
    async fn plaintext_secret_never_stored() {
        let store = store();
        let issued = store
            .issue("ci", "u1", "basic", BTreeSet::new(), None)
            .unwrap();
        let (_, secret) = issued.key.split_once('.').unwrap();

        for entry in store.keys.iter() {
            assert!(!entry.secret_hash.contains(secret));
            assert_ne!(entry.secret_hash, secret);
        }
        // Listing never exposes key material
        let listed = serde_json::to_string(&store.list()).unwrap();
        assert!(!listed.contains(secret));
    }

    #[tokio::test]
    async fn wrong_secret_fails() {
        let store = store();
        let issued = store
            .issue("ci", "u1", "basic", BTreeSet::new(), None)
            .unwrap();
        let forged = format!("{}.{}", issued.meta.id, "0".repeat(64));
        assert!(store.validate(&forged).await.is_err());
        assert!(store.validate("garbage-without-dot").await.is_err());
    }

    #[tokio::test]
    async fn revocation_is_checked_before_compare() {
        let store = store();
        let issued = store
            .issue("ci", "u1", "basic", BTreeSet::new(), None)
            .unwrap();
        store.revoke(&issued.meta.id).unwrap();
        assert!(store.validate(&issued.key).await.is_err());
        assert!(store.revoke("llmr_missing").is_err());
    }

    #[tokio::test]
    async fn expired_key_fails() {
        let store = store();
        let issued = store
            .issue(
                "ci",
                "u1",
                "basic",
                BTreeSet::new(),
                Some(Utc::now() - chrono::Duration::hours(1)),
            )
            .unwrap();
        assert!(store.validate(&issued.key).await.is_err());
    }

    #[tokio::test]
    async fn user_deletion_revokes_owned_keys() {
        let store = store();
        let a = store.issue("a", "u1", "basic", BTreeSet::new(), None).unwrap();
        let _b = store.issue("b", "u2", "basic", BTreeSet::new(), None).unwrap();

        assert_eq!(store.revoke_owned_by("u1"), 1);
        assert!(store.validate(&a.key).await.is_err());
    }
}
