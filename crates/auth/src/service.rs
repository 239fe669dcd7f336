//! The authentication facade used by the gateway pipeline.
//!
//! Accepts a Bearer JWT or an `X-API-Key` header and produces a
//! `Principal`; exposes `require_permission` / `require_role` guards and
//! the login/refresh flows.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use llmrouter_core::error::{GatewayError, Result};

use crate::apikey::{ApiKeyStore, IssuedKey};
use crate::password::{LockoutTracker, verify_password};
use crate::permission::has_permission;
use crate::token::{TokenPair, TokenService};
use crate::users::{Role, UserRecord, UserStore};

/// An authenticated caller.
#[derive(Debug, Clone)]
pub struct Principal {
    /// User id, or the key id for key-only principals.
    pub subject: String,
    pub role: Role,
    pub tier: String,
    pub permissions: BTreeSet<String>,
    /// Set when the caller authenticated with an API key.
    pub key_id: Option<String>,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Stable subject id for rate limiting: the key when present,
    /// otherwise the user.
    pub fn rate_subject(&self) -> &str {
        self.key_id.as_deref().unwrap_or(&self.subject)
    }
}

/// Composed auth subsystem.
pub struct AuthService {
    pub users: UserStore,
    pub keys: ApiKeyStore,
    pub tokens: TokenService,
    lockout: LockoutTracker,
}

impl AuthService {
    pub fn new(users: UserStore, keys: ApiKeyStore, tokens: TokenService) -> Self {
        Self {
            users,
            keys,
            tokens,
            lockout: LockoutTracker::new(),
        }
    }

    /// Authenticate from transport headers: Bearer JWT first, then
    /// `X-API-Key`.
    pub async fn authenticate(
        &self,
        authorization: Option<&str>,
        x_api_key: Option<&str>,
    ) -> Result<Principal> {
        if let Some(bearer) = authorization.and_then(|v| v.strip_prefix("Bearer ")) {
            return self.authenticate_bearer(bearer);
        }
        if let Some(key) = x_api_key {
            return self.authenticate_api_key(key).await;
        }
        Err(GatewayError::Unauthenticated(
            "missing credentials".into(),
        ))
    }

    pub fn authenticate_bearer(&self, token: &str) -> Result<Principal> {
        let claims = self.tokens.verify_access(token)?;
        // Prefer the live user record so role/permission changes apply
        // before the token expires.
        if let Some(user) = self.users.get(&claims.sub) {
            return Ok(Principal {
                subject: user.id,
                role: user.role,
                tier: user.tier,
                permissions: user.permissions,
                key_id: None,
            });
        }
        Err(GatewayError::Unauthenticated("unknown subject".into()))
    }

    pub async fn authenticate_api_key(&self, presented: &str) -> Result<Principal> {
        let record = self.keys.validate(presented).await?;
        let role = self
            .users
            .get(&record.owner_user_id)
            .map(|u| u.role)
            .unwrap_or(Role::User);
        Ok(Principal {
            subject: record.owner_user_id,
            role,
            tier: record.tier,
            permissions: record.permissions,
            key_id: Some(record.key_id),
        })
    }

    /// Password login. Applies the lockout schedule and rotates nothing.
    pub async fn login(&self, username: &str, password: &str) -> Result<(TokenPair, UserRecord)> {
        let now_ms = Utc::now().timestamp_millis() as u64;
        self.lockout.check(username, now_ms)?;

        let Some(user) = self.users.get_by_username(username) else {
            // Burn comparable time so absent users are not distinguishable
            // by response latency.
            let _ = verify_password(
                password.to_string(),
                "$2b$10$7EqJtq98hPqEX7fNZaFWoOhi5B0xB1/kqZ6y2P7ZAmbiy9RWK1Tm2".to_string(),
            )
            .await;
            self.lockout.record_failure(username, now_ms);
            return Err(GatewayError::Unauthenticated("invalid credentials".into()));
        };

        if !verify_password(password.to_string(), user.password_hash.clone()).await? {
            self.lockout.record_failure(username, now_ms);
            return Err(GatewayError::Unauthenticated("invalid credentials".into()));
        }

        self.lockout.record_success(username);
        debug!(user = %user.username, "Login succeeded");
        let pair = self
            .tokens
            .issue_pair(&user.id, user.role.as_str(), &user.permissions)?;
        Ok((pair, user))
    }

    /// Refresh rotation: the presented token is invalidated and exactly
    /// one successor pair is issued.
    pub fn refresh(&self, refresh_token: &str) -> Result<(TokenPair, UserRecord)> {
        let user_id = self.tokens.consume_refresh(refresh_token)?;
        let user = self
            .users
            .get(&user_id)
            .ok_or_else(|| GatewayError::Unauthenticated("unknown subject".into()))?;
        let pair = self
            .tokens
            .issue_pair(&user.id, user.role.as_str(), &user.permissions)?;
        Ok((pair, user))
    }

    /// Issue an API key owned by a principal.
    pub fn issue_key(
        &self,
        principal: &Principal,
        name: &str,
        permissions: Option<BTreeSet<String>>,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<IssuedKey> {
        // A key can never grant more than its owner holds
        let granted = match permissions {
            Some(requested) => {
                if let Some(excess) = requested
                    .iter()
                    .find(|p| !has_permission(&principal.permissions, p))
                {
                    return Err(GatewayError::Forbidden(format!(
                        "cannot delegate permission '{excess}'"
                    )));
                }
                requested
            }
            None => principal.permissions.clone(),
        };
        self.keys.issue(
            name,
            &principal.subject,
            &principal.tier,
            granted,
            expires_at,
        )
    }

    pub fn require_permission(&self, principal: &Principal, permission: &str) -> Result<()> {
        if has_permission(&principal.permissions, permission) {
            Ok(())
        } else {
            Err(GatewayError::Forbidden(format!(
                "missing permission '{permission}'"
            )))
        }
    }

    pub fn require_role(&self, principal: &Principal, allowed: &[Role]) -> Result<()> {
        if allowed.contains(&principal.role) {
            Ok(())
        } else {
            Err(GatewayError::Forbidden(format!(
                "role '{}' not permitted",
                principal.role.as_str()
            )))
        }
    }

    /// Janitor entry point; the gateway runs this every few minutes.
    pub fn sweep_expired(&self) {
        self.tokens.sweep();
    }
}

/// Build the service with an initial admin account.
pub fn bootstrap(
    bcrypt_rounds: u32,
    jwt_secret: &str,
    access_ttl_secs: u64,
    refresh_ttl_secs: u64,
    admin_username: &str,
    admin_password: &str,
) -> Result<Arc<AuthService>> {
    let users = UserStore::new(bcrypt_rounds);
    users.create(admin_username, admin_password, Role::Admin, "admin")?;
    Ok(Arc::new(AuthService::new(
        users,
        ApiKeyStore::new(bcrypt_rounds),
        TokenService::new(jwt_secret, access_ttl_secs, refresh_ttl_secs),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AuthService {
        let users = UserStore::new(4);
        users.create("admin", "root-pw", Role::Admin, "admin").unwrap();
        users.create("dev", "dev-pw", Role::User, "basic").unwrap();
        AuthService::new(
            users,
            ApiKeyStore::new(4),
            TokenService::new("test-secret", 3_600, 86_400),
        )
    }

    #[tokio::test]
    async fn login_and_bearer_round_trip() {
        let svc = service();
        let (pair, user) = svc.login("dev", "dev-pw").await.unwrap();
        assert_eq!(user.username, "dev");

        let principal = svc
            .authenticate(Some(&format!("Bearer {}", pair.access_token)), None)
            .await
            .unwrap();
        assert_eq!(principal.subject, user.id);
        assert_eq!(principal.role, Role::User);
        assert!(principal.key_id.is_none());
    }

    #[tokio::test]
    async fn wrong_password_fails_and_locks_after_streak() {
        let svc = service();
        for _ in 0..5 {
            assert!(svc.login("dev", "nope").await.is_err());
        }
        // Locked now — even the right password is refused
        let err = svc.login("dev", "dev-pw").await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn api_key_flow() {
        let svc = service();
        let (_, admin) = svc.login("admin", "root-pw").await.unwrap();
        let principal = Principal {
            subject: admin.id.clone(),
            role: admin.role,
            tier: admin.tier.clone(),
            permissions: admin.permissions.clone(),
            key_id: None,
        };

        let issued = svc.issue_key(&principal, "ci", None, None).unwrap();
        let via_key = svc
            .authenticate(None, Some(&issued.key))
            .await
            .unwrap();
        assert_eq!(via_key.key_id.as_deref(), Some(issued.meta.id.as_str()));
        assert_eq!(via_key.rate_subject(), issued.meta.id);

        svc.keys.revoke(&issued.meta.id).unwrap();
        assert!(svc.authenticate(None, Some(&issued.key)).await.is_err());
    }

    #[tokio::test]
    async fn key_cannot_exceed_owner_permissions() {
        let svc = service();
        let (_, dev) = svc.login("dev", "dev-pw").await.unwrap();
        let principal = Principal {
            subject: dev.id.clone(),
            role: dev.role,
            tier: dev.tier.clone(),
            permissions: dev.permissions.clone(),
            key_id: None,
        };
        let wanted: BTreeSet<String> = ["admin:everything".to_string()].into();
        let err = svc
            .issue_key(&principal, "sneaky", Some(wanted), None)
            .unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));
    }

    #[tokio::test]
    async fn refresh_rotates() {
        let svc = service();
        let (pair, _) = svc.login("dev", "dev-pw").await.unwrap();

        let (next, _) = svc.refresh(&pair.refresh_token).unwrap();
        assert!(svc.refresh(&pair.refresh_token).is_err());
        assert!(svc.refresh(&next.refresh_token).is_ok());
    }

    #[tokio::test]
    async fn permission_and_role_guards() {
        let svc = service();
        let (_, dev) = svc.login("dev", "dev-pw").await.unwrap();
        let principal = Principal {
            subject: dev.id,
            role: dev.role,
            tier: dev.tier,
            permissions: dev.permissions,
            key_id: None,
        };

        svc.require_permission(&principal, "inference:invoke").unwrap();
        assert!(svc.require_permission(&principal, "cache:clear").is_err());
        assert!(svc.require_role(&principal, &[Role::Admin]).is_err());
        svc.require_role(&principal, &[Role::Admin, Role::User]).unwrap();
    }

    #[tokio::test]
    async fn missing_credentials_unauthenticated() {
        let svc = service();
        let err = svc.authenticate(None, None).await.unwrap_err();
        assert_eq!(err.kind(), "unauthenticated");
    }
}
