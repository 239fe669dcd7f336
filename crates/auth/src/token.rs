//! JWT issuance, refresh rotation, and revocation.
//!
//! Access tokens are HS256 JWTs carrying `{sub, role, permissions, jti,
//! iat, exp, iss}`. Refresh tokens are tracked server-side by jti and
//! rotate on every use: the predecessor is invalid the moment its
//! successor exists. Revoked access tokens go into a jti blacklist whose
//! entries expire when the token itself would have.

use std::collections::BTreeSet;

use chrono::Utc;
use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use llmrouter_core::error::{GatewayError, Result};

const ISSUER: &str = "llm-router";

/// Claims carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub role: String,
    pub permissions: Vec<String>,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    /// "access" or "refresh"; refresh tokens are rejected on API routes.
    #[serde(default)]
    pub kind: String,
}

/// The pair returned by login and refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
}

#[derive(Debug, Clone)]
struct RefreshRecord {
    user_id: String,
    expires_at: i64,
}

/// Token issuance and verification service.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl_secs: u64,
    refresh_ttl_secs: u64,
    /// Live refresh tokens: jti → record.
    refresh_tokens: DashMap<String, RefreshRecord>,
    /// Revoked access tokens: jti → original exp.
    blacklist: DashMap<String, i64>,
}

impl TokenService {
    pub fn new(secret: &str, access_ttl_secs: u64, refresh_ttl_secs: u64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl_secs,
            refresh_ttl_secs,
            refresh_tokens: DashMap::new(),
            blacklist: DashMap::new(),
        }
    }

    /// Issue an access/refresh pair for a user.
    pub fn issue_pair(
        &self,
        user_id: &str,
        role: &str,
        permissions: &BTreeSet<String>,
    ) -> Result<TokenPair> {
        let now = Utc::now().timestamp();
        let access = self.sign(AccessClaims {
            sub: user_id.to_string(),
            role: role.to_string(),
            permissions: permissions.iter().cloned().collect(),
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + self.access_ttl_secs as i64,
            iss: ISSUER.into(),
            kind: "access".into(),
        })?;

        let refresh_jti = Uuid::new_v4().to_string();
        let refresh_exp = now + self.refresh_ttl_secs as i64;
        let refresh = self.sign(AccessClaims {
            sub: user_id.to_string(),
            role: role.to_string(),
            permissions: Vec::new(),
            jti: refresh_jti.clone(),
            iat: now,
            exp: refresh_exp,
            iss: ISSUER.into(),
            kind: "refresh".into(),
        })?;
        self.refresh_tokens.insert(
            refresh_jti,
            RefreshRecord {
                user_id: user_id.to_string(),
                expires_at: refresh_exp,
            },
        );

        Ok(TokenPair {
            access_token: access,
            refresh_token: refresh,
            token_type: "Bearer".into(),
        })
    }

    /// Verify an access token: signature, expiry, issuer, kind, and the
    /// revocation blacklist.
    pub fn verify_access(&self, token: &str) -> Result<AccessClaims> {
        let claims = self.decode(token)?;
        if claims.kind != "access" {
            return Err(GatewayError::Unauthenticated(
                "refresh token presented where an access token is required".into(),
            ));
        }
        if self.blacklist.contains_key(&claims.jti) {
            return Err(GatewayError::Unauthenticated("token revoked".into()));
        }
        Ok(claims)
    }

    /// Rotate a refresh token: invalidate the presented jti and hand the
    /// caller what is needed to issue the successor pair. Exactly one
    /// live successor exists after rotation.
    pub fn consume_refresh(&self, token: &str) -> Result<String> {
        let claims = self.decode(token)?;
        if claims.kind != "refresh" {
            return Err(GatewayError::Unauthenticated(
                "not a refresh token".into(),
            ));
        }
        let (_, record) = self
            .refresh_tokens
            .remove(&claims.jti)
            .ok_or_else(|| GatewayError::Unauthenticated("refresh token not recognized".into()))?;
        if record.expires_at < Utc::now().timestamp() {
            return Err(GatewayError::Unauthenticated("refresh token expired".into()));
        }
        Ok(record.user_id)
    }

    /// Blacklist an access token until its natural expiry.
    pub fn revoke_access(&self, token: &str) -> Result<()> {
        let claims = self.decode(token)?;
        self.blacklist.insert(claims.jti, claims.exp);
        Ok(())
    }

    /// Drop expired blacklist and refresh entries. Run by the janitor.
    pub fn sweep(&self) {
        let now = Utc::now().timestamp();
        self.blacklist.retain(|_, exp| *exp > now);
        self.refresh_tokens.retain(|_, r| r.expires_at > now);
    }

    pub fn live_refresh_count(&self) -> usize {
        self.refresh_tokens.len()
    }

    pub fn blacklist_len(&self) -> usize {
        self.blacklist.len()
    }

    fn sign(&self, claims: AccessClaims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| GatewayError::Internal(format!("token signing failed: {e}")))
    }

    fn decode(&self, token: &str) -> Result<AccessClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.validate_exp = true;
        decode::<AccessClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| GatewayError::Unauthenticated(format!("invalid token: {e}")))
    }
}
