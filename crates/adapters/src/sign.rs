//! Outbound request authentication.
//!
//! Materializes a provider record's auth scheme: bearer headers, custom
//! API-key headers, SigV4 request signing, and service-account JWTs
//! exchanged for short-lived OAuth tokens (cached, refreshed 60 s before
//! expiry).

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use llmrouter_core::error::{GatewayError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Credentials supplied by configuration for one provider.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_region: Option<String>,
    /// Path to a service-account JSON key file.
    pub credentials_file: Option<String>,
}

impl Credentials {
    pub fn bearer(key: impl Into<String>) -> Self {
        Self {
            api_key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn require_api_key(&self, provider: &str) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            GatewayError::Internal(format!("provider '{provider}' has no API key configured"))
        })
    }
}

// ── SigV4 ───────────────────────────────────────────────────────────────

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Sign a request AWS-style. Returns the headers to attach:
/// `host`, `x-amz-date`, and `authorization`.
///
/// Only the header set the gateway actually sends participates in the
/// canonical request, which keeps the signature stable regardless of
/// what the HTTP client adds later.
pub fn sigv4_headers(
    access_key: &str,
    secret_key: &str,
    region: &str,
    service: &str,
    method: &str,
    url: &reqwest::Url,
    payload: &[u8],
    now: chrono::DateTime<Utc>,
) -> Vec<(String, String)> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let host = url.host_str().unwrap_or_default().to_string();

    let canonical_uri = if url.path().is_empty() { "/" } else { url.path() };
    let canonical_query = url.query().unwrap_or("");
    let payload_hash = hex(&Sha256::digest(payload));

    let canonical_headers = format!("host:{host}\nx-amz-date:{amz_date}\n");
    let signed_headers = "host;x-amz-date";

    let canonical_request = format!(
        "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
    );

    let scope = format!("{date_stamp}/{region}/{service}/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        hex(&Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    let signature = hex(&hmac_sha256(&k_signing, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={access_key}/{scope}, SignedHeaders={signed_headers}, Signature={signature}"
    );

    vec![
        ("host".into(), host),
        ("x-amz-date".into(), amz_date),
        ("authorization".into(), authorization),
    ]
}

// ── Service-account OAuth ───────────────────────────────────────────────

/// The fields of a service-account key file we use.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl ServiceAccountKey {
    pub fn from_file(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Internal(format!("cannot read service-account key '{path}': {e}"))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            GatewayError::Internal(format!("invalid service-account key '{path}': {e}"))
        })
    }
}

#[derive(Debug, serde::Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expiry")]
    expires_in: u64,
}

fn default_expiry() -> u64 {
    3_600
}

/// Refresh this long before the token actually expires.
const EARLY_REFRESH: Duration = Duration::from_secs(60);

/// Cached OAuth token minted from a service-account JWT assertion.
pub struct ServiceAccountTokenSource {
    key: ServiceAccountKey,
    token_uri: String,
    scope: String,
    cached: Mutex<Option<(String, Instant)>>,
}

impl ServiceAccountTokenSource {
    pub fn new(key: ServiceAccountKey, token_uri: &str, scope: &str) -> Self {
        let token_uri = key
            .token_uri
            .clone()
            .unwrap_or_else(|| token_uri.to_string());
        Self {
            key,
            token_uri,
            scope: scope.to_string(),
            cached: Mutex::new(None),
        }
    }

    /// Current token, minting a fresh one when the cache is empty or
    /// inside the early-refresh window.
    pub async fn token(&self, client: &reqwest::Client) -> Result<String> {
        {
            let cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((token, expires_at)) = cached.as_ref() {
                if *expires_at > Instant::now() + EARLY_REFRESH {
                    return Ok(token.clone());
                }
            }
        }

        let now = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: &self.scope,
            aud: &self.token_uri,
            iat: now,
            exp: now + 3_600,
        };
        let encoding_key = jsonwebtoken::EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|e| GatewayError::Internal(format!("bad service-account key: {e}")))?;
        let assertion = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &encoding_key,
        )
        .map_err(|e| GatewayError::Internal(format!("assertion signing failed: {e}")))?;

        let response = client
            .post(&self.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::Internal(format!("token exchange failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(GatewayError::Internal(format!(
                "token endpoint returned status {status}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Internal(format!("bad token response: {e}")))?;

        let expires_at = Instant::now() + Duration::from_secs(token.expires_in);
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        *cached = Some((token.access_token.clone(), expires_at));
        Ok(token.access_token)
    }
}

/// Managed-identity token sourced from the host environment.
pub fn managed_identity_token(provider: &str) -> Result<String> {
    std::env::var("MANAGED_IDENTITY_TOKEN").map_err(|_| {
        GatewayError::Internal(format!(
            "provider '{provider}' uses managed identity but MANAGED_IDENTITY_TOKEN is not set"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sigv4_headers_are_deterministic() {
        let url: reqwest::Url = "https://bedrock-runtime.us-east-1.amazonaws.com/model/anthropic.claude-v2/invoke"
            .parse()
            .unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();

        let a = sigv4_headers("AKIDEXAMPLE", "secret", "us-east-1", "bedrock", "POST", &url, b"{}", now);
        let b = sigv4_headers("AKIDEXAMPLE", "secret", "us-east-1", "bedrock", "POST", &url, b"{}", now);
        assert_eq!(a, b);

        let auth = &a.iter().find(|(k, _)| k == "authorization").unwrap().1;
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20260115/us-east-1/bedrock/aws4_request"));
        assert!(auth.contains("SignedHeaders=host;x-amz-date"));
        assert!(auth.contains("Signature="));

        let date = &a.iter().find(|(k, _)| k == "x-amz-date").unwrap().1;
        assert_eq!(date, "20260115T120000Z");
    }

    #[test]
    fn sigv4_signature_depends_on_payload() {
        let url: reqwest::Url = "https://example.amazonaws.com/".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
        let a = sigv4_headers("k", "s", "us-east-1", "bedrock", "POST", &url, b"one", now);
        let b = sigv4_headers("k", "s", "us-east-1", "bedrock", "POST", &url, b"two", now);
        assert_ne!(a, b);
    }

    #[test]
    fn credentials_require_key() {
        let creds = Credentials::default();
        assert!(creds.require_api_key("p").is_err());
        assert_eq!(Credentials::bearer("sk").require_api_key("p").unwrap(), "sk");
    }
}
