//! Credential issuance, validation, and permission evaluation.
//!
//! Secrets never persist in plaintext: passwords and API-key secrets are
//! bcrypt hashes from the moment of issuance. JWT refresh tokens rotate on
//! use; revoked access tokens sit in a jti blacklist until they would have
//! expired anyway.

pub mod apikey;
pub mod password;
pub mod permission;
pub mod service;
pub mod token;
pub mod users;

pub use apikey::{ApiKeyMeta, ApiKeyStore, IssuedKey};
pub use password::{LockoutTracker, hash_password, verify_password};
pub use permission::has_permission;
pub use service::{AuthService, Principal, bootstrap};
pub use token::{AccessClaims, TokenPair, TokenService};
pub use users::{Role, UserRecord, UserStore};
