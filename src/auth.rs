//! Authentication gate for the admin and audit surface
//!
//! Three credential kinds, each independently sufficient:
//!
//! 1. Shared secret: `Authorization: Basic` against `ADMIN_USERNAME` /
//!    `ADMIN_PASSWORD` (the password is hashed at startup; comparison is
//!    constant-time over the digests).
//! 2. Session token: `Authorization: Bearer` carrying an HS256-signed blob
//!    with subject, kind, and expiry. Access tokens are short-lived; refresh
//!    tokens are accepted only by the refresh endpoint. There is no
//!    server-side session table.
//! 3. Opaque key: `X-API-Key`, stored hashed; the `vpx_`-prefix identifies
//!    keys externally without revealing them.
//!
//! Every failure collapses to a generic 401 on the wire.

use std::net::IpAddr;
use std::path::Path;

use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

/// Access tokens live for 30 minutes.
const ACCESS_TOKEN_TTL_SECS: i64 = 30 * 60;
/// Refresh tokens live for 7 days.
const REFRESH_TOKEN_TTL_SECS: i64 = 7 * 24 * 3600;
/// Opaque keys are identified externally by this prefix plus a short tail.
const KEY_PREFIX: &str = "vpx_";

const KEY_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS api_keys (
    key_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    key_hash TEXT NOT NULL UNIQUE,
    key_prefix TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_used_at TEXT,
    is_active INTEGER DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_api_keys_hash ON api_keys(key_hash);
";

/// Auth failures. Collapsed to a generic 401 at the HTTP boundary.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    Missing,
    #[error("invalid credentials")]
    Invalid,
    #[error("credential store error: {0}")]
    Store(String),
}

/// Who a request authenticated as.
#[derive(Debug, Clone)]
pub enum Identity {
    /// Shared-secret or token subject
    Admin(String),
    /// Opaque key id
    ApiKey(String),
}

impl Identity {
    pub fn subject(&self) -> &str {
        match self {
            Self::Admin(name) => name,
            Self::ApiKey(id) => id,
        }
    }
}

/// Constant-time equality over fixed-size digests.
fn digest_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Shared-secret credential loaded from the environment at startup.
pub struct AdminCredentials {
    username: String,
    password_hash: [u8; 32],
}

impl AdminCredentials {
    pub fn new(username: impl Into<String>, password: &str) -> Self {
        Self {
            username: username.into(),
            password_hash: sha256(password.as_bytes()),
        }
    }

    /// Constant-time verification of a presented username/password pair.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        let user_ok = digest_eq(&sha256(username.as_bytes()), &sha256(self.username.as_bytes()));
        let pass_ok = digest_eq(&sha256(password.as_bytes()), &self.password_hash);
        user_ok && pass_ok
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

/// Session-token kind. Refresh tokens are only good for minting new pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    iat: i64,
    #[serde(rename = "type")]
    kind: TokenKind,
}

/// Token pair handed to a freshly authenticated caller.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
}

/// Issues and verifies HMAC-signed session tokens.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenService {
    pub fn new(signing_key: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(signing_key.as_bytes()),
            decoding: DecodingKey::from_secret(signing_key.as_bytes()),
        }
    }

    fn issue(&self, subject: &str, kind: TokenKind, ttl_secs: i64) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: subject.to_string(),
            exp: now + ttl_secs,
            iat: now,
            kind,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Store(e.to_string()))
    }

    /// Mint a fresh access/refresh pair for `subject`.
    pub fn issue_pair(&self, subject: &str) -> Result<TokenPair, AuthError> {
        Ok(TokenPair {
            access_token: self.issue(subject, TokenKind::Access, ACCESS_TOKEN_TTL_SECS)?,
            refresh_token: self.issue(subject, TokenKind::Refresh, REFRESH_TOKEN_TTL_SECS)?,
            token_type: "bearer",
            expires_in: ACCESS_TOKEN_TTL_SECS,
        })
    }

    /// Verify signature, expiry, and kind; returns the subject.
    pub fn verify(&self, token: &str, expected: TokenKind) -> Result<String, AuthError> {
        let validation = Validation::new(Algorithm::HS256);
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|_| AuthError::Invalid)?;

        if data.claims.kind != expected {
            return Err(AuthError::Invalid);
        }
        Ok(data.claims.sub)
    }
}

/// Key metadata on the admin surface. The secret is never listed.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyInfo {
    pub key_id: String,
    pub name: String,
    pub key_prefix: String,
    pub created_at: String,
    pub last_used_at: Option<String>,
    pub is_active: bool,
}

/// Creation response; the only place the secret ever appears.
#[derive(Debug, Clone, Serialize)]
pub struct NewApiKey {
    pub key_id: String,
    pub name: String,
    /// Shown exactly once
    pub api_key: String,
    pub key_prefix: String,
    pub created_at: String,
}

/// SQLite-backed store of long-lived opaque keys, hashed at rest.
pub struct KeyStore {
    conn: Mutex<Connection>,
}

impl KeyStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(KEY_SCHEMA)?;
        info!("key store opened at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(KEY_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Generate and persist a new key. The cleartext secret is returned
    /// once and only its hash is stored.
    pub fn generate(&self, name: &str) -> Result<NewApiKey, AuthError> {
        let mut rng = rand::thread_rng();
        let secret: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(40)
            .map(char::from)
            .collect();
        let api_key = format!("{KEY_PREFIX}{secret}");

        let key_id: String = hex::encode(rng.gen::<[u8; 8]>());
        let key_hash = hex::encode(sha256(api_key.as_bytes()));
        let key_prefix = api_key[..KEY_PREFIX.len() + 7].to_string();
        let created_at = Utc::now().to_rfc3339();

        self.conn
            .lock()
            .execute(
                "INSERT INTO api_keys (key_id, name, key_hash, key_prefix, created_at) \
                 VALUES (?, ?, ?, ?, ?)",
                rusqlite::params![key_id, name, key_hash, key_prefix, created_at],
            )
            .map_err(|e| AuthError::Store(e.to_string()))?;

        info!("created API key {} ({})", key_id, name);

        Ok(NewApiKey {
            key_id,
            name: name.to_string(),
            api_key,
            key_prefix,
            created_at,
        })
    }

    /// Verify a presented key; returns its id. `last_used_at` is refreshed
    /// best-effort on success.
    pub fn verify(&self, api_key: &str) -> Result<String, AuthError> {
        if !api_key.starts_with(KEY_PREFIX) {
            return Err(AuthError::Invalid);
        }
        let key_hash = hex::encode(sha256(api_key.as_bytes()));

        let conn = self.conn.lock();
        let row: Option<(String, bool)> = conn
            .query_row(
                "SELECT key_id, is_active FROM api_keys WHERE key_hash = ?",
                [&key_hash],
                |row| Ok((row.get(0)?, row.get::<_, i64>(1)? != 0)),
            )
            .optional()
            .map_err(|e| AuthError::Store(e.to_string()))?;

        let (key_id, active) = row.ok_or(AuthError::Invalid)?;
        if !active {
            warn!("rejected revoked API key {}", key_id);
            return Err(AuthError::Invalid);
        }

        // Best effort; a failed touch does not fail the auth
        let _ = conn.execute(
            "UPDATE api_keys SET last_used_at = ? WHERE key_id = ?",
            rusqlite::params![Utc::now().to_rfc3339(), key_id],
        );

        Ok(key_id)
    }

    pub fn list(&self) -> Result<Vec<ApiKeyInfo>, AuthError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT key_id, name, key_prefix, created_at, last_used_at, is_active \
                 FROM api_keys ORDER BY created_at DESC",
            )
            .map_err(|e| AuthError::Store(e.to_string()))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(ApiKeyInfo {
                    key_id: row.get(0)?,
                    name: row.get(1)?,
                    key_prefix: row.get(2)?,
                    created_at: row.get(3)?,
                    last_used_at: row.get(4)?,
                    is_active: row.get::<_, i64>(5)? != 0,
                })
            })
            .map_err(|e| AuthError::Store(e.to_string()))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| AuthError::Store(e.to_string()))
    }

    /// Set `active = false`; the key stops validating but stays listed.
    pub fn revoke(&self, key_id: &str) -> Result<bool, AuthError> {
        let changed = self
            .conn
            .lock()
            .execute("UPDATE api_keys SET is_active = 0 WHERE key_id = ?", [key_id])
            .map_err(|e| AuthError::Store(e.to_string()))?;
        if changed > 0 {
            info!("revoked API key {}", key_id);
        }
        Ok(changed > 0)
    }

    /// Remove the key entirely.
    pub fn delete(&self, key_id: &str) -> Result<bool, AuthError> {
        let changed = self
            .conn
            .lock()
            .execute("DELETE FROM api_keys WHERE key_id = ?", [key_id])
            .map_err(|e| AuthError::Store(e.to_string()))?;
        if changed > 0 {
            info!("deleted API key {}", key_id);
        }
        Ok(changed > 0)
    }
}

/// Unified gate over the three credential kinds.
pub struct AuthGate {
    pub credentials: AdminCredentials,
    pub tokens: TokenService,
    pub keys: KeyStore,
}

impl AuthGate {
    pub fn new(credentials: AdminCredentials, tokens: TokenService, keys: KeyStore) -> Self {
        Self {
            credentials,
            tokens,
            keys,
        }
    }

    /// Authenticate a request from its headers. Any one credential kind is
    /// sufficient; the failure reason is not surfaced to the caller.
    pub fn authenticate(
        &self,
        headers: &axum::http::HeaderMap,
        client_ip: IpAddr,
    ) -> Result<Identity, AuthError> {
        if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
            return match self.keys.verify(key) {
                Ok(key_id) => Ok(Identity::ApiKey(key_id)),
                Err(e) => {
                    warn!("API key auth failed from {}", client_ip);
                    Err(e)
                }
            };
        }

        let authorization = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::Missing)?;

        if let Some(token) = authorization.strip_prefix("Bearer ") {
            return match self.tokens.verify(token, TokenKind::Access) {
                Ok(subject) => Ok(Identity::Admin(subject)),
                Err(e) => {
                    warn!("bearer auth failed from {}", client_ip);
                    Err(e)
                }
            };
        }

        if let Some(encoded) = authorization.strip_prefix("Basic ") {
            let (username, password) = decode_basic(encoded).ok_or(AuthError::Invalid)?;
            if self.credentials.verify(&username, &password) {
                return Ok(Identity::Admin(username));
            }
            warn!("basic auth failed for '{}' from {}", username, client_ip);
            return Err(AuthError::Invalid);
        }

        Err(AuthError::Invalid)
    }
}

/// Decode a `Basic` credential into (username, password).
pub fn decode_basic(encoded: &str) -> Option<(String, String)> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let pair = String::from_utf8(decoded).ok()?;
    let (user, pass) = pair.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_verify() {
        let creds = AdminCredentials::new("admin", "hunter2");
        assert!(creds.verify("admin", "hunter2"));
        assert!(!creds.verify("admin", "wrong"));
        assert!(!creds.verify("root", "hunter2"));
        assert!(!creds.verify("", ""));
    }

    #[test]
    fn test_token_round_trip() {
        let service = TokenService::new("test-signing-key");
        let pair = service.issue_pair("admin").unwrap();

        assert_eq!(pair.token_type, "bearer");
        assert_eq!(pair.expires_in, 30 * 60);
        assert_eq!(
            service.verify(&pair.access_token, TokenKind::Access).unwrap(),
            "admin"
        );
        assert_eq!(
            service
                .verify(&pair.refresh_token, TokenKind::Refresh)
                .unwrap(),
            "admin"
        );
    }

    #[test]
    fn test_token_kind_enforced() {
        let service = TokenService::new("test-signing-key");
        let pair = service.issue_pair("admin").unwrap();

        // A refresh token is not an access token and vice versa
        assert!(service.verify(&pair.refresh_token, TokenKind::Access).is_err());
        assert!(service.verify(&pair.access_token, TokenKind::Refresh).is_err());
    }

    #[test]
    fn test_token_wrong_key_rejected() {
        let issuer = TokenService::new("key-one");
        let verifier = TokenService::new("key-two");
        let pair = issuer.issue_pair("admin").unwrap();

        assert!(verifier.verify(&pair.access_token, TokenKind::Access).is_err());
    }

    #[test]
    fn test_tampered_token_rejected() {
        let service = TokenService::new("test-signing-key");
        let pair = service.issue_pair("admin").unwrap();

        let mut tampered = pair.access_token.clone();
        tampered.push('x');
        assert!(service.verify(&tampered, TokenKind::Access).is_err());
        assert!(service.verify("not-a-token", TokenKind::Access).is_err());
    }

    #[test]
    fn test_key_store_lifecycle() {
        let store = KeyStore::open_in_memory().unwrap();

        let new_key = store.generate("ci-bot").unwrap();
        assert!(new_key.api_key.starts_with("vpx_"));
        assert!(new_key.key_prefix.len() < new_key.api_key.len());

        // The cleartext validates; the prefix alone does not
        assert_eq!(store.verify(&new_key.api_key).unwrap(), new_key.key_id);
        assert!(store.verify(&new_key.key_prefix).is_err());
        assert!(store.verify("vpx_bogus").is_err());
        assert!(store.verify("unprefixed").is_err());

        // Listing exposes metadata, never the secret
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key_id, new_key.key_id);
        assert!(listed[0].is_active);
        assert!(listed[0].last_used_at.is_some());

        // Revoked keys stop validating but stay listed
        assert!(store.revoke(&new_key.key_id).unwrap());
        assert!(store.verify(&new_key.api_key).is_err());
        assert_eq!(store.list().unwrap().len(), 1);

        // Deletion removes them
        assert!(store.delete(&new_key.key_id).unwrap());
        assert_eq!(store.list().unwrap().len(), 0);
        assert!(!store.revoke(&new_key.key_id).unwrap());
    }

    #[test]
    fn test_decode_basic() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("admin:s3cret");
        assert_eq!(
            decode_basic(&encoded),
            Some(("admin".to_string(), "s3cret".to_string()))
        );
        assert_eq!(decode_basic("!!!"), None);
    }

    #[test]
    fn test_gate_prefers_each_kind() {
        use axum::http::{HeaderMap, HeaderValue};

        let gate = AuthGate::new(
            AdminCredentials::new("admin", "hunter2"),
            TokenService::new("signing-key"),
            KeyStore::open_in_memory().unwrap(),
        );
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        // No credentials at all
        assert!(gate.authenticate(&HeaderMap::new(), ip).is_err());

        // Basic
        let mut headers = HeaderMap::new();
        let basic = base64::engine::general_purpose::STANDARD.encode("admin:hunter2");
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {basic}")).unwrap(),
        );
        assert!(matches!(
            gate.authenticate(&headers, ip).unwrap(),
            Identity::Admin(_)
        ));

        // Bearer
        let pair = gate.tokens.issue_pair("admin").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", pair.access_token)).unwrap(),
        );
        assert!(matches!(
            gate.authenticate(&headers, ip).unwrap(),
            Identity::Admin(_)
        ));

        // Refresh token is not valid on the general gate
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", pair.refresh_token)).unwrap(),
        );
        assert!(gate.authenticate(&headers, ip).is_err());

        // API key
        let key = gate.keys.generate("svc").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_str(&key.api_key).unwrap());
        assert!(matches!(
            gate.authenticate(&headers, ip).unwrap(),
            Identity::ApiKey(_)
        ));
    }
}
