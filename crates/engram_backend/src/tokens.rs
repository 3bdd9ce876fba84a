//! Worker token service.
//!
//! Issues, validates, and revokes the credentials that let workers register
//! with the hub. The plaintext token is returned exactly once at creation;
//! only a salted SHA-256 hash and a display prefix are persisted.

use anyhow::Result;
use chrono::Utc;
use engram_protocol::http::CreateTokenRequest;
use engram_protocol::{HubId, TokenId, TokenScope, WorkerId};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::db::models::TaskRecord;
use crate::db::tokens::{RegistrationRecord, TokenRecord, TokenStore};

const TOKEN_PREFIX_TAG: &str = "egt_";
/// Tag + 8 hex chars shown in listings; enough to tell tokens apart.
const DISPLAY_PREFIX_LEN: usize = TOKEN_PREFIX_TAG.len() + 8;
const SECRET_BYTES: usize = 20;
const SALT_BYTES: usize = 16;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid worker token")]
    Invalid,
    #[error("worker token revoked")]
    Revoked,
    #[error("worker token expired")]
    Expired,
    #[error("token permits none of the declared capabilities")]
    NoPermittedCapabilities,
}

/// Scope context attached to an authenticated worker, consulted on every
/// assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenScopeContext {
    pub token_id: TokenId,
    pub scope: TokenScope,
    pub hub_id: Option<HubId>,
    pub project_filter: Option<String>,
}

impl TokenScopeContext {
    /// Scope check for handing `task` to a worker through `assigning_hub`.
    pub fn permits(&self, task: &TaskRecord, assigning_hub: &HubId) -> bool {
        match self.scope {
            TokenScope::Instance => true,
            TokenScope::Group => self.hub_id.as_ref() == Some(assigning_hub),
            TokenScope::Project => match (&self.project_filter, task.project()) {
                (Some(filter), Some(project)) => filter == project,
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenService {
    store: TokenStore,
}

impl TokenService {
    pub fn new(store: TokenStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Create a token. The returned plaintext is the only copy that will
    /// ever exist.
    pub async fn create(&self, req: &CreateTokenRequest) -> Result<(TokenRecord, String)> {
        let plain = generate_plain_token();
        let prefix = plain[..DISPLAY_PREFIX_LEN].to_string();
        let record = TokenRecord {
            id: TokenId::new(),
            name: req.name.clone(),
            token_hash: hash_token(&plain),
            token_prefix: prefix,
            scope: req.scope,
            hub_id: req.hub_id.clone(),
            project_filter: req.project_filter.clone(),
            capabilities: req.capabilities.clone(),
            labels: req.labels.clone(),
            created_at: Utc::now(),
            expires_at: req.expires_at,
            revoked_at: None,
            last_used_at: None,
        };
        self.store.insert(&record).await?;
        info!(token_id = %record.id, name = %record.name, scope = %record.scope, "Worker token created");
        Ok((record, plain))
    }

    /// Validate a presented plaintext token. Updates `last_used_at` on
    /// success.
    pub async fn validate(&self, plain: &str) -> Result<TokenRecord, TokenError> {
        if plain.len() <= DISPLAY_PREFIX_LEN || !plain.starts_with(TOKEN_PREFIX_TAG) {
            return Err(TokenError::Invalid);
        }
        let prefix = &plain[..DISPLAY_PREFIX_LEN];

        let candidates = self.store.find_by_prefix(prefix).await.map_err(|e| {
            warn!("Token lookup failed: {}", e);
            TokenError::Invalid
        })?;

        let now = Utc::now();
        for candidate in candidates {
            if !verify_token(plain, &candidate.token_hash) {
                continue;
            }
            if candidate.is_revoked() {
                return Err(TokenError::Revoked);
            }
            if candidate.is_expired(now) {
                return Err(TokenError::Expired);
            }
            if let Err(e) = self.store.touch_last_used(&candidate.id).await {
                warn!(token_id = %candidate.id, "Failed to update last_used_at: {}", e);
            }
            return Ok(candidate);
        }
        Err(TokenError::Invalid)
    }

    pub async fn list(&self) -> Result<Vec<TokenRecord>> {
        self.store.list().await
    }

    pub async fn get(&self, id: &TokenId) -> Result<Option<TokenRecord>> {
        self.store.get(id).await
    }

    pub async fn revoke(&self, id: &TokenId) -> Result<bool> {
        self.store.revoke(id).await
    }

    /// Register a worker instance under a validated token. The effective
    /// capability set is the declared set intersected with the token's
    /// allowed set (when one is configured).
    pub async fn register_worker(
        &self,
        token: &TokenRecord,
        system_id: &str,
        worker_id: &WorkerId,
        declared_capabilities: &[String],
        labels: &HashMap<String, String>,
        metadata: &serde_json::Value,
    ) -> Result<(RegistrationRecord, Vec<String>), TokenError> {
        let effective = effective_capabilities(declared_capabilities, token.capabilities.as_deref());
        if effective.is_empty() {
            return Err(TokenError::NoPermittedCapabilities);
        }

        let registration = self
            .store
            .register_worker(&token.id, system_id, worker_id, &effective, labels, metadata)
            .await
            .map_err(|e| {
                warn!("Worker registration failed: {}", e);
                TokenError::Invalid
            })?;

        debug!(
            worker_id = %worker_id,
            system_id,
            capabilities = ?effective,
            "Worker registered"
        );
        Ok((registration, effective))
    }

    pub async fn mark_offline(&self, registration_id: &str) -> Result<bool> {
        self.store.mark_offline(registration_id).await
    }

    pub async fn heartbeat(&self, registration_id: &str) -> Result<()> {
        self.store.heartbeat(registration_id).await
    }
}

fn effective_capabilities(declared: &[String], allowed: Option<&[String]>) -> Vec<String> {
    match allowed {
        None => declared.to_vec(),
        Some(allowed) => declared
            .iter()
            .filter(|cap| allowed.iter().any(|a| a == *cap))
            .cloned()
            .collect(),
    }
}

fn generate_plain_token() -> String {
    let mut secret = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut secret);
    format!("{}{}", TOKEN_PREFIX_TAG, hex_encode(&secret))
}

/// `<salt_hex>$<sha256(salt || token)_hex>`
fn hash_token(plain: &str) -> String {
    let mut salt = [0u8; SALT_BYTES];
    rand::thread_rng().fill_bytes(&mut salt);
    format!("{}${}", hex_encode(&salt), digest_with_salt(&salt, plain))
}

fn verify_token(plain: &str, stored_hash: &str) -> bool {
    let Some((salt_hex, digest_hex)) = stored_hash.split_once('$') else {
        return false;
    };
    let Some(salt) = hex_decode(salt_hex) else {
        return false;
    };
    // Hashes are fixed-length hex; plain comparison leaks nothing useful.
    digest_with_salt(&salt, plain) == digest_hex
}

fn digest_with_salt(salt: &[u8], plain: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(plain.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hex = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(hex, 16).ok()
        })
        .collect()
}

/// Convenience used by tests and the admin API.
pub fn default_create_request(name: &str) -> CreateTokenRequest {
    CreateTokenRequest {
        name: name.to_string(),
        scope: TokenScope::Instance,
        hub_id: None,
        project_filter: None,
        capabilities: None,
        labels: HashMap::new(),
        expires_at: None,
    }
}
