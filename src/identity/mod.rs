//! Identity / quota collaborator.
//!
//! The pipeline is agnostic to who is calling; the gateway resolves a
//! bearer token into a [`Caller`] through this trait and enforces the
//! caller's review quota. Tokens are compared by SHA-256 digest — the
//! provider never holds plaintext tokens after construction.

use crate::config::AuthConfig;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// A resolved caller with its usage quota. `reviews_limit` of `None`
/// means unlimited.
#[derive(Debug, Clone)]
pub struct Caller {
    pub id: String,
    pub reviews_used: u64,
    pub reviews_limit: Option<u64>,
}

impl Caller {
    pub fn over_quota(&self) -> bool {
        self.reviews_limit
            .is_some_and(|limit| self.reviews_used >= limit)
    }
}

/// Caller identity collaborator. Resolution returning `None` means the
/// request proceeds anonymously: no quota, no history persistence.
pub trait IdentityProvider: Send + Sync {
    fn name(&self) -> &str;

    fn resolve(&self, bearer: Option<&str>) -> Option<Caller>;

    /// Count one completed review against the caller.
    fn record_review(&self, caller_id: &str);
}

/// Build the configured provider: static tokens when any are
/// configured, open anonymous access otherwise.
pub fn create_identity(config: &AuthConfig) -> Arc<dyn IdentityProvider> {
    if config.tokens.is_empty() {
        Arc::new(OpenAccess)
    } else {
        Arc::new(TokenIdentity::from_config(config))
    }
}

fn digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.trim().as_bytes()))
}

// ── Open access ──────────────────────────────────────────────────

/// No identity at all: every caller is anonymous and unmetered.
pub struct OpenAccess;

impl IdentityProvider for OpenAccess {
    fn name(&self) -> &str {
        "open"
    }

    fn resolve(&self, _bearer: Option<&str>) -> Option<Caller> {
        None
    }

    fn record_review(&self, _caller_id: &str) {}
}

// ── Static token identity ────────────────────────────────────────

struct TokenUser {
    user: String,
    reviews_limit: Option<u64>,
}

/// Static API-token identity with in-memory usage counters.
pub struct TokenIdentity {
    by_digest: HashMap<String, TokenUser>,
    usage: Mutex<HashMap<String, u64>>,
}

impl TokenIdentity {
    pub fn from_config(config: &AuthConfig) -> Self {
        let by_digest = config
            .tokens
            .iter()
            .filter(|entry| !entry.token.trim().is_empty())
            .map(|entry| {
                (
                    digest(&entry.token),
                    TokenUser {
                        user: entry.user.clone(),
                        reviews_limit: (entry.reviews_limit > 0).then_some(entry.reviews_limit),
                    },
                )
            })
            .collect();
        Self {
            by_digest,
            usage: Mutex::new(HashMap::new()),
        }
    }
}

impl IdentityProvider for TokenIdentity {
    fn name(&self) -> &str {
        "token"
    }

    fn resolve(&self, bearer: Option<&str>) -> Option<Caller> {
        let token = bearer?.trim();
        if token.is_empty() {
            return None;
        }
        let user = self.by_digest.get(&digest(token))?;
        let used = self.usage.lock().get(&user.user).copied().unwrap_or(0);
        Some(Caller {
            id: user.user.clone(),
            reviews_used: used,
            reviews_limit: user.reviews_limit,
        })
    }

    fn record_review(&self, caller_id: &str) {
        *self.usage.lock().entry(caller_id.to_owned()).or_insert(0) += 1;
    }
}

// ── Tests ────────────────────────────────────────────────────────
