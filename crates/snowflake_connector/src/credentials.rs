//! Secure credential cache interface.
//!
//! The driver only needs to read, write and drop cached tokens. Where they
//! are actually stored (keyring, file, memory) is up to the implementation.
use std::collections::HashMap;
use std::fmt::{self, Debug};

use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    IdToken,
    MfaToken,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IdToken => "ID_TOKEN",
            Self::MfaToken => "MFATOKEN",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one cached credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenSpec {
    pub host: String,
    pub user: String,
    pub token_type: TokenType,
}

impl TokenSpec {
    pub fn new(host: impl Into<String>, user: impl Into<String>, token_type: TokenType) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            token_type,
        }
    }

    pub fn id_token(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self::new(host, user, TokenType::IdToken)
    }

    pub fn mfa_token(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self::new(host, user, TokenType::MfaToken)
    }

    /// Storage key, `None` if host or user is missing.
    pub fn cache_key(&self) -> Option<String> {
        if self.host.is_empty() || self.user.is_empty() {
            return None;
        }
        Some(format!(
            "{}:{}:{}",
            self.host.to_uppercase(),
            self.user.to_uppercase(),
            self.token_type
        ))
    }
}

pub trait CredentialCache: Sync + Send + Debug {
    fn set_credential(&self, spec: &TokenSpec, value: &str);

    fn get_credential(&self, spec: &TokenSpec) -> Option<String>;

    fn delete_credential(&self, spec: &TokenSpec);
}

/// Process local cache, lost on exit.
#[derive(Default)]
pub struct MemoryCredentialCache {
    creds: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Debug for MemoryCredentialCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCredentialCache")
            .field("entries", &self.creds.lock().len())
            .finish()
    }
}

impl CredentialCache for MemoryCredentialCache {
    fn set_credential(&self, spec: &TokenSpec, value: &str) {
        match spec.cache_key() {
            Some(key) => {
                self.creds.lock().insert(key, value.to_string());
            }
            None => debug!(token_type = %spec.token_type, "incomplete token spec, not caching"),
        }
    }

    fn get_credential(&self, spec: &TokenSpec) -> Option<String> {
        let key = spec.cache_key()?;
        self.creds.lock().get(&key).cloned()
    }

    fn delete_credential(&self, spec: &TokenSpec) {
        if let Some(key) = spec.cache_key() {
            self.creds.lock().remove(&key);
        }
    }
}
