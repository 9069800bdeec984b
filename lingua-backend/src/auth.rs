//! Bearer-token resolution.
//!
//! The auth provider is an external collaborator; the backend only needs
//! "token in, user id out". The shipped implementation is a token registry
//! loaded from a JSON file at startup, which is also what the tests seed
//! in memory.

use std::{
    collections::HashMap,
    env, fs,
    path::Path,
    sync::{Arc, RwLock},
};

use axum::http::{header, HeaderMap};
use serde::Deserialize;

const TOKENS_PATH_ENV: &str = "LINGUA_TOKENS_PATH";
const DEFAULT_TOKENS_PATH: &str = "config/tokens.json";

/// Resolve a bearer token to a user identity.
pub trait AuthProvider: Send + Sync {
    fn resolve(&self, token: &str) -> Option<String>;
}

#[derive(Deserialize)]
struct TokenEntry {
    token: String,
    user_id: String,
}

#[derive(Clone)]
pub struct TokenRegistry {
    tokens: Arc<RwLock<HashMap<String, String>>>,
}

impl TokenRegistry {
    pub fn in_memory() -> Self {
        Self {
            tokens: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn from_env() -> Self {
        let path = env::var(TOKENS_PATH_ENV).unwrap_or_else(|_| DEFAULT_TOKENS_PATH.to_string());
        Self::from_path(path)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path_ref = path.as_ref();
        let bytes = fs::read(path_ref).unwrap_or_else(|err| {
            panic!(
                "failed to read token registry from {}: {}",
                path_ref.display(),
                err
            )
        });
        let entries: Vec<TokenEntry> = serde_json::from_slice(&bytes).unwrap_or_else(|err| {
            panic!(
                "failed to parse token registry from {}: {}",
                path_ref.display(),
                err
            )
        });
        let registry = Self::in_memory();
        for entry in entries {
            registry.insert(entry.token, entry.user_id);
        }
        registry
    }

    pub fn insert(&self, token: impl Into<String>, user_id: impl Into<String>) {
        self.tokens
            .write()
            .expect("token registry poisoned")
            .insert(token.into(), user_id.into());
    }
}

impl AuthProvider for TokenRegistry {
    fn resolve(&self, token: &str) -> Option<String> {
        self.tokens
            .read()
            .expect("token registry poisoned")
            .get(token)
            .cloned()
    }
}

/// Pull the bearer token out of the Authorization header, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
