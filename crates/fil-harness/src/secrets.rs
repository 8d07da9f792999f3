//! Key-store indirection for provider credentials.
//!
//! The registry never holds API keys; it holds references into this store.
//! Secret material is zeroed from memory when dropped.

use std::collections::HashMap;
use std::sync::RwLock;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// A secret value wiped on drop. Access only through [`Secret::expose`].
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(****)")
    }
}

/// In-memory secret store keyed by opaque reference strings
/// (e.g. `provider:anthropic-main`).
pub struct SecretStore {
    entries: RwLock<HashMap<String, Secret>>,
}

impl SecretStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn put(&self, reference: impl Into<String>, secret: Secret) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(reference.into(), secret);
    }

    pub fn get(&self, reference: &str) -> Option<Secret> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(reference)
            .cloned()
    }

    pub fn remove(&self, reference: &str) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(reference);
    }

    /// Resolve a secret from an environment variable, storing it under the
    /// given reference. Missing/empty variables store nothing.
    pub fn put_from_env(&self, reference: impl Into<String>, env_var: &str) -> bool {
        match std::env::var(env_var) {
            Ok(value) if !value.is_empty() => {
                self.put(reference, Secret::new(value));
                true
            }
            _ => false,
        }
    }
}

impl Default for SecretStore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_remove() {
        let store = SecretStore::new();
        store.put("provider:a", Secret::new("sk-123"));
        assert_eq!(store.get("provider:a").unwrap().expose(), "sk-123");

        store.remove("provider:a");
        assert!(store.get("provider:a").is_none());
    }

    #[test]
    fn debug_never_prints_material() {
        let secret = Secret::new("sk-should-not-leak");
        let printed = format!("{secret:?}");
        assert!(!printed.contains("leak"));
        assert!(printed.contains("****"));
    }
}
