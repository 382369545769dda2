// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Named-secret key-value store, gated behind the same approval channel as
//! code execution.
//!
//! Values never leave this crate except as environment variables handed to
//! the Sandbox Executor — see [`SecretVault::get`]'s doc comment for the
//! invariant this crate exists to protect.

use broker_store::{RequestStore, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// In-memory cache over the Request Store's secret table.
///
/// Reads are served from memory; writes go through to the store first so a
/// crash between the two never loses a secret the caller believes was
/// saved.
#[derive(Clone)]
pub struct SecretVault {
    store: RequestStore,
    cache: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl std::fmt::Debug for SecretVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretVault").finish_non_exhaustive()
    }
}

impl SecretVault {
    /// Populate the vault from the store's persisted secret table. Call
    /// once at process startup.
    pub async fn hydrate(store: RequestStore) -> Result<Self, StoreError> {
        let names = store.list_secret_names().await;
        let mut cache = HashMap::with_capacity(names.len());
        for name in &names {
            if let Some(value) = store.get_secret(name).await {
                cache.insert(name.clone(), value);
            }
        }
        info!(count = cache.len(), "vault hydrated from store");
        Ok(Self {
            store,
            cache: Arc::new(RwLock::new(cache)),
        })
    }

    /// Write a secret value. A single atomic operation — never a
    /// read-modify-write race between callers.
    pub async fn put(&self, name: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.store.put_secret(name, &value).await?;
        self.cache.write().await.insert(name.to_string(), value);
        Ok(())
    }

    /// Read a secret's value.
    ///
    /// The returned bytes must never be written to any externally
    /// reachable surface — HTTP response, chat message, or log line. The
    /// only legitimate destination is the sandboxed subprocess's
    /// environment.
    pub async fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.cache.read().await.get(name).cloned()
    }

    /// Delete a secret.
    pub async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.store.delete_secret(name).await?;
        self.cache.write().await.remove(name);
        Ok(())
    }

    /// Names only — never values.
    pub async fn list_names(&self) -> Vec<String> {
        self.cache.read().await.keys().cloned().collect()
    }

    /// Of `declared`, which names are currently absent from the vault, in
    /// the order `declared` specifies. Used by the Approval Coordinator to
    /// decide whether a request must enter `awaiting_secrets`.
    pub async fn missing(&self, declared: &[String]) -> Vec<String> {
        let cache = self.cache.read().await;
        declared
            .iter()
            .filter(|name| !cache.contains_key(name.as_str()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn vault() -> SecretVault {
        let dir = tempfile::tempdir().unwrap();
        let store = RequestStore::open(dir.path()).await.unwrap();
        std::mem::forget(dir);
        SecretVault::hydrate(store).await.unwrap()
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let vault = vault().await;
        vault.put("K", b"v1".to_vec()).await.unwrap();
        assert_eq!(vault.get("K").await.unwrap(), b"v1");
    }

    #[tokio::test]
    async fn list_names_never_exposes_values() {
        let vault = vault().await;
        vault.put("API_KEY", b"super-secret-sentinel".to_vec()).await.unwrap();
        let names = vault.list_names().await;
        assert_eq!(names, vec!["API_KEY".to_string()]);
        for name in &names {
            assert!(!name.contains("super-secret-sentinel"));
        }
    }

    #[tokio::test]
    async fn debug_impl_never_exposes_values() {
        let vault = vault().await;
        vault.put("K", b"super-secret-sentinel".to_vec()).await.unwrap();
        let rendered = format!("{vault:?}");
        assert!(!rendered.contains("super-secret-sentinel"));
    }

    #[tokio::test]
    async fn missing_reports_only_absent_declared_names() {
        let vault = vault().await;
        vault.put("A", b"1".to_vec()).await.unwrap();
        let missing = vault
            .missing(&["A".to_string(), "B".to_string(), "C".to_string()])
            .await;
        assert_eq!(missing, vec!["B".to_string(), "C".to_string()]);
    }

    #[tokio::test]
    async fn delete_removes_from_cache_and_listing() {
        let vault = vault().await;
        vault.put("K", b"v".to_vec()).await.unwrap();
        vault.delete("K").await.unwrap();
        assert!(vault.get("K").await.is_none());
        assert!(vault.list_names().await.is_empty());
    }

    #[tokio::test]
    async fn hydrate_recovers_existing_secrets_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = RequestStore::open(dir.path()).await.unwrap();
        store.put_secret("PRELOADED", b"x").await.unwrap();
        let vault = SecretVault::hydrate(store).await.unwrap();
        assert_eq!(vault.get("PRELOADED").await.unwrap(), b"x");
    }
}
