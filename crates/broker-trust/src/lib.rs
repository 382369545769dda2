// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The content-addressed code-trust cache.
//!
//! This is policy only, with no data of its own: every call delegates to
//! [`broker_store::RequestStore`]'s trust table. The facade exists so the
//! Approval Coordinator depends on a narrow, trust-shaped interface rather
//! than the full store contract.

use broker_core::{TrustKey, TrustRecord, TrustScope};
use broker_store::{RequestStore, StoreError};
use chrono::{DateTime, Utc};

/// Thin facade over the Request Store's trust table.
#[derive(Clone)]
pub struct TrustCache {
    store: RequestStore,
}

impl TrustCache {
    /// Wrap an existing store.
    #[must_use]
    pub fn new(store: RequestStore) -> Self {
        Self { store }
    }

    /// Grant trust for `(source_locator, fingerprint)`. Returns
    /// [`StoreError::OnceNotPersistable`] for [`TrustScope::Once`] — callers
    /// that only want a one-shot approval should simply not call this.
    pub async fn grant(
        &self,
        source_locator: &str,
        fingerprint: &str,
        scope: TrustScope,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let key = TrustKey::new(source_locator, fingerprint);
        self.store.add_trust(key, scope, now).await
    }

    /// The sole read path. Returns `None` if there is no grant or it has
    /// expired; an expired grant is deleted as a side effect so no caller
    /// ever observes a stale one.
    pub async fn is_trusted(
        &self,
        source_locator: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let key = TrustKey::new(source_locator, fingerprint);
        self.store.lookup_trust(&key, now).await.is_some()
    }

    /// Full record, if present and unexpired.
    pub async fn lookup(
        &self,
        source_locator: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Option<TrustRecord> {
        let key = TrustKey::new(source_locator, fingerprint);
        self.store.lookup_trust(&key, now).await
    }

    /// Delete every expired record. Called by the Background Janitor; safe
    /// to run concurrently with lookups and grants.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        self.store.sweep_expired_trust(now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn cache() -> TrustCache {
        let dir = tempfile::tempdir().unwrap();
        let store = RequestStore::open(dir.path()).await.unwrap();
        // Leak the tempdir for the test's lifetime rather than threading it
        // through; these tests only assert in-process behavior.
        std::mem::forget(dir);
        TrustCache::new(store)
    }

    #[tokio::test]
    async fn untrusted_code_is_not_trusted() {
        let cache = cache().await;
        assert!(!cache.is_trusted("src", "fp", Utc::now()).await);
    }

    #[tokio::test]
    async fn granting_forever_makes_it_trusted() {
        let cache = cache().await;
        let now = Utc::now();
        cache.grant("src", "fp", TrustScope::Forever, now).await.unwrap();
        assert!(cache.is_trusted("src", "fp", now).await);
        assert!(
            cache
                .is_trusted("src", "fp", now + chrono::Duration::days(3650))
                .await
        );
    }

    #[tokio::test]
    async fn once_scope_cannot_be_granted() {
        let cache = cache().await;
        let err = cache
            .grant("src", "fp", TrustScope::Once, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::OnceNotPersistable));
    }

    #[tokio::test]
    async fn twenty_four_hour_grant_expires() {
        let cache = cache().await;
        let t0 = Utc::now();
        cache
            .grant("src", "fp", TrustScope::TwentyFourHours, t0)
            .await
            .unwrap();
        assert!(cache.is_trusted("src", "fp", t0).await);
        let later = t0 + chrono::Duration::seconds(broker_core::TRUST_24H_SECS + 1);
        assert!(!cache.is_trusted("src", "fp", later).await);
    }

    #[tokio::test]
    async fn distinct_fingerprints_are_independent() {
        let cache = cache().await;
        let now = Utc::now();
        cache.grant("src", "fp-a", TrustScope::Forever, now).await.unwrap();
        assert!(cache.is_trusted("src", "fp-a", now).await);
        assert!(!cache.is_trusted("src", "fp-b", now).await);
    }
}
