// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Durable persistence for requests, code bytes, trust grants, and secrets.
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/requests/<uuid>.json   one row per request
//! <root>/codes/<uuid>.bin       fingerprinted code bytes, keyed by request id
//! <root>/secrets/<name>.bin     one file per secret, raw bytes
//! <root>/trust.json             the full trust table, rewritten atomically
//! ```
//!
//! An in-memory index mirrors the `requests` and `trust` tables, hydrated at
//! startup (mirrors the daemon's receipt-hydration pattern: load once, then
//! serve reads from memory and keep disk in sync on every write).

use broker_core::{Request, RequestState, TrustKey, TrustRecord, TrustScope};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, warn};
use uuid::Uuid;

/// Errors surfaced by the Request Store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A request with this id already exists.
    #[error("request {0} already exists")]
    DuplicateRequestId(Uuid),

    /// No request exists with this id.
    #[error("request {0} not found")]
    RequestNotFound(Uuid),

    /// `transition`'s compare-and-set precondition was not met.
    #[error("request {id}: expected state {expected}, found {actual}")]
    TransitionConflict {
        /// The request in question.
        id: Uuid,
        /// The state the caller expected to CAS from.
        expected: RequestState,
        /// The state actually found.
        actual: RequestState,
    },

    /// Attempted to persist the `once` trust scope.
    #[error("trust scope `once` is never persisted")]
    OnceNotPersistable,

    /// A secret name was empty.
    #[error("secret name must not be empty")]
    EmptySecretName,

    /// No code bytes are stored for this request.
    #[error("code bytes for request {0} not found")]
    CodeNotFound(Uuid),

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Row or table failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable, concurrency-safe store backing the orchestration engine.
///
/// Cloning is cheap: all state lives behind `Arc`.
#[derive(Clone)]
pub struct RequestStore {
    root: PathBuf,
    requests: Arc<RwLock<HashMap<Uuid, Request>>>,
    row_locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
    trust: Arc<RwLock<BTreeMap<TrustKey, TrustRecord>>>,
    secrets: Arc<RwLock<BTreeMap<String, ()>>>,
}

impl RequestStore {
    /// Open (creating if necessary) a store rooted at `root`, hydrating the
    /// in-memory index from whatever is already on disk.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join("requests")).await?;
        fs::create_dir_all(root.join("codes")).await?;
        fs::create_dir_all(root.join("secrets")).await?;

        let store = Self {
            root,
            requests: Arc::new(RwLock::new(HashMap::new())),
            row_locks: Arc::new(Mutex::new(HashMap::new())),
            trust: Arc::new(RwLock::new(BTreeMap::new())),
            secrets: Arc::new(RwLock::new(BTreeMap::new())),
        };
        store.hydrate().await?;
        Ok(store)
    }

    async fn hydrate(&self) -> Result<(), StoreError> {
        let requests_dir = self.root.join("requests");
        let mut entries = fs::read_dir(&requests_dir).await?;
        let mut loaded = HashMap::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<Request>(&bytes) {
                    Ok(req) => {
                        loaded.insert(req.id, req);
                    }
                    Err(err) => error!(path = %path.display(), error = %err, "failed to parse request row"),
                },
                Err(err) => error!(path = %path.display(), error = %err, "failed to read request row"),
            }
        }
        *self.requests.write().await = loaded;

        let trust_path = self.root.join("trust.json");
        if let Ok(bytes) = fs::read(&trust_path).await {
            match serde_json::from_slice::<Vec<TrustRecord>>(&bytes) {
                Ok(records) => {
                    *self.trust.write().await =
                        records.into_iter().map(|r| (r.key.clone(), r)).collect();
                }
                Err(err) => error!(error = %err, "failed to parse trust table"),
            }
        }

        let secrets_dir = self.root.join("secrets");
        let mut entries = fs::read_dir(&secrets_dir).await?;
        let mut names = BTreeMap::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.insert(stem.to_string(), ());
            }
        }
        *self.secrets.write().await = names;

        Ok(())
    }

    async fn row_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.row_locks.lock().await;
        locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    async fn persist_request(&self, request: &Request) -> Result<(), StoreError> {
        let path = self.request_path(request.id);
        write_atomic(&path, &serde_json::to_vec_pretty(request)?).await?;
        Ok(())
    }

    fn request_path(&self, id: Uuid) -> PathBuf {
        self.root.join("requests").join(format!("{id}.json"))
    }

    fn code_path(&self, id: Uuid) -> PathBuf {
        self.root.join("codes").join(format!("{id}.bin"))
    }

    fn secret_path(&self, name: &str) -> PathBuf {
        self.root.join("secrets").join(format!("{name}.bin"))
    }

    async fn persist_trust_table(&self, table: &BTreeMap<TrustKey, TrustRecord>) -> Result<(), StoreError> {
        let records: Vec<&TrustRecord> = table.values().collect();
        write_atomic(&self.root.join("trust.json"), &serde_json::to_vec_pretty(&records)?).await
    }

    // -- Request rows --------------------------------------------------

    /// Insert a new request row in state `pending`.
    pub async fn create(&self, request: Request) -> Result<(), StoreError> {
        let mut guard = self.requests.write().await;
        if guard.contains_key(&request.id) {
            return Err(StoreError::DuplicateRequestId(request.id));
        }
        self.persist_request(&request).await?;
        guard.insert(request.id, request);
        Ok(())
    }

    /// Return the full row, if it exists.
    pub async fn get(&self, id: Uuid) -> Option<Request> {
        self.requests.read().await.get(&id).cloned()
    }

    /// Compare-and-set on state: succeeds only if the row's current state is
    /// `from`. This is the sole legal mutator for lifecycle state.
    pub async fn transition(
        &self,
        id: Uuid,
        from: RequestState,
        to: RequestState,
        ts: DateTime<Utc>,
    ) -> Result<Request, StoreError> {
        let lock = self.row_lock(id).await;
        let _guard = lock.lock().await;

        let mut requests = self.requests.write().await;
        let req = requests
            .get_mut(&id)
            .ok_or(StoreError::RequestNotFound(id))?;

        if req.state != from {
            return Err(StoreError::TransitionConflict {
                id,
                expected: from,
                actual: req.state,
            });
        }

        req.state = to;
        req.revision += 1;
        match to {
            RequestState::Approved => {
                req.approved_at.get_or_insert(ts);
            }
            RequestState::Executing => {
                req.executed_at.get_or_insert(ts);
            }
            _ => {}
        }

        let snapshot = req.clone();
        self.persist_request(&snapshot).await?;
        Ok(snapshot)
    }

    /// Attach (or replace) the chat-message handle used to edit the
    /// operator dialogue in place. Idempotent.
    pub async fn attach_chat_handle(&self, id: Uuid, handle: String) -> Result<(), StoreError> {
        let lock = self.row_lock(id).await;
        let _guard = lock.lock().await;

        let mut requests = self.requests.write().await;
        let req = requests
            .get_mut(&id)
            .ok_or(StoreError::RequestNotFound(id))?;
        req.chat_handle = Some(handle);
        req.revision += 1;
        let snapshot = req.clone();
        self.persist_request(&snapshot).await
    }

    /// Atomically record a successful sandbox result alongside the
    /// transition to `completed` or `failed`.
    pub async fn set_result(
        &self,
        id: Uuid,
        terminal_state: RequestState,
        result: broker_core::ExecutionResult,
    ) -> Result<Request, StoreError> {
        debug_assert!(terminal_state.is_terminal());
        let lock = self.row_lock(id).await;
        let _guard = lock.lock().await;

        let mut requests = self.requests.write().await;
        let req = requests
            .get_mut(&id)
            .ok_or(StoreError::RequestNotFound(id))?;
        req.state = terminal_state;
        req.result = Some(result);
        req.revision += 1;
        let snapshot = req.clone();
        self.persist_request(&snapshot).await?;
        Ok(snapshot)
    }

    /// Atomically record a fatal internal error alongside the transition to
    /// `failed` (used when the sandbox was never reached).
    pub async fn set_failure(&self, id: Uuid, reason: String) -> Result<Request, StoreError> {
        let lock = self.row_lock(id).await;
        let _guard = lock.lock().await;

        let mut requests = self.requests.write().await;
        let req = requests
            .get_mut(&id)
            .ok_or(StoreError::RequestNotFound(id))?;
        req.state = RequestState::Failed;
        req.failure_reason = Some(reason);
        req.revision += 1;
        let snapshot = req.clone();
        self.persist_request(&snapshot).await?;
        Ok(snapshot)
    }

    // -- Trust ------------------------------------------------------------

    /// Upsert a trust grant. Rejects [`TrustScope::Once`], which is never
    /// persisted.
    pub async fn add_trust(
        &self,
        key: TrustKey,
        scope: TrustScope,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let record = TrustRecord::new(key.clone(), scope, now).ok_or(StoreError::OnceNotPersistable)?;
        let mut table = self.trust.write().await;
        table.insert(key, record);
        self.persist_trust_table(&table).await
    }

    /// Look up a trust record, lazily deleting it if it has expired so that
    /// callers never observe a stale grant.
    pub async fn lookup_trust(&self, key: &TrustKey, now: DateTime<Utc>) -> Option<TrustRecord> {
        let mut table = self.trust.write().await;
        match table.get(key) {
            Some(rec) if rec.is_expired(now) => {
                table.remove(key);
                let _ = self.persist_trust_table(&table).await;
                None
            }
            Some(rec) => Some(rec.clone()),
            None => None,
        }
    }

    /// Delete every expired trust record; returns the number removed. Safe
    /// to call concurrently with `lookup_trust`.
    pub async fn sweep_expired_trust(&self, now: DateTime<Utc>) -> usize {
        let mut table = self.trust.write().await;
        let before = table.len();
        table.retain(|_, rec| !rec.is_expired(now));
        let removed = before - table.len();
        if removed > 0
            && let Err(err) = self.persist_trust_table(&table).await
        {
            warn!(error = %err, "failed to persist trust table after sweep");
        }
        removed
    }

    // -- Code bytes ---------------------------------------------------

    /// Persist the exact bytes that were fingerprinted at ingress.
    pub async fn store_code(&self, id: Uuid, bytes: &[u8]) -> Result<(), StoreError> {
        write_atomic(&self.code_path(id), bytes).await
    }

    /// Load the bytes previously stored by [`Self::store_code`]. Never
    /// re-fetches — this preserves the hash-to-execute binding.
    pub async fn load_code(&self, id: Uuid) -> Result<Vec<u8>, StoreError> {
        fs::read(self.code_path(id))
            .await
            .map_err(|_| StoreError::CodeNotFound(id))
    }

    // -- Secrets -------------------------------------------------------

    /// Write (or overwrite) a secret value. A single atomic rename, never a
    /// read-modify-write.
    pub async fn put_secret(&self, name: &str, value: &[u8]) -> Result<(), StoreError> {
        if name.is_empty() {
            return Err(StoreError::EmptySecretName);
        }
        write_atomic(&self.secret_path(name), value).await?;
        self.secrets.write().await.insert(name.to_string(), ());
        Ok(())
    }

    /// Read a secret's bytes, if present.
    pub async fn get_secret(&self, name: &str) -> Option<Vec<u8>> {
        fs::read(self.secret_path(name)).await.ok()
    }

    /// Delete a secret. Not an error if it was already absent.
    pub async fn delete_secret(&self, name: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.secret_path(name)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.secrets.write().await.remove(name);
        Ok(())
    }

    /// List every secret name currently present. Never the values.
    pub async fn list_secret_names(&self) -> Vec<String> {
        self.secrets.read().await.keys().cloned().collect()
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
