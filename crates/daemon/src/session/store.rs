//! Session record store.
//!
//! The store is the single source of truth for session state. Every record
//! lives behind its own async mutex so that ownership changes and dimension
//! updates for one session are serialized, while different sessions proceed
//! in parallel.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::record::{SessionId, SessionRecord, SpawnParams};

/// Longest slug kept from a user-supplied name.
const MAX_SLUG_LEN: usize = 32;

/// Errors returned by the store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No record matches the id or name.
    #[error("session not found: {0}")]
    NotFound(String),

    /// Attempted to delete a record that still has owners.
    #[error("session {id} still has {owners} owner(s)")]
    HasOwners { id: SessionId, owners: usize },

    /// A record with the same multiplexer name already exists.
    #[error("multiplexer name already registered: {0}")]
    DuplicateName(String),

    /// The store already holds the maximum number of sessions.
    #[error("session limit of {0} reached")]
    LimitReached(usize),
}

/// Thread-safe registry of session records.
pub struct SessionStore {
    records: DashMap<SessionId, Arc<Mutex<SessionRecord>>>,
    /// Multiplexer name to record id.
    by_mux_name: DashMap<String, SessionId>,
    prefix: String,
    /// Serializes limit checks with the inserts they guard.
    admission: std::sync::Mutex<()>,
}

impl SessionStore {
    /// Creates an empty store whose multiplexer names start with `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            records: DashMap::new(),
            by_mux_name: DashMap::new(),
            prefix: prefix.into(),
            admission: std::sync::Mutex::new(()),
        }
    }

    /// Application prefix used for multiplexer names.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns whether `mux_name` lives in this application's namespace.
    pub fn owns_name(&self, mux_name: &str) -> bool {
        mux_name.starts_with(&self.prefix)
    }

    /// Allocates a new record in the `Spawning` state.
    ///
    /// The id is a fresh UUID. The multiplexer name is derived from the
    /// requested name, namespaced with the prefix and suffixed with a short
    /// random tag so two sessions with the same display name never collide.
    pub fn create(&self, params: &SpawnParams) -> SessionRecord {
        let id = Uuid::new_v4().to_string();
        let tag = Uuid::new_v4().simple().to_string();
        let mux_name = format!("{}{}-{}", self.prefix, sanitize_name(&params.name), &tag[..8]);
        let display_name = if params.name.trim().is_empty() {
            mux_name.clone()
        } else {
            params.name.trim().to_string()
        };

        let record = SessionRecord::new(id.clone(), mux_name.clone(), display_name, params.dimensions);
        self.by_mux_name.insert(mux_name, id.clone());
        self.records.insert(id.clone(), Arc::new(Mutex::new(record.clone())));

        tracing::debug!(session_id = %id, mux_name = %record.mux_name, "Created session record");
        record
    }

    /// Like [`create`](Self::create), but fails once `limit` records exist.
    ///
    /// The check and the insert happen under one lock, so concurrent callers
    /// never overshoot the limit.
    pub fn try_create(&self, params: &SpawnParams, limit: usize) -> Result<SessionRecord, StoreError> {
        let _admission = self.admission.lock().unwrap_or_else(|e| e.into_inner());
        if self.records.len() >= limit {
            return Err(StoreError::LimitReached(limit));
        }
        Ok(self.create(params))
    }

    /// Registers a record discovered outside this process, e.g. a multiplexer
    /// session that survived a daemon restart.
    pub fn insert_restored(&self, record: SessionRecord) -> Result<(), StoreError> {
        if self.by_mux_name.contains_key(&record.mux_name) {
            return Err(StoreError::DuplicateName(record.mux_name));
        }
        self.by_mux_name
            .insert(record.mux_name.clone(), record.id.clone());
        self.records
            .insert(record.id.clone(), Arc::new(Mutex::new(record)));
        Ok(())
    }

    fn entry(&self, id: &str) -> Result<Arc<Mutex<SessionRecord>>, StoreError> {
        self.records
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Returns a snapshot of the record.
    pub async fn get(&self, id: &str) -> Result<SessionRecord, StoreError> {
        let entry = self.entry(id)?;
        let record = entry.lock().await;
        Ok(record.clone())
    }

    /// Looks a record up by its multiplexer name.
    pub async fn find_by_mux_name(&self, mux_name: &str) -> Result<SessionRecord, StoreError> {
        let id = self
            .by_mux_name
            .get(mux_name)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::NotFound(mux_name.to_string()))?;
        self.get(&id).await
    }

    /// Resolves either a session id or a multiplexer name.
    pub async fn resolve(&self, target: &str) -> Result<SessionRecord, StoreError> {
        match self.get(target).await {
            Ok(record) => Ok(record),
            Err(StoreError::NotFound(_)) => self.find_by_mux_name(target).await,
            Err(e) => Err(e),
        }
    }

    /// Applies `f` to the record under its lock.
    pub async fn mutate<F, R>(&self, id: &str, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut SessionRecord) -> R,
    {
        let entry = self.entry(id)?;
        let mut record = entry.lock().await;
        Ok(f(&mut record))
    }

    /// Removes a record.
    ///
    /// Fails with [`StoreError::HasOwners`] if any connection still owns it;
    /// the record is left untouched in that case.
    pub async fn delete(&self, id: &str) -> Result<SessionRecord, StoreError> {
        let entry = self.entry(id)?;
        let record = entry.lock().await;
        if record.is_owned() {
            tracing::error!(
                session_id = %id,
                owners = record.owners.len(),
                "Refusing to delete a session that still has owners"
            );
            return Err(StoreError::HasOwners {
                id: id.to_string(),
                owners: record.owners.len(),
            });
        }

        self.records.remove(id);
        self.by_mux_name.remove(&record.mux_name);
        tracing::debug!(session_id = %id, "Deleted session record");
        Ok(record.clone())
    }

    /// Changes the display name. The id and multiplexer name are unaffected.
    pub async fn rename(&self, id: &str, display_name: &str) -> Result<SessionRecord, StoreError> {
        let name = display_name.trim().to_string();
        self.mutate(id, move |record| {
            record.display_name = name;
            record.touch();
            record.clone()
        })
        .await
    }

    /// Snapshots every record, oldest first.
    pub async fn list(&self) -> Vec<SessionRecord> {
        let entries: Vec<_> = self.records.iter().map(|e| Arc::clone(e.value())).collect();
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            records.push(entry.lock().await.clone());
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    /// Ids of every record.
    pub fn ids(&self) -> Vec<SessionId> {
        self.records.iter().map(|e| e.key().clone()).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Reduces a user-supplied name to characters every multiplexer accepts.
fn sanitize_name(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "session".to_string()
    } else {
        slug.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{Dimensions, SessionStatus};

    fn params(name: &str) -> SpawnParams {
        SpawnParams::new(name, Dimensions::new(80, 24))
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("My Shell"), "my-shell");
        assert_eq!(sanitize_name("a.b:c"), "a-b-c");
        assert_eq!(sanitize_name("  "), "session");
        assert_eq!(sanitize_name("!!!"), "session");
        assert_eq!(sanitize_name("build_42"), "build_42");
        assert!(sanitize_name(&"x".repeat(100)).len() <= MAX_SLUG_LEN);
    }

    #[tokio::test]
    async fn test_create_allocates_distinct_id_and_name() {
        let store = SessionStore::new("panehub-");
        let a = store.create(&params("shell"));
        let b = store.create(&params("shell"));

        assert_ne!(a.id, a.mux_name);
        assert_ne!(a.id, b.id);
        assert_ne!(a.mux_name, b.mux_name);
        assert!(a.mux_name.starts_with("panehub-shell-"));
        assert!(store.owns_name(&a.mux_name));
        assert_eq!(a.display_name, "shell");
        assert_eq!(a.status, SessionStatus::Spawning);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_get_and_find_by_mux_name() {
        let store = SessionStore::new("panehub-");
        let created = store.create(&params("work"));

        let by_id = store.get(&created.id).await.unwrap();
        let by_name = store.find_by_mux_name(&created.mux_name).await.unwrap();
        assert_eq!(by_id, by_name);

        let resolved = store.resolve(&created.mux_name).await.unwrap();
        assert_eq!(resolved.id, created.id);

        assert_eq!(
            store.get("missing").await,
            Err(StoreError::NotFound("missing".to_string()))
        );
        assert!(store.resolve("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_mutate_is_visible() {
        let store = SessionStore::new("panehub-");
        let created = store.create(&params("work"));

        let added = store
            .mutate(&created.id, |r| r.add_owner("c1".to_string(), "w1"))
            .await
            .unwrap();
        assert!(added);

        let record = store.get(&created.id).await.unwrap();
        assert_eq!(record.status, SessionStatus::Running);
        assert!(record.is_owner("c1"));
    }

    #[tokio::test]
    async fn test_delete_with_owners_fails_loudly() {
        let store = SessionStore::new("panehub-");
        let created = store.create(&params("work"));
        store
            .mutate(&created.id, |r| r.add_owner("c1".to_string(), "w1"))
            .await
            .unwrap();

        let err = store.delete(&created.id).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::HasOwners {
                id: created.id.clone(),
                owners: 1
            }
        );
        assert!(store.contains(&created.id));

        store
            .mutate(&created.id, |r| r.remove_owner("c1"))
            .await
            .unwrap();
        let deleted = store.delete(&created.id).await.unwrap();
        assert_eq!(deleted.id, created.id);
        assert!(!store.contains(&created.id));
        assert!(store.find_by_mux_name(&created.mux_name).await.is_err());
    }

    #[tokio::test]
    async fn test_rename_keeps_identity() {
        let store = SessionStore::new("panehub-");
        let created = store.create(&params("old"));
        let renamed = store.rename(&created.id, " new name ").await.unwrap();

        assert_eq!(renamed.display_name, "new name");
        assert_eq!(renamed.id, created.id);
        assert_eq!(renamed.mux_name, created.mux_name);
    }

    #[tokio::test]
    async fn test_insert_restored_rejects_duplicates() {
        let store = SessionStore::new("panehub-");
        let record = SessionRecord::new(
            "r1".to_string(),
            "panehub-restored".to_string(),
            "restored".to_string(),
            Dimensions::default(),
        );
        store.insert_restored(record.clone()).unwrap();
        assert_eq!(
            store.insert_restored(record),
            Err(StoreError::DuplicateName("panehub-restored".to_string()))
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_list_snapshots_all_records() {
        let store = SessionStore::new("panehub-");
        store.create(&params("a"));
        store.create(&params("b"));
        store.create(&params("c"));

        let list = store.list().await;
        assert_eq!(list.len(), 3);
        assert_eq!(store.ids().len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_mutations_are_serialized() {
        let store = Arc::new(SessionStore::new("panehub-"));
        let created = store.create(&params("busy"));

        let mut tasks = Vec::new();
        for i in 0..32 {
            let store = Arc::clone(&store);
            let id = created.id.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .mutate(&id, |r| {
                        r.add_owner(format!("c{i}"), "w1");
                    })
                    .await
                    .unwrap();
                store
                    .mutate(&id, |r| {
                        r.remove_owner(&format!("c{i}"));
                    })
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let record = store.get(&created.id).await.unwrap();
        assert!(record.owners.is_empty());
        assert_eq!(record.status, SessionStatus::Detached);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_try_create_never_exceeds_limit() {
        let store = Arc::new(SessionStore::new("panehub-"));

        let mut tasks = Vec::new();
        for i in 0..32 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store.try_create(&params(&format!("s{i}")), 5)
            }));
        }
        let mut created = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => assert_eq!(e, StoreError::LimitReached(5)),
            }
        }

        assert_eq!(created, 5);
        assert_eq!(store.len(), 5);
    }
}
