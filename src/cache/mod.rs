//! Contact and group cache with a JSON file behind it.
//!
//! The in-memory [`Snapshot`] is replaced wholesale on refresh, so readers
//! see either the old or the new set and never a mix. The file is written to
//! a temporary sibling and renamed into place, so a crash mid-write leaves the
//! previous file intact.

pub mod model;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::rpc::events::ContactsDelta;
use crate::rpc::RpcError;
use crate::utils::current_timestamp;
pub use model::{Contact, Group, Snapshot};

pub const CACHE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache file is corrupt: {0}")]
    Corrupt(String),

    #[error("Unsupported cache version {0}")]
    UnknownVersion(u64),

    #[error("Failed to serialize cache: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to replace cache file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    #[serde(default)]
    refreshed_at: Option<u64>,
    #[serde(default)]
    contacts: BTreeMap<String, Contact>,
    #[serde(default)]
    groups: BTreeMap<String, Group>,
}

/// Where refreshed contact data comes from.
#[async_trait]
pub trait ContactSource: Send + Sync {
    async fn list_contacts(&self) -> Result<Value, RpcError>;
    async fn list_groups(&self) -> Result<Value, RpcError>;
}

pub struct ContactCache {
    path: PathBuf,
    snapshot: Mutex<Arc<Snapshot>>,
    /// Serializes writers of the snapshot that fetch or merge
    refresh_lock: tokio::sync::Mutex<()>,
    /// Serializes file writes; each write takes the latest snapshot
    persist_lock: tokio::sync::Mutex<()>,
    needs_refresh: AtomicBool,
}

impl ContactCache {
    /// Open the cache file. A missing, corrupt or foreign-version file gives
    /// an empty snapshot flagged for refresh.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (snapshot, needs_refresh) = match load_file(&path) {
            Ok(Some(snap)) => {
                tracing::info!("Loaded {} cached contacts/groups from {}", snap.len(), path.display());
                (snap, false)
            }
            Ok(None) => (Snapshot::default(), true),
            Err(e) => {
                tracing::warn!("Ignoring cache {}: {}", path.display(), e);
                (Snapshot::default(), true)
            }
        };
        Self {
            path,
            snapshot: Mutex::new(Arc::new(snapshot)),
            refresh_lock: tokio::sync::Mutex::new(()),
            persist_lock: tokio::sync::Mutex::new(()),
            needs_refresh: AtomicBool::new(needs_refresh),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn slot(&self) -> MutexGuard<'_, Arc<Snapshot>> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.slot().clone()
    }

    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh.load(Ordering::Relaxed)
    }

    /// Fetch everything from `source`, swap the snapshot and persist it.
    /// Concurrent refreshes run one after another.
    pub async fn refresh(&self, source: &dyn ContactSource) -> Result<Arc<Snapshot>, RpcError> {
        let _serial = self.refresh_lock.lock().await;

        let fetched = async {
            let contacts = source.list_contacts().await?;
            let groups = source.list_groups().await?;
            Ok::<_, RpcError>((contacts, groups))
        }
        .await;
        let (contacts, groups) = match fetched {
            Ok(lists) => lists,
            Err(e) => {
                tracing::warn!("Contact refresh failed: {}", e);
                self.mark_stale();
                return Err(e);
            }
        };

        let mut fresh = Snapshot::from_listing(&contacts, &groups);
        fresh.refreshed_at = Some(current_timestamp());

        let snap = {
            let mut slot = self.slot();
            // activity timestamps are local knowledge, carry them over
            for (id, contact) in fresh.contacts.iter_mut() {
                if let Some(old) = slot.contacts.get(id) {
                    contact.last_seen = old.last_seen;
                }
            }
            let snap = Arc::new(fresh);
            *slot = snap.clone();
            snap
        };
        self.needs_refresh.store(false, Ordering::Relaxed);
        tracing::info!(
            "Contacts refreshed: {} contacts, {} groups",
            snap.contacts.len(),
            snap.groups.len()
        );

        self.persist_current().await;
        Ok(snap)
    }

    /// Merge an incremental change pushed by the daemon. Waits for a refresh
    /// in flight so the delta lands on top of the fetched lists.
    pub async fn apply_delta(&self, delta: &ContactsDelta) -> Arc<Snapshot> {
        let _serial = self.refresh_lock.lock().await;
        let snap = {
            let mut slot = self.slot();
            let mut next = Snapshot::clone(&slot);
            for id in &delta.removed {
                next.contacts.remove(id);
                next.groups.remove(id);
            }
            for contact in &delta.contacts {
                let mut contact = contact.clone();
                if contact.last_seen.is_none() {
                    contact.last_seen = next.contacts.get(&contact.id).and_then(|c| c.last_seen);
                }
                next.contacts.insert(contact.id.clone(), contact);
            }
            for group in &delta.groups {
                next.groups.insert(group.id.clone(), group.clone());
            }
            let snap = Arc::new(next);
            *slot = snap.clone();
            snap
        };
        self.persist_current().await;
        snap
    }

    /// Record activity from `id`. Memory only.
    pub fn touch(&self, id: &str, at: u64) {
        let mut slot = self.slot();
        let Some(key) = slot.contact(id).map(|c| c.id.clone()) else {
            return;
        };
        let mut next = Snapshot::clone(&slot);
        if let Some(contact) = next.contacts.get_mut(&key) {
            if contact.last_seen.map_or(true, |seen| seen < at) {
                contact.last_seen = Some(at);
                *slot = Arc::new(next);
            }
        }
    }

    pub fn mark_stale(&self) {
        self.needs_refresh.store(true, Ordering::Relaxed);
        let mut slot = self.slot();
        if !slot.stale {
            let mut next = Snapshot::clone(&slot);
            next.stale = true;
            *slot = Arc::new(next);
        }
    }

    /// Write whatever snapshot is current once the previous write is done,
    /// so the file always ends up matching memory.
    async fn persist_current(&self) {
        let _serial = self.persist_lock.lock().await;
        let snap = self.snapshot();
        let path = self.path.clone();
        match tokio::task::spawn_blocking(move || write_file(&path, &snap)).await {
            Ok(Ok(())) => tracing::debug!("Contact cache written to {}", self.path.display()),
            Ok(Err(e)) => tracing::warn!("Failed to persist contact cache: {}", e),
            Err(e) => tracing::warn!("Contact cache writer panicked: {}", e),
        }
    }
}

fn write_file(path: &Path, snap: &Snapshot) -> Result<(), CacheError> {
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let file = CacheFile {
        version: CACHE_VERSION,
        refreshed_at: snap.refreshed_at,
        contacts: snap.contacts.clone(),
        groups: snap.groups.clone(),
    };
    let bytes = serde_json::to_vec_pretty(&file)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

fn load_file(path: &Path) -> Result<Option<Snapshot>, CacheError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value: Value = serde_json::from_str(&raw).map_err(|e| CacheError::Corrupt(e.to_string()))?;
    let version = value.get("version").and_then(Value::as_u64).unwrap_or(0);
    if version != u64::from(CACHE_VERSION) {
        return Err(CacheError::UnknownVersion(version));
    }
    let file: CacheFile = serde_json::from_value(value).map_err(|e| CacheError::Corrupt(e.to_string()))?;
    Ok(Some(Snapshot {
        contacts: file.contacts,
        groups: file.groups,
        refreshed_at: file.refreshed_at,
        stale: false,
    }))
}
