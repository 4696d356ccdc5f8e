// # Device State Cache
//
// Authoritative, in-memory store of device records keyed by identity.
//
// ## Concurrency
//
// The outer map sits behind a `RwLock` and holds one `Mutex` per record.
// Mutations of a single record (metadata upserts, probe merges) take that
// record's mutex, so updates to one identity are serialized while different
// identities proceed in parallel. The outer write lock is only held to insert
// or remove entries.
//
// ## Crash Behavior
//
// Nothing is persisted. After a restart every device starts `unknown` and is
// rebuilt by the first poll cycle.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use crate::device::{DeviceFilter, DeviceIdentity, DeviceRecord, DeviceUpdate};

type Slot = Arc<Mutex<DeviceRecord>>;

/// In-memory device state cache
///
/// Cloning is cheap; clones share the same records.
///
/// # Example
///
/// ```rust,no_run
/// use netsup_core::cache::DeviceStateCache;
/// use netsup_core::device::{DeviceIdentity, DeviceUpdate};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let cache = DeviceStateCache::new();
///     let addr = "10.0.0.1".parse()?;
///     let identity = DeviceIdentity::ip(addr);
///
///     cache.upsert(&identity, DeviceUpdate::address(addr)).await;
///     assert!(cache.get(&identity).await.is_some());
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct DeviceStateCache {
    inner: Arc<RwLock<HashMap<DeviceIdentity, Slot>>>,
}

impl DeviceStateCache {
    /// Create a new empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Whether the cache holds no records
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Snapshot of one record
    pub async fn get(&self, identity: &DeviceIdentity) -> Option<DeviceRecord> {
        let slot = self.slot(identity).await?;
        let record = slot.lock().await;
        Some(record.clone())
    }

    /// Insert a record or update its metadata
    ///
    /// Health fields are untouched; a newly created record starts `unknown`.
    /// Returns the record after the update and whether it was created.
    pub async fn upsert(
        &self,
        identity: &DeviceIdentity,
        update: DeviceUpdate,
    ) -> (DeviceRecord, bool) {
        let (slot, created) = self.slot_or_insert(identity, update.address).await;
        let mut record = slot.lock().await;
        update.apply(&mut record);
        (record.clone(), created)
    }

    /// Run `f` on a record while holding its lock, creating the record first
    /// if needed
    ///
    /// `seed_address` is used only when the record does not exist yet.
    pub async fn merge_with<F, R>(
        &self,
        identity: &DeviceIdentity,
        seed_address: Option<IpAddr>,
        f: F,
    ) -> R
    where
        F: FnOnce(&mut DeviceRecord) -> R,
    {
        let (slot, _) = self.slot_or_insert(identity, seed_address).await;
        let mut record = slot.lock().await;
        f(&mut record)
    }

    /// Run `f` on a record while holding its lock, only if it still exists
    ///
    /// Returns `None` when the record is missing or was removed while
    /// waiting for its lock; `f` is not called then.
    pub async fn merge_existing<F, R>(&self, identity: &DeviceIdentity, f: F) -> Option<R>
    where
        F: FnOnce(&mut DeviceRecord) -> R,
    {
        let slot = self.slot(identity).await?;
        let mut record = slot.lock().await;
        // `remove` drops the map entry before taking the record lock
        let live = self
            .slot(identity)
            .await
            .is_some_and(|current| Arc::ptr_eq(&current, &slot));
        if !live {
            return None;
        }
        Some(f(&mut record))
    }

    /// Remove a record, returning its last state
    pub async fn remove(&self, identity: &DeviceIdentity) -> Option<DeviceRecord> {
        let slot = self.inner.write().await.remove(identity)?;
        let record = slot.lock().await;
        Some(record.clone())
    }

    /// Snapshots of every record matching the filter
    pub async fn list(&self, filter: &DeviceFilter) -> Vec<DeviceRecord> {
        let mut records = Vec::new();
        for slot in self.slots().await {
            let record = slot.lock().await;
            if filter.matches(&record) {
                records.push(record.clone());
            }
        }
        records.sort_by(|a, b| a.identity.cmp(&b.identity));
        records
    }

    /// Records not probed within `max_age`
    pub async fn all_stale(&self, max_age: Duration) -> Vec<DeviceRecord> {
        let max_age = chrono::Duration::from_std(max_age)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut stale = Vec::new();
        for slot in self.slots().await {
            let record = slot.lock().await;
            if record.is_stale(max_age) {
                stale.push(record.clone());
            }
        }
        stale
    }

    /// Identity of the record currently holding `address`, if any
    pub async fn identity_for_address(&self, address: IpAddr) -> Option<DeviceIdentity> {
        let address = address.to_canonical();
        for slot in self.slots().await {
            let record = slot.lock().await;
            if record.address == address {
                return Some(record.identity.clone());
            }
        }
        None
    }

    async fn slot(&self, identity: &DeviceIdentity) -> Option<Slot> {
        self.inner.read().await.get(identity).cloned()
    }

    // Snapshot of the slots so record locks are never taken under the map lock
    async fn slots(&self) -> Vec<Slot> {
        self.inner.read().await.values().cloned().collect()
    }

    async fn slot_or_insert(
        &self,
        identity: &DeviceIdentity,
        seed_address: Option<IpAddr>,
    ) -> (Slot, bool) {
        if let Some(slot) = self.slot(identity).await {
            return (slot, false);
        }

        let mut guard = self.inner.write().await;
        if let Some(slot) = guard.get(identity) {
            return (slot.clone(), false);
        }
        let slot = Arc::new(Mutex::new(DeviceRecord::seed(identity.clone(), seed_address)));
        guard.insert(identity.clone(), slot.clone());
        (slot, true)
    }
}
