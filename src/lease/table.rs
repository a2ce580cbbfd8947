//! In-memory lease bookkeeping and per-device guards

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::{Error, Result};

/// Default wait for a device guard before giving up with `Timeout`
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

type GuardMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Connection bookkeeping for a held device
#[derive(Debug, Clone, Serialize)]
pub struct ActiveLease {
    pub session_id: String,
    pub holder: String,
    pub holder_group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_meta: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

/// Exclusive hold on one device id
///
/// Every read-then-write on a device runs while one of these is alive.
/// Dropping the last interested guard removes the device's mutex from the
/// table.
pub struct DeviceGuard {
    device_id: String,
    mutex: Arc<AsyncMutex<()>>,
    guards: GuardMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl DeviceGuard {
    /// Device this guard protects
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        let mut guards = self.guards.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.guard.take());
        prune(&mut guards, &self.device_id, &self.mutex);
    }
}

/// Remove a device's mutex when only the map and `mutex` still refer to it
///
/// Callers hold the map lock, so no new waiter can clone the entry meanwhile.
fn prune(
    guards: &mut HashMap<String, Arc<AsyncMutex<()>>>,
    device_id: &str,
    mutex: &Arc<AsyncMutex<()>>,
) {
    let ours = guards
        .get(device_id)
        .is_some_and(|entry| Arc::ptr_eq(entry, mutex));
    if ours && Arc::strong_count(mutex) == 2 {
        guards.remove(device_id);
    }
}

/// Owned lease table
///
/// Holds one async mutex per device id while anyone holds or waits on it,
/// and the active lease of every held device. There is no table-wide lock
/// around operations; the plain mutexes below only protect the maps
/// themselves and are never held across an await.
pub struct LeaseTable {
    guards: GuardMap,
    active: Mutex<HashMap<String, ActiveLease>>,
    running: AtomicBool,
    lock_timeout: Duration,
}

impl Default for LeaseTable {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl LeaseTable {
    /// Create a stopped, empty table whose guards wait at most `lock_timeout`
    #[must_use]
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            guards: GuardMap::default(),
            active: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            lock_timeout,
        }
    }

    /// Longest wait for a device guard
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Start accepting operations, seeding the table with restored leases
    pub fn start(&self, restored: impl IntoIterator<Item = (String, ActiveLease)>) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.clear();
        active.extend(restored);
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(leases = active.len(), "lease table started");
    }

    /// Stop accepting operations and forget in-memory leases
    ///
    /// Open sessions stay in the store and are restored by the next start.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::info!("lease table stopped");
    }

    /// Whether the table accepts operations
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Fail with `Internal` unless started
    ///
    /// # Errors
    ///
    /// Returns `Internal` after `stop` or before `start`
    pub fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::Internal("lease table is not running".to_string()))
        }
    }

    /// Wait for exclusive access to a device
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the table is not running, `Timeout` if the
    /// device stays locked longer than the lock timeout
    pub async fn lock(&self, device_id: &str) -> Result<DeviceGuard> {
        self.ensure_running()?;

        let mutex = {
            let mut guards = self.guards.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(guards.entry(device_id.to_string()).or_default())
        };

        let Ok(guard) = tokio::time::timeout(self.lock_timeout, Arc::clone(&mutex).lock_owned()).await
        else {
            prune(
                &mut self.guards.lock().unwrap_or_else(PoisonError::into_inner),
                device_id,
                &mutex,
            );
            tracing::warn!(
                device_id = %device_id,
                timeout = ?self.lock_timeout,
                "timed out waiting for device guard"
            );
            return Err(Error::Timeout(format!(
                "device {device_id} is busy, gave up after {}ms",
                self.lock_timeout.as_millis()
            )));
        };

        let guard = DeviceGuard {
            device_id: device_id.to_string(),
            mutex,
            guards: Arc::clone(&self.guards),
            guard: Some(guard),
        };

        // A stop may have landed while waiting
        self.ensure_running()?;

        Ok(guard)
    }

    /// Number of device ids with a live guard or waiter
    #[must_use]
    pub fn guard_count(&self) -> usize {
        self.guards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Active lease on a device
    #[must_use]
    pub fn get(&self, device_id: &str) -> Option<ActiveLease> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned()
    }

    /// Record a new lease
    pub fn insert(&self, guard: &DeviceGuard, lease: ActiveLease) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(guard.device_id().to_string(), lease);
    }

    /// Forget a lease
    pub fn remove(&self, guard: &DeviceGuard) -> Option<ActiveLease> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(guard.device_id())
    }

    /// Mark a lease active now, replacing client metadata when given
    pub fn touch(&self, guard: &DeviceGuard, client_meta: Option<String>) -> Option<ActiveLease> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let lease = active.get_mut(guard.device_id())?;
        lease.last_active = Utc::now();
        if client_meta.is_some() {
            lease.client_meta = client_meta;
        }
        Some(lease.clone())
    }

    /// Devices whose lease has seen no activity since `cutoff`
    #[must_use]
    pub fn idle_since(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let mut ids: Vec<_> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, lease)| lease.last_active < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Snapshot of every active lease
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, ActiveLease)> {
        let mut leases: Vec<_> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, lease)| (id.clone(), lease.clone()))
            .collect();
        leases.sort_by(|a, b| a.0.cmp(&b.0));
        leases
    }

    /// Number of held devices
    #[must_use]
    pub fn len(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no device is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn lease(holder: &str) -> ActiveLease {
        let now = Utc::now();
        ActiveLease {
            session_id: format!("s-{holder}"),
            holder: holder.to_string(),
            holder_group: "lab".to_string(),
            client_meta: None,
            connected_at: now,
            last_active: now,
        }
    }

    #[tokio::test]
    async fn lock_fails_until_started() {
        let table = LeaseTable::default();
        assert!(matches!(table.lock("d1").await, Err(Error::Internal(_))));

        table.start(Vec::new());
        assert!(table.lock("d1").await.is_ok());

        table.stop();
        assert!(matches!(table.lock("d1").await, Err(Error::Internal(_))));
    }

    #[tokio::test]
    async fn guard_is_exclusive_per_device() {
        let table = Arc::new(LeaseTable::default());
        table.start(Vec::new());

        let held = table.lock("d1").await.unwrap();

        // A different device is not blocked
        let other = tokio::time::timeout(Duration::from_millis(50), table.lock("d2")).await;
        assert!(other.is_ok());

        let blocked = tokio::time::timeout(Duration::from_millis(50), table.lock("d1")).await;
        assert!(blocked.is_err());

        drop(held);
        assert!(table.lock("d1").await.is_ok());
    }

    #[tokio::test]
    async fn lock_times_out_while_held() {
        let table = LeaseTable::new(Duration::from_millis(50));
        table.start(Vec::new());

        let _held = table.lock("d1").await.unwrap();
        let err = table.lock("d1").await.err().unwrap();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(err.kind(), ErrorKind::Timeout);

        // The timed-out waiter leaves only the holder's entry behind
        assert_eq!(table.guard_count(), 1);
    }

    #[tokio::test]
    async fn released_guards_are_pruned() {
        let table = LeaseTable::default();
        table.start(Vec::new());

        for i in 0..1000 {
            let guard = table.lock(&format!("ghost-{i}")).await.unwrap();
            drop(guard);
        }
        assert_eq!(table.guard_count(), 0);

        let held = table.lock("d1").await.unwrap();
        assert_eq!(table.guard_count(), 1);
        drop(held);
        assert_eq!(table.guard_count(), 0);
    }

    #[tokio::test]
    async fn waiter_keeps_entry_until_it_is_done() {
        let table = Arc::new(LeaseTable::default());
        table.start(Vec::new());

        let held = table.lock("d1").await.unwrap();
        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move {
                let guard = table.lock("d1").await.unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                drop(guard);
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert_eq!(table.guard_count(), 1);

        waiter.await.unwrap();
        assert_eq!(table.guard_count(), 0);
    }

    #[tokio::test]
    async fn start_restores_and_stop_clears() {
        let table = LeaseTable::default();
        table.start(vec![("d1".to_string(), lease("alice"))]);
        assert_eq!(table.get("d1").unwrap().holder, "alice");

        table.stop();
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn touch_and_idle_detection() {
        let table = LeaseTable::default();
        let mut stale = lease("alice");
        stale.last_active = Utc::now() - chrono::Duration::minutes(30);
        table.start(vec![
            ("d1".to_string(), stale),
            ("d2".to_string(), lease("bob")),
        ]);

        let cutoff = Utc::now() - chrono::Duration::minutes(10);
        assert_eq!(table.idle_since(cutoff), vec!["d1".to_string()]);

        let guard = table.lock("d1").await.unwrap();
        let touched = table.touch(&guard, Some("10.0.0.9".to_string())).unwrap();
        assert_eq!(touched.client_meta.as_deref(), Some("10.0.0.9"));
        assert!(table.idle_since(cutoff).is_empty());
    }
}
