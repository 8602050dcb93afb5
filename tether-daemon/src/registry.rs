//! Device registry: the in-memory device map and its durable store.
//!
//! # Locking
//!
//! Each device sits behind its own `tokio::sync::Mutex`. A mutation holds
//! that lock through its store write, so rows for one device are written in
//! mutation order while unrelated devices proceed in parallel. Map guards
//! are dropped before any `.await`.
//!
//! # Stale devices
//!
//! A failed or timed-out write keeps the in-memory mutation and flags the
//! device stale. The caller sees [`RegistryError::Persist`]. The retry loop
//! in [`DeviceRegistry::run_retry`] flushes stale devices with capped
//! exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tether_core::{Device, DeviceId};
use tokio::sync::{watch, Mutex};

use crate::db::{DbService, StoreError};

const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("device not found: {0}")]
    NotFound(DeviceId),

    #[error("failed to persist device {udid}: {source}")]
    Persist {
        udid: DeviceId,
        #[source]
        source: StoreError,
    },
}

/// A device plus whether its latest state has reached the store.
#[derive(Debug, Clone)]
pub struct DeviceView {
    pub device: Device,
    pub stale: bool,
}

/// Result of a stale flush.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: usize,
    pub failed: usize,
}

struct Slot {
    device: Device,
    stale: bool,
    /// Bumped on every change; lets a snapshot tell whether it is current.
    revision: u64,
}

impl Slot {
    fn new(device: Device) -> Self {
        Self {
            device,
            stale: false,
            revision: 0,
        }
    }
}

type SlotRef = Arc<Mutex<Slot>>;

/// Owned registry shared behind an `Arc`.
pub struct DeviceRegistry {
    devices: DashMap<DeviceId, SlotRef>,
    db: DbService,
    store_timeout: Duration,
    persist_lock: Mutex<()>,
}

impl DeviceRegistry {
    /// An empty registry over `db`.
    pub fn new(db: DbService, store_timeout: Duration) -> Self {
        Self {
            devices: DashMap::new(),
            db,
            store_timeout,
            persist_lock: Mutex::new(()),
        }
    }

    /// Load every stored device. Undecodable rows are logged and skipped.
    pub async fn restore(db: DbService, store_timeout: Duration) -> Result<Self, StoreError> {
        let loaded = tokio::time::timeout(store_timeout, db.load_all())
            .await
            .map_err(|_| StoreError::Timeout)??;

        for row in &loaded.skipped {
            tracing::warn!(udid = %row.udid, reason = %row.reason, "Skipping undecodable device row");
        }

        let registry = Self::new(db, store_timeout);
        for device in loaded.devices {
            registry
                .devices
                .insert(device.id.clone(), Arc::new(Mutex::new(Slot::new(device))));
        }
        tracing::info!(
            devices = registry.len(),
            skipped = loaded.skipped.len(),
            "Registry restored"
        );
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn slot(&self, id: &DeviceId) -> Option<SlotRef> {
        self.devices.get(id).map(|entry| entry.value().clone())
    }

    fn slots(&self) -> Vec<SlotRef> {
        self.devices.iter().map(|entry| entry.value().clone()).collect()
    }

    pub async fn get(&self, id: &DeviceId) -> Option<Device> {
        let slot = self.slot(id)?;
        let guard = slot.lock().await;
        Some(guard.device.clone())
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    /// Snapshot of every device, in no particular order.
    pub async fn all(&self) -> Vec<Device> {
        let mut out = Vec::with_capacity(self.len());
        for slot in self.slots() {
            out.push(slot.lock().await.device.clone());
        }
        out
    }

    /// Every device with its stale flag.
    pub async fn summaries(&self) -> Vec<DeviceView> {
        let mut out = Vec::with_capacity(self.len());
        for slot in self.slots() {
            let guard = slot.lock().await;
            out.push(DeviceView {
                device: guard.device.clone(),
                stale: guard.stale,
            });
        }
        out
    }

    pub async fn stale_count(&self) -> usize {
        let mut count = 0;
        for slot in self.slots() {
            if slot.lock().await.stale {
                count += 1;
            }
        }
        count
    }

    /// Mutate a device, creating it first if absent, and persist it.
    pub async fn upsert<R>(
        &self,
        id: &DeviceId,
        now: DateTime<Utc>,
        mutate: impl FnOnce(&mut Device) -> R,
    ) -> Result<(Device, R), RegistryError> {
        let mut created = false;
        let slot = self
            .devices
            .entry(id.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(Slot::new(Device::new(id.clone(), now))))
            })
            .value()
            .clone();
        if created {
            tracing::debug!(udid = %id, "Registered new device");
        }
        self.mutate(id, &slot, created, mutate).await
    }

    /// Mutate an existing device and persist it.
    pub async fn update<R>(
        &self,
        id: &DeviceId,
        mutate: impl FnOnce(&mut Device) -> R,
    ) -> Result<(Device, R), RegistryError> {
        let slot = self
            .slot(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        self.mutate(id, &slot, false, mutate).await
    }

    async fn mutate<R>(
        &self,
        id: &DeviceId,
        slot: &SlotRef,
        force_write: bool,
        mutate: impl FnOnce(&mut Device) -> R,
    ) -> Result<(Device, R), RegistryError> {
        let mut guard = slot.lock().await;
        let before = guard.device.clone();
        let result = mutate(&mut guard.device);
        let changed = guard.device != before;
        if changed {
            guard.revision += 1;
        }

        if changed || force_write || guard.stale {
            match self.write(&guard.device).await {
                Ok(()) => guard.stale = false,
                Err(source) => {
                    guard.stale = true;
                    tracing::warn!(udid = %id, error = %source, "Device write failed; marked stale");
                    return Err(RegistryError::Persist {
                        udid: id.clone(),
                        source,
                    });
                }
            }
        }

        Ok((guard.device.clone(), result))
    }

    async fn write(&self, device: &Device) -> Result<(), StoreError> {
        tokio::time::timeout(self.store_timeout, self.db.save_device(device))
            .await
            .map_err(|_| StoreError::Timeout)?
    }

    /// Write the full registry in one transaction.
    ///
    /// Devices whose state did not change while the snapshot was written
    /// are no longer stale afterwards.
    pub async fn persist(&self) -> Result<usize, StoreError> {
        let _persist = self.persist_lock.lock().await;

        let mut snapshot = Vec::with_capacity(self.len());
        for slot in self.slots() {
            let guard = slot.lock().await;
            snapshot.push((slot.clone(), guard.revision, guard.device.clone()));
        }
        let devices: Vec<Device> = snapshot.iter().map(|(_, _, d)| d.clone()).collect();

        tokio::time::timeout(self.store_timeout, self.db.save_all(&devices))
            .await
            .map_err(|_| StoreError::Timeout)??;

        for (slot, revision, _) in &snapshot {
            let mut guard = slot.lock().await;
            if guard.revision == *revision {
                guard.stale = false;
            }
        }
        Ok(devices.len())
    }

    /// Retry the write for every stale device.
    pub async fn flush_stale(&self) -> FlushReport {
        let mut report = FlushReport::default();
        for slot in self.slots() {
            let mut guard = slot.lock().await;
            if !guard.stale {
                continue;
            }
            match self.write(&guard.device).await {
                Ok(()) => {
                    guard.stale = false;
                    report.flushed += 1;
                }
                Err(e) => {
                    tracing::debug!(udid = %guard.device.id, error = %e, "Stale flush failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Flush stale devices until `shutdown` flips to true.
    ///
    /// The delay doubles after each failed round, up to a cap, and resets
    /// once a round leaves nothing stale.
    pub async fn run_retry(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut delay = RETRY_BASE;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let report = self.flush_stale().await;
            if report.flushed > 0 {
                tracing::info!(flushed = report.flushed, "Flushed stale devices");
            }
            delay = next_delay(delay, report.failed > 0);
            if report.failed > 0 {
                tracing::warn!(
                    failed = report.failed,
                    retry_in = ?delay,
                    "Stale devices still unpersisted"
                );
            }
        }
    }
}

fn next_delay(current: Duration, failed: bool) -> Duration {
    if failed {
        (current * 2).min(RETRY_CAP)
    } else {
        RETRY_BASE
    }
}
