//! Latest-snapshot store
//!
//! One snapshot per device, replaced wholesale. Applying is guarded by the
//! snapshot timestamp so a stale poll result arriving late can never
//! overwrite fresher truth; ties keep the existing snapshot.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::trace;

use periph_types::StatusSnapshot;

/// Thread-safe map of device name to its latest status
#[derive(Default)]
pub struct StatusStore {
    snapshots: RwLock<HashMap<String, StatusSnapshot>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a snapshot if it is strictly newer than the stored one.
    ///
    /// Returns true when the store changed.
    pub fn apply(&self, snapshot: StatusSnapshot) -> bool {
        let mut snapshots = self.snapshots.write();
        match snapshots.get(&snapshot.device_name) {
            Some(existing) if existing.timestamp >= snapshot.timestamp => {
                trace!(device = %snapshot.device_name, "stale snapshot dropped");
                false
            }
            _ => {
                snapshots.insert(snapshot.device_name.clone(), snapshot);
                true
            }
        }
    }

    /// Latest snapshot for one device.
    pub fn get(&self, device: &str) -> Option<StatusSnapshot> {
        self.snapshots.read().get(device).cloned()
    }

    /// Snapshot of every known device.
    pub fn all(&self) -> Vec<StatusSnapshot> {
        self.snapshots.read().values().cloned().collect()
    }

    /// True when any device currently reports a fault or is offline.
    pub fn any_faulted(&self) -> bool {
        self.snapshots
            .read()
            .values()
            .any(|s| !s.is_online() || s.has_fault())
    }
}
