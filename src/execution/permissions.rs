//! Where grants, caller authorization and snap source code come from.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::info;

use crate::capability::PermissionGrant;
use crate::lock;
use crate::snap::SnapId;

/// Buffered grant-change signals before slow subscribers start lagging.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

pub trait PermissionSource: Send + Sync {
    /// Current grant of an installed snap.
    fn grant(&self, snap_id: &SnapId) -> Option<PermissionGrant>;

    /// Whether `origin` may call `snap_id` at all.
    fn can_invoke(&self, origin: &str, snap_id: &SnapId) -> bool;

    /// Signals the id of every snap whose grant changed.
    fn subscribe(&self) -> broadcast::Receiver<SnapId>;
}

pub trait SnapSource: Send + Sync {
    fn source(&self, snap_id: &SnapId) -> Option<String>;
}

/// One installed snap.
#[derive(Debug, Clone)]
pub struct SnapRecord {
    pub source: String,
    /// Origins allowed to call the snap. `*` allows any.
    pub allowed_origins: Vec<String>,
    pub grant: PermissionGrant,
}

/// In-memory snap registry, typically built from the config file.
pub struct StaticSnaps {
    snaps: Mutex<BTreeMap<SnapId, SnapRecord>>,
    changes: broadcast::Sender<SnapId>,
}

impl Default for StaticSnaps {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticSnaps {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            snaps: Mutex::new(BTreeMap::new()),
            changes,
        }
    }

    pub fn insert(&self, snap_id: SnapId, record: SnapRecord) {
        lock(&self.snaps).insert(snap_id, record);
    }

    pub fn with(self, snap_id: SnapId, record: SnapRecord) -> Self {
        self.insert(snap_id, record);
        self
    }

    /// Replaces a snap's grant and signals subscribers.
    /// Returns false if the snap is not installed.
    pub fn update_grant(&self, snap_id: &SnapId, grant: PermissionGrant) -> bool {
        {
            let mut snaps = lock(&self.snaps);
            let Some(record) = snaps.get_mut(snap_id) else {
                return false;
            };
            if record.grant == grant {
                return true;
            }
            record.grant = grant;
        }
        info!(snap = %snap_id, "permission grant changed");
        // No subscribers is fine.
        let _ = self.changes.send(snap_id.clone());
        true
    }

    pub fn snap_ids(&self) -> Vec<SnapId> {
        lock(&self.snaps).keys().cloned().collect()
    }
}

impl PermissionSource for StaticSnaps {
    fn grant(&self, snap_id: &SnapId) -> Option<PermissionGrant> {
        lock(&self.snaps).get(snap_id).map(|r| r.grant.clone())
    }

    fn can_invoke(&self, origin: &str, snap_id: &SnapId) -> bool {
        lock(&self.snaps).get(snap_id).is_some_and(|r| {
            r.allowed_origins
                .iter()
                .any(|allowed| allowed == "*" || allowed == origin)
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<SnapId> {
        self.changes.subscribe()
    }
}

impl SnapSource for StaticSnaps {
    fn source(&self, snap_id: &SnapId) -> Option<String> {
        lock(&self.snaps).get(snap_id).map(|r| r.source.clone())
    }
}
