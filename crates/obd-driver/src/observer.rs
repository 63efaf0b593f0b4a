//! Snapshot Subscriptions

use obd_protocol::VehicleSnapshot;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Callback = Arc<dyn Fn(&VehicleSnapshot) + Send + Sync>;

/// Identifies a registered callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Table {
    next_id: u64,
    callbacks: BTreeMap<u64, Callback>,
}

/// Callbacks invoked whenever a decoded value changes the snapshot
#[derive(Clone, Default)]
pub struct SnapshotObservers {
    table: Arc<Mutex<Table>>,
}

impl SnapshotObservers {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, callback: impl Fn(&VehicleSnapshot) + Send + Sync + 'static) -> SubscriptionId {
        let mut table = self.lock();
        let id = table.next_id;
        table.next_id += 1;
        table.callbacks.insert(id, Arc::new(callback));
        SubscriptionId(id)
    }

    /// Returns false if the subscription was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().callbacks.remove(&id.0).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every subscriber in registration order. The table is not
    /// locked during the calls, so callbacks may unsubscribe themselves.
    pub fn notify(&self, snapshot: &VehicleSnapshot) {
        let callbacks: Vec<Callback> = self.lock().callbacks.values().cloned().collect();
        for callback in callbacks {
            callback(snapshot);
        }
    }
}
