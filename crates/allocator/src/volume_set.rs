use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::entry::VolumeEntry;

/// Concurrent map from volume-id to [`VolumeEntry`]. `list()` returns a
/// point-in-time snapshot that stays safe to iterate even as later
/// `put`/`delete` calls run concurrently — the entries it holds may still
/// mutate through their own lock, matching the guarantee
/// `storage::InMemoryBackend` gives its callers.
#[derive(Default)]
pub struct VolumeSet {
    entries: RwLock<HashMap<u64, Arc<VolumeEntry>>>,
}

impl VolumeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, entry: Arc<VolumeEntry>) {
        self.entries
            .write()
            .expect("volume set lock poisoned")
            .insert(entry.vid, entry);
    }

    pub fn get(&self, vid: u64) -> Option<Arc<VolumeEntry>> {
        self.entries
            .read()
            .expect("volume set lock poisoned")
            .get(&vid)
            .cloned()
    }

    pub fn delete(&self, vid: u64) -> Option<Arc<VolumeEntry>> {
        self.entries
            .write()
            .expect("volume set lock poisoned")
            .remove(&vid)
    }

    pub fn list(&self) -> Vec<Arc<VolumeEntry>> {
        self.entries
            .read()
            .expect("volume set lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("volume set lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
