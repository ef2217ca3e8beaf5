use std::sync::Mutex;
use std::time::Instant;

use crate::mode::CodeMode;

#[derive(Debug)]
struct VolumeEntryState {
    free: u64,
    used: u64,
    deleted: bool,
    expire_time: Instant,
}

/// Outcome of a successful [`VolumeEntry::try_debit`] call.
#[derive(Debug, Clone, Copy)]
pub struct DebitOutcome {
    /// `free` remaining after the debit.
    pub remaining_free: u64,
    /// Whether the debit pushed `free` below the reserve size, retiring
    /// the volume.
    pub retired: bool,
}

/// A point-in-time copy of a volume's accounting, returned by
/// [`crate::Allocator::list`].
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub vid: u64,
    pub code_mode: CodeMode,
    pub capacity: u64,
    pub free: u64,
    pub used: u64,
    pub deleted: bool,
}

/// One leased volume. `vid`, `code_mode`, and `capacity` are fixed at
/// construction and read without locking; `free`/`used`/`deleted`/
/// `expire_time` live behind this entry's own lock so that writers
/// touching different volumes never contend with each other — the design
/// explicitly forbids a single mode-wide lock here.
#[derive(Debug)]
pub struct VolumeEntry {
    pub vid: u64,
    pub code_mode: CodeMode,
    pub capacity: u64,
    state: Mutex<VolumeEntryState>,
}

impl VolumeEntry {
    pub fn new(
        vid: u64,
        code_mode: CodeMode,
        free: u64,
        capacity: u64,
        expire_time: Instant,
    ) -> Self {
        Self {
            vid,
            code_mode,
            capacity,
            state: Mutex::new(VolumeEntryState {
                free,
                used: capacity.saturating_sub(free),
                deleted: false,
                expire_time,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VolumeEntryState> {
        self.state.lock().expect("volume entry lock poisoned")
    }

    pub fn free(&self) -> u64 {
        self.lock().free
    }

    pub fn used(&self) -> u64 {
        self.lock().used
    }

    pub fn is_deleted(&self) -> bool {
        self.lock().deleted
    }

    pub fn expire_time(&self) -> Instant {
        self.lock().expire_time
    }

    /// Mark the entry deleted. Returns `false` if it was already deleted
    /// (deletion is monotonic and idempotent).
    pub fn mark_deleted(&self) -> bool {
        let mut state = self.lock();
        if state.deleted {
            return false;
        }
        state.deleted = true;
        true
    }

    pub fn renew(&self, new_expire: Instant) {
        self.lock().expire_time = new_expire;
    }

    /// Attempt to debit `size` bytes. Returns `None` if the volume is
    /// already deleted or doesn't have `size` bytes free — the caller
    /// should move on to the next candidate. `size = 0` always succeeds
    /// without mutating `free`/`used`.
    pub fn try_debit(&self, size: u64, reserve_size: u64) -> Option<DebitOutcome> {
        let mut state = self.lock();
        if state.deleted || state.free < size {
            return None;
        }

        state.free -= size;
        state.used += size;

        let retired = state.free < reserve_size;
        if retired {
            state.deleted = true;
        }

        Some(DebitOutcome {
            remaining_free: state.free,
            retired,
        })
    }

    pub fn snapshot(&self) -> VolumeInfo {
        let state = self.lock();
        VolumeInfo {
            vid: self.vid,
            code_mode: self.code_mode.clone(),
            capacity: self.capacity,
            free: state.free,
            used: state.used,
            deleted: state.deleted,
        }
    }
}
