use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::debug;

use crate::volume_set::VolumeSet;

/// Redundancy scheme tag (e.g. `EC6P6`), opaque to the allocator beyond
/// being a hashable identity shared by a `ModeState` and the `VolumeEntry`s
/// leased under it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodeMode(String);

impl CodeMode {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shard counts for a code mode, as published by cluster manager policy.
/// `n` (data shards) is the effective write fan-out used to size
/// `total_threshold`.
#[derive(Debug, Clone, Copy)]
pub struct Tactic {
    pub n: u32,
    pub m: u32,
    pub l: u32,
}

impl Tactic {
    pub fn n(&self) -> u32 {
        self.n
    }
}

/// One record from the cluster manager's code-mode policy config.
/// Disabled records (`enable = false`) never get a `ModeState`.
#[derive(Debug, Clone)]
pub struct CodeModePolicy {
    pub mode_name: String,
    pub enable: bool,
    pub tactic: Tactic,
}

/// Request posted to a mode's refill mailbox.
#[derive(Debug, Clone)]
pub struct AllocRequest {
    pub is_init: bool,
    pub code_mode: CodeMode,
    pub count: u32,
}

/// Per-code-mode aggregate: its volumes, an advisory free-space counter,
/// the low-water mark that triggers refill, and the single-slot mailbox
/// the Replenisher consumes from.
pub struct ModeState {
    pub code_mode: CodeMode,
    pub volumes: VolumeSet,
    pub total_threshold: u64,
    total_free: AtomicU64,
    default_alloc_vols_num: u32,
    mailbox_tx: mpsc::Sender<AllocRequest>,
}

impl ModeState {
    pub fn new(
        code_mode: CodeMode,
        total_threshold: u64,
        default_alloc_vols_num: u32,
        mailbox_tx: mpsc::Sender<AllocRequest>,
    ) -> Self {
        Self {
            code_mode,
            volumes: VolumeSet::new(),
            total_threshold,
            total_free: AtomicU64::new(0),
            default_alloc_vols_num,
            mailbox_tx,
        }
    }

    pub fn total_free(&self) -> u64 {
        self.total_free.load(Ordering::Relaxed)
    }

    pub fn add_free(&self, amount: u64) {
        self.total_free.fetch_add(amount, Ordering::Relaxed);
    }

    /// Advisory counter, so a drifting subtraction saturates at zero
    /// instead of wrapping — correctness never depends on this value.
    pub fn sub_free(&self, amount: u64) {
        let _ = self
            .total_free
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(amount))
            });
    }

    /// Try to post a refill request for `default_alloc_vols_num` volumes;
    /// drops the signal if one is already in flight (mailbox full) or the
    /// Replenisher has shut down (mailbox closed) rather than blocking
    /// the caller.
    pub fn signal_refill(&self, is_init: bool) {
        self.signal_refill_with_count(is_init, self.default_alloc_vols_num);
    }

    /// Same as [`Self::signal_refill`] but with an explicit volume count,
    /// used for the construction-time warm-up request which asks for
    /// `init_volume_num` rather than the steady-state refill size.
    pub fn signal_refill_with_count(&self, is_init: bool, count: u32) {
        let request = AllocRequest {
            is_init,
            code_mode: self.code_mode.clone(),
            count,
        };

        match self.mailbox_tx.try_send(request) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(code_mode = %self.code_mode, "refill already in flight, dropping duplicate signal");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(code_mode = %self.code_mode, "refill mailbox closed, dropping signal");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_refill_coalesces_bursts() {
        let (tx, mut rx) = mpsc::channel(1);
        let mode = ModeState::new(CodeMode::new("EC6P6"), 100, 2, tx);

        mode.signal_refill(false);
        mode.signal_refill(false);
        mode.signal_refill(false);

        let first = rx.try_recv().expect("one request should be queued");
        assert_eq!(first.count, 2);
        assert!(rx.try_recv().is_err(), "duplicate signals must be dropped");
    }

    #[test]
    fn sub_free_saturates_at_zero() {
        let (tx, _rx) = mpsc::channel(1);
        let mode = ModeState::new(CodeMode::new("EC6P6"), 100, 1, tx);
        mode.add_free(10);
        mode.sub_free(50);
        assert_eq!(mode.total_free(), 0);
    }
}
