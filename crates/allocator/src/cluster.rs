use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::watch;

use crate::error::{ClusterError, ClusterResult};
use crate::mode::{CodeMode, CodeModePolicy, Tactic};

/// Parameters for one `AllocVolume` call to the cluster manager.
#[derive(Debug, Clone)]
pub struct AllocVolumeRequest {
    pub cluster_id: String,
    pub idc: String,
    pub code_mode: CodeMode,
    pub count: u32,
    pub is_init: bool,
}

/// One volume handed back by a successful `AllocVolume` call.
#[derive(Debug, Clone)]
pub struct AllocVolumeInfo {
    pub vid: u64,
    pub free: u64,
    pub capacity: u64,
    /// How far in the future this lease's first expiration lands,
    /// relative to the moment the allocator observes the response — the
    /// cluster manager's own clock never needs to enter this crate.
    pub expire_in: Duration,
}

/// Result of a `RetainVolume` batch call: which vids got a fresh lease
/// horizon, and which the cluster manager has reclaimed outright.
#[derive(Debug, Clone, Default)]
pub struct RetainResult {
    pub renewed: Vec<(u64, Duration)>,
    pub reclaimed: Vec<u64>,
}

/// Remote cluster-manager surface the allocator depends on: config
/// lookup, volume allocation, and lease retain. Modeled as a trait
/// returning boxed futures — the same shape
/// `common::traits::StorageBackend` uses — so it can be held as a trait
/// object without pulling in `async-trait`.
///
/// Every call takes a `cancel` receiver shared with the allocator's own
/// shutdown signal, so a `close()` can abort an in-flight call rather
/// than leaving the caller to wait out a full network timeout.
pub trait ClusterClient: Send + Sync {
    fn get_config<'a>(&'a self, key: &'a str, cancel: watch::Receiver<bool>) -> BoxFuture<'a, ClusterResult<String>>;

    fn alloc_volume(
        &self,
        req: AllocVolumeRequest,
        cancel: watch::Receiver<bool>,
    ) -> BoxFuture<'_, ClusterResult<Vec<AllocVolumeInfo>>>;

    fn retain_volume<'a>(
        &'a self,
        vids: &'a [u64],
        cancel: watch::Receiver<bool>,
    ) -> BoxFuture<'a, ClusterResult<RetainResult>>;
}

#[derive(Debug, Deserialize)]
struct RawCodeModePolicy {
    mode_name: String,
    enable: bool,
    n: u32,
    m: u32,
    l: u32,
}

/// Parse the `code_mode` config key's JSON-encoded policy records.
pub fn parse_code_mode_policies(raw: &str) -> Result<Vec<CodeModePolicy>, serde_json::Error> {
    let records: Vec<RawCodeModePolicy> = serde_json::from_str(raw)?;
    Ok(records
        .into_iter()
        .map(|r| CodeModePolicy {
            mode_name: r.mode_name,
            enable: r.enable,
            tactic: Tactic {
                n: r.n,
                m: r.m,
                l: r.l,
            },
        })
        .collect())
}

#[derive(Default)]
struct FakeState {
    fail_next: u32,
    next_vid: u64,
    scripted_batches: VecDeque<Vec<AllocVolumeInfo>>,
    reclaim_next: HashSet<u64>,
    retain_calls: u32,
    alloc_calls: u32,
}

/// In-memory `ClusterClient` test double, the allocator-side analogue of
/// `storage::InMemoryBackend`. Exercises the Replenisher/Retainer retry
/// paths by letting tests script failures, partial batches, and
/// reclamations without a live cluster manager.
pub struct FakeClusterClient {
    config: HashMap<String, String>,
    default_capacity: u64,
    state: Mutex<FakeState>,
}

impl FakeClusterClient {
    pub fn new() -> Self {
        Self {
            config: HashMap::new(),
            default_capacity: 1 << 30,
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_default_capacity(mut self, capacity: u64) -> Self {
        self.default_capacity = capacity;
        self
    }

    /// Make the next `n` `alloc_volume` calls fail with a transient
    /// transport error before any further call succeeds.
    pub fn fail_next_allocs(&self, n: u32) {
        self.state.lock().expect("fake cluster client lock poisoned").fail_next = n;
    }

    /// Queue an exact response for the next `alloc_volume` call,
    /// overriding the default auto-generated batch.
    pub fn script_alloc_batch(&self, batch: Vec<AllocVolumeInfo>) {
        self.state
            .lock()
            .expect("fake cluster client lock poisoned")
            .scripted_batches
            .push_back(batch);
    }

    /// Reclaim the given vids on the next `retain_volume` call.
    pub fn reclaim_on_next_retain(&self, vids: impl IntoIterator<Item = u64>) {
        self.state
            .lock()
            .expect("fake cluster client lock poisoned")
            .reclaim_next
            .extend(vids);
    }

    pub fn alloc_call_count(&self) -> u32 {
        self.state.lock().expect("fake cluster client lock poisoned").alloc_calls
    }

    pub fn retain_call_count(&self) -> u32 {
        self.state.lock().expect("fake cluster client lock poisoned").retain_calls
    }
}

impl Default for FakeClusterClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterClient for FakeClusterClient {
    fn get_config<'a>(&'a self, key: &'a str, cancel: watch::Receiver<bool>) -> BoxFuture<'a, ClusterResult<String>> {
        Box::pin(async move {
            if *cancel.borrow() {
                return Err(ClusterError::Cancelled);
            }
            self.config
                .get(key)
                .cloned()
                .ok_or_else(|| ClusterError::InvalidResponse(format!("missing config key `{key}`")))
        })
    }

    fn alloc_volume(
        &self,
        req: AllocVolumeRequest,
        cancel: watch::Receiver<bool>,
    ) -> BoxFuture<'_, ClusterResult<Vec<AllocVolumeInfo>>> {
        Box::pin(async move {
            if *cancel.borrow() {
                return Err(ClusterError::Cancelled);
            }

            let mut state = self.state.lock().expect("fake cluster client lock poisoned");
            state.alloc_calls += 1;

            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(ClusterError::Transport("simulated transport failure".into()));
            }

            if let Some(batch) = state.scripted_batches.pop_front() {
                return Ok(batch);
            }

            let mut out = Vec::with_capacity(req.count as usize);
            for _ in 0..req.count {
                state.next_vid += 1;
                out.push(AllocVolumeInfo {
                    vid: state.next_vid,
                    free: self.default_capacity,
                    capacity: self.default_capacity,
                    expire_in: Duration::from_secs(3600),
                });
            }
            Ok(out)
        })
    }

    fn retain_volume<'a>(
        &'a self,
        vids: &'a [u64],
        cancel: watch::Receiver<bool>,
    ) -> BoxFuture<'a, ClusterResult<RetainResult>> {
        Box::pin(async move {
            if *cancel.borrow() {
                return Err(ClusterError::Cancelled);
            }

            let mut state = self.state.lock().expect("fake cluster client lock poisoned");
            state.retain_calls += 1;

            let reclaim: HashSet<u64> = state.reclaim_next.drain().collect();
            let mut result = RetainResult::default();
            for &vid in vids {
                if reclaim.contains(&vid) {
                    result.reclaimed.push(vid);
                } else {
                    result.renewed.push((vid, Duration::from_secs(3600)));
                }
            }
            Ok(result)
        })
    }
}
