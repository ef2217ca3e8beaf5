use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cluster::{AllocVolumeRequest, ClusterClient};
use crate::entry::VolumeEntry;
use crate::mode::{AllocRequest, ModeState};

const RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Background worker that drains one mode's refill mailbox and calls the
/// cluster manager's `AllocVolume` until the request is satisfied. One
/// `Replenisher` runs per code mode, mirroring `ScalingAgent::run`'s
/// single-receiver consume loop.
pub struct Replenisher<C: ClusterClient> {
    cluster: Arc<C>,
    mode: Arc<ModeState>,
    cluster_id: String,
    idc: String,
    mailbox_rx: mpsc::Receiver<AllocRequest>,
    shutdown: watch::Receiver<bool>,
}

impl<C: ClusterClient> Replenisher<C> {
    pub fn new(
        cluster: Arc<C>,
        mode: Arc<ModeState>,
        cluster_id: String,
        idc: String,
        mailbox_rx: mpsc::Receiver<AllocRequest>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cluster,
            mode,
            cluster_id,
            idc,
            mailbox_rx,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        info!(code_mode = %self.mode.code_mode, "replenisher shutting down");
                        return;
                    }
                }
                request = self.mailbox_rx.recv() => {
                    match request {
                        Some(request) => self.fulfill(request).await,
                        None => {
                            debug!(code_mode = %self.mode.code_mode, "mailbox closed, replenisher exiting");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Keep calling `AllocVolume` until `request.count` fresh volumes have
    /// been installed, retrying transient failures after a fixed backoff
    /// and folding any partial batch into the mode before asking for the
    /// remainder. `is_init` only describes the very first attempt — once
    /// we've gone back to the cluster manager once, every further attempt
    /// for the same request is a plain retry, not a warm-up call.
    async fn fulfill(&mut self, request: AllocRequest) {
        let mut remaining = request.count;
        let mut is_init = request.is_init;

        while remaining > 0 {
            if *self.shutdown.borrow() {
                debug!(code_mode = %self.mode.code_mode, "shutdown observed mid-fulfill, abandoning remaining request");
                return;
            }

            let alloc_request = AllocVolumeRequest {
                cluster_id: self.cluster_id.clone(),
                idc: self.idc.clone(),
                code_mode: request.code_mode.clone(),
                count: remaining,
                is_init,
            };
            is_init = false;

            match self.cluster.alloc_volume(alloc_request, self.shutdown.clone()).await {
                Ok(volumes) if volumes.is_empty() => {
                    // The cluster manager reported success but handed back
                    // nothing usable; back off instead of spinning.
                    warn!(code_mode = %self.mode.code_mode, "alloc_volume returned zero volumes, backing off");
                    if self.sleep_or_shutdown(RETRY_BACKOFF).await {
                        return;
                    }
                }
                Ok(volumes) => {
                    let fulfilled = volumes.len() as u32;
                    for v in volumes {
                        let entry = Arc::new(VolumeEntry::new(
                            v.vid,
                            request.code_mode.clone(),
                            v.free,
                            v.capacity,
                            Instant::now() + v.expire_in,
                        ));
                        self.mode.add_free(v.free);
                        self.mode.volumes.put(entry);
                    }
                    info!(
                        code_mode = %self.mode.code_mode,
                        fulfilled,
                        remaining = remaining.saturating_sub(fulfilled),
                        "replenished volumes"
                    );
                    remaining = remaining.saturating_sub(fulfilled);
                }
                Err(err) => {
                    warn!(code_mode = %self.mode.code_mode, error = %err, "alloc_volume failed, retrying");
                    if self.sleep_or_shutdown(RETRY_BACKOFF).await {
                        return;
                    }
                }
            }
        }
    }

    /// Sleep for `dur` unless shutdown fires first. Returns `true` if the
    /// caller should abandon the in-progress request rather than retry.
    async fn sleep_or_shutdown(&mut self, dur: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.changed() => *self.shutdown.borrow(),
            _ = tokio::time::sleep(dur) => false,
        }
    }
}
