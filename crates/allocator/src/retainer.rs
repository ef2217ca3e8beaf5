use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cluster::ClusterClient;
use crate::mode::ModeState;

/// Periodic lease-renewal sweep over one mode's volumes. Every
/// `interval`, every live volume whose lease falls inside the renewal
/// window (`expire_time - now < 2 * interval`) is sent to the cluster
/// manager's `RetainVolume`; volumes it renews get a fresh `expire_time`,
/// volumes it reports reclaimed are removed from the mode immediately
/// rather than waiting to be discovered lazily during selection.
pub struct Retainer<C: ClusterClient> {
    cluster: Arc<C>,
    mode: Arc<ModeState>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl<C: ClusterClient> Retainer<C> {
    pub fn new(cluster: Arc<C>, mode: Arc<ModeState>, interval: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            cluster,
            mode,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        info!(code_mode = %self.mode.code_mode, "retainer shutting down");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    async fn sweep(&self) {
        let snapshot = self.mode.volumes.list();
        if snapshot.is_empty() {
            return;
        }

        let renewal_window = self.interval * 2;
        let now = Instant::now();
        let vids: Vec<u64> = snapshot
            .iter()
            .filter(|e| !e.is_deleted() && e.expire_time().saturating_duration_since(now) < renewal_window)
            .map(|e| e.vid)
            .collect();
        if vids.is_empty() {
            return;
        }

        match self.cluster.retain_volume(&vids, self.shutdown.clone()).await {
            Ok(result) => {
                for (vid, expire_in) in &result.renewed {
                    if let Some(entry) = self.mode.volumes.get(*vid) {
                        entry.renew(Instant::now() + *expire_in);
                    }
                }
                for vid in &result.reclaimed {
                    // Mark deleted before removing from the set, the same
                    // order every other removal path in this crate follows:
                    // a caller holding a stale `Arc<VolumeEntry>` clone from
                    // before the sweep (e.g. a Selector mid-walk) must still
                    // see `is_deleted()` and refuse to debit it.
                    if let Some(entry) = self.mode.volumes.get(*vid) {
                        if entry.mark_deleted() {
                            self.mode.volumes.delete(*vid);
                            self.mode.sub_free(entry.free());
                        }
                    }
                }
                debug!(
                    code_mode = %self.mode.code_mode,
                    renewed = result.renewed.len(),
                    reclaimed = result.reclaimed.len(),
                    "retain sweep complete"
                );
            }
            Err(err) => {
                warn!(code_mode = %self.mode.code_mode, error = %err, "retain_volume failed, will retry next tick");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::VolumeEntry;
    use crate::mode::CodeMode;
    use tokio::sync::mpsc;

    fn new_mode_with_volume(vid: u64) -> Arc<ModeState> {
        let (tx, _rx) = mpsc::channel(1);
        let mode = Arc::new(ModeState::new(CodeMode::new("EC6P6"), 10, 1, tx));
        mode.volumes.put(Arc::new(VolumeEntry::new(
            vid,
            CodeMode::new("EC6P6"),
            100,
            100,
            Instant::now(),
        )));
        mode
    }

    #[tokio::test]
    async fn sweep_renews_expire_time() {
        use crate::cluster::FakeClusterClient;

        let mode = new_mode_with_volume(1);
        let cluster = Arc::new(FakeClusterClient::new());
        let (_tx, rx) = watch::channel(false);
        let retainer = Retainer::new(cluster, mode.clone(), Duration::from_secs(1), rx);

        let before = mode.volumes.get(1).unwrap().expire_time();
        retainer.sweep().await;
        let after = mode.volumes.get(1).unwrap().expire_time();
        assert!(after > before);
    }

    #[tokio::test]
    async fn sweep_removes_reclaimed_volumes() {
        use crate::cluster::FakeClusterClient;

        let mode = new_mode_with_volume(1);
        mode.add_free(100);
        let cluster = Arc::new(FakeClusterClient::new());
        cluster.reclaim_on_next_retain([1]);
        let (_tx, rx) = watch::channel(false);
        let retainer = Retainer::new(cluster, mode.clone(), Duration::from_secs(1), rx);

        retainer.sweep().await;
        assert!(mode.volumes.get(1).is_none());
        assert_eq!(mode.total_free(), 0);
    }

    #[tokio::test]
    async fn sweep_skips_volumes_outside_the_renewal_window() {
        use crate::cluster::FakeClusterClient;

        let (tx, _rx) = mpsc::channel(1);
        let mode = Arc::new(ModeState::new(CodeMode::new("EC6P6"), 10, 1, tx));
        mode.volumes.put(Arc::new(VolumeEntry::new(
            1,
            CodeMode::new("EC6P6"),
            100,
            100,
            Instant::now() + Duration::from_secs(3600),
        )));
        let cluster = Arc::new(FakeClusterClient::new());
        let (_tx, rx) = watch::channel(false);
        let retainer = Retainer::new(cluster.clone(), mode.clone(), Duration::from_secs(1), rx);

        let before = mode.volumes.get(1).unwrap().expire_time();
        retainer.sweep().await;
        let after = mode.volumes.get(1).unwrap().expire_time();
        assert_eq!(before, after, "a lease far from expiring should not be touched");
        assert_eq!(cluster.retain_call_count(), 0, "no retain call should fire for it");
    }
}
