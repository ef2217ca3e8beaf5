use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use crate::mode::ModeState;

/// Periodically logs a structured snapshot of every mode's volume count
/// and advisory free-space total. There is no metrics-backend
/// integration here — only the `tracing` event, left for whatever
/// binary wires this crate in to scrape or export as it sees fit.
pub struct MetricsReporter {
    modes: Vec<Arc<ModeState>>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl MetricsReporter {
    pub fn new(modes: Vec<Arc<ModeState>>, interval: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            modes,
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
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.report();
                }
            }
        }
    }

    fn report(&self) {
        for mode in &self.modes {
            info!(
                code_mode = %mode.code_mode,
                volume_count = mode.volumes.len(),
                total_free = mode.total_free(),
                "volume pool snapshot"
            );
        }
    }
}
