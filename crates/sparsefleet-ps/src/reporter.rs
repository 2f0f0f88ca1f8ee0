//! Rate-limited progress reporting to the monitor service.
//!
//! Both workers (loss/AUC counters) and server shards (nnz deltas) flush
//! through a `TimeReporter`, which buffers deltas and sends at most one
//! report per `min_interval` so a hot pipeline cannot flood the scheduler.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tonic::transport::Channel;

use sparsefleet_core::{Error, Progress, Result};
use sparsefleet_proto::{MonitorClient, Phase, ProgressReport};

struct ReporterState {
    pending: Progress,
    /// None until the first flush, so the first report goes out at once.
    last_flush: Option<Instant>,
}

/// Buffers progress deltas and flushes them to the monitor at a bounded
/// rate.
pub struct TimeReporter {
    client: MonitorClient<Channel>,
    sender: String,
    min_interval: Duration,
    state: Mutex<ReporterState>,
}

impl TimeReporter {
    /// Creates a reporter identified as `sender`, flushing at most once per
    /// `min_interval` (clamped to at least one second).
    pub fn new(
        client: MonitorClient<Channel>,
        sender: impl Into<String>,
        min_interval: Duration,
    ) -> Self {
        Self {
            client,
            sender: sender.into(),
            min_interval: min_interval.max(Duration::from_secs(1)),
            state: Mutex::new(ReporterState {
                pending: Progress::new(),
                last_flush: None,
            }),
        }
    }

    /// Buffers `delta` and flushes the merged buffer if the interval has
    /// elapsed.
    pub async fn report(&self, phase: Phase, delta: &Progress) -> Result<()> {
        let to_send = {
            let mut state = self.state.lock();
            state.pending.merge(delta);
            let due = match state.last_flush {
                None => true,
                Some(at) => at.elapsed() >= self.min_interval,
            };
            if state.pending.is_empty() || !due {
                return Ok(());
            }
            state.last_flush = Some(Instant::now());
            std::mem::take(&mut state.pending)
        };
        self.send(phase, &to_send).await
    }

    /// Sends whatever is buffered regardless of the interval. Called at the
    /// end of a partition so the tail of the counters is not lost.
    pub async fn flush(&self, phase: Phase) -> Result<()> {
        let to_send = {
            let mut state = self.state.lock();
            if state.pending.is_empty() {
                return Ok(());
            }
            state.last_flush = Some(Instant::now());
            std::mem::take(&mut state.pending)
        };
        self.send(phase, &to_send).await
    }

    async fn send(&self, phase: Phase, progress: &Progress) -> Result<()> {
        let report = ProgressReport::from_progress(phase, self.sender.clone(), progress);
        let mut client = self.client.clone();
        client
            .report(report)
            .await
            .map_err(|e| Error::Transport(format!("progress report: {e}")))?;
        Ok(())
    }
}
