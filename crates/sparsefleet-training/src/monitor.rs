//! Two-level progress aggregation.
//!
//! Workers accumulate per-minibatch counters locally and flush them through
//! a rate-limited reporter (see `sparsefleet_ps::TimeReporter`); the
//! scheduler-hosted [`DistMonitor`] merges everything per phase and hands
//! the scheduler `get`/`clear` for the periodic display. Merge order does
//! not matter, so late or duplicated reports are harmless.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tonic::{Request, Response, Status};

use sparsefleet_core::Progress;
use sparsefleet_proto::{Monitor, Phase, ProgressReport, ReportAck};

/// Phase-keyed merged progress, hosted in the scheduler process.
pub struct DistMonitor {
    records: Mutex<HashMap<i32, Progress>>,
}

impl DistMonitor {
    /// Creates an empty monitor.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(HashMap::new()),
        })
    }

    /// Merges one delta into a phase's record.
    pub fn merge(&self, phase: Phase, delta: &Progress) {
        self.records
            .lock()
            .entry(phase as i32)
            .or_default()
            .merge(delta);
    }

    /// A snapshot of a phase's merged record.
    pub fn get(&self, phase: Phase) -> Progress {
        self.records
            .lock()
            .get(&(phase as i32))
            .cloned()
            .unwrap_or_default()
    }

    /// Resets a phase's record to zero.
    pub fn clear(&self, phase: Phase) {
        self.records.lock().remove(&(phase as i32));
    }
}

/// Newtype over `Arc<DistMonitor>` carrying the gRPC service impl.
#[derive(Clone)]
pub struct MonitorHandle(pub Arc<DistMonitor>);

#[tonic::async_trait]
impl Monitor for MonitorHandle {
    async fn report(
        &self,
        request: Request<ProgressReport>,
    ) -> Result<Response<ReportAck>, Status> {
        let report = request.into_inner();
        let phase = Phase::try_from(report.phase).unwrap_or(Phase::Train);
        self.0.merge(phase, &report.to_progress());
        Ok(Response::new(ReportAck {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(n: i64, obj: f64) -> Progress {
        Progress {
            num_examples: n,
            minibatch_count: 1,
            objective_sum: obj,
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_get_clear_cycle() {
        let m = DistMonitor::new();
        m.merge(Phase::Train, &delta(100, 50.0));
        m.merge(Phase::Train, &delta(200, 80.0));
        m.merge(Phase::Val, &delta(10, 1.0));

        let train = m.get(Phase::Train);
        assert_eq!(train.num_examples, 300);
        assert!((train.objective() - 130.0 / 300.0).abs() < 1e-12);

        m.clear(Phase::Train);
        assert!(m.get(Phase::Train).is_empty());
        // Other phase untouched.
        assert_eq!(m.get(Phase::Val).num_examples, 10);
    }

    #[tokio::test]
    async fn test_report_rpc_merges() {
        let monitor = DistMonitor::new();
        let handle = MonitorHandle(monitor.clone());

        let report = ProgressReport::from_progress(Phase::Train, "w0", &delta(42, 21.0));
        handle.report(Request::new(report)).await.unwrap();

        assert_eq!(monitor.get(Phase::Train).num_examples, 42);
    }
}
