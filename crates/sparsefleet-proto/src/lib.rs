//! Generated protobuf types and gRPC stubs for sparsefleet, plus the small
//! conversions between wire progress reports and the in-memory record.

use sparsefleet_core::Progress;

#[allow(clippy::derive_partial_eq_without_eq)]
pub mod pb {
    tonic::include_proto!("sparsefleet");
}

pub use pb::monitor_client::MonitorClient;
pub use pb::monitor_server::{Monitor, MonitorServer};
pub use pb::param_server_client::ParamServerClient;
pub use pb::param_server_server::{ParamServer, ParamServerServer};
pub use pb::worker_control_client::WorkerControlClient;
pub use pb::worker_control_server::{WorkerControl, WorkerControlServer};
pub use pb::{
    KeyChunk, Phase, ProcessResponse, ProgressReport, PullRequest, PullResponse, PushRequest,
    PushResponse, ReportAck, SaveModelRequest, SaveModelResponse, ShutdownRequest,
    ShutdownResponse, ValueChunk, Workload,
};

impl ProgressReport {
    /// Wraps an in-memory progress record for the wire.
    pub fn from_progress(phase: Phase, sender: impl Into<String>, p: &Progress) -> Self {
        Self {
            phase: phase as i32,
            sender: sender.into(),
            num_examples: p.num_examples,
            minibatch_count: p.minibatch_count,
            nnz_w: p.nnz_w,
            nnz_v: p.nnz_v,
            objective_sum: p.objective_sum,
            auc_sum: p.auc_sum,
            clamped_gradients: p.clamped_gradients,
        }
    }

    /// Extracts the in-memory progress record.
    pub fn to_progress(&self) -> Progress {
        Progress {
            num_examples: self.num_examples,
            minibatch_count: self.minibatch_count,
            nnz_w: self.nnz_w,
            nnz_v: self.nnz_v,
            objective_sum: self.objective_sum,
            auc_sum: self.auc_sum,
            clamped_gradients: self.clamped_gradients,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_report_round_trip() {
        let p = Progress {
            num_examples: 10,
            minibatch_count: 2,
            nnz_w: 5,
            nnz_v: 0,
            objective_sum: 6.5,
            auc_sum: 1.8,
            clamped_gradients: 1,
        };
        let report = ProgressReport::from_progress(Phase::Train, "worker-0", &p);
        assert_eq!(report.sender, "worker-0");
        assert_eq!(report.to_progress(), p);
    }
}
