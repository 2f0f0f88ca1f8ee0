//! The asynchronous-SGD coordination engine: workload partitioning, the
//! scheduler's epoch loop, the worker minibatch pipeline with its
//! bounded-staleness gate, and the two-level progress monitor.

pub mod monitor;
pub mod scheduler;
pub mod worker;
pub mod workload_pool;

pub use monitor::{DistMonitor, MonitorHandle};
pub use scheduler::{Scheduler, SchedulerOpts};
pub use worker::{serve_worker, WorkerContext, WorkerHandle, WorkerService};
pub use workload_pool::WorkloadPool;
