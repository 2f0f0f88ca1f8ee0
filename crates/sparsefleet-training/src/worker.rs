//! The worker role: a gRPC-controlled minibatch pipeline.
//!
//! The partition driver runs on a blocking thread: it streams minibatches,
//! localizes feature IDs and dispatches one asynchronous
//! pull -> evaluate -> push continuation per minibatch onto the runtime.
//! A mutex/condvar gate bounds the number of uncommitted minibatches at
//! `max_delay`; the continuation's final completion (push in train,
//! pull-side evaluation in validation) decrements the gate and wakes the
//! driver. At end of partition the driver drains the gate to zero before
//! replying.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tonic::{Request, Response, Status};

use sparsefleet_core::{Error, Progress, Result, TrainerConfig};
use sparsefleet_data::{localize, LocalizedBlock, MinibatchIter};
use sparsefleet_loss::create_loss;
use sparsefleet_proto::{
    Phase, ProcessResponse, ProgressReport, ShutdownRequest, ShutdownResponse, WorkerControl,
    WorkerControlServer, Workload,
};
use sparsefleet_ps::{KvClient, TimeReporter};

/// Everything a partition run needs from the worker process.
pub struct WorkerContext {
    /// Trainer configuration (minibatch sizing, staleness window, loss).
    pub cfg: TrainerConfig,
    /// Client over the parameter-server group.
    pub kv: Arc<KvClient>,
    /// Rate-limited progress reporter toward the scheduler; absent in
    /// embedded runs that do not track progress centrally.
    pub reporter: Option<Arc<TimeReporter>>,
    /// Stable worker name used in pool assignments and logs.
    pub worker_id: String,
}

/// The in-flight minibatch gate: one mutex and condvar per worker.
pub(crate) struct InflightGate {
    count: Mutex<usize>,
    cv: Condvar,
}

impl InflightGate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            count: Mutex::new(0),
            cv: Condvar::new(),
        })
    }

    /// Registers one dispatched minibatch, then blocks while more than
    /// `max_delay` are uncommitted.
    pub(crate) fn dispatch_and_throttle(&self, max_delay: usize) {
        let mut n = self.count.lock();
        *n += 1;
        while *n > max_delay {
            self.cv.wait(&mut n);
        }
    }

    /// Commits one minibatch and wakes a throttled driver.
    pub(crate) fn finish(&self) {
        let mut n = self.count.lock();
        *n -= 1;
        drop(n);
        self.cv.notify_one();
    }

    /// Blocks until nothing is in flight.
    pub(crate) fn drain(&self) {
        let mut n = self.count.lock();
        while *n > 0 {
            self.cv.wait(&mut n);
        }
    }

    pub(crate) fn current(&self) -> usize {
        *self.count.lock()
    }
}

/// The gRPC worker service.
pub struct WorkerService {
    ctx: Arc<WorkerContext>,
    stop: Arc<AtomicBool>,
    shutdown: Notify,
}

impl WorkerService {
    /// Wraps a worker context for serving.
    pub fn new(ctx: WorkerContext) -> Arc<Self> {
        Arc::new(Self {
            ctx: Arc::new(ctx),
            stop: Arc::new(AtomicBool::new(false)),
            shutdown: Notify::new(),
        })
    }

    /// Completes once a shutdown command arrives.
    pub async fn wait_shutdown(&self) {
        self.shutdown.notified().await;
    }
}

/// Newtype over `Arc<WorkerService>` carrying the service impl.
#[derive(Clone)]
pub struct WorkerHandle(pub Arc<WorkerService>);

#[tonic::async_trait]
impl WorkerControl for WorkerHandle {
    async fn process(
        &self,
        request: Request<Workload>,
    ) -> std::result::Result<Response<ProcessResponse>, Status> {
        let workload = request.into_inner();
        let ctx = self.0.ctx.clone();
        let stop = self.0.stop.clone();
        let handle = Handle::current();
        let phase = workload.phase();

        tracing::info!(
            worker = %ctx.worker_id,
            file = %workload.file,
            part = workload.part_id,
            ?phase,
            "processing partition"
        );

        let joined =
            tokio::task::spawn_blocking(move || process_partition(&ctx, &workload, &stop, &handle))
                .await;

        let response = match joined {
            Ok(Ok(progress)) => ProcessResponse {
                ok: true,
                error_message: String::new(),
                // Train progress flows continuously through the monitor;
                // validation progress rides back on the reply.
                progress: (phase == Phase::Val).then(|| {
                    ProgressReport::from_progress(phase, self.0.ctx.worker_id.clone(), &progress)
                }),
            },
            Ok(Err(e)) => {
                tracing::warn!(worker = %self.0.ctx.worker_id, "partition failed: {e}");
                ProcessResponse {
                    ok: false,
                    error_message: e.to_string(),
                    progress: None,
                }
            }
            Err(join_err) => ProcessResponse {
                ok: false,
                error_message: format!("partition driver panicked: {join_err}"),
                progress: None,
            },
        };
        Ok(Response::new(response))
    }

    async fn shutdown(
        &self,
        _request: Request<ShutdownRequest>,
    ) -> std::result::Result<Response<ShutdownResponse>, Status> {
        tracing::info!(worker = %self.0.ctx.worker_id, "shutdown requested");
        self.0.stop.store(true, Ordering::SeqCst);
        self.0.shutdown.notify_one();
        Ok(Response::new(ShutdownResponse {}))
    }
}

/// Serves `service` on `addr` until shutdown; in-flight partitions drain
/// before the reply goes out.
pub async fn serve_worker(
    service: Arc<WorkerService>,
    addr: SocketAddr,
) -> std::result::Result<(), tonic::transport::Error> {
    let signal = service.clone();
    tonic::transport::Server::builder()
        .add_service(WorkerControlServer::new(WorkerHandle(service)))
        .serve_with_shutdown(addr, async move { signal.wait_shutdown().await })
        .await
}

/// Resolves the workload's file field into concrete local paths.
fn resolve_files(cfg: &TrainerConfig, workload: &Workload) -> Result<Vec<String>> {
    if !cfg.use_worker_local_data {
        return Ok(vec![workload.file.clone()]);
    }
    let mut files: Vec<String> = glob::glob(&workload.file)
        .map_err(|e| Error::Reader {
            path: workload.file.clone(),
            message: e.to_string(),
        })?
        .filter_map(|entry| entry.ok())
        .map(|p| p.display().to_string())
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(Error::Reader {
            path: workload.file.clone(),
            message: "no local files match".to_string(),
        });
    }
    Ok(files)
}

/// The blocking partition driver.
fn process_partition(
    ctx: &Arc<WorkerContext>,
    workload: &Workload,
    stop: &AtomicBool,
    handle: &Handle,
) -> Result<Progress> {
    let phase = workload.phase();
    let train = phase == Phase::Train;
    let mb_size = if train {
        ctx.cfg.minibatch
    } else {
        ctx.cfg.val_minibatch()
    };
    // Validation has no gradient backpressure to bound, so the window is
    // effectively unlimited.
    let max_delay = if train { ctx.cfg.max_delay } else { usize::MAX / 2 };

    let gate = InflightGate::new();
    let partition_prog: Arc<Mutex<Progress>> = Arc::new(Mutex::new(Progress::new()));
    let first_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

    // A failed read stops dispatching but still drains the pipeline below;
    // in-flight RPCs run to completion either way.
    let mut driver_result: Result<()> = Ok(());
    'files: for file in resolve_files(&ctx.cfg, workload)? {
        let mut reader = match MinibatchIter::new(
            &file,
            workload.part_id,
            workload.num_parts,
            &ctx.cfg.data_format,
            mb_size,
        ) {
            Ok(reader) => reader,
            Err(e) => {
                driver_result = Err(e);
                break 'files;
            }
        };

        loop {
            if stop.load(Ordering::SeqCst) || first_error.lock().is_some() {
                break 'files;
            }
            let batch = match reader.next_batch() {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(e) => {
                    driver_result = Err(e);
                    break 'files;
                }
            };

            let (local, feaid) = localize(&batch);
            handle.spawn(run_minibatch(
                ctx.clone(),
                local,
                feaid,
                train,
                gate.clone(),
                partition_prog.clone(),
                first_error.clone(),
            ));
            gate.dispatch_and_throttle(max_delay);
        }
    }

    gate.drain();

    if train {
        if let Some(reporter) = &ctx.reporter {
            // Ship whatever the rate limiter still holds for this partition.
            if let Err(e) = handle.block_on(reporter.flush(Phase::Train)) {
                tracing::warn!(worker = %ctx.worker_id, "final progress flush failed: {e}");
            }
        }
    }

    driver_result?;
    if let Some(e) = first_error.lock().take() {
        return Err(e);
    }
    let progress = partition_prog.lock().clone();
    Ok(progress)
}

/// One minibatch continuation: pull weights, evaluate, and in train phase
/// push gradients. Whichever step completes the pipeline releases the gate.
async fn run_minibatch(
    ctx: Arc<WorkerContext>,
    local: LocalizedBlock,
    feaid: Vec<u64>,
    train: bool,
    gate: Arc<InflightGate>,
    partition_prog: Arc<Mutex<Progress>>,
    first_error: Arc<Mutex<Option<Error>>>,
) {
    let result = async {
        let weights = ctx.kv.pull(&feaid).await?;

        let loss = create_loss(
            ctx.cfg.loss,
            ctx.cfg.dim_v,
            &local,
            &weights,
            ctx.cfg.num_threads,
        );
        let mut delta = Progress::new();
        loss.evaluate(&mut delta);
        partition_prog.lock().merge(&delta);

        if train {
            if let Some(reporter) = &ctx.reporter {
                if let Err(e) = reporter.report(Phase::Train, &delta).await {
                    tracing::warn!(worker = %ctx.worker_id, "progress report failed: {e}");
                }
            }
            let mut buf = weights;
            loss.calc_grad(&local, &mut buf);
            ctx.kv.push(&feaid, &buf).await?;
        }
        Ok::<(), Error>(())
    }
    .await;

    if let Err(e) = result {
        first_error.lock().get_or_insert(e);
    }
    gate.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_gate_bounds_inflight_count() {
        let gate = InflightGate::new();
        let max_delay = 4usize;
        let peak = Arc::new(AtomicUsize::new(0));

        // Completions arrive from another thread with a small lag, the way
        // push callbacks do.
        let completer = {
            let gate = gate.clone();
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    while gate.current() == 0 {
                        std::thread::yield_now();
                    }
                    std::thread::sleep(Duration::from_micros(10));
                    gate.finish();
                }
            })
        };

        for _ in 0..1000 {
            gate.dispatch_and_throttle(max_delay);
            peak.fetch_max(gate.current(), Ordering::SeqCst);
        }
        gate.drain();
        completer.join().unwrap();

        assert_eq!(gate.current(), 0);
        assert!(peak.load(Ordering::SeqCst) <= max_delay + 1);
    }

    #[test]
    fn test_gate_drain_waits_for_zero() {
        let gate = InflightGate::new();
        gate.dispatch_and_throttle(10);
        gate.dispatch_and_throttle(10);
        let finisher = {
            let gate = gate.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                gate.finish();
                gate.finish();
            })
        };
        gate.drain();
        assert_eq!(gate.current(), 0);
        finisher.join().unwrap();
    }

    #[test]
    fn test_resolve_files_passthrough_without_local_data() {
        let cfg = TrainerConfig::default();
        let wl = Workload {
            file: "/data/does-not-need-to-exist".to_string(),
            part_id: 0,
            num_parts: 1,
            phase: Phase::Train as i32,
            epoch: 0,
        };
        let files = resolve_files(&cfg, &wl).unwrap();
        assert_eq!(files, vec!["/data/does-not-need-to-exist".to_string()]);
    }

    #[test]
    fn test_resolve_files_expands_local_glob() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.libsvm", "a.libsvm"] {
            let mut f = std::fs::File::create(dir.path().join(name)).unwrap();
            writeln!(f, "1 1:1").unwrap();
        }
        let cfg = TrainerConfig {
            use_worker_local_data: true,
            ..Default::default()
        };
        let wl = Workload {
            file: format!("{}/*.libsvm", dir.path().display()),
            part_id: 0,
            num_parts: 1,
            phase: Phase::Train as i32,
            epoch: 0,
        };
        let files = resolve_files(&cfg, &wl).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a.libsvm"));
    }

    #[test]
    fn test_resolve_files_empty_glob_fails_partition() {
        let cfg = TrainerConfig {
            use_worker_local_data: true,
            ..Default::default()
        };
        let wl = Workload {
            file: "/nonexistent-dir-xyz/*.libsvm".to_string(),
            part_id: 0,
            num_parts: 1,
            phase: Phase::Train as i32,
            epoch: 0,
        };
        assert!(matches!(
            resolve_files(&cfg, &wl),
            Err(Error::Reader { .. })
        ));
    }
}
