//! The scheduler role: epoch state machine, partition dispatch, progress
//! display and the final save broadcast.
//!
//! Per epoch the pool is loaded with train partitions and one dispatch
//! task per worker drives `Process` calls with a deadline; a response
//! merges progress and immediately hands the sender its next partition. A
//! timed-out or failed call returns the partition to the pool for another
//! worker. The optional validation pass reuses the same machinery without
//! pushes. After the last epoch the scheduler broadcasts a save command to
//! the server group and shuts the fleet down. Model weights never pass
//! through here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tonic::transport::Channel;

use sparsefleet_core::{Error, Progress, Result, TrainerConfig};
use sparsefleet_proto::{Phase, ShutdownRequest, WorkerControlClient, Workload};
use sparsefleet_ps::KvClient;

use crate::monitor::DistMonitor;
use crate::workload_pool::WorkloadPool;

/// Dispatch policy knobs.
#[derive(Debug, Clone)]
pub struct SchedulerOpts {
    /// Deadline for one partition on one worker before it is requeued.
    pub assignment_timeout: Duration,
    /// Bounded retry budget per partition.
    pub max_retries: u32,
}

impl Default for SchedulerOpts {
    fn default() -> Self {
        Self {
            assignment_timeout: Duration::from_secs(3600),
            max_retries: 3,
        }
    }
}

/// The scheduler over one worker group and one server group.
pub struct Scheduler {
    cfg: TrainerConfig,
    opts: SchedulerOpts,
    monitor: Arc<DistMonitor>,
    workers: Vec<(String, WorkerControlClient<Channel>)>,
    servers: KvClient,
    /// Cumulative examples across epochs, for the display line.
    num_examples: i64,
}

impl Scheduler {
    /// Creates the scheduler. `workers` pairs a stable name with a control
    /// client; `servers` is the client over the shard group.
    pub fn new(
        cfg: TrainerConfig,
        opts: SchedulerOpts,
        monitor: Arc<DistMonitor>,
        workers: Vec<(String, WorkerControlClient<Channel>)>,
        servers: KvClient,
    ) -> Self {
        Self {
            cfg,
            opts,
            monitor,
            workers,
            servers,
            num_examples: 0,
        }
    }

    /// Runs all epochs, saves the model and shuts the fleet down.
    pub async fn run(&mut self) -> Result<()> {
        if self.workers.is_empty() {
            return Err(Error::config("no workers connected"));
        }
        let started = Instant::now();

        for epoch in 0..self.cfg.max_data_pass as u32 {
            println!("training pass #{epoch}");
            self.run_phase(Phase::Train, epoch, started).await?;

            if !self.cfg.val_data.is_empty() {
                println!("validation pass #{epoch}");
                self.run_phase(Phase::Val, epoch, started).await?;
            }
        }

        tracing::info!(dir = %self.cfg.model_dir, "saving model");
        let entries = self.servers.save_model(&self.cfg.model_dir).await?;
        println!(
            "{:7.1} sec, model saved: {entries} nonzero weights in {}",
            started.elapsed().as_secs_f64(),
            self.cfg.model_dir
        );

        self.shutdown_fleet().await;
        Ok(())
    }

    /// Runs one phase of one epoch to completion.
    async fn run_phase(&mut self, phase: Phase, epoch: u32, started: Instant) -> Result<()> {
        let files = self.enumerate_files(phase)?;
        let pool = {
            let mut pool = WorkloadPool::new(self.opts.assignment_timeout, self.opts.max_retries);
            pool.add(&files, self.cfg.num_parts_per_file as u32, phase, epoch);
            Arc::new(Mutex::new(pool))
        };
        let phase_prog = Arc::new(Mutex::new(Progress::new()));

        let mut tasks = JoinSet::new();
        for (name, client) in &self.workers {
            tasks.spawn(dispatch_worker(
                name.clone(),
                client.clone(),
                pool.clone(),
                phase_prog.clone(),
                self.opts.assignment_timeout,
            ));
        }

        if phase == Phase::Train {
            let mut ticker =
                tokio::time::interval(Duration::from_secs_f64(self.cfg.disp_itv));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.print_train_line(started);
                    }
                    joined = tasks.join_next() => match joined {
                        Some(result) => {
                            result.map_err(|e| Error::Transport(format!("dispatch task: {e}")))??;
                        }
                        None => break,
                    }
                }
            }
            // Drain whatever reports arrived after the last tick.
            self.print_train_line(started);
        } else {
            while let Some(result) = tasks.join_next().await {
                result.map_err(|e| Error::Transport(format!("dispatch task: {e}")))??;
            }
            let prog = phase_prog.lock().clone();
            println!(
                "{:7.1} sec, #val {:.3e}, {}",
                started.elapsed().as_secs_f64(),
                prog.num_examples as f64,
                prog.print_str()
            );
        }

        if !pool.lock().is_finished() {
            return Err(Error::Transport(
                "phase aborted: no workers left and partitions remain".to_string(),
            ));
        }
        Ok(())
    }

    /// One periodic display line: elapsed seconds, cumulative examples and
    /// the merged metrics since the previous line.
    fn print_train_line(&mut self, started: Instant) {
        let prog = self.monitor.get(Phase::Train);
        self.monitor.clear(Phase::Train);
        if prog.is_empty() {
            return;
        }
        self.num_examples += prog.num_examples;
        println!(
            "{:7.1} sec, #train {:.3e}, {}",
            started.elapsed().as_secs_f64(),
            self.num_examples as f64,
            prog.print_str()
        );
    }

    /// The files a phase's partitions enumerate. With worker-local data the
    /// pattern goes out verbatim; otherwise it is expanded here.
    fn enumerate_files(&self, phase: Phase) -> Result<Vec<String>> {
        let pattern = match phase {
            Phase::Train => &self.cfg.train_data,
            Phase::Val => &self.cfg.val_data,
        };
        if pattern.is_empty() {
            return Err(Error::config(format!("no data configured for {phase:?}")));
        }
        if self.cfg.use_worker_local_data {
            return Ok(vec![pattern.clone()]);
        }

        let mut files: Vec<String> = glob::glob(pattern)
            .map_err(|e| Error::config(format!("bad data pattern {pattern}: {e}")))?
            .filter_map(|entry| entry.ok())
            .map(|p| p.display().to_string())
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(Error::config(format!("no files match {pattern}")));
        }
        Ok(files)
    }

    /// Best-effort shutdown broadcast: workers first, then the server group.
    async fn shutdown_fleet(&mut self) {
        for (name, client) in &self.workers {
            let mut client = client.clone();
            if let Err(e) = client.shutdown(ShutdownRequest {}).await {
                tracing::warn!(worker = %name, "worker shutdown rpc failed: {e}");
            }
        }
        self.servers.shutdown_all().await;
    }
}

/// One worker's dispatch loop: keep handing it partitions until the pool
/// drains. Failures and deadline expiries requeue the partition.
async fn dispatch_worker(
    worker: String,
    mut client: WorkerControlClient<Channel>,
    pool: Arc<Mutex<WorkloadPool>>,
    phase_prog: Arc<Mutex<Progress>>,
    deadline: Duration,
) -> Result<()> {
    let mut consecutive_failures = 0u32;
    loop {
        let next: Option<Workload> = {
            let mut pool = pool.lock();
            let wl = pool.get(&worker);
            if wl.is_none() && pool.is_finished() {
                return Ok(());
            }
            wl
        };
        let Some(workload) = next else {
            // Other workers still hold assignments that may yet come back.
            tokio::time::sleep(Duration::from_millis(200)).await;
            continue;
        };

        match tokio::time::timeout(deadline, client.process(workload.clone())).await {
            Ok(Ok(response)) => {
                consecutive_failures = 0;
                let response = response.into_inner();
                if response.ok {
                    if let Some(report) = &response.progress {
                        phase_prog.lock().merge(&report.to_progress());
                    }
                    pool.lock().finish(&worker);
                } else {
                    tracing::warn!(
                        worker = %worker,
                        part = workload.part_id,
                        "partition failed on worker: {}",
                        response.error_message
                    );
                    pool.lock().fail(&worker)?;
                }
            }
            Ok(Err(status)) => {
                tracing::warn!(worker = %worker, "process rpc failed: {status}");
                pool.lock().fail(&worker)?;
                consecutive_failures += 1;
                if consecutive_failures >= 2 {
                    // The transport keeps refusing this worker: declare it
                    // dead and let the rest of the group absorb the queue.
                    tracing::warn!(worker = %worker, "declaring worker dead");
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Err(_elapsed) => {
                tracing::warn!(worker = %worker, part = workload.part_id, "assignment deadline expired");
                pool.lock().fail(&worker)?;
            }
        }
    }
}
