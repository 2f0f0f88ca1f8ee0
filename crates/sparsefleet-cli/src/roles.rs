//! Role startup: connect to peers with retries, assemble the services and
//! run until completion or shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tonic::transport::Channel;

use sparsefleet_core::config::LossKind;
use sparsefleet_core::TrainerConfig;
use sparsefleet_proto::{MonitorClient, MonitorServer, WorkerControlClient};
use sparsefleet_ps::{
    serve_shard, AnyShard, KvClient, ShardService, TimeReporter, TransportOpts,
};
use sparsefleet_training::{
    serve_worker, DistMonitor, MonitorHandle, Scheduler, SchedulerOpts, WorkerContext,
    WorkerService,
};
use sparsefleet_optimizer::L1L2;

use crate::{Cli, CONNECT_BACKOFF, CONNECT_RETRIES};

fn endpoint(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

async fn connect_monitor(addr: &str) -> Result<MonitorClient<Channel>> {
    for attempt in 0.. {
        match MonitorClient::connect(endpoint(addr)).await {
            Ok(client) => return Ok(client),
            Err(e) if attempt < CONNECT_RETRIES => {
                tracing::debug!("monitor connect attempt {attempt} failed: {e}");
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
            Err(e) => return Err(e).context(format!("connecting to scheduler {addr}")),
        }
    }
    unreachable!()
}

async fn connect_worker_control(addr: &str) -> Result<WorkerControlClient<Channel>> {
    for attempt in 0.. {
        match WorkerControlClient::connect(endpoint(addr)).await {
            Ok(client) => return Ok(client),
            Err(e) if attempt < CONNECT_RETRIES => {
                tracing::debug!("worker connect attempt {attempt} failed: {e}");
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
            Err(e) => return Err(e).context(format!("connecting to worker {addr}")),
        }
    }
    unreachable!()
}

async fn connect_kv(addrs: &[String], client_id: &str, opts: TransportOpts) -> Result<KvClient> {
    for attempt in 0.. {
        match KvClient::connect(addrs, client_id, opts).await {
            Ok(client) => return Ok(client),
            Err(e) if attempt < CONNECT_RETRIES => {
                tracing::debug!("server group connect attempt {attempt} failed: {e}");
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
            Err(e) => return Err(e).context("connecting to the server group"),
        }
    }
    unreachable!()
}

fn transport_opts(cfg: &TrainerConfig) -> TransportOpts {
    TransportOpts {
        fixed_bytes: cfg.fixed_bytes,
        key_cache: cfg.key_cache,
        msg_compression: cfg.msg_compression,
    }
}

/// The scheduler role: host the monitor, connect the fleet, run all
/// epochs, save and shut everything down.
pub async fn run_scheduler(cli: &Cli, cfg: TrainerConfig) -> Result<()> {
    if cli.worker_addrs.is_empty() {
        bail!("scheduler requires at least one --worker-addr");
    }
    if cli.server_addrs.is_empty() {
        bail!("scheduler requires at least one --server-addr");
    }

    let monitor = DistMonitor::new();
    let bind = cli.bind_addr()?;
    let monitor_task = {
        let handle = MonitorHandle(monitor.clone());
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(MonitorServer::new(handle))
                .serve(bind)
                .await
        })
    };

    let mut workers = Vec::with_capacity(cli.worker_addrs.len());
    for addr in &cli.worker_addrs {
        workers.push((addr.clone(), connect_worker_control(addr).await?));
    }
    let servers = connect_kv(&cli.server_addrs, "scheduler", TransportOpts::default()).await?;
    tracing::info!(
        workers = workers.len(),
        servers = servers.num_shards(),
        "fleet connected"
    );

    let result = Scheduler::new(
        cfg,
        SchedulerOpts::default(),
        monitor,
        workers,
        servers,
    )
    .run()
    .await;

    monitor_task.abort();
    result?;
    Ok(())
}

/// The server role: one shard behind the gRPC surface, serving until the
/// scheduler broadcasts shutdown.
pub async fn run_server(cli: &Cli, cfg: TrainerConfig) -> Result<()> {
    let penalty = L1L2::new(cfg.lambda_l1, cfg.lambda_l2);
    let shard = AnyShard::from_algo(cfg.algo, cfg.lr_eta, cfg.lr_beta, penalty);

    let reporter = match &cli.scheduler_addr {
        Some(addr) => {
            let client = connect_monitor(addr).await?;
            Some(TimeReporter::new(
                client,
                format!("server-{}", cli.shard_id),
                Duration::from_secs_f64(cfg.disp_itv),
            ))
        }
        None => None,
    };

    let service = ShardService::new(shard, cli.shard_id, reporter);
    tracing::info!(shard = cli.shard_id, algo = cfg.algo.name(), bind = %cli.bind_addr, "server shard up");
    serve_shard(service, cli.bind_addr()?).await?;
    Ok(())
}

/// The worker role: serve the process pipeline until shutdown.
pub async fn run_worker(cli: &Cli, cfg: TrainerConfig) -> Result<()> {
    if cli.server_addrs.is_empty() {
        bail!("worker requires at least one --server-addr");
    }
    if cfg.loss == LossKind::Fm {
        // FM gradients need dim_v + 1 values per key on the wire; the
        // scalar store serves one. The FM loss is exercised embedded.
        bail!("the fm loss is not wired to the scalar parameter store; use logistic or squared");
    }

    // Loss parallelism for this process.
    if cfg.num_threads > 1 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(cfg.num_threads)
            .build_global()
            .ok();
    }

    let worker_id = format!("worker@{}", cli.bind_addr);
    let kv = connect_kv(&cli.server_addrs, &worker_id, transport_opts(&cfg)).await?;

    let reporter = match &cli.scheduler_addr {
        Some(addr) => {
            let client = connect_monitor(addr).await?;
            Some(Arc::new(TimeReporter::new(
                client,
                worker_id.clone(),
                Duration::from_secs(1),
            )))
        }
        None => None,
    };

    let service = WorkerService::new(WorkerContext {
        cfg,
        kv: Arc::new(kv),
        reporter,
        worker_id: worker_id.clone(),
    });
    tracing::info!(worker = %worker_id, "worker up");
    serve_worker(service, cli.bind_addr()?).await?;
    Ok(())
}
