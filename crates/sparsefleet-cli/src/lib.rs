//! Command-line surface for sparsefleet.
//!
//! One binary, three roles. Every trainer knob is a flag with an optional
//! JSON config file underneath (`--config`); flags override the file. A
//! configuration error, an unknown algorithm or a failed save all exit
//! non-zero.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use sparsefleet_core::config::{Algo, LossKind};
use sparsefleet_core::TrainerConfig;

pub mod roles;

/// Which long-running role this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// Drives epochs, assigns partitions, aggregates progress.
    Scheduler,
    /// Owns one shard of the parameter vector.
    Server,
    /// Streams minibatches through the pull/push pipeline.
    Worker,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum AlgoArg {
    Sgd,
    Adagrad,
    Ftrl,
}

impl From<AlgoArg> for Algo {
    fn from(a: AlgoArg) -> Self {
        match a {
            AlgoArg::Sgd => Algo::Sgd,
            AlgoArg::Adagrad => Algo::Adagrad,
            AlgoArg::Ftrl => Algo::Ftrl,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LossArg {
    Logistic,
    Squared,
    Fm,
}

impl From<LossArg> for LossKind {
    fn from(l: LossArg) -> Self {
        match l {
            LossArg::Logistic => LossKind::Logistic,
            LossArg::Squared => LossKind::Squared,
            LossArg::Fm => LossKind::Fm,
        }
    }
}

/// Train sparse linear and factorization-machine models over a
/// scheduler/worker/server fleet.
#[derive(Parser, Debug, Clone)]
#[command(name = "sparsefleet", version)]
pub struct Cli {
    /// Role of this process.
    #[arg(long, value_enum)]
    pub role: Role,

    /// JSON config file with `TrainerConfig` fields; flags override it.
    #[arg(long, short = 'c', env = "SPARSEFLEET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address this process listens on.
    #[arg(long, default_value = "127.0.0.1:9000")]
    pub bind_addr: String,

    /// Scheduler address, used by workers and servers to report progress.
    #[arg(long)]
    pub scheduler_addr: Option<String>,

    /// Parameter-server addresses in shard order. Repeatable.
    #[arg(long = "server-addr")]
    pub server_addrs: Vec<String>,

    /// Worker addresses. Repeatable; consumed by the scheduler.
    #[arg(long = "worker-addr")]
    pub worker_addrs: Vec<String>,

    /// Shard index of this server, used in saved-model file names.
    #[arg(long, default_value = "0")]
    pub shard_id: u32,

    // ------------------------------------------------------------------
    // Trainer knobs; unset flags fall back to --config, then defaults.
    // ------------------------------------------------------------------
    /// Server-side update algorithm.
    #[arg(long, value_enum)]
    pub algo: Option<AlgoArg>,

    /// Learning-rate scale (alpha).
    #[arg(long)]
    pub lr_eta: Option<f32>,

    /// Learning-rate offset (beta); must be positive.
    #[arg(long)]
    pub lr_beta: Option<f32>,

    /// L1 penalty.
    #[arg(long)]
    pub lambda_l1: Option<f32>,

    /// L2 penalty.
    #[arg(long)]
    pub lambda_l2: Option<f32>,

    /// Train minibatch size.
    #[arg(long)]
    pub minibatch: Option<usize>,

    /// Bounded-staleness window during training.
    #[arg(long)]
    pub max_delay: Option<usize>,

    /// Loss-evaluation threads per worker.
    #[arg(long)]
    pub num_threads: Option<usize>,

    /// Number of passes over the training data.
    #[arg(long)]
    pub max_data_pass: Option<usize>,

    /// Progress display interval in seconds.
    #[arg(long)]
    pub disp_itv: Option<f64>,

    /// Training files (path or glob).
    #[arg(long)]
    pub train_data: Option<String>,

    /// Validation files (path or glob); empty disables validation.
    #[arg(long)]
    pub val_data: Option<String>,

    /// Data format.
    #[arg(long)]
    pub data_format: Option<String>,

    /// Partitions per data file.
    #[arg(long)]
    pub num_parts_per_file: Option<usize>,

    /// Let workers resolve data paths locally.
    #[arg(long)]
    pub use_worker_local_data: bool,

    /// Fixed-point quantization width for push/pull values (0 = raw f32).
    #[arg(long)]
    pub fixed_bytes: Option<u32>,

    /// Cache key vectors between transport calls.
    #[arg(long)]
    pub key_cache: bool,

    /// Compress push/pull payloads.
    #[arg(long)]
    pub msg_compression: bool,

    /// Worker-side loss.
    #[arg(long, value_enum)]
    pub loss: Option<LossArg>,

    /// Latent-factor dimension for the FM loss.
    #[arg(long)]
    pub dim_v: Option<usize>,

    /// Directory the server group saves the model into.
    #[arg(long)]
    pub model_dir: Option<String>,
}

impl Cli {
    /// Builds the validated trainer configuration: JSON file first, then
    /// flag overrides.
    pub fn trainer_config(&self) -> Result<TrainerConfig> {
        let mut cfg = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => TrainerConfig::default(),
        };

        if let Some(v) = self.algo {
            cfg.algo = v.into();
        }
        if let Some(v) = self.lr_eta {
            cfg.lr_eta = v;
        }
        if let Some(v) = self.lr_beta {
            cfg.lr_beta = v;
        }
        if let Some(v) = self.lambda_l1 {
            cfg.lambda_l1 = v;
        }
        if let Some(v) = self.lambda_l2 {
            cfg.lambda_l2 = v;
        }
        if let Some(v) = self.minibatch {
            cfg.minibatch = v;
        }
        if let Some(v) = self.max_delay {
            cfg.max_delay = v;
        }
        if let Some(v) = self.num_threads {
            cfg.num_threads = v;
        }
        if let Some(v) = self.max_data_pass {
            cfg.max_data_pass = v;
        }
        if let Some(v) = self.disp_itv {
            cfg.disp_itv = v;
        }
        if let Some(v) = &self.train_data {
            cfg.train_data = v.clone();
        }
        if let Some(v) = &self.val_data {
            cfg.val_data = v.clone();
        }
        if let Some(v) = &self.data_format {
            cfg.data_format = v.clone();
        }
        if let Some(v) = self.num_parts_per_file {
            cfg.num_parts_per_file = v;
        }
        if self.use_worker_local_data {
            cfg.use_worker_local_data = true;
        }
        if let Some(v) = self.fixed_bytes {
            cfg.fixed_bytes = v;
        }
        if self.key_cache {
            cfg.key_cache = true;
        }
        if self.msg_compression {
            cfg.msg_compression = true;
        }
        if let Some(v) = self.loss {
            cfg.loss = v.into();
        }
        if let Some(v) = self.dim_v {
            cfg.dim_v = v;
        }
        if let Some(v) = &self.model_dir {
            cfg.model_dir = v.clone();
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// The parsed bind address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind_addr
            .parse()
            .with_context(|| format!("invalid --bind-addr {}", self.bind_addr))
    }
}

/// How long role startup keeps retrying peer connections.
pub const CONNECT_RETRIES: usize = 60;
/// Backoff between connection attempts.
pub const CONNECT_BACKOFF: Duration = Duration::from_millis(500);

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"algo":"sgd","minibatch":123}}"#).unwrap();
        file.flush().unwrap();

        let cli = Cli::parse_from([
            "sparsefleet",
            "--role",
            "scheduler",
            "--config",
            file.path().to_str().unwrap(),
            "--minibatch",
            "456",
        ]);
        let cfg = cli.trainer_config().unwrap();
        assert_eq!(cfg.algo, Algo::Sgd);
        assert_eq!(cfg.minibatch, 456);
    }

    #[test]
    fn test_invalid_beta_rejected() {
        let cli = Cli::parse_from(["sparsefleet", "--role", "server", "--lr-beta", "0"]);
        assert!(cli.trainer_config().is_err());
    }

    #[test]
    fn test_unknown_algo_rejected_by_clap() {
        let parsed = Cli::try_parse_from(["sparsefleet", "--role", "server", "--algo", "adam"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_defaults_without_config() {
        let cli = Cli::parse_from(["sparsefleet", "--role", "worker"]);
        let cfg = cli.trainer_config().unwrap();
        assert_eq!(cfg.algo, Algo::Ftrl);
        assert!(!cfg.key_cache);
    }
}
