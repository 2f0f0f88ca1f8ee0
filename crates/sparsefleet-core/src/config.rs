//! Trainer configuration shared by every role.
//!
//! The recognized option set mirrors the flags of the `sparsefleet` binary;
//! a JSON file with the same field names can be loaded via serde and
//! overridden by individual flags. `validate` enforces the startup
//! invariants; configuration errors are fatal before any role starts.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The server-side online update algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algo {
    /// Plain SGD with the `(beta + sqrt(t)) / alpha` learning-rate schedule.
    Sgd,
    /// AdaGrad: per-coordinate learning rate from the accumulated squared
    /// gradient.
    Adagrad,
    /// FTRL-Proximal with the smoothed linear term.
    Ftrl,
}

impl Algo {
    /// Parses an algorithm name, case-insensitively.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sgd" => Ok(Algo::Sgd),
            "adagrad" => Ok(Algo::Adagrad),
            "ftrl" => Ok(Algo::Ftrl),
            _ => Err(Error::UnknownAlgo {
                name: name.to_string(),
            }),
        }
    }

    /// The canonical lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            Algo::Sgd => "sgd",
            Algo::Adagrad => "adagrad",
            Algo::Ftrl => "ftrl",
        }
    }
}

/// The worker-side loss function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    /// Binary logistic loss over labels in {-1, +1}.
    Logistic,
    /// Squared loss.
    Squared,
    /// Factorization-machine loss with `dim_v` latent factors.
    Fm,
}

impl LossKind {
    /// Parses a loss name, case-insensitively.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "logistic" | "logit" => Ok(LossKind::Logistic),
            "squared" | "l2" => Ok(LossKind::Squared),
            "fm" => Ok(LossKind::Fm),
            _ => Err(Error::config(format!("unknown loss: {name}"))),
        }
    }
}

/// The full recognized option set. Each knob is consumed by exactly one role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Server-side update handler.
    pub algo: Algo,
    /// Learning-rate scale (alpha).
    pub lr_eta: f32,
    /// Learning-rate offset (beta). Must be positive.
    pub lr_beta: f32,
    /// L1 penalty of the proximal operator.
    pub lambda_l1: f32,
    /// L2 penalty of the proximal operator.
    pub lambda_l2: f32,
    /// Train minibatch size. Validation uses `max(10 * minibatch, 100_000)`.
    pub minibatch: usize,
    /// Bounded-staleness window: maximum uncommitted minibatches in flight
    /// during training.
    pub max_delay: usize,
    /// Loss-evaluation parallelism per worker.
    pub num_threads: usize,
    /// Number of passes over the training data.
    pub max_data_pass: usize,
    /// Scheduler display interval in seconds.
    pub disp_itv: f64,
    /// Training files, as a path or glob pattern.
    pub train_data: String,
    /// Validation files, as a path or glob pattern. Empty disables the
    /// validation pass.
    pub val_data: String,
    /// Data format name. Currently `libsvm`.
    pub data_format: String,
    /// Number of partitions each file is split into.
    pub num_parts_per_file: usize,
    /// If set, workers resolve data paths locally and the scheduler never
    /// touches the filesystem.
    pub use_worker_local_data: bool,
    /// Fixed-point quantization width in bytes for push/pull values.
    /// 0 sends raw f32.
    pub fixed_bytes: u32,
    /// Cache key vectors between transport calls to avoid resending
    /// identical ones.
    pub key_cache: bool,
    /// Compress push/pull payloads.
    pub msg_compression: bool,
    /// Worker-side loss function.
    pub loss: LossKind,
    /// Latent-factor dimension for the FM loss.
    pub dim_v: usize,
    /// Directory the server group saves the model into.
    pub model_dir: String,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            algo: Algo::Ftrl,
            lr_eta: 0.1,
            lr_beta: 1.0,
            lambda_l1: 1.0,
            lambda_l2: 0.1,
            minibatch: 1000,
            max_delay: 4,
            num_threads: 2,
            max_data_pass: 1,
            disp_itv: 1.0,
            train_data: String::new(),
            val_data: String::new(),
            data_format: "libsvm".to_string(),
            num_parts_per_file: 1,
            use_worker_local_data: false,
            fixed_bytes: 0,
            key_cache: false,
            msg_compression: false,
            loss: LossKind::Logistic,
            dim_v: 0,
            model_dir: "model".to_string(),
        }
    }
}

impl TrainerConfig {
    /// Checks the startup invariants. Any failure here is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.lr_beta <= 0.0 {
            return Err(Error::config("lr_beta must be > 0"));
        }
        if self.lr_eta <= 0.0 {
            return Err(Error::config("lr_eta must be > 0"));
        }
        if self.lambda_l1 < 0.0 || self.lambda_l2 < 0.0 {
            return Err(Error::config("lambda_l1 and lambda_l2 must be >= 0"));
        }
        if self.minibatch == 0 {
            return Err(Error::config("minibatch must be > 0"));
        }
        if self.num_parts_per_file == 0 {
            return Err(Error::config("num_parts_per_file must be > 0"));
        }
        if self.max_data_pass == 0 {
            return Err(Error::config("max_data_pass must be > 0"));
        }
        if self.disp_itv <= 0.0 {
            return Err(Error::config("disp_itv must be > 0"));
        }
        if self.data_format.to_ascii_lowercase() != "libsvm" {
            return Err(Error::UnknownFormat {
                name: self.data_format.clone(),
            });
        }
        if self.loss == LossKind::Fm && self.dim_v == 0 {
            return Err(Error::config("fm loss requires dim_v > 0"));
        }
        if !matches!(self.fixed_bytes, 0 | 1 | 2 | 4) {
            return Err(Error::config("fixed_bytes must be one of 0, 1, 2, 4"));
        }
        Ok(())
    }

    /// Minibatch size for a validation pass: large batches, since there is
    /// no gradient backpressure to bound.
    pub fn val_minibatch(&self) -> usize {
        (10 * self.minibatch).max(100_000)
    }
}
