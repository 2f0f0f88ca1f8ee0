//! A key-range shard of the global parameter vector.
//!
//! The shard owns a map from feature ID to optimizer entry and funnels
//! every batched push and pull through the handler hook sequence. Updates
//! to a given key are totally ordered because the service wraps the shard
//! in a single lock; pulls observe an atomic snapshot for the same reason.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde_json::json;

use sparsefleet_core::config::Algo;
use sparsefleet_core::{Error, FeaId, Progress, Result};
use sparsefleet_optimizer::{
    AdagradHandle, FtrlHandle, L1L2, SgdHandle, UpdateHandler,
};

/// Entries and handler for one shard.
pub struct Shard<H: UpdateHandler> {
    handler: H,
    entries: HashMap<FeaId, H::Entry>,
    progress: Progress,
}

impl<H: UpdateHandler> Shard<H> {
    /// Creates an empty shard around `handler`.
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            entries: HashMap::new(),
            progress: Progress::new(),
        }
    }

    /// Applies one batched push. Non-finite gradients are clamped to zero
    /// before the handler runs and counted for observability.
    pub fn push(&mut self, keys: &[FeaId], grads: &[f32]) -> Result<()> {
        if keys.len() != grads.len() {
            return Err(Error::LengthMismatch {
                expected: keys.len(),
                actual: grads.len(),
            });
        }

        self.handler.start(true);
        for (&key, &grad) in keys.iter().zip(grads) {
            let grad = if grad.is_finite() {
                grad
            } else {
                self.progress.clamped_gradients += 1;
                0.0
            };

            let entry = match self.entries.entry(key) {
                std::collections::hash_map::Entry::Occupied(o) => o.into_mut(),
                std::collections::hash_map::Entry::Vacant(v) => {
                    let mut entry = H::Entry::default();
                    self.handler.init(key, &mut entry);
                    v.insert(entry)
                }
            };
            self.handler.push(key, grad, entry);
        }
        let delta = self.handler.finish();
        self.progress.merge(&delta);
        Ok(())
    }

    /// Serves one batched pull: one weight per key in matching order.
    /// Missing keys yield the handler's zero and are not materialized.
    pub fn pull(&mut self, keys: &[FeaId]) -> Vec<f32> {
        self.handler.start(false);
        let zero = H::Entry::default();
        let out = keys
            .iter()
            .map(|&key| match self.entries.get(&key) {
                Some(entry) => self.handler.pull(key, entry),
                None => self.handler.pull(key, &zero),
            })
            .collect();
        let delta = self.handler.finish();
        self.progress.merge(&delta);
        out
    }

    /// Drains the progress accumulated since the last call.
    pub fn take_progress(&mut self) -> Progress {
        std::mem::take(&mut self.progress)
    }

    /// Number of materialized entries.
    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    /// Writes this shard's nonzero weights as self-describing JSON lines:
    /// a header record followed by `{"key","w"}` records in ascending key
    /// order. Returns the number of weight records written.
    pub fn save(&self, dir: &Path, shard_id: u32, algo: Algo) -> Result<u64> {
        let save_err = |e: std::io::Error| Error::Save(format!("{}: {e}", dir.display()));

        fs::create_dir_all(dir).map_err(save_err)?;
        let path = dir.join(format!("part-{shard_id}.jsonl"));
        let mut out = BufWriter::new(File::create(&path).map_err(save_err)?);

        let mut keys: Vec<FeaId> = self
            .entries
            .iter()
            .filter(|(_, e)| H::weight(e) != 0.0)
            .map(|(&k, _)| k)
            .collect();
        keys.sort_unstable();

        let header = json!({
            "format": "sparsefleet-model",
            "version": 1,
            "algo": algo.name(),
            "shard": shard_id,
            "entries": keys.len(),
        });
        writeln!(out, "{header}").map_err(save_err)?;
        for key in &keys {
            let w = H::weight(&self.entries[key]);
            writeln!(out, "{}", json!({ "key": key, "w": w })).map_err(save_err)?;
        }
        out.flush().map_err(save_err)?;
        Ok(keys.len() as u64)
    }
}

/// The process-wide handler choice, tagged once at shard construction.
pub enum AnyShard {
    /// SGD entries.
    Sgd(Shard<SgdHandle>),
    /// AdaGrad entries.
    Adagrad(Shard<AdagradHandle>),
    /// FTRL-Proximal entries.
    Ftrl(Shard<FtrlHandle>),
}

impl AnyShard {
    /// Builds the shard for `algo` with the given learning-rate parameters
    /// and penalty.
    pub fn from_algo(algo: Algo, alpha: f32, beta: f32, penalty: L1L2) -> Self {
        match algo {
            Algo::Sgd => AnyShard::Sgd(Shard::new(SgdHandle::new(alpha, beta, penalty))),
            Algo::Adagrad => {
                AnyShard::Adagrad(Shard::new(AdagradHandle::new(alpha, beta, penalty)))
            }
            Algo::Ftrl => AnyShard::Ftrl(Shard::new(FtrlHandle::new(alpha, beta, penalty))),
        }
    }

    /// The algorithm this shard runs.
    pub fn algo(&self) -> Algo {
        match self {
            AnyShard::Sgd(_) => Algo::Sgd,
            AnyShard::Adagrad(_) => Algo::Adagrad,
            AnyShard::Ftrl(_) => Algo::Ftrl,
        }
    }

    /// See [`Shard::push`].
    pub fn push(&mut self, keys: &[FeaId], grads: &[f32]) -> Result<()> {
        match self {
            AnyShard::Sgd(s) => s.push(keys, grads),
            AnyShard::Adagrad(s) => s.push(keys, grads),
            AnyShard::Ftrl(s) => s.push(keys, grads),
        }
    }

    /// See [`Shard::pull`].
    pub fn pull(&mut self, keys: &[FeaId]) -> Vec<f32> {
        match self {
            AnyShard::Sgd(s) => s.pull(keys),
            AnyShard::Adagrad(s) => s.pull(keys),
            AnyShard::Ftrl(s) => s.pull(keys),
        }
    }

    /// See [`Shard::take_progress`].
    pub fn take_progress(&mut self) -> Progress {
        match self {
            AnyShard::Sgd(s) => s.take_progress(),
            AnyShard::Adagrad(s) => s.take_progress(),
            AnyShard::Ftrl(s) => s.take_progress(),
        }
    }

    /// See [`Shard::num_entries`].
    pub fn num_entries(&self) -> usize {
        match self {
            AnyShard::Sgd(s) => s.num_entries(),
            AnyShard::Adagrad(s) => s.num_entries(),
            AnyShard::Ftrl(s) => s.num_entries(),
        }
    }

    /// See [`Shard::save`].
    pub fn save(&self, dir: &Path, shard_id: u32) -> Result<u64> {
        let algo = self.algo();
        match self {
            AnyShard::Sgd(s) => s.save(dir, shard_id, algo),
            AnyShard::Adagrad(s) => s.save(dir, shard_id, algo),
            AnyShard::Ftrl(s) => s.save(dir, shard_id, algo),
        }
    }
}
