//! Core types shared across the sparsefleet workspace.
//!
//! This crate holds the pieces every role (scheduler, worker, parameter
//! server) agrees on: the feature-ID type, the trainer configuration, the
//! mergeable progress record, and the common error type.

pub mod config;
pub mod error;
pub mod fid;
pub mod progress;

pub use config::{Algo, LossKind, TrainerConfig};
pub use error::{Error, Result};
pub use fid::FeaId;
pub use progress::Progress;
