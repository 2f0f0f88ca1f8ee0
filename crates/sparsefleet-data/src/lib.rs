//! Data plumbing for sparsefleet workers: the row-block minibatch
//! container, the partitioned libsvm reader, and the localizer that maps
//! global feature IDs to dense per-minibatch indices.

pub mod localizer;
pub mod reader;
pub mod row_block;

pub use localizer::localize;
pub use reader::MinibatchIter;
pub use row_block::{LocalizedBlock, RowBlock};
