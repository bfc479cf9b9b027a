//! On-disk event queue
//!
//! ```text
//! <root>/
//!   tmp/         producer staging (same filesystem as incoming/)
//!   incoming/    written by producers, watched by the daemon
//!   processing/  claimed by a worker
//!   failed/      dead-letter, each file with an adjacent <name>.error.json
//!   archive/     successfully applied
//! ```
//!
//! Every state change is a `rename(2)` inside this tree. A rename either
//! happens or it doesn't, which makes it the only lock the queue needs:
//! two workers racing for the same file cannot both win the claim.

mod layout;
mod state;
mod writer;

pub(crate) use layout::is_queue_file;
pub use layout::{file_name_for, ParsedName, QueueDepths, QueueLayout};
pub use state::{DeadLetter, ErrorDetail, FailureKind, QueueState};
pub use writer::QueueWriter;

use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to prepare queue directory {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid envelope: {0}")]
    Invalid(#[from] crate::envelope::EnvelopeError),

    #[error("failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write queue file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("queue file {0} already exists")]
    Exists(PathBuf),

    #[error("failed to move {from} -> {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("illegal queue transition {from:?} -> {to:?}")]
    IllegalTransition { from: QueueState, to: QueueState },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
