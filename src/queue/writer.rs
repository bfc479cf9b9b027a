// Producer side of the queue
//
// write() = serialize -> temp file in <root>/tmp -> fsync -> rename into
// incoming/. Readers never see a partial file: until the rename, the content
// lives under a name nobody watches.

use super::layout::file_name_for;
use super::{QueueError, QueueLayout, QueueState};
use crate::envelope::EventEnvelope;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Writes envelopes into `incoming/`
///
/// Holds no locks and no state besides the layout, so any number of producer
/// processes can write concurrently.
#[derive(Debug, Clone)]
pub struct QueueWriter {
    layout: QueueLayout,
}

impl QueueWriter {
    /// Create a writer, making sure the staging and incoming directories exist
    pub fn new(layout: QueueLayout) -> Result<Self, QueueError> {
        layout.ensure()?;
        Ok(Self { layout })
    }

    pub fn layout(&self) -> &QueueLayout {
        &self.layout
    }

    /// Durably enqueue one envelope, returning its final path
    ///
    /// Fails if the envelope is invalid, the disk write fails, or a file with
    /// the same name already exists. Never retries.
    pub fn write(&self, envelope: &EventEnvelope) -> Result<PathBuf, QueueError> {
        envelope.validate()?;
        let bytes = envelope.to_json()?;
        let target = self
            .layout
            .path(QueueState::Incoming, &file_name_for(envelope));

        write_atomic(&self.layout.tmp_dir(), &target, &bytes, false)?;
        tracing::trace!(path = %target.display(), "Enqueued event");
        Ok(target)
    }
}

/// Write `bytes` to `target` through a synced temp file in `staging`
///
/// `staging` must be on the same filesystem as `target`. With `overwrite`
/// false an existing target is an error instead of being replaced.
pub(crate) fn write_atomic(
    staging: &Path,
    target: &Path,
    bytes: &[u8],
    overwrite: bool,
) -> Result<(), QueueError> {
    let write_err = |source| QueueError::Write {
        path: target.to_path_buf(),
        source,
    };

    let mut tmp = NamedTempFile::new_in(staging).map_err(write_err)?;
    tmp.write_all(bytes).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;

    let persisted = if overwrite {
        tmp.persist(target)
    } else {
        tmp.persist_noclobber(target)
    };

    match persisted {
        Ok(_) => Ok(()),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(QueueError::Exists(target.to_path_buf()))
        }
        Err(e) => Err(write_err(e.error)),
    }
}
