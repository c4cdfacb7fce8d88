//! Source tree scanner.
//!
//! Walks the perfdata directory on a background task, parses every sidecar
//! file it finds and classifies the result: corrupt, too old, already done
//! or pending. The walk streams over a bounded channel so huge trees never
//! pile up in memory, and it stops early when the run is cancelled.

mod sidecar;

pub use sidecar::{SeriesDescriptor, SidecarError};

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Backpressure bound between the walking task and classification.
const DESCRIPTOR_QUEUE: usize = 64;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scan cancelled")]
    Cancelled,
    #[error("could not walk source tree: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("scan task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    /// Descriptors last updated at or before this instant are skipped.
    pub cutoff: Option<DateTime<Utc>>,
    /// Cap on the pending list, 0 means unlimited.
    pub limit: usize,
    /// Treat descriptors whose last rrd update failed as convertible.
    pub include_corrupt: bool,
}

/// Scan result: the work list plus counters for the summary line.
#[derive(Debug, Default)]
pub struct Workdata {
    pub pending: Vec<SeriesDescriptor>,
    pub total: u64,
    pub corrupt: u64,
    pub too_old: u64,
    pub todo: u64,
    pub broken_xml: u64,
}

/// Walks `root` and classifies every sidecar file.
///
/// Unparsable sidecars are counted and skipped, never fatal. Cancellation
/// aborts the walk with [`ScanError::Cancelled`] so callers can tell an
/// interrupted scan from an empty tree.
pub async fn scan(
    root: &Path,
    options: &ScanOptions,
    cancel: &CancellationToken,
) -> Result<Workdata, ScanError> {
    let (descriptors, producer) = walk(root.to_path_buf(), cancel.clone());

    let mut workdata = Workdata::default();
    let mut pending = Vec::new();
    while let Ok(descriptor) = descriptors.recv_async().await {
        workdata.total += 1;
        if !descriptor.updated {
            workdata.corrupt += 1;
            if !options.include_corrupt {
                continue;
            }
        }
        if let Some(cutoff) = options.cutoff
            && descriptor.last_update <= cutoff
        {
            workdata.too_old += 1;
        } else if descriptor.marker_exists() {
            // converted by an earlier run
        } else {
            workdata.todo += 1;
            pending.push(descriptor);
        }
    }
    workdata.broken_xml = producer.await??;

    if options.limit > 0 {
        pending.truncate(options.limit);
    }
    workdata.pending = pending;
    debug!(
        total = workdata.total,
        todo = workdata.todo,
        broken_xml = workdata.broken_xml,
        "scan finished"
    );
    Ok(workdata)
}

/// Spawns the directory walk. The task reports the broken sidecar count on
/// success and checks the token before every send so a cancelled scan stops
/// without draining the tree.
fn walk(
    root: PathBuf,
    cancel: CancellationToken,
) -> (
    flume::Receiver<SeriesDescriptor>,
    JoinHandle<Result<u64, ScanError>>,
) {
    let (tx, rx) = flume::bounded(DESCRIPTOR_QUEUE);
    let producer = tokio::task::spawn_blocking(move || {
        let mut broken_xml = 0u64;
        for entry in WalkDir::new(&root) {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            let entry = entry?;
            if !entry.file_type().is_file()
                || entry.path().extension().is_none_or(|ext| ext != "xml")
            {
                continue;
            }
            match SeriesDescriptor::read(entry.path()) {
                Ok(descriptor) => {
                    // consumer gone means the scan was dropped, stop quietly
                    if tx.send(descriptor).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    broken_xml += 1;
                    warn!(path = %entry.path().display(), error = %err, "skipping broken sidecar file");
                }
            }
        }
        Ok(broken_xml)
    });
    (rx, producer)
}
