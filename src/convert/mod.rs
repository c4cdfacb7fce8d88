//! Converts one rrd archive into whisper files, one per datasource label.
//!
//! Rows stream out of the archive reader into a bounded cache that
//! bulk-writes each label's column into a freshly created whisper file in a
//! private temp directory. Every label then goes through the same promotion
//! steps: merge trailing points out of a pre-existing destination file, move
//! that file aside if an archive tree is configured, and rename the fresh
//! file into place. The done marker is written only after every label has
//! been published.

mod cache;
mod resolve;
pub mod worker;

pub use cache::SeriesCache;
pub use resolve::resolve_labels;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::lookup::PerfdataMap;
use crate::rrd::{ArchiveReader, ReaderError};
use crate::scan::SeriesDescriptor;
use crate::whisper::{self, Aggregation, Point, Retention, Whisper, WhisperError};

/// Rows buffered per label before a bulk write. Bounds peak memory per
/// conversion at roughly `CACHE_ROWS * label_count` points.
const CACHE_ROWS: usize = 100_000;

/// Fraction of known points a lower-precision slot needs to aggregate.
const X_FILES_FACTOR: f32 = 0.5;

static ILLEGAL_CHARACTERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9\-\.]").unwrap());

/// Replaces everything outside the safe filename alphabet with underscores.
fn sanitize_label(label: &str) -> String {
    ILLEGAL_CHARACTERS.replace_all(label, "_").into_owned()
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("conversion cancelled")]
    Cancelled,
    #[error("sidecar lists no datasources")]
    NoDatasources,
    #[error("label count mismatch: database has {db}, sidecar has {xml}")]
    LabelCountMismatch { db: usize, xml: usize },
    #[error("could not create temp directory in {path}: {source}")]
    TempDir { path: PathBuf, source: io::Error },
    #[error("could not create whisper file {path}: {source}")]
    CreateSeries { path: PathBuf, source: WhisperError },
    #[error("row at {time} carries {got} values for {expected} labels")]
    SchemaMismatch { time: u32, got: usize, expected: usize },
    #[error("could not write batch to {path}: {source}")]
    Flush { path: PathBuf, source: WhisperError },
    #[error("could not close whisper file {path}: {source}")]
    CloseSeries { path: PathBuf, source: WhisperError },
    #[error(transparent)]
    Read(#[from] ReaderError),
    #[error("could not merge old whisper file {path}: {source}")]
    Merge { path: PathBuf, source: WhisperError },
    #[error("could not move {from} to archive {to}: {source}")]
    Archive {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
    #[error("could not create destination directory {path}: {source}")]
    CreateDestination { path: PathBuf, source: io::Error },
    #[error("could not publish {from} to {to}: {source}")]
    Publish {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
    #[error("could not create done marker {path}: {source}")]
    MarkDone { path: PathBuf, source: io::Error },
    #[error("converted, but could not delete source archive {path}: {source}")]
    DeleteSource { path: PathBuf, source: io::Error },
}

/// Conversion settings shared by every worker, fixed at startup.
#[derive(Debug, Clone)]
pub struct ConvertConfig {
    pub destination: PathBuf,
    pub archive: Option<PathBuf>,
    pub temp: PathBuf,
    pub merge: bool,
    pub delete_rrd: bool,
    pub retentions: Vec<Retention>,
}

/// One datasource label of a conversion: where the fresh series is written,
/// where it will be published, where a replaced file goes. The writer handle
/// lives here while rows stream in and is taken when the cache closes.
pub struct ConvertSource {
    label: String,
    temp_path: PathBuf,
    dest_path: PathBuf,
    archive_path: Option<PathBuf>,
    writer: Option<Whisper>,
}

impl ConvertSource {
    pub fn new(
        label: &str,
        dest_dir: &Path,
        temp_dir: &Path,
        archive_dir: Option<&Path>,
        retentions: &[Retention],
    ) -> Result<Self, ConvertError> {
        let label = sanitize_label(label);
        let filename = format!("{label}.wsp");
        let temp_path = temp_dir.join(&filename);
        let writer = Whisper::create(&temp_path, retentions, Aggregation::Average, X_FILES_FACTOR)
            .map_err(|source| ConvertError::CreateSeries {
                path: temp_path.clone(),
                source,
            })?;
        Ok(Self {
            label,
            dest_path: dest_dir.join(&filename),
            archive_path: archive_dir.map(|dir| dir.join(&filename)),
            temp_path,
            writer: Some(writer),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn destination(&self) -> &Path {
        &self.dest_path
    }

    /// Oldest timestamp the fresh series can hold. Seeds the last-update
    /// tracking for archives that turn out to be empty.
    pub fn start_time(&self) -> u32 {
        self.writer.as_ref().map_or(0, Whisper::start_time)
    }

    /// Copies the tail of a pre-existing destination series into the fresh
    /// file: every known point after `last_update`. Points the live system
    /// wrote while the source archive was already stale would otherwise be
    /// lost when publish overwrites the file.
    pub fn merge_existing(&self, last_update: u32) -> Result<(), ConvertError> {
        if !self.dest_path.exists() {
            return Ok(());
        }
        let merge_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ConvertError::Merge { path, source }
        };
        let old = Whisper::open(&self.dest_path).map_err(merge_err(&self.dest_path))?;
        let series = old
            .fetch(last_update, whisper::unix_now())
            .map_err(merge_err(&self.dest_path))?;
        let points: Vec<Point> = series.points().filter(|p| !p.value.is_nan()).collect();
        if !points.is_empty() {
            let mut fresh = Whisper::open(&self.temp_path).map_err(merge_err(&self.temp_path))?;
            fresh
                .update_many(&points)
                .map_err(merge_err(&self.temp_path))?;
            fresh.close().map_err(merge_err(&self.temp_path))?;
        }
        old.close().map_err(merge_err(&self.dest_path))?;
        debug!(
            path = %self.dest_path.display(),
            points = points.len(),
            "merged trailing points from existing whisper file"
        );
        Ok(())
    }

    /// Moves a pre-existing destination file into the archive tree. Without
    /// an archive path the old file simply gets overwritten by publish.
    pub fn archive_existing(&self) -> Result<(), ConvertError> {
        let Some(archive_path) = &self.archive_path else {
            return Ok(());
        };
        if !self.dest_path.exists() {
            return Ok(());
        }
        let archive_err = |source| ConvertError::Archive {
            from: self.dest_path.clone(),
            to: archive_path.clone(),
            source,
        };
        if let Some(parent) = archive_path.parent() {
            fs::create_dir_all(parent).map_err(archive_err)?;
        }
        fs::rename(&self.dest_path, archive_path).map_err(archive_err)
    }

    /// Renames the finished temp file onto the destination path.
    pub fn publish(&self) -> Result<(), ConvertError> {
        fs::rename(&self.temp_path, &self.dest_path).map_err(|source| ConvertError::Publish {
            from: self.temp_path.clone(),
            to: self.dest_path.clone(),
            source,
        })
    }
}

/// Converts pending descriptors end to end. One instance is shared by all
/// workers; per-conversion state lives on the stack of [`Converter::convert`].
pub struct Converter {
    config: Arc<ConvertConfig>,
    reader: Arc<dyn ArchiveReader>,
    perfdata: Option<PerfdataMap>,
    cancel: CancellationToken,
}

impl Converter {
    pub fn new(
        config: Arc<ConvertConfig>,
        reader: Arc<dyn ArchiveReader>,
        perfdata: Option<PerfdataMap>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            reader,
            perfdata,
            cancel,
        }
    }

    /// Runs the full pipeline for one descriptor: resolve labels, stream the
    /// archive through the cache into temp whisper files, merge and archive
    /// any existing destination files, publish, mark done. Nothing below the
    /// destination directory is touched until publish, so a failure anywhere
    /// earlier leaves only the self-deleting temp directory behind.
    pub async fn convert(&self, descriptor: &SeriesDescriptor) -> Result<(), ConvertError> {
        if self.cancel.is_cancelled() {
            return Err(ConvertError::Cancelled);
        }
        let labels = match resolve_labels(self.perfdata.as_ref(), descriptor)? {
            Some(labels) => labels,
            None => descriptor.labels.clone(),
        };
        if labels.is_empty() {
            return Err(ConvertError::NoDatasources);
        }

        let dest_dir = self
            .config
            .destination
            .join(&descriptor.hostname)
            .join(&descriptor.servicename);
        let archive_dir = self
            .config
            .archive
            .as_ref()
            .map(|base| base.join(&descriptor.hostname).join(&descriptor.servicename));
        let temp_dir = tempfile::Builder::new()
            .prefix("rrd2whisper")
            .tempdir_in(&self.config.temp)
            .map_err(|source| ConvertError::TempDir {
                path: self.config.temp.clone(),
                source,
            })?;

        let mut stream = self.reader.stream(&descriptor.rrd_path, &self.cancel).await?;

        let mut sources = Vec::with_capacity(labels.len());
        for label in &labels {
            sources.push(ConvertSource::new(
                label,
                &dest_dir,
                temp_dir.path(),
                archive_dir.as_deref(),
                &self.config.retentions,
            )?);
        }
        let mut last_update = sources[0].start_time();

        let mut cache = SeriesCache::new(sources, CACHE_ROWS);
        while let Some(row) = stream.next().await {
            last_update = row.time;
            cache.add_row(row.time, &row.values)?;
        }
        stream.finish().await?;
        debug!(
            path = %descriptor.rrd_path.display(),
            rows = cache.rows(),
            flushes = cache.auto_flushes(),
            "archive streamed"
        );
        let sources = cache.close()?;

        // Point of no return is publish; bail out while that is still cheap.
        if self.cancel.is_cancelled() {
            return Err(ConvertError::Cancelled);
        }

        if self.config.merge {
            for source in &sources {
                source.merge_existing(last_update)?;
                source.archive_existing()?;
            }
        } else if self.config.archive.is_some() {
            for source in &sources {
                source.archive_existing()?;
            }
        }

        fs::create_dir_all(&dest_dir).map_err(|source| ConvertError::CreateDestination {
            path: dest_dir.clone(),
            source,
        })?;
        for source in &sources {
            source.publish()?;
        }

        descriptor
            .mark_done()
            .map_err(|source| ConvertError::MarkDone {
                path: descriptor.marker_path().to_path_buf(),
                source,
            })?;

        if self.config.delete_rrd {
            fs::remove_file(&descriptor.rrd_path).map_err(|source| ConvertError::DeleteSource {
                path: descriptor.rrd_path.clone(),
                source,
            })?;
        }
        Ok(())
    }
}
