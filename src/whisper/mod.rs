//! Minimal whisper (fixed-size round-robin) database engine.
//!
//! Implements the subset of the on-disk format needed to write migrated
//! series and to merge previously written files: create, open, bulk update
//! with downsampling into lower-precision archives, and ranged fetch.
//! All integers and floats are big-endian, matching files produced and read
//! by graphite.

mod retention;

pub use retention::{Retention, parse_retentions};

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

pub const METADATA_SIZE: u64 = 16;
pub const ARCHIVE_INFO_SIZE: u64 = 12;
pub const POINT_SIZE: u64 = 12;

#[derive(Debug, Error)]
pub enum WhisperError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid retention: {0}")]
    Retention(String),
    #[error("corrupt whisper file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("invalid time range {from}..{until}")]
    InvalidTimeRange { from: u32, until: u32 },
}

/// Consolidation function applied when points are downsampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Average,
    Sum,
    Last,
    Max,
    Min,
}

impl Aggregation {
    fn code(self) -> u32 {
        match self {
            Aggregation::Average => 1,
            Aggregation::Sum => 2,
            Aggregation::Last => 3,
            Aggregation::Max => 4,
            Aggregation::Min => 5,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Aggregation::Average),
            2 => Some(Aggregation::Sum),
            3 => Some(Aggregation::Last),
            4 => Some(Aggregation::Max),
            5 => Some(Aggregation::Min),
            _ => None,
        }
    }

    fn apply(self, values: &[f64]) -> f64 {
        match self {
            Aggregation::Average => values.iter().sum::<f64>() / values.len() as f64,
            Aggregation::Sum => values.iter().sum(),
            Aggregation::Last => values[values.len() - 1],
            Aggregation::Max => values.iter().copied().fold(f64::MIN, f64::max),
            Aggregation::Min => values.iter().copied().fold(f64::MAX, f64::min),
        }
    }
}

/// A timestamped value. `time` is a raw unix timestamp on write and an
/// interval-aligned one on read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub time: u32,
    pub value: f64,
}

/// Result of a ranged fetch. `values[i]` belongs to interval `from + i * step`;
/// intervals with no stored point are NaN.
#[derive(Debug, Clone)]
pub struct TimeSeries {
    pub from: u32,
    pub until: u32,
    pub step: u32,
    pub values: Vec<f64>,
}

impl TimeSeries {
    pub fn points(&self) -> impl Iterator<Item = Point> + '_ {
        self.values.iter().enumerate().map(|(i, &value)| Point {
            time: self.from + i as u32 * self.step,
            value,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct ArchiveInfo {
    offset: u32,
    seconds_per_point: u32,
    points: u32,
}

impl ArchiveInfo {
    fn retention(&self) -> u32 {
        self.seconds_per_point * self.points
    }

    fn size(&self) -> u64 {
        self.points as u64 * POINT_SIZE
    }

    fn end(&self) -> u64 {
        self.offset as u64 + self.size()
    }

    /// Byte offset of `interval`'s slot within the ring, relative to `base`.
    fn slot_offset(&self, base: u32, interval: u32) -> u64 {
        let time_distance = interval as i64 - base as i64;
        let point_distance =
            (time_distance / self.seconds_per_point as i64).rem_euclid(self.points as i64);
        self.offset as u64 + point_distance as u64 * POINT_SIZE
    }
}

/// An open whisper database file.
#[derive(Debug)]
pub struct Whisper {
    file: File,
    path: PathBuf,
    aggregation: Aggregation,
    max_retention: u32,
    x_files_factor: f32,
    archives: Vec<ArchiveInfo>,
}

impl Whisper {
    /// Creates a new database at `path`, preallocated to its final size.
    /// Fails if the file already exists.
    pub fn create(
        path: &Path,
        retentions: &[Retention],
        aggregation: Aggregation,
        x_files_factor: f32,
    ) -> Result<Self, WhisperError> {
        if retentions.is_empty() {
            return Err(WhisperError::Retention(
                "at least one archive is required".to_string(),
            ));
        }
        let header_size = METADATA_SIZE + retentions.len() as u64 * ARCHIVE_INFO_SIZE;
        let mut archives = Vec::with_capacity(retentions.len());
        let mut offset = header_size;
        for r in retentions {
            archives.push(ArchiveInfo {
                offset: offset as u32,
                seconds_per_point: r.seconds_per_point,
                points: r.points,
            });
            offset += r.points as u64 * POINT_SIZE;
        }
        let max_retention = archives
            .iter()
            .map(ArchiveInfo::retention)
            .max()
            .unwrap_or(0);

        let mut header = BytesMut::with_capacity(header_size as usize);
        header.put_u32(aggregation.code());
        header.put_u32(max_retention);
        header.put_f32(x_files_factor);
        header.put_u32(archives.len() as u32);
        for archive in &archives {
            header.put_u32(archive.offset);
            header.put_u32(archive.seconds_per_point);
            header.put_u32(archive.points);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all_at(&header, 0)?;
        // set_len zero-fills the data region, which reads back as empty slots
        file.set_len(offset)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            aggregation,
            max_retention,
            x_files_factor,
            archives,
        })
    }

    /// Opens an existing database and validates its header.
    pub fn open(path: &Path) -> Result<Self, WhisperError> {
        let corrupt = |reason: String| WhisperError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut meta = [0u8; METADATA_SIZE as usize];
        file.read_exact_at(&mut meta, 0)?;
        let mut buf: &[u8] = &meta;
        let aggregation_code = buf.get_u32();
        let max_retention = buf.get_u32();
        let x_files_factor = buf.get_f32();
        let archive_count = buf.get_u32();

        let aggregation = Aggregation::from_code(aggregation_code)
            .ok_or_else(|| corrupt(format!("unknown aggregation type {aggregation_code}")))?;
        if archive_count == 0 || archive_count > 1024 {
            return Err(corrupt(format!("implausible archive count {archive_count}")));
        }

        let mut infos = vec![0u8; archive_count as usize * ARCHIVE_INFO_SIZE as usize];
        file.read_exact_at(&mut infos, METADATA_SIZE)?;
        let mut buf: &[u8] = &infos;
        let mut archives = Vec::with_capacity(archive_count as usize);
        for _ in 0..archive_count {
            let archive = ArchiveInfo {
                offset: buf.get_u32(),
                seconds_per_point: buf.get_u32(),
                points: buf.get_u32(),
            };
            if archive.seconds_per_point == 0 || archive.points == 0 {
                return Err(corrupt("zero-sized archive".to_string()));
            }
            archives.push(archive);
        }
        let expected_len = archives
            .last()
            .map(ArchiveInfo::end)
            .unwrap_or(METADATA_SIZE);
        if file.metadata()?.len() < expected_len {
            return Err(corrupt("file shorter than its archives".to_string()));
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            aggregation,
            max_retention,
            x_files_factor,
            archives,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_retention(&self) -> u32 {
        self.max_retention
    }

    /// Earliest timestamp the database can hold right now.
    pub fn start_time(&self) -> u32 {
        unix_now().saturating_sub(self.max_retention)
    }

    /// Writes a batch of points, spreading them over the archives that still
    /// cover their age and downsampling into lower-precision archives.
    /// Points older than the maximum retention are dropped.
    pub fn update_many(&mut self, points: &[Point]) -> Result<(), WhisperError> {
        if points.is_empty() {
            return Ok(());
        }
        let mut sorted = points.to_vec();
        sorted.sort_by(|a, b| b.time.cmp(&a.time));

        let now = unix_now();
        let mut idx = 0;
        for archive_idx in 0..self.archives.len() {
            let age_limit = now.saturating_sub(self.archives[archive_idx].retention());
            let start = idx;
            while idx < sorted.len() && sorted[idx].time > age_limit {
                idx += 1;
            }
            if idx > start {
                let mut batch = sorted[start..idx].to_vec();
                batch.reverse();
                self.archive_update_many(archive_idx, &batch)?;
            }
            if idx == sorted.len() {
                break;
            }
        }
        Ok(())
    }

    /// Reads the series between `from` and `until` (both clamped to the data
    /// the file can hold) from the highest-precision archive covering `from`.
    pub fn fetch(&self, mut from: u32, mut until: u32) -> Result<TimeSeries, WhisperError> {
        if from > until {
            return Err(WhisperError::InvalidTimeRange { from, until });
        }
        let now = unix_now();
        let oldest = now.saturating_sub(self.max_retention);
        if from < oldest {
            from = oldest;
        }
        if until > now {
            until = now;
        }

        let archive = self
            .archives
            .iter()
            .find(|a| now.saturating_sub(a.retention()) <= from)
            .or_else(|| self.archives.last())
            .copied()
            .ok_or_else(|| WhisperError::Corrupt {
                path: self.path.clone(),
                reason: "no archives".to_string(),
            })?;

        let step = archive.seconds_per_point;
        let from_interval = from - from % step + step;
        let until_interval = until - until % step + step;
        if from_interval >= until_interval {
            return Ok(TimeSeries {
                from: from_interval,
                until: until_interval,
                step,
                values: Vec::new(),
            });
        }

        let slots = ((until_interval - from_interval) / step) as usize;
        let base = self.base_interval(&archive)?;
        let mut values = vec![f64::NAN; slots];
        if base == 0 {
            return Ok(TimeSeries {
                from: from_interval,
                until: until_interval,
                step,
                values,
            });
        }

        let start = archive.slot_offset(base, from_interval);
        let end = archive.slot_offset(base, until_interval);
        let raw = if start < end {
            self.read_range(start, (end - start) as usize)?
        } else {
            // wrapped around the end of the ring
            let mut head = self.read_range(start, (archive.end() - start) as usize)?;
            let tail = self.read_range(archive.offset as u64, (end - archive.offset as u64) as usize)?;
            head.extend_from_slice(&tail);
            head
        };

        for (slot, chunk) in raw.chunks_exact(POINT_SIZE as usize).enumerate() {
            let mut buf = chunk;
            let interval = buf.get_u32();
            let value = buf.get_f64();
            if interval == from_interval + slot as u32 * step {
                values[slot] = value;
            }
        }

        Ok(TimeSeries {
            from: from_interval,
            until: until_interval,
            step,
            values,
        })
    }

    /// Flushes file contents to disk and closes the handle.
    pub fn close(self) -> Result<(), WhisperError> {
        self.file.sync_all()?;
        Ok(())
    }

    fn archive_update_many(
        &mut self,
        archive_idx: usize,
        points: &[Point],
    ) -> Result<(), WhisperError> {
        let archive = self.archives[archive_idx];
        // interval-align, later duplicates win
        let mut aligned = BTreeMap::new();
        for p in points {
            aligned.insert(p.time - p.time % archive.seconds_per_point, p.value);
        }
        let Some(&first_interval) = aligned.keys().next() else {
            return Ok(());
        };

        let mut base = self.base_interval(&archive)?;
        if base == 0 {
            base = first_interval;
        }
        for (&interval, &value) in &aligned {
            let offset = archive.slot_offset(base, interval);
            self.write_point(offset, interval, value)?;
        }

        // walk the chain of lower-precision archives, stopping once an
        // aggregation window no longer meets the known-points factor
        let mut intervals: Vec<u32> = aligned.keys().copied().collect();
        for lower_idx in archive_idx + 1..self.archives.len() {
            let higher = self.archives[lower_idx - 1];
            let lower = self.archives[lower_idx];
            let mut lower_intervals: Vec<u32> = intervals
                .iter()
                .map(|i| i - i % lower.seconds_per_point)
                .collect();
            lower_intervals.dedup();

            let mut propagated = Vec::with_capacity(lower_intervals.len());
            for lower_interval in lower_intervals {
                if self.propagate(&higher, &lower, lower_interval)? {
                    propagated.push(lower_interval);
                }
            }
            if propagated.is_empty() {
                break;
            }
            intervals = propagated;
        }
        Ok(())
    }

    /// Aggregates one lower-archive interval out of the higher archive.
    /// Returns false when too few higher-precision points are known.
    fn propagate(
        &mut self,
        higher: &ArchiveInfo,
        lower: &ArchiveInfo,
        lower_interval: u32,
    ) -> Result<bool, WhisperError> {
        let higher_base = self.base_interval(higher)?;
        if higher_base == 0 {
            return Ok(false);
        }

        let window = lower.seconds_per_point / higher.seconds_per_point;
        let mut values = Vec::with_capacity(window as usize);
        let mut expected = lower_interval;
        for _ in 0..window {
            let offset = higher.slot_offset(higher_base, expected);
            let (interval, value) = self.read_point(offset)?;
            if interval == expected {
                values.push(value);
            }
            expected += higher.seconds_per_point;
        }
        if values.is_empty() || (values.len() as f32) < self.x_files_factor * window as f32 {
            return Ok(false);
        }

        let aggregate = self.aggregation.apply(&values);
        let mut lower_base = self.base_interval(lower)?;
        if lower_base == 0 {
            lower_base = lower_interval;
        }
        let offset = lower.slot_offset(lower_base, lower_interval);
        self.write_point(offset, lower_interval, aggregate)?;
        Ok(true)
    }

    /// The interval stored in an archive's first slot; 0 means never written.
    fn base_interval(&self, archive: &ArchiveInfo) -> Result<u32, WhisperError> {
        Ok(self.read_point(archive.offset as u64)?.0)
    }

    fn read_point(&self, offset: u64) -> Result<(u32, f64), WhisperError> {
        let mut raw = [0u8; POINT_SIZE as usize];
        self.file.read_exact_at(&mut raw, offset)?;
        let mut buf: &[u8] = &raw;
        Ok((buf.get_u32(), buf.get_f64()))
    }

    fn write_point(&mut self, offset: u64, interval: u32, value: f64) -> Result<(), WhisperError> {
        let mut buf = BytesMut::with_capacity(POINT_SIZE as usize);
        buf.put_u32(interval);
        buf.put_f64(value);
        self.file.write_all_at(&buf, offset)?;
        Ok(())
    }

    fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>, WhisperError> {
        let mut raw = vec![0u8; len];
        self.file.read_exact_at(&mut raw, offset)?;
        Ok(raw)
    }
}

pub(crate) fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
