//! Bounded row cache between the archive reader and the whisper writers.

use super::{ConvertError, ConvertSource};
use crate::whisper::Point;

/// Buffers rows column-wise until every label holds `capacity` points, then
/// bulk-writes one batch per label. Peak memory stays at
/// `capacity * label_count` points no matter how large the archive is.
pub struct SeriesCache {
    sources: Vec<ConvertSource>,
    columns: Vec<Vec<Point>>,
    capacity: usize,
    rows: u64,
    auto_flushes: u64,
}

impl SeriesCache {
    pub fn new(sources: Vec<ConvertSource>, capacity: usize) -> Self {
        let columns = sources
            .iter()
            .map(|_| Vec::with_capacity(capacity))
            .collect();
        Self {
            sources,
            columns,
            capacity,
            rows: 0,
            auto_flushes: 0,
        }
    }

    /// Appends one timestamp and one value per label. A full batch is
    /// written out before this returns, so the call can block on file i/o.
    /// Rows whose width does not match the label count fail the conversion.
    pub fn add_row(&mut self, time: u32, values: &[f64]) -> Result<(), ConvertError> {
        if values.len() != self.columns.len() {
            return Err(ConvertError::SchemaMismatch {
                time,
                got: values.len(),
                expected: self.columns.len(),
            });
        }
        for (column, &value) in self.columns.iter_mut().zip(values) {
            column.push(Point { time, value });
        }
        self.rows += 1;
        if self
            .columns
            .first()
            .is_some_and(|column| column.len() >= self.capacity)
        {
            self.flush()?;
            self.auto_flushes += 1;
        }
        Ok(())
    }

    /// Rows accepted so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Batches written because the cache filled up. The final partial batch
    /// written by [`SeriesCache::close`] does not count.
    pub fn auto_flushes(&self) -> u64 {
        self.auto_flushes
    }

    fn flush(&mut self) -> Result<(), ConvertError> {
        for (source, column) in self.sources.iter_mut().zip(&mut self.columns) {
            if column.is_empty() {
                continue;
            }
            if let Some(writer) = source.writer.as_mut() {
                writer
                    .update_many(column)
                    .map_err(|err| ConvertError::Flush {
                        path: source.temp_path.clone(),
                        source: err,
                    })?;
            }
            column.clear();
        }
        Ok(())
    }

    /// Writes the remaining partial batch and closes every writer. A close
    /// failure is fatal for the conversion: a half-synced series must never
    /// reach the publish step. Returns the sources for merge and publish.
    pub fn close(mut self) -> Result<Vec<ConvertSource>, ConvertError> {
        self.flush()?;
        for source in &mut self.sources {
            if let Some(writer) = source.writer.take() {
                writer.close().map_err(|err| ConvertError::CloseSeries {
                    path: source.temp_path.clone(),
                    source: err,
                })?;
            }
        }
        Ok(self.sources)
    }
}
