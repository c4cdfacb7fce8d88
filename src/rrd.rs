//! Legacy rrd archive access.
//!
//! Archives are read through the `rrdtool` binary instead of linking librrd:
//! `rrdtool first`/`last` bound the stored range and `rrdtool fetch` dumps
//! the AVERAGE consolidated rows, which a background task parses and streams
//! over a bounded channel. Rows whose values are all NaN carry no information
//! and are dropped at the source.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Backpressure bound between the fetch parser and the conversion loop.
const ROW_QUEUE: usize = 1000;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("rrdtool binary not found: {0}")]
    Locate(#[from] which::Error),
    #[error("could not run {command}: {source}")]
    Spawn { command: String, source: io::Error },
    #[error("{command} failed: {stderr}")]
    Failed { command: String, stderr: String },
    #[error("could not parse rrdtool output line {line:?}")]
    Parse { line: String },
    #[error("i/o error while reading rrdtool output: {0}")]
    Io(#[from] io::Error),
    #[error("row stream task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// One archive row: a timestamp and one value per datasource, in sidecar
/// datasource order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub time: u32,
    pub values: Vec<f64>,
}

/// Receiving end of a row stream plus the producing task. The producer stops
/// silently when cancelled; callers that need to distinguish cancellation do
/// so through their own token.
pub struct RowStream {
    rows: mpsc::Receiver<Row>,
    producer: JoinHandle<Result<(), ReaderError>>,
}

impl RowStream {
    /// Next row in emission order, `None` once the producer is done.
    pub async fn next(&mut self) -> Option<Row> {
        self.rows.recv().await
    }

    /// Waits for the producer and surfaces any read or parse error.
    pub async fn finish(self) -> Result<(), ReaderError> {
        self.producer.await?
    }

    /// A stream over rows already in memory. Useful for readers that do not
    /// shell out, and for exercising conversions against synthetic data.
    pub fn from_rows(rows: Vec<Row>, cancel: &CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(ROW_QUEUE);
        let cancel = cancel.clone();
        let producer = tokio::spawn(async move {
            for row in rows {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    res = tx.send(row) => {
                        if res.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
            Ok(())
        });
        Self {
            rows: rx,
            producer,
        }
    }
}

/// Source of rows for one archive file.
#[async_trait]
pub trait ArchiveReader: Send + Sync {
    /// Starts streaming the archive's rows in timestamp order.
    async fn stream(&self, path: &Path, cancel: &CancellationToken)
    -> Result<RowStream, ReaderError>;
}

/// Production reader that shells out to `rrdtool`.
pub struct RrdtoolReader {
    binary: PathBuf,
}

impl RrdtoolReader {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Finds `rrdtool` in `PATH`.
    pub fn locate() -> Result<Self, ReaderError> {
        Ok(Self::new(which::which("rrdtool")?))
    }

    /// Runs `rrdtool first`/`rrdtool last` and parses the resulting epoch.
    async fn query_timestamp(&self, subcommand: &str, path: &Path) -> Result<i64, ReaderError> {
        let command = format!("rrdtool {subcommand} {}", path.display());
        let output = Command::new(&self.binary)
            .arg(subcommand)
            .arg(path)
            .output()
            .await
            .map_err(|source| ReaderError::Spawn {
                command: command.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ReaderError::Failed {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        let text = String::from_utf8_lossy(&output.stdout);
        text.trim()
            .parse()
            .map_err(|_| ReaderError::Parse {
                line: text.trim().to_string(),
            })
    }
}

#[async_trait]
impl ArchiveReader for RrdtoolReader {
    async fn stream(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<RowStream, ReaderError> {
        let first = self.query_timestamp("first", path).await?;
        let last = self.query_timestamp("last", path).await?;
        debug!(path = %path.display(), first, last, "dumping rrd archive");

        let command = format!("rrdtool fetch {}", path.display());
        // fetch yields rows in (start, end], so back off by one second to
        // keep the very first stored point
        let mut child = Command::new(&self.binary)
            .arg("fetch")
            .arg(path)
            .arg("AVERAGE")
            .arg("-s")
            .arg((first - 1).to_string())
            .arg("-e")
            .arg(last.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ReaderError::Spawn {
                command: command.clone(),
                source,
            })?;
        let stdout = child.stdout.take().ok_or_else(|| ReaderError::Spawn {
            command: command.clone(),
            source: io::Error::other("stdout was not captured"),
        })?;

        let (tx, rx) = mpsc::channel(ROW_QUEUE);
        let cancel = cancel.clone();
        let producer = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                let Some(row) = parse_fetch_line(&line)? else {
                    continue;
                };
                if row.values.iter().all(|v| v.is_nan()) {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    continue;
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    res = tx.send(row) => {
                        if res.is_err() {
                            return Ok(());
                        }
                    }
                }
            }

            // stdout is drained, so reading stderr to EOF cannot deadlock
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                pipe.read_to_string(&mut stderr).await?;
            }
            let status = child.wait().await?;
            if !status.success() {
                return Err(ReaderError::Failed { command, stderr });
            }
            Ok(())
        });

        Ok(RowStream {
            rows: rx,
            producer,
        })
    }
}

/// Parses one line of `rrdtool fetch` output. The datasource header and
/// blank lines yield `None`; data lines look like
/// `1700000040: 1.2345678901e+01 -nan`.
fn parse_fetch_line(line: &str) -> Result<Option<Row>, ReaderError> {
    let Some((timestamp, rest)) = line.split_once(':') else {
        return Ok(None);
    };
    let parse_err = || ReaderError::Parse {
        line: line.to_string(),
    };
    let time = timestamp.trim().parse().map_err(|_| parse_err())?;
    let values = rest
        .split_whitespace()
        .map(|v| v.parse().map_err(|_| parse_err()))
        .collect::<Result<Vec<f64>, _>>()?;
    Ok(Some(Row { time, values }))
}
