// Shared test helpers
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use rrd2whisper::convert::ConvertError;
use rrd2whisper::convert::worker::ConvertVisitor;
use rrd2whisper::rrd::{ArchiveReader, ReaderError, Row, RowStream};
use rrd2whisper::scan::SeriesDescriptor;

pub fn sidecar_xml(
    host: &str,
    service: &str,
    labels: &[&str],
    timet: i64,
    updated: bool,
) -> String {
    let txt = if updated {
        "successful updated"
    } else {
        "an update error occurred"
    };
    let datasources: String = labels
        .iter()
        .map(|l| format!("<DATASOURCE><NAME>{l}</NAME></DATASOURCE>"))
        .collect();
    format!(
        "<NAGIOS><NAGIOS_HOSTNAME>{host}</NAGIOS_HOSTNAME>\
         <NAGIOS_SERVICEDESC>{service}</NAGIOS_SERVICEDESC>\
         <NAGIOS_TIMET>{timet}</NAGIOS_TIMET>\
         <RRD><TXT>{txt}</TXT></RRD>{datasources}</NAGIOS>"
    )
}

/// Writes `{root}/{host}/{service}.xml` plus a dummy rrd file next to it and
/// returns the parsed descriptor.
pub fn write_sidecar(
    root: &Path,
    host: &str,
    service: &str,
    labels: &[&str],
    timet: i64,
    updated: bool,
) -> SeriesDescriptor {
    let dir = root.join(host);
    std::fs::create_dir_all(&dir).unwrap();
    let xml_path = dir.join(format!("{service}.xml"));
    std::fs::write(&xml_path, sidecar_xml(host, service, labels, timet, updated)).unwrap();
    std::fs::write(xml_path.with_extension("rrd"), b"not a real rrd").unwrap();
    SeriesDescriptor::read(&xml_path).unwrap()
}

/// `count` rows of `width` values each, `step` seconds apart, ending at
/// `end`. Values are deterministic per row and column.
pub fn make_rows(count: usize, end: u32, step: u32, width: usize) -> Vec<Row> {
    (0..count)
        .map(|i| Row {
            time: end - (count - 1 - i) as u32 * step,
            values: (0..width).map(|col| (i * 10 + col) as f64).collect(),
        })
        .collect()
}

/// Archive reader serving canned rows regardless of the requested path.
pub struct FakeReader {
    pub rows: Vec<Row>,
}

#[async_trait]
impl ArchiveReader for FakeReader {
    async fn stream(
        &self,
        _path: &Path,
        cancel: &CancellationToken,
    ) -> Result<RowStream, ReaderError> {
        Ok(RowStream::from_rows(self.rows.clone(), cancel))
    }
}

pub struct RecordedVisit {
    pub xml_path: PathBuf,
    pub cancelled: bool,
    pub outcome: Result<(), String>,
}

/// Visitor that records every callback for later assertions.
#[derive(Default)]
pub struct RecordingVisitor {
    visits: Mutex<Vec<RecordedVisit>>,
}

impl RecordingVisitor {
    pub fn take(&self) -> Vec<RecordedVisit> {
        std::mem::take(&mut *self.visits.lock().unwrap())
    }
}

impl ConvertVisitor for RecordingVisitor {
    fn visit(
        &self,
        item: &SeriesDescriptor,
        _elapsed: Duration,
        result: &Result<(), ConvertError>,
    ) {
        self.visits.lock().unwrap().push(RecordedVisit {
            xml_path: item.xml_path.clone(),
            cancelled: matches!(result, Err(ConvertError::Cancelled)),
            outcome: result.as_ref().map(|_| ()).map_err(|e| e.to_string()),
        });
    }
}
