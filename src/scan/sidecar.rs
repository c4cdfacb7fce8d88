//! Sidecar metadata files.
//!
//! Every rrd archive is described by an xml file written next to it by the
//! monitoring system. The interesting parts are the host/service identity,
//! the datasource names (one per series in the archive), the time of the
//! last update and whether that update succeeded.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

/// Status text the perfdata writer puts into `<RRD><TXT>` on success.
const UPDATE_OK: &str = "successful updated";

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("could not read sidecar file: {0}")]
    Read(#[from] io::Error),
    #[error("could not parse sidecar xml: {0}")]
    Parse(#[from] quick_xml::DeError),
    #[error("last update timestamp {0} is out of range")]
    Timestamp(i64),
}

#[derive(Debug, Deserialize)]
struct XmlDatasource {
    #[serde(rename = "NAME")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct XmlRrd {
    #[serde(rename = "TXT")]
    txt: String,
}

/// The `<NAGIOS>` document. Unknown elements are plentiful and ignored.
#[derive(Debug, Deserialize)]
struct XmlNagios {
    #[serde(rename = "NAGIOS_HOSTNAME")]
    hostname: String,
    #[serde(rename = "NAGIOS_SERVICEDESC")]
    servicename: String,
    #[serde(rename = "NAGIOS_TIMET")]
    timet: i64,
    #[serde(rename = "RRD")]
    rrd: XmlRrd,
    #[serde(rename = "DATASOURCE", default)]
    datasources: Vec<XmlDatasource>,
}

/// Parsed content of one sidecar file plus the paths derived from it.
/// Immutable once read.
#[derive(Debug, Clone)]
pub struct SeriesDescriptor {
    pub xml_path: PathBuf,
    pub rrd_path: PathBuf,
    marker_path: PathBuf,
    pub hostname: String,
    pub servicename: String,
    pub last_update: DateTime<Utc>,
    pub updated: bool,
    pub labels: Vec<String>,
}

impl SeriesDescriptor {
    pub fn read(xml_path: &Path) -> Result<Self, SidecarError> {
        let raw = std::fs::read_to_string(xml_path)?;
        Self::from_xml(xml_path, &raw)
    }

    pub fn from_xml(xml_path: &Path, raw: &str) -> Result<Self, SidecarError> {
        let xml: XmlNagios = quick_xml::de::from_str(raw)?;
        let last_update = DateTime::from_timestamp(xml.timet, 0)
            .ok_or(SidecarError::Timestamp(xml.timet))?;
        Ok(Self {
            rrd_path: xml_path.with_extension("rrd"),
            marker_path: xml_path.with_extension("ok"),
            xml_path: xml_path.to_path_buf(),
            hostname: xml.hostname,
            servicename: xml.servicename,
            last_update,
            updated: xml.rrd.txt == UPDATE_OK,
            labels: xml.datasources.into_iter().map(|ds| ds.name).collect(),
        })
    }

    /// Whether the done marker from a previous run exists.
    pub fn marker_exists(&self) -> bool {
        self.marker_path.exists()
    }

    /// Creates the done marker. Its existence alone flags completion, content
    /// does not matter.
    pub fn mark_done(&self) -> io::Result<()> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.marker_path)?;
        Ok(())
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }
}
