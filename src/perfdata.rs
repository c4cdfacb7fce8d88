//! Parser for nagios plugin performance data strings.
//!
//! A perfdata string is a space separated list of
//! `'label'=value[UOM];[warn];[crit];[min];[max]` entries. Quoted labels may
//! contain spaces. Thresholds are optional and default to NaN.

use std::num::ParseFloatError;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(('[^']+')?[^\s]+)").unwrap());
static LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(('[^']+')?([^='])*)").unwrap());
static VALUE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+[\.,]?\d*)").unwrap());

#[derive(Debug, Error)]
pub enum PerfdataError {
    #[error("could not split perfdata: {0}")]
    Split(String),
    #[error("invalid perfdata value: {0}")]
    FieldCount(String),
    #[error("could not parse {field} value {raw:?}: {source}")]
    Threshold {
        field: &'static str,
        raw: String,
        source: ParseFloatError,
    },
    #[error("invalid label: {0}")]
    Label(String),
    #[error("no value found: {0}")]
    NoValue(String),
    #[error("invalid format {0}")]
    Format(String),
    #[error("invalid decimal in: {0}")]
    Decimal(String),
    #[error("could not parse value {raw:?}: {source}")]
    Value {
        raw: String,
        source: ParseFloatError,
    },
}

/// One metric from a perfdata string. The label is kept verbatim, including
/// surrounding quotes; absent thresholds are NaN.
#[derive(Debug, Clone)]
pub struct Perfdata {
    pub label: String,
    pub value: f64,
    pub uom: String,
    pub warning: f64,
    pub critical: f64,
    pub min: f64,
    pub max: f64,
}

/// Splits a perfdata string and parses every entry. Fails on the first
/// malformed entry so a series with bogus metadata is rejected as a whole.
pub fn parse_perfdata(perfdata: &str) -> Result<Vec<Perfdata>, PerfdataError> {
    let entries: Vec<&str> = SPLIT_RE.find_iter(perfdata).map(|m| m.as_str()).collect();
    if entries.is_empty() {
        return Err(PerfdataError::Split(perfdata.to_string()));
    }
    entries.iter().map(|entry| parse_value(entry)).collect()
}

fn parse_value(entry: &str) -> Result<Perfdata, PerfdataError> {
    let fields: Vec<&str> = entry.split(';').collect();
    if fields.is_empty() || fields.len() > 5 {
        return Err(PerfdataError::FieldCount(entry.to_string()));
    }

    let mut pd = Perfdata {
        label: String::new(),
        value: f64::NAN,
        uom: String::new(),
        warning: f64::NAN,
        critical: f64::NAN,
        min: f64::NAN,
        max: f64::NAN,
    };

    let threshold = |field: &'static str, raw: &str| -> Result<f64, PerfdataError> {
        raw.parse().map_err(|source| PerfdataError::Threshold {
            field,
            raw: raw.to_string(),
            source,
        })
    };
    if fields.len() == 5 && !fields[4].is_empty() {
        pd.max = threshold("max", fields[4])?;
    }
    if fields.len() >= 4 && !fields[3].is_empty() {
        pd.min = threshold("min", fields[3])?;
    }
    if fields.len() >= 3 && !fields[2].is_empty() {
        pd.critical = threshold("critical", fields[2])?;
    }
    if fields.len() >= 2 && !fields[1].is_empty() {
        pd.warning = threshold("warning", fields[1])?;
    }

    let head = fields[0];
    let label = LABEL_RE.find(head).map(|m| m.as_str()).unwrap_or("");
    if label.is_empty() {
        return Err(PerfdataError::Label(head.to_string()));
    }
    if label.len() == head.len() {
        return Err(PerfdataError::NoValue(head.to_string()));
    }
    if head.as_bytes()[label.len()] != b'=' {
        return Err(PerfdataError::Format(head.to_string()));
    }
    pd.label = label.to_string();

    let value_with_unit = &head[label.len() + 1..];
    let raw_value = VALUE_RE
        .find(value_with_unit)
        .map(|m| m.as_str())
        .unwrap_or("");
    if raw_value.is_empty() {
        return Err(PerfdataError::Decimal(head.to_string()));
    }
    pd.value = raw_value.parse().map_err(|source| PerfdataError::Value {
        raw: head.to_string(),
        source,
    })?;
    pd.uom = value_with_unit[raw_value.len()..].to_string();

    Ok(pd)
}
