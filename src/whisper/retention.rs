// Retention schedule parsing: "precision:length[,precision:length]" with s/m/h/d/w/y units.

use super::WhisperError;

/// One archive definition: point precision and number of points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub seconds_per_point: u32,
    pub points: u32,
}

impl Retention {
    /// Total time span covered by this archive, in seconds.
    pub fn retention(&self) -> u32 {
        self.seconds_per_point * self.points
    }
}

/// Parses a whisper retention string like `60s:365d` or `10s:6h,60s:30d,300s:1y`.
///
/// Each entry is `precision:length`. A bare number on the right-hand side is a
/// point count; a suffixed value is a duration that is divided by the
/// precision. The resulting list is sorted by precision and validated the way
/// whisper itself does (no duplicate precisions, coarser precisions divisible
/// by finer ones, strictly growing retention, and enough points in each
/// archive to consolidate into the next).
pub fn parse_retentions(defs: &str) -> Result<Vec<Retention>, WhisperError> {
    let mut retentions = Vec::new();
    for def in defs.split(',') {
        let def = def.trim();
        if def.is_empty() {
            return Err(WhisperError::Retention(format!(
                "empty retention definition in {defs:?}"
            )));
        }
        retentions.push(parse_retention_def(def)?);
    }
    retentions.sort_by_key(|r| r.seconds_per_point);
    validate_retentions(&retentions)?;
    Ok(retentions)
}

fn parse_retention_def(def: &str) -> Result<Retention, WhisperError> {
    let (precision, length) = def
        .split_once(':')
        .ok_or_else(|| WhisperError::Retention(format!("missing ':' in {def:?}")))?;

    let seconds_per_point = parse_duration(precision)
        .ok_or_else(|| WhisperError::Retention(format!("invalid precision {precision:?}")))?;
    if seconds_per_point == 0 {
        return Err(WhisperError::Retention(format!(
            "precision must be positive in {def:?}"
        )));
    }

    // A bare number is a point count, a suffixed value a time span.
    let points = if let Ok(points) = length.parse::<u32>() {
        points
    } else {
        let span = parse_duration(length)
            .ok_or_else(|| WhisperError::Retention(format!("invalid length {length:?}")))?;
        span / seconds_per_point
    };
    if points == 0 {
        return Err(WhisperError::Retention(format!(
            "archive length shorter than one point in {def:?}"
        )));
    }

    Ok(Retention {
        seconds_per_point,
        points,
    })
}

fn parse_duration(s: &str) -> Option<u32> {
    if s.is_empty() {
        return None;
    }
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => s.split_at(pos),
        None => (s, ""),
    };
    let n: u32 = digits.parse().ok()?;
    let multiplier: u32 = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        "w" => 86400 * 7,
        "y" => 86400 * 365,
        _ => return None,
    };
    n.checked_mul(multiplier)
}

fn validate_retentions(retentions: &[Retention]) -> Result<(), WhisperError> {
    if retentions.is_empty() {
        return Err(WhisperError::Retention(
            "at least one archive is required".to_string(),
        ));
    }
    for pair in retentions.windows(2) {
        let (finer, coarser) = (pair[0], pair[1]);
        if finer.seconds_per_point == coarser.seconds_per_point {
            return Err(WhisperError::Retention(format!(
                "duplicate archive precision {}s",
                finer.seconds_per_point
            )));
        }
        if coarser.seconds_per_point % finer.seconds_per_point != 0 {
            return Err(WhisperError::Retention(format!(
                "precision {}s is not divisible by {}s",
                coarser.seconds_per_point, finer.seconds_per_point
            )));
        }
        if coarser.retention() <= finer.retention() {
            return Err(WhisperError::Retention(format!(
                "archive {}s:{} does not cover more time than {}s:{}",
                coarser.seconds_per_point, coarser.points, finer.seconds_per_point, finer.points
            )));
        }
        let per_consolidation = coarser.seconds_per_point / finer.seconds_per_point;
        if finer.points < per_consolidation {
            return Err(WhisperError::Retention(format!(
                "archive {}s:{} has too few points to consolidate into {}s",
                finer.seconds_per_point, finer.points, coarser.seconds_per_point
            )));
        }
    }
    Ok(())
}
