//! Picks the datasource labels a conversion publishes under.

use tracing::warn;

use super::ConvertError;
use crate::lookup::PerfdataMap;
use crate::perfdata::parse_perfdata;
use crate::scan::SeriesDescriptor;

/// The sidecar only knows generic datasource names; the database knows the
/// labels the check actually reports. When the database has a parsable
/// perfdata string for the service its labels win. `None` means "keep the
/// sidecar labels".
///
/// A parsed label list whose length differs from the sidecar's datasource
/// count fails the conversion. That shape drift needs an operator looking at
/// it, not a guess that publishes series under wrong names.
pub fn resolve_labels(
    perfdata: Option<&PerfdataMap>,
    descriptor: &SeriesDescriptor,
) -> Result<Option<Vec<String>>, ConvertError> {
    let Some(raw) = perfdata.and_then(|map| map.get(&descriptor.servicename)) else {
        return Ok(None);
    };
    let parsed = match parse_perfdata(raw) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(
                service = %descriptor.servicename,
                error = %err,
                "service has invalid perfdata in database, keeping sidecar labels"
            );
            return Ok(None);
        }
    };
    if parsed.len() != descriptor.labels.len() {
        return Err(ConvertError::LabelCountMismatch {
            db: parsed.len(),
            xml: descriptor.labels.len(),
        });
    }
    Ok(Some(parsed.into_iter().map(|pd| pd.label).collect()))
}
