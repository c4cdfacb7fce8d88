//! Terminal progress reporting for the conversion pool.

use std::io::IsTerminal;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::convert::ConvertError;
use crate::convert::worker::ConvertVisitor;
use crate::scan::SeriesDescriptor;

/// Progress bar over the pending list, drawn on stderr. Hidden when stderr
/// is not a terminal so piped and cron runs stay clean; failures still reach
/// the log and the stderr warning layer either way.
pub struct ProgressVisitor {
    bar: ProgressBar,
}

impl ProgressVisitor {
    pub fn new(total: u64) -> Self {
        if !std::io::stderr().is_terminal() {
            return Self {
                bar: ProgressBar::hidden(),
            };
        }
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} rrds ({percent:>3}%) [{elapsed_precise}] {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ConvertVisitor for ProgressVisitor {
    fn visit(
        &self,
        item: &SeriesDescriptor,
        _elapsed: Duration,
        result: &Result<(), ConvertError>,
    ) {
        let state = if result.is_ok() { "" } else { "failed: " };
        self.bar
            .set_message(format!("{state}{}/{}", item.hostname, item.servicename));
        self.bar.inc(1);
    }
}
