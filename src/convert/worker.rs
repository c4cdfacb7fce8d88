//! Bounded worker pool draining the pending list.
//!
//! One producer feeds a bounded queue in discovery order and a configurable
//! number of workers convert in parallel. Every submitted item is reported
//! to the visitor exactly once: converted, failed, or cancelled before its
//! turn came.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{ConvertError, Converter};
use crate::scan::SeriesDescriptor;

/// Called after every conversion attempt with the outcome and the time since
/// the pool started. Implementations must tolerate concurrent calls.
pub trait ConvertVisitor: Send + Sync {
    fn visit(&self, item: &SeriesDescriptor, elapsed: Duration, result: &Result<(), ConvertError>);
}

/// Work list, converter and reporting for one pool run.
pub struct PoolDeps {
    pub items: Vec<SeriesDescriptor>,
    pub converter: Arc<Converter>,
    pub visitor: Arc<dyn ConvertVisitor>,
    pub cancel: CancellationToken,
}

/// Runs the pool to completion: `parallel` workers behind a queue holding
/// `parallel + 1` items, so the producer stays at most one item ahead.
///
/// After cancellation no new conversion starts. The producer reports items
/// it has not handed out yet, workers drain and report whatever is already
/// queued, and in-flight conversions abort at their next checkpoint. The
/// queue is never abandoned while a sender could still block on it.
pub async fn run(deps: PoolDeps, parallel: usize) {
    let PoolDeps {
        items,
        converter,
        visitor,
        cancel,
    } = deps;
    let parallel = parallel.max(1);
    let started = Instant::now();
    let (tx, rx) = flume::bounded::<SeriesDescriptor>(parallel + 1);

    let mut tasks = JoinSet::new();

    {
        let cancel = cancel.clone();
        let visitor = visitor.clone();
        tasks.spawn(async move {
            for item in items {
                if cancel.is_cancelled() {
                    visitor.visit(&item, started.elapsed(), &Err(ConvertError::Cancelled));
                    continue;
                }
                if let Err(flume::SendError(item)) = tx.send_async(item).await {
                    // all workers gone, nobody will ever take this item
                    visitor.visit(&item, started.elapsed(), &Err(ConvertError::Cancelled));
                }
            }
        });
    }

    for _ in 0..parallel {
        let rx = rx.clone();
        let cancel = cancel.clone();
        let converter = converter.clone();
        let visitor = visitor.clone();
        tasks.spawn(async move {
            while let Ok(item) = rx.recv_async().await {
                if cancel.is_cancelled() {
                    visitor.visit(&item, started.elapsed(), &Err(ConvertError::Cancelled));
                    continue;
                }
                let result = converter.convert(&item).await;
                match &result {
                    Ok(()) => info!(path = %item.rrd_path.display(), "converted to whisper"),
                    Err(err) => {
                        error!(path = %item.rrd_path.display(), error = %err, "conversion failed");
                    }
                }
                visitor.visit(&item, started.elapsed(), &result);
            }
        });
    }
    // Only worker tasks may hold the receiver: the producer must see a
    // disconnect if every worker dies.
    drop(rx);

    while tasks.join_next().await.is_some() {}
}
