// Worker pool: parallel conversion, exactly-once reporting, cancellation

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use common::{FakeReader, RecordingVisitor, make_rows, write_sidecar};
use rrd2whisper::convert::worker::{self, PoolDeps};
use rrd2whisper::convert::{ConvertConfig, Converter};
use rrd2whisper::rrd::Row;
use rrd2whisper::whisper::parse_retentions;

const TIMET: i64 = 1_700_000_000;

fn aligned_now(step: u32) -> u32 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as u32;
    now / step * step
}

fn pool_converter(
    dest: &Path,
    temp: &Path,
    rows: Vec<Row>,
    cancel: &CancellationToken,
) -> Arc<Converter> {
    Arc::new(Converter::new(
        Arc::new(ConvertConfig {
            destination: dest.to_path_buf(),
            archive: None,
            temp: temp.to_path_buf(),
            merge: true,
            delete_rrd: false,
            retentions: parse_retentions("60s:1d").unwrap(),
        }),
        Arc::new(FakeReader { rows }),
        None,
        cancel.clone(),
    ))
}

#[tokio::test]
async fn pool_converts_every_pending_item() {
    let root = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();

    let items = vec![
        write_sidecar(root.path(), "web01", "Load", &["load1"], TIMET, true),
        write_sidecar(root.path(), "web01", "Ping", &["rta"], TIMET, true),
        write_sidecar(root.path(), "web02", "Load", &["load1"], TIMET, true),
    ];

    let end = aligned_now(60);
    let cancel = CancellationToken::new();
    let visitor = Arc::new(RecordingVisitor::default());
    let deps = PoolDeps {
        items: items.clone(),
        converter: pool_converter(dest.path(), temp.path(), make_rows(5, end, 60, 1), &cancel),
        visitor: visitor.clone(),
        cancel,
    };
    worker::run(deps, 2).await;

    let visits = visitor.take();
    assert_eq!(visits.len(), 3);
    assert!(visits.iter().all(|v| v.outcome.is_ok()));
    for item in &items {
        assert!(item.marker_exists());
    }
    assert!(dest.path().join("web01/Load/load1.wsp").exists());
    assert!(dest.path().join("web01/Ping/rta.wsp").exists());
    assert!(dest.path().join("web02/Load/load1.wsp").exists());
}

#[tokio::test]
async fn cancelled_pool_reports_every_item_without_converting() {
    let root = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();

    let items = vec![
        write_sidecar(root.path(), "web01", "Load", &["load1"], TIMET, true),
        write_sidecar(root.path(), "web01", "Ping", &["rta"], TIMET, true),
        write_sidecar(root.path(), "web02", "Load", &["load1"], TIMET, true),
        write_sidecar(root.path(), "web02", "Ping", &["rta"], TIMET, true),
    ];

    let end = aligned_now(60);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let visitor = Arc::new(RecordingVisitor::default());
    let deps = PoolDeps {
        items: items.clone(),
        converter: pool_converter(dest.path(), temp.path(), make_rows(5, end, 60, 1), &cancel),
        visitor: visitor.clone(),
        cancel,
    };
    worker::run(deps, 2).await;

    let visits = visitor.take();
    assert_eq!(visits.len(), 4, "every item is reported exactly once");
    assert!(visits.iter().all(|v| v.cancelled));
    for item in &items {
        assert!(!item.marker_exists());
    }
    assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn failed_items_do_not_stop_the_pool() {
    let root = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();

    // the middle sidecar claims two datasources, the rows only carry one
    let items = vec![
        write_sidecar(root.path(), "web01", "Load", &["load1"], TIMET, true),
        write_sidecar(root.path(), "web01", "Mixed", &["a", "b"], TIMET, true),
        write_sidecar(root.path(), "web02", "Load", &["load1"], TIMET, true),
    ];

    let end = aligned_now(60);
    let cancel = CancellationToken::new();
    let visitor = Arc::new(RecordingVisitor::default());
    let deps = PoolDeps {
        items: items.clone(),
        converter: pool_converter(dest.path(), temp.path(), make_rows(5, end, 60, 1), &cancel),
        visitor: visitor.clone(),
        cancel,
    };
    worker::run(deps, 2).await;

    let visits = visitor.take();
    assert_eq!(visits.len(), 3);
    let failed: Vec<_> = visits.iter().filter(|v| v.outcome.is_err()).collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].xml_path.ends_with("web01/Mixed.xml"));

    assert!(items[0].marker_exists());
    assert!(!items[1].marker_exists());
    assert!(items[2].marker_exists());
}

#[tokio::test]
async fn zero_parallelism_still_converts() {
    let root = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();

    let items = vec![write_sidecar(
        root.path(),
        "web01",
        "Load",
        &["load1"],
        TIMET,
        true,
    )];

    let end = aligned_now(60);
    let cancel = CancellationToken::new();
    let visitor = Arc::new(RecordingVisitor::default());
    let deps = PoolDeps {
        items: items.clone(),
        converter: pool_converter(dest.path(), temp.path(), make_rows(5, end, 60, 1), &cancel),
        visitor: visitor.clone(),
        cancel,
    };
    worker::run(deps, 0).await;

    assert_eq!(visitor.take().len(), 1);
    assert!(items[0].marker_exists());
}
