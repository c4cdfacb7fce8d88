// Whisper engine: on-disk format, bulk updates, downsampling and fetch windows

use std::time::{SystemTime, UNIX_EPOCH};

use rrd2whisper::whisper::{
    ARCHIVE_INFO_SIZE, Aggregation, METADATA_SIZE, POINT_SIZE, Point, Whisper, WhisperError,
    parse_retentions,
};

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as u32
}

/// Current time rounded down to a step boundary, so written points land on
/// predictable fetch slots.
fn aligned_now(step: u32) -> u32 {
    unix_now() / step * step
}

#[test]
fn create_preallocates_and_reopens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("series.wsp");
    let retentions = parse_retentions("60s:1d").unwrap();

    let db = Whisper::create(&path, &retentions, Aggregation::Average, 0.5).unwrap();
    assert_eq!(db.max_retention(), 86_400);
    db.close().unwrap();

    // header plus one archive of 1440 zeroed slots
    let expected = METADATA_SIZE + ARCHIVE_INFO_SIZE + 1440 * POINT_SIZE;
    assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);

    let db = Whisper::open(&path).unwrap();
    assert_eq!(db.max_retention(), 86_400);
    assert_eq!(db.path(), path);
}

#[test]
fn create_refuses_to_replace_an_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("series.wsp");
    let retentions = parse_retentions("60s:1h").unwrap();
    Whisper::create(&path, &retentions, Aggregation::Average, 0.5)
        .unwrap()
        .close()
        .unwrap();

    let err = Whisper::create(&path, &retentions, Aggregation::Average, 0.5).unwrap_err();
    assert!(matches!(err, WhisperError::Io(_)));
}

#[test]
fn open_rejects_garbage_and_missing_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("series.wsp");
    std::fs::write(&path, b"definitely not a whisper file").unwrap();
    assert!(matches!(
        Whisper::open(&path).unwrap_err(),
        WhisperError::Corrupt { .. }
    ));

    assert!(matches!(
        Whisper::open(&dir.path().join("missing.wsp")).unwrap_err(),
        WhisperError::Io(_)
    ));
}

#[test]
fn open_rejects_a_truncated_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("series.wsp");
    let retentions = parse_retentions("60s:1h").unwrap();
    Whisper::create(&path, &retentions, Aggregation::Average, 0.5)
        .unwrap()
        .close()
        .unwrap();

    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(METADATA_SIZE + ARCHIVE_INFO_SIZE).unwrap();
    assert!(matches!(
        Whisper::open(&path).unwrap_err(),
        WhisperError::Corrupt { .. }
    ));
}

#[test]
fn update_many_and_fetch_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("series.wsp");
    let retentions = parse_retentions("60s:1d").unwrap();
    let mut db = Whisper::create(&path, &retentions, Aggregation::Average, 0.5).unwrap();

    let end = aligned_now(60);
    let points: Vec<Point> = (0..10)
        .map(|i| Point {
            time: end - (9 - i) * 60,
            value: f64::from(i),
        })
        .collect();
    db.update_many(&points).unwrap();

    let series = db.fetch(end - 600, end).unwrap();
    assert_eq!(series.step, 60);
    assert_eq!(series.from, end - 540);
    assert_eq!(series.values.len(), 10);
    for (i, value) in series.values.iter().enumerate() {
        assert_eq!(*value, i as f64, "slot {i}");
    }
}

#[test]
fn fetch_of_an_unwritten_file_is_all_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("series.wsp");
    let retentions = parse_retentions("60s:1d").unwrap();
    let db = Whisper::create(&path, &retentions, Aggregation::Average, 0.5).unwrap();

    let end = aligned_now(60);
    let series = db.fetch(end - 300, end).unwrap();
    assert_eq!(series.values.len(), 5);
    assert!(series.values.iter().all(|v| v.is_nan()));
}

#[test]
fn gaps_between_points_stay_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("series.wsp");
    let retentions = parse_retentions("60s:1d").unwrap();
    let mut db = Whisper::create(&path, &retentions, Aggregation::Average, 0.5).unwrap();

    let end = aligned_now(60);
    db.update_many(&[
        Point {
            time: end - 540,
            value: 1.0,
        },
        Point {
            time: end - 60,
            value: 2.0,
        },
    ])
    .unwrap();

    let series = db.fetch(end - 600, end).unwrap();
    assert_eq!(series.values.len(), 10);
    assert_eq!(series.values[0], 1.0);
    assert_eq!(series.values[8], 2.0);
    for (i, value) in series.values.iter().enumerate() {
        if i != 0 && i != 8 {
            assert!(value.is_nan(), "slot {i} should be empty");
        }
    }
}

#[test]
fn later_point_in_an_interval_wins() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("series.wsp");
    let retentions = parse_retentions("60s:1d").unwrap();
    let mut db = Whisper::create(&path, &retentions, Aggregation::Average, 0.5).unwrap();

    let end = aligned_now(60);
    db.update_many(&[
        Point {
            time: end - 55,
            value: 1.0,
        },
        Point {
            time: end - 35,
            value: 2.0,
        },
    ])
    .unwrap();

    let series = db.fetch(end - 120, end - 60).unwrap();
    assert_eq!(series.values, vec![2.0]);
}

#[test]
fn points_outside_retention_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("series.wsp");
    let retentions = parse_retentions("60s:1h").unwrap();
    let mut db = Whisper::create(&path, &retentions, Aggregation::Average, 0.5).unwrap();

    let end = aligned_now(60);
    db.update_many(&[
        Point {
            time: end - 7200,
            value: 1.0,
        },
        Point {
            time: end,
            value: 2.0,
        },
    ])
    .unwrap();

    let series = db.fetch(end - 60, end).unwrap();
    assert_eq!(series.values, vec![2.0]);
}

#[test]
fn downsampling_fills_the_lower_archive() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("series.wsp");
    let retentions = parse_retentions("60s:1h,300s:1d").unwrap();
    let mut db = Whisper::create(&path, &retentions, Aggregation::Average, 0.5).unwrap();

    // five minutes of data filling exactly one lower-precision window
    let window = aligned_now(300) - 600;
    let points: Vec<Point> = (0..5)
        .map(|i| Point {
            time: window + i * 60,
            value: f64::from(i + 1),
        })
        .collect();
    db.update_many(&points).unwrap();

    // a `from` older than the high-precision archive reads the 300s one
    let series = db.fetch(unix_now() - 3700, window).unwrap();
    assert_eq!(series.step, 300);
    let (last, rest) = series.values.split_last().unwrap();
    assert_eq!(*last, 3.0);
    assert!(rest.iter().all(|v| v.is_nan()));
}

#[test]
fn downsampling_respects_the_known_points_factor() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("series.wsp");
    let retentions = parse_retentions("60s:1h,300s:1d").unwrap();
    let mut db = Whisper::create(&path, &retentions, Aggregation::Average, 0.5).unwrap();

    // two of five slots is below the 0.5 factor, nothing propagates
    let window = aligned_now(300) - 600;
    db.update_many(&[
        Point {
            time: window,
            value: 1.0,
        },
        Point {
            time: window + 60,
            value: 2.0,
        },
    ])
    .unwrap();

    let series = db.fetch(unix_now() - 3700, window).unwrap();
    assert_eq!(series.step, 300);
    assert!(series.values.iter().all(|v| v.is_nan()));
}

#[test]
fn backwards_range_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("series.wsp");
    let retentions = parse_retentions("60s:1h").unwrap();
    let db = Whisper::create(&path, &retentions, Aggregation::Average, 0.5).unwrap();

    assert!(matches!(
        db.fetch(1000, 500).unwrap_err(),
        WhisperError::InvalidTimeRange { .. }
    ));
}

#[test]
fn sub_step_range_yields_no_slots() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("series.wsp");
    let retentions = parse_retentions("60s:1h").unwrap();
    let db = Whisper::create(&path, &retentions, Aggregation::Average, 0.5).unwrap();

    let end = aligned_now(60);
    let series = db.fetch(end - 30, end - 20).unwrap();
    assert!(series.values.is_empty());
}
