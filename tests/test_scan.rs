use mmscan::conf::{FilterConfig, ScanConfig};
use mmscan::event::{CircleEvent, Event};
use mmscan::report::{ReportError, ReportSink, ScanReport};
use mmscan::scanner::{ScanError, ScanOrchestrator, ScanState};
use mmscan::utils::spatial::great_circle_distance_deg;
use mmscan::utils::testing::{alert_at, ArchiveCall, MockArchive};

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

const T_MAX: f64 = 2459010.0;

const POSITIONS: [(&str, f64, f64); 4] = [
    ("ZTF20aaaaaaa", 150.0, 30.0),
    ("ZTF20bbbbbbb", 152.0, 31.0),
    ("ZTF20ccccccc", 148.0, 29.0),
    ("ZTF20ddddddd", 153.0, 27.0),
];

fn event() -> Event {
    CircleEvent::new("GRB200530A", 2459000.0, 150.0, 30.0, 5.0)
        .unwrap()
        .into()
}

fn archive() -> MockArchive {
    POSITIONS
        .iter()
        .fold(MockArchive::new(), |archive, (id, ra, dec)| {
            archive.with_alert(alert_at(id, 2459001.0, *ra, *dec))
        })
        // far outside the circle
        .with_alert(alert_at("ZTF20zzzzzzz", 2459001.0, 200.0, -10.0))
}

fn scan_config() -> ScanConfig {
    ScanConfig {
        cone_nside: 16,
        ..Default::default()
    }
}

fn scanner(archive: &Arc<MockArchive>, scan: ScanConfig) -> ScanOrchestrator {
    ScanOrchestrator::new(archive.clone(), event(), scan, FilterConfig::default()).unwrap()
}

fn expected_ids() -> BTreeSet<String> {
    POSITIONS.iter().map(|(id, _, _)| id.to_string()).collect()
}

#[tokio::test]
async fn test_scan_in_two_halves_matches_single_scan() {
    let single = Arc::new(archive());
    let mut full = scanner(&single, scan_config());
    let cones = full.cones().len();
    assert!(cones >= 2);
    full.scan_cones(Some(T_MAX), None).await.unwrap();
    let found: BTreeSet<String> = full.candidates().keys().cloned().collect();
    assert_eq!(found, expected_ids());

    let halves = Arc::new(archive());
    let mut split = scanner(&halves, scan_config());
    // two calls capped at half the cones each
    let half = cones.div_ceil(2);
    let first = split.scan_cones(Some(T_MAX), Some(half)).await.unwrap();
    assert_eq!(first.cones_scanned, half);
    assert_eq!(split.scanned_cones().len(), half);
    let second = split.scan_cones(Some(T_MAX), Some(half)).await.unwrap();
    assert_eq!(second.cones_scanned, cones);
    assert_eq!(second.cone_searches, cones);
    let all: BTreeSet<u64> = split.cones().cones.iter().map(|cone| cone.id).collect();
    assert_eq!(split.scanned_cones(), &all);

    // no cone searched twice
    let calls = halves.cone_calls();
    assert_eq!(calls.len(), cones);
    let distinct: BTreeSet<(u64, u64)> = calls
        .iter()
        .map(|(ra, dec)| (ra.to_bits(), dec.to_bits()))
        .collect();
    assert_eq!(distinct.len(), cones);

    assert_eq!(split.candidates(), full.candidates());

    // a further call has nothing left to do
    let again = split.scan_cones(Some(T_MAX), None).await.unwrap();
    assert_eq!(again.cone_searches, cones);
    assert_eq!(halves.cone_calls().len(), cones);
}

#[tokio::test]
async fn test_failure_preserves_progress() {
    let archive = Arc::new(archive());
    let mut scanner = scanner(&archive, scan_config());
    let cones = scanner.cones().len();
    assert!(cones > 2);

    archive.fail_cones_after(2);
    let error = scanner.scan_cones(Some(T_MAX), None).await.unwrap_err();
    assert!(matches!(error, ScanError::Archive(_)));
    assert_eq!(scanner.state(), ScanState::Error);
    assert_eq!(scanner.scanned_cones().len(), 2);
    assert!(scanner.cache().is_empty());

    // ids seen in the two scanned cones wait for their history
    let radius = scanner.cones().radius_deg;
    let expected_pending: BTreeSet<String> = scanner
        .cones()
        .cones
        .iter()
        .take(2)
        .flat_map(|cone| {
            POSITIONS.iter().filter(move |(_, ra, dec)| {
                great_circle_distance_deg(cone.ra, cone.dec, *ra, *dec) <= radius
            })
        })
        .map(|(id, _, _)| id.to_string())
        .collect();
    assert_eq!(scanner.pending(), &expected_pending);

    archive.recover();
    let summary = scanner.scan_cones(Some(T_MAX), None).await.unwrap();
    assert_eq!(scanner.state(), ScanState::Done);
    assert_eq!(summary.cones_scanned, cones);
    assert_eq!(summary.pending, 0);
    // the failed cone is the only one searched twice
    assert_eq!(archive.cone_calls().len(), cones + 1);

    let found: BTreeSet<String> = scanner.candidates().keys().cloned().collect();
    assert_eq!(found, expected_ids());
}

#[tokio::test]
async fn test_fast_mode_skips_history() {
    let archive = Arc::new(archive());
    let mut scanner = scanner(
        &archive,
        ScanConfig {
            fast_query: true,
            ..scan_config()
        },
    );
    scanner.scan_cones(Some(T_MAX), None).await.unwrap();

    let found: BTreeSet<String> = scanner.candidates().keys().cloned().collect();
    assert_eq!(found, expected_ids());
    for record in scanner.candidates().values() {
        assert!(record.prv_candidates.is_empty());
    }
    for call in archive.calls() {
        if let ArchiveCall::Object { with_history, .. } = call {
            assert!(!with_history);
        }
    }
}

#[tokio::test]
async fn test_cache_only_moves_forward() {
    let archive = Arc::new(
        archive().with_history(alert_at("ZTF20aaaaaaa", 2459003.0, 150.0, 30.0)),
    );
    let mut scanner = scanner(&archive, scan_config());
    scanner.scan_cones(Some(T_MAX), None).await.unwrap();
    let before: Vec<(String, f64)> = scanner
        .candidates()
        .iter()
        .map(|(id, record)| (id.clone(), record.candidate.jd.unwrap()))
        .collect();
    assert_eq!(
        scanner.cache().get("ZTF20aaaaaaa").unwrap().candidate.jd,
        Some(2459003.0)
    );

    let stats = scanner
        .add_objects(&["ZTF20aaaaaaa", "ZTF20bbbbbbb"])
        .await
        .unwrap();
    assert_eq!(stats.unchanged, 2);
    assert_eq!(stats.replaced, 0);

    for (id, jd) in before {
        assert!(scanner.cache().get(&id).unwrap().candidate.jd.unwrap() >= jd);
    }
}

#[tokio::test]
async fn test_timerange_scan() {
    let archive = Arc::new(archive());
    let mut scanner = scanner(&archive, scan_config());
    let summary = scanner.scan_timerange(Some(T_MAX), 100).await.unwrap();
    assert_eq!(summary.alerts_received, 5);
    assert!(archive.cone_calls().is_empty());

    let found: BTreeSet<String> = scanner.candidates().keys().cloned().collect();
    assert_eq!(found, expected_ids());
}

#[derive(Default)]
struct RecordingSink {
    published: Mutex<Vec<(String, Vec<String>, usize)>>,
}

#[async_trait]
impl ReportSink for RecordingSink {
    async fn publish(&self, report: &ScanReport<'_>) -> Result<(), ReportError> {
        self.published.lock().unwrap().push((
            report.event.name().to_string(),
            report.candidates.keys().cloned().collect(),
            report.summary.candidates,
        ));
        Ok(())
    }
}

struct BrokenSink;

#[async_trait]
impl ReportSink for BrokenSink {
    async fn publish(&self, _report: &ScanReport<'_>) -> Result<(), ReportError> {
        Err(std::io::Error::other("disk full").into())
    }
}

#[tokio::test]
async fn test_finish_hands_snapshot_to_sink() {
    let archive = Arc::new(archive());
    let mut scanner = scanner(&archive, scan_config());
    scanner.scan_cones(Some(T_MAX), None).await.unwrap();

    let sink = RecordingSink::default();
    let summary = scanner.finish(&sink).await.unwrap();
    assert_eq!(summary.candidates, 4);

    let published = sink.published.lock().unwrap();
    assert_eq!(published.len(), 1);
    let (event, ids, count) = &published[0];
    assert_eq!(event, "GRB200530A");
    assert_eq!(ids.iter().cloned().collect::<BTreeSet<_>>(), expected_ids());
    assert_eq!(*count, 4);
    drop(published);

    let error = scanner.finish(&BrokenSink).await.unwrap_err();
    assert!(matches!(error, ScanError::Report(ReportError::Io(_))));
    assert_eq!(scanner.state(), ScanState::Error);
    // the cache survives a failed publish
    assert_eq!(scanner.cache().len(), 4);
}
