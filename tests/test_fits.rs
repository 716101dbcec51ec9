use mmscan::conf::ConfigurationError;
use mmscan::event::{EventContext, EventError, GravitationalWave, NoticeType};
use mmscan::skymap::fits::{read_skymap, SkyMapReadError};
use mmscan::skymap::Ordering;
use mmscan::utils::testing::write_skymap_fits;

use flate2::{write::GzEncoder, Compression};
use std::io::Write;
use std::path::{Path, PathBuf};

fn gzip(path: &Path) -> PathBuf {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&std::fs::read(path).unwrap()).unwrap();
    let gzipped = path.with_extension("fits.gz");
    std::fs::write(&gzipped, encoder.finish().unwrap()).unwrap();
    gzipped
}

fn peaked(n: usize, peaks: &[(usize, f64)]) -> Vec<f64> {
    let mut probs = vec![0.0; n];
    for (i, p) in peaks {
        probs[*i] = *p;
    }
    probs
}

#[test]
fn test_read_gzipped_nested_map() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("S190425z.fits");
    let probs = peaked(48, &[(5, 0.6), (6, 0.3), (7, 0.1)]);
    write_skymap_fits(
        &path,
        "PROB",
        Some(Ordering::Nested),
        &probs,
        &[("DATE-OBS", "2019-04-25T08:18:05.017553"), ("OBJECT", "S190425z")],
        &[("DISTMEAN", 156.1), ("DISTSTD", 41.1)],
    )
    .unwrap();

    let map = read_skymap(gzip(&path)).unwrap();
    assert_eq!(map.nside(), 2);
    assert_eq!(map.probabilities(), probs.as_slice());
    assert!((map.event_time_jd().unwrap() - 2458598.845891).abs() < 1e-5);
    assert_eq!(map.object(), Some("S190425z"));
    let distance = map.distance().unwrap();
    assert_eq!(distance.mean_mpc, 156.1);
    assert_eq!(distance.std_mpc, 41.1);
}

#[test]
fn test_ring_map_is_reordered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ring.fits");
    let probs = peaked(48, &[(5, 1.0)]);
    write_skymap_fits(&path, "PROBABILITY", Some(Ordering::Ring), &probs, &[], &[]).unwrap();

    let map = read_skymap(&path).unwrap();
    let nested = map
        .probabilities()
        .iter()
        .position(|p| *p == 1.0)
        .unwrap() as u64;
    assert_eq!(cdshealpix::nested::get(1).to_ring(nested), 5);
    assert_eq!(map.total_probability(), 1.0);
}

#[test]
fn test_unknown_probability_column() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("foo.fits");
    write_skymap_fits(&path, "FOO", Some(Ordering::Nested), &[0.1; 12], &[], &[]).unwrap();

    let error = read_skymap(&path).unwrap_err();
    assert!(matches!(
        error,
        SkyMapReadError::Configuration(ConfigurationError::UnrecognizedSkyMap(_))
    ));
}

#[test]
fn test_truncated_download_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("full.fits");
    write_skymap_fits(&path, "PROB", Some(Ordering::Nested), &[1.0 / 12.0; 12], &[], &[]).unwrap();
    let bytes = std::fs::read(&path).unwrap();
    // primary HDU, one header block for the table, then the data
    assert!(bytes.len() > 2 * 2880);

    // cut right after the table header, and in the middle of it
    for len in [2 * 2880, 2880 + 880] {
        let truncated = dir.path().join(format!("truncated-{}.fits", len));
        std::fs::write(&truncated, &bytes[..len]).unwrap();
        assert!(read_skymap(&truncated).is_err(), "{} bytes were accepted", len);
    }
}

#[test]
fn test_gravitational_wave_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("S190425z.fits");
    let probs = peaked(48, &[(5, 0.6), (6, 0.3), (7, 0.1)]);
    write_skymap_fits(
        &path,
        "PROB",
        Some(Ordering::Nested),
        &probs,
        &[("DATE-OBS", "2019-04-25T08:18:05"), ("OBJECT", "S190425z")],
        &[],
    )
    .unwrap();

    let event = GravitationalWave::from_file(None, NoticeType::Initial, &path, 0.9).unwrap();
    assert_eq!(event.name(), "S190425z");
    assert_eq!(event.credible_region().pixels(), &[5, 6, 7]);
    assert_eq!(event.distance(), None);
    assert!(event.tiling_line().starts_with("The 90% credible region spans"));

    let error = GravitationalWave::from_file(Some("S190425z"), NoticeType::Retraction, &path, 0.9)
        .unwrap_err();
    assert!(matches!(error, EventError::Retracted { .. }));
}
