//! How much of a localisation the survey actually observed.
//!
//! Each observation covers a square field; the region's pixels are counted
//! once observed, and twice observed when the observations of a pixel span
//! more than a minimum separation. Pixels near the galactic plane are
//! tracked apart, since transient searches there are unreliable.
use crate::conf::ConfigurationError;
use crate::skymap::{depth_of, n_pixels, pixel_center, PixelSet, FULL_SKY_DEG2};
use crate::utils::spatial::{galactic_latitude, iso_to_jd, TimeParseError};

use cdshealpix::nested;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::f64::consts::TAU;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// Half the side of a survey field, degrees.
pub const FIELD_HALF_WIDTH_DEG: f64 = 3.5;
/// Pixels with |b| at or below this are counted as galactic plane.
pub const PLANE_LATITUDE_DEG: f64 = 10.0;
pub const DEFAULT_MIN_SEP_DAYS: f64 = 0.01;

#[derive(thiserror::Error, Debug)]
pub enum CoverageError {
    #[error("no observation overlaps the search region")]
    NoObservations,
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("could not read observation log")]
    Csv(#[from] csv::Error),
    #[error("invalid observation time")]
    Time(#[from] TimeParseError),
    #[error("observation log row {row}: {reason}")]
    MalformedRow { row: usize, reason: String },
}

/// One pointing of the survey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldObservation {
    pub field: u32,
    pub ra: f64,
    pub dec: f64,
    pub jd: f64,
}

/// Source of survey pointings.
pub trait ObservationLog {
    /// Pointings taken within `[t_min_jd, t_max_jd]`, in time order.
    fn observations(
        &self,
        t_min_jd: f64,
        t_max_jd: f64,
    ) -> Result<Vec<FieldObservation>, CoverageError>;
}

#[derive(Debug, Deserialize)]
struct ObservationRow {
    field: u32,
    ra: f64,
    dec: f64,
    #[serde(default)]
    jd: Option<f64>,
    #[serde(default)]
    datetime: Option<String>,
}

/// Observation log kept as CSV with `field,ra,dec` and either `jd` or an
/// ISO-8601 `datetime` column.
#[derive(Debug, Clone)]
pub struct CsvObservationLog {
    path: PathBuf,
}

impl CsvObservationLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        CsvObservationLog {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ObservationLog for CsvObservationLog {
    #[instrument(skip(self), fields(path = %self.path.display()), err)]
    fn observations(
        &self,
        t_min_jd: f64,
        t_max_jd: f64,
    ) -> Result<Vec<FieldObservation>, CoverageError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(&self.path)?;
        let mut observations = Vec::new();
        for (row, result) in reader.deserialize::<ObservationRow>().enumerate() {
            let raw = result?;
            let jd = match (raw.jd, raw.datetime.as_deref()) {
                (Some(jd), _) => jd,
                (None, Some(datetime)) => iso_to_jd(datetime)?,
                (None, None) => {
                    return Err(CoverageError::MalformedRow {
                        row: row + 1,
                        reason: "neither 'jd' nor 'datetime' is set".to_string(),
                    })
                }
            };
            if (t_min_jd..=t_max_jd).contains(&jd) {
                observations.push(FieldObservation {
                    field: raw.field,
                    ra: raw.ra,
                    dec: raw.dec,
                    jd,
                });
            }
        }
        observations.sort_by(|a, b| a.jd.total_cmp(&b.jd));
        debug!(n_observations = observations.len(), "read observation log");
        Ok(observations)
    }
}

/// Result of [`estimate_coverage`]. Probabilities are fractions of the
/// region's total weight.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageEstimate {
    pub nside: u32,
    pub observed_prob: f64,
    pub plane_prob: f64,
    pub double_prob: f64,
    pub double_extragalactic_prob: f64,
    pub observed_area_deg2: f64,
    pub plane_area_deg2: f64,
    pub double_extragalactic_area_deg2: f64,
    pub first_observation_jd: f64,
    pub last_observation_jd: f64,
    pub fields: Vec<u32>,
}

impl CoverageEstimate {
    pub fn summary_line(&self) -> String {
        format!(
            "In total, {:.2} % of the region was observed at least once, including {:.2} % \
             at a galactic latitude below {:.0} deg. {:.2} % was observed at least twice, \
             and {:.2} % at least twice outside the galactic plane. ",
            100.0 * self.observed_prob,
            100.0 * self.plane_prob,
            PLANE_LATITUDE_DEG,
            100.0 * self.double_prob,
            100.0 * self.double_extragalactic_prob,
        )
    }
}

/// Corners of the square field centered on (ra, dec), radians, from the
/// gnomonic projection so fields near the poles stay square.
fn field_vertices(ra: f64, dec: f64, half_width_deg: f64) -> Vec<(f64, f64)> {
    let (ra0, dec0) = (ra.to_radians(), dec.to_radians());
    let h = half_width_deg.to_radians().tan();
    [(-h, -h), (h, -h), (h, h), (-h, h)]
        .into_iter()
        .map(|(x, y)| {
            let rho = (x * x + y * y).sqrt();
            let c = rho.atan();
            let lat = (c.cos() * dec0.sin() + y * c.sin() * dec0.cos() / rho).asin();
            let lon = ra0
                + (x * c.sin()).atan2(rho * dec0.cos() * c.cos() - y * dec0.sin() * c.sin());
            (lon.rem_euclid(TAU), lat)
        })
        .collect()
}

/// Nested pixels at `depth` overlapping the field of one observation.
fn footprint(depth: u8, observation: &FieldObservation) -> Vec<u64> {
    let vertices = field_vertices(observation.ra, observation.dec, FIELD_HALF_WIDTH_DEG);
    nested::polygon_coverage(depth, &vertices, true)
        .flat_iter()
        .collect()
}

/// Overlap of `observations` with the weighted pixels of a region.
///
/// A pixel counts as observed twice when its observation times span more
/// than `min_sep_days`.
#[instrument(skip_all, fields(nside = pixels.nside, n_pixels = pixels.pixels.len()), err)]
pub fn estimate_coverage(
    pixels: &PixelSet,
    observations: &[FieldObservation],
    min_sep_days: f64,
) -> Result<CoverageEstimate, CoverageError> {
    let depth = depth_of(pixels.nside)?;
    let index: HashMap<u64, usize> = pixels
        .pixels
        .iter()
        .enumerate()
        .map(|(i, hash)| (*hash, i))
        .collect();

    let mut times: Vec<Vec<f64>> = vec![Vec::new(); pixels.pixels.len()];
    let mut fields = BTreeSet::new();
    for observation in observations {
        let mut hit = false;
        for hash in footprint(depth, observation) {
            if let Some(&i) = index.get(&hash) {
                times[i].push(observation.jd);
                hit = true;
            }
        }
        if hit {
            fields.insert(observation.field);
        }
    }

    let total = pixels.total_weight();
    let pixel_area = FULL_SKY_DEG2 / n_pixels(pixels.nside) as f64;
    let (mut observed, mut plane, mut double, mut double_extragalactic) = (0.0, 0.0, 0.0, 0.0);
    let (mut n_observed, mut n_plane, mut n_double_extragalactic) = (0usize, 0usize, 0usize);
    let mut first = f64::INFINITY;
    let mut last = f64::NEG_INFINITY;

    for ((hash, weight), seen) in pixels.pixels.iter().zip(&pixels.weights).zip(&times) {
        if seen.is_empty() {
            continue;
        }
        let (ra, dec) = pixel_center(depth, *hash);
        let in_plane = galactic_latitude(ra, dec).abs() <= PLANE_LATITUDE_DEG;
        let earliest = seen.iter().copied().fold(f64::INFINITY, f64::min);
        let latest = seen.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        first = first.min(earliest);
        last = last.max(latest);

        n_observed += 1;
        observed += weight;
        if in_plane {
            n_plane += 1;
            plane += weight;
        }
        if latest - earliest > min_sep_days {
            double += weight;
            if !in_plane {
                n_double_extragalactic += 1;
                double_extragalactic += weight;
            }
        }
    }

    if n_observed == 0 {
        return Err(CoverageError::NoObservations);
    }
    let norm = if total > 0.0 { total } else { 1.0 };
    let estimate = CoverageEstimate {
        nside: pixels.nside,
        observed_prob: observed / norm,
        plane_prob: plane / norm,
        double_prob: double / norm,
        double_extragalactic_prob: double_extragalactic / norm,
        observed_area_deg2: n_observed as f64 * pixel_area,
        plane_area_deg2: n_plane as f64 * pixel_area,
        double_extragalactic_area_deg2: n_double_extragalactic as f64 * pixel_area,
        first_observation_jd: first,
        last_observation_jd: last,
        fields: fields.into_iter().collect(),
    };
    info!(
        observed_prob = estimate.observed_prob,
        double_prob = estimate.double_prob,
        n_fields = estimate.fields.len(),
        "coverage estimated"
    );
    Ok(estimate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::CircleRegion;
    use crate::skymap::SkyRegion;
    use crate::utils::spatial::great_circle_distance_deg;
    use std::io::Write;

    fn region_pixels(ra: f64, dec: f64) -> PixelSet {
        CircleRegion::new(ra, dec, 1.0)
            .unwrap()
            .search_pixels(64)
            .unwrap()
    }

    fn obs(field: u32, ra: f64, dec: f64, jd: f64) -> FieldObservation {
        FieldObservation { field, ra, dec, jd }
    }

    #[test]
    fn test_field_vertices_are_square() {
        for dec in [0.0, 45.0, 85.0] {
            let vertices = field_vertices(120.0, dec, FIELD_HALF_WIDTH_DEG);
            for (lon, lat) in vertices {
                let distance =
                    great_circle_distance_deg(120.0, dec, lon.to_degrees(), lat.to_degrees());
                // half diagonal of a 7 deg square
                assert!((distance - 4.945).abs() < 0.01, "{}", distance);
            }
        }
    }

    #[test]
    fn test_single_and_double_coverage() {
        let pixels = region_pixels(150.0, 30.0);
        let once = estimate_coverage(&pixels, &[obs(600, 150.0, 30.0, 2459000.6)], 0.01).unwrap();
        assert!((once.observed_prob - 1.0).abs() < 1e-9);
        assert_eq!(once.double_prob, 0.0);
        assert_eq!(once.plane_prob, 0.0);
        assert_eq!(once.fields, vec![600]);

        let twice = estimate_coverage(
            &pixels,
            &[
                obs(600, 150.0, 30.0, 2459000.6),
                obs(601, 150.5, 30.5, 2459000.7),
                obs(900, 10.0, -40.0, 2459000.8),
            ],
            0.01,
        )
        .unwrap();
        assert!((twice.double_prob - 1.0).abs() < 1e-9);
        assert!((twice.double_extragalactic_prob - 1.0).abs() < 1e-9);
        assert_eq!(twice.fields, vec![600, 601]);
        assert_eq!(twice.first_observation_jd, 2459000.6);
        assert_eq!(twice.last_observation_jd, 2459000.7);
        assert!(twice.summary_line().starts_with("In total, 100.00 %"));
    }

    #[test]
    fn test_galactic_plane_is_tracked_apart() {
        // close to the galactic center
        let pixels = region_pixels(266.4, -28.9);
        let estimate = estimate_coverage(
            &pixels,
            &[obs(1, 266.4, -28.9, 2459000.6), obs(1, 266.4, -28.9, 2459001.6)],
            0.01,
        )
        .unwrap();
        assert!((estimate.plane_prob - 1.0).abs() < 1e-9);
        assert!((estimate.double_prob - 1.0).abs() < 1e-9);
        assert_eq!(estimate.double_extragalactic_prob, 0.0);
        assert_eq!(estimate.double_extragalactic_area_deg2, 0.0);
    }

    #[test]
    fn test_no_overlap() {
        let pixels = region_pixels(150.0, 30.0);
        let error = estimate_coverage(&pixels, &[obs(1, 330.0, -60.0, 2459000.6)], 0.01).unwrap_err();
        assert!(matches!(error, CoverageError::NoObservations));
        assert!(matches!(
            estimate_coverage(&pixels, &[], 0.01),
            Err(CoverageError::NoObservations)
        ));
    }

    #[test]
    fn test_csv_log() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "field,ra,dec,datetime").unwrap();
        writeln!(file, "600,150.0,30.0,2020-05-31T12:00:00").unwrap();
        writeln!(file, "601,150.5,30.5,2020-05-30 12:00:00").unwrap();
        writeln!(file, "602,151.0,31.0,2021-01-01T00:00:00").unwrap();
        file.flush().unwrap();

        let log = CsvObservationLog::new(file.path());
        let observations = log.observations(2459000.0, 2459010.0).unwrap();
        let fields: Vec<u32> = observations.iter().map(|o| o.field).collect();
        assert_eq!(fields, vec![601, 600]);
        assert_eq!(observations[1].jd, 2459001.0);
    }
}
