// Utilities for unit and integration tests
use crate::alert::{AlertRecord, Detection};
use crate::archive::{AlertArchive, ArchiveError, RemoteServiceError, RequestError};
use crate::skymap::{Ordering, SkyRegion};
use crate::utils::spatial::great_circle_distance_deg;

use async_trait::async_trait;
use fitsio::tables::{ColumnDataType, ColumnDescription};
use fitsio::FitsFile;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

pub const TEST_CONFIG_FILE: &str = "tests/config.test.yaml";

/// Default position of records built by [`alert`].
pub const DEFAULT_RA: f64 = 150.0;
pub const DEFAULT_DEC: f64 = 30.0;

/// A record for `object_id` detected at `jd` that passes every filter stage
/// for an event window starting up to one day before `jd`.
///
/// The history holds a positive detection half a day earlier (first in
/// `prv_candidates`) and an upper limit two days earlier.
pub fn alert(object_id: &str, jd: f64) -> AlertRecord {
    alert_at(object_id, jd, DEFAULT_RA, DEFAULT_DEC)
}

pub fn alert_at(object_id: &str, jd: f64, ra: f64, dec: f64) -> AlertRecord {
    let candid = ((jd - 2_400_000.0) * 1e6) as i64;
    let candidate = Detection {
        jd: Some(jd),
        candid: Some(candid),
        fid: Some(2),
        ra: Some(ra),
        dec: Some(dec),
        magpsf: Some(19.0),
        sigmapsf: Some(0.1),
        diffmaglim: Some(20.5),
        isdiffpos: Some(true),
        jdstarthist: Some(jd - 0.5),
        jdendhist: Some(jd),
        ndethist: Some(2),
        rb: Some(0.9),
        drb: Some(0.99),
        fwhm: Some(2.0),
        elong: Some(1.1),
        magdiff: Some(0.1),
        nbad: Some(0),
        ssdistnr: Some(-999.0),
        ssmagnr: Some(-999.0),
        distpsnr1: Some(10.0),
        sgscore1: Some(0.1),
        programid: Some(1),
        ..Default::default()
    };
    let previous = Detection {
        jd: Some(jd - 0.5),
        candid: Some(candid - 500_000),
        fid: Some(1),
        ra: Some(ra),
        dec: Some(dec),
        magpsf: Some(19.4),
        sigmapsf: Some(0.12),
        diffmaglim: Some(20.4),
        isdiffpos: Some(true),
        ..Default::default()
    };
    let upper_limit = Detection {
        jd: Some(jd - 2.0),
        fid: Some(2),
        diffmaglim: Some(20.3),
        ..Default::default()
    };
    AlertRecord {
        object_id: object_id.to_string(),
        candid: Some(candid),
        candidate,
        prv_candidates: vec![previous, upper_limit],
    }
}

/// A region covering the whole sky.
pub struct Everywhere;

impl SkyRegion for Everywhere {
    fn contains(&self, _ra: f64, _dec: f64) -> bool {
        true
    }

    fn bounding_cone(&self) -> (f64, f64, f64) {
        (0.0, 0.0, 180.0)
    }
}

/// A request the mock archive received.
#[derive(Debug, Clone, PartialEq)]
pub enum ArchiveCall {
    Cone { ra: f64, dec: f64, radius_deg: f64 },
    Object { object_id: String, with_history: bool },
    Timerange { t_min_jd: f64, t_max_jd: f64 },
    Cutouts(i64),
}

/// In-memory archive serving a fixed set of alerts.
///
/// Cone and time-range searches answer from the latest alerts, without
/// history; object searches answer from every alert registered for the
/// object. Cone searches can be told to start failing after a number of
/// successful calls.
#[derive(Default)]
pub struct MockArchive {
    alerts: Vec<AlertRecord>,
    histories: HashMap<String, Vec<AlertRecord>>,
    fail_cones_after: Mutex<Option<usize>>,
    calls: Mutex<Vec<ArchiveCall>>,
}

impl MockArchive {
    pub fn new() -> Self {
        MockArchive::default()
    }

    /// Register an alert, searchable by cone, time range and object id.
    pub fn with_alert(mut self, record: AlertRecord) -> Self {
        self.histories
            .entry(record.object_id.clone())
            .or_default()
            .push(record.clone());
        self.alerts.push(record);
        self
    }

    /// Register an older alert only returned by object searches.
    pub fn with_history(mut self, record: AlertRecord) -> Self {
        self.histories
            .entry(record.object_id.clone())
            .or_default()
            .push(record);
        self
    }

    pub fn fail_cones_after(&self, successes: usize) {
        *self.fail_cones_after.lock().unwrap() = Some(successes);
    }

    pub fn recover(&self) {
        *self.fail_cones_after.lock().unwrap() = None;
    }

    pub fn calls(&self) -> Vec<ArchiveCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn cone_calls(&self) -> Vec<(f64, f64)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ArchiveCall::Cone { ra, dec, .. } => Some((ra, dec)),
                _ => None,
            })
            .collect()
    }

    pub fn object_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ArchiveCall::Object { object_id, .. } => Some(object_id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: ArchiveCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn without_history(record: &AlertRecord) -> AlertRecord {
        AlertRecord {
            prv_candidates: Vec::new(),
            ..record.clone()
        }
    }
}

#[async_trait]
impl AlertArchive for MockArchive {
    async fn cone_search(
        &self,
        ra: f64,
        dec: f64,
        radius_deg: f64,
        t_min_jd: f64,
        t_max_jd: f64,
    ) -> Result<Vec<AlertRecord>, ArchiveError> {
        self.record(ArchiveCall::Cone {
            ra,
            dec,
            radius_deg,
        });
        {
            let mut fail_after = self.fail_cones_after.lock().unwrap();
            match fail_after.as_mut() {
                Some(0) => {
                    return Err(RemoteServiceError {
                        service: "mock archive".to_string(),
                        operation: "cone_search".to_string(),
                        attempts: 1,
                        elapsed: Duration::ZERO,
                        last_error: RequestError::Unavailable("archive offline".to_string()),
                    }
                    .into())
                }
                Some(remaining) => *remaining -= 1,
                None => {}
            }
        }
        Ok(self
            .alerts
            .iter()
            .filter(|record| {
                let (Some(jd), Some(a_ra), Some(a_dec)) =
                    (record.candidate.jd, record.candidate.ra, record.candidate.dec)
                else {
                    return true;
                };
                jd >= t_min_jd
                    && jd <= t_max_jd
                    && great_circle_distance_deg(ra, dec, a_ra, a_dec) <= radius_deg
            })
            .map(Self::without_history)
            .collect())
    }

    async fn object_search(
        &self,
        object_id: &str,
        with_history: bool,
    ) -> Result<Vec<AlertRecord>, ArchiveError> {
        self.record(ArchiveCall::Object {
            object_id: object_id.to_string(),
            with_history,
        });
        let records = self.histories.get(object_id).cloned().unwrap_or_default();
        Ok(if with_history {
            records
        } else {
            records.iter().map(Self::without_history).collect()
        })
    }

    async fn timerange_search(
        &self,
        t_min_jd: f64,
        t_max_jd: f64,
        with_history: bool,
        _chunk_size: usize,
    ) -> Result<Vec<AlertRecord>, ArchiveError> {
        self.record(ArchiveCall::Timerange { t_min_jd, t_max_jd });
        Ok(self
            .alerts
            .iter()
            .filter(|record| {
                record
                    .candidate
                    .jd
                    .is_some_and(|jd| jd >= t_min_jd && jd <= t_max_jd)
            })
            .map(|record| {
                if with_history {
                    record.clone()
                } else {
                    Self::without_history(record)
                }
            })
            .collect())
    }

    async fn get_cutouts(&self, candid: i64) -> Result<HashMap<String, Vec<u8>>, ArchiveError> {
        self.record(ArchiveCall::Cutouts(candid));
        Ok(HashMap::from([
            ("cutoutScience".to_string(), vec![0x1f, 0x8b, 1]),
            ("cutoutTemplate".to_string(), vec![0x1f, 0x8b, 2]),
            ("cutoutDifference".to_string(), vec![0x1f, 0x8b, 3]),
        ]))
    }
}

/// Write a HEALPix map with a single double column to a new FITS file.
///
/// `NSIDE` follows from the number of pixels. `text_keys` and
/// `number_keys` are extra header keys of the table HDU.
pub fn write_skymap_fits(
    path: impl AsRef<Path>,
    column: &str,
    ordering: Option<Ordering>,
    probabilities: &[f64],
    text_keys: &[(&str, &str)],
    number_keys: &[(&str, f64)],
) -> Result<(), fitsio::errors::Error> {
    let mut fptr = FitsFile::create(path.as_ref()).open()?;
    let description = ColumnDescription::new(column)
        .with_type(ColumnDataType::Double)
        .create()?;
    let hdu = fptr.create_table("PROBMAP".to_string(), &[description])?;
    hdu.write_col(&mut fptr, column, probabilities)?;

    let nside = ((probabilities.len() / 12) as f64).sqrt().round() as i64;
    hdu.write_key(&mut fptr, "PIXTYPE", "HEALPIX")?;
    hdu.write_key(&mut fptr, "NSIDE", nside)?;
    match ordering {
        Some(Ordering::Nested) => hdu.write_key(&mut fptr, "ORDERING", "NESTED")?,
        Some(Ordering::Ring) => hdu.write_key(&mut fptr, "ORDERING", "RING")?,
        None => {}
    }
    for (key, value) in text_keys {
        hdu.write_key(&mut fptr, key, *value)?;
    }
    for (key, value) in number_keys {
        hdu.write_key(&mut fptr, key, *value)?;
    }
    Ok(())
}
