//! Rendering the candidate cache for humans and downstream tools.
//!
//! The scanner hands a [`ScanReport`] to a [`ReportSink`]; the sink decides
//! where it goes. [`DirectoryReport`] writes a JSON dump, a plain-text draft
//! with a candidate table and, optionally, the image cutouts.
use crate::alert::AlertRecord;
use crate::archive::AlertArchive;
use crate::catalog::{CatalogMatch, CatalogMatcher};
use crate::conf::ConfigurationError;
use crate::coverage::{estimate_coverage, CoverageError, CoverageEstimate, FieldObservation};
use crate::event::EventContext;
use crate::scanner::ScanSummary;
use crate::utils::o11y::logging::WARN;
use crate::utils::photometry::{absolute_magnitude, luminosity_distance_mpc};
use crate::utils::spatial::{band_name, galactic_latitude, jd_to_datetime, now_jd};
use crate::log_error;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const TABLE_RULE: &str =
    "+--------------------------------------------------------------------------------+\n";
const TABLE_HEADER: &str =
    "| ZTF Name     | IAU Name  | RA (deg)    | DEC (deg)   | Filter | Mag   | MagErr |\n";
/// Appended to the header when a distance to the event is known.
const ABS_MAG_HEADER: &str = " AbsMag |";
const NO_EXTERNAL_NAME: &str = " ------- ";
const LATE_FLAG: &str = "(MORE THAN ONE DAY SINCE SECOND DETECTION)";
/// Candidates closer than this to the galactic plane get a note.
const LOW_LATITUDE_NOTE_DEG: f64 = 15.0;

#[derive(thiserror::Error, Debug)]
pub enum ReportError {
    #[error("could not write report")]
    Io(#[from] std::io::Error),
    #[error("could not serialize report")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("could not estimate coverage")]
    Coverage(#[from] CoverageError),
}

/// What a scan hands to its sink when it finishes.
pub struct ScanReport<'a> {
    pub event: &'a dyn EventContext,
    pub candidates: &'a BTreeMap<String, AlertRecord>,
    pub summary: &'a ScanSummary,
}

#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn publish(&self, report: &ScanReport<'_>) -> Result<(), ReportError>;
}

/// Fixed-width table of the candidates, one row per object at its latest
/// detection.
///
/// Rows are flagged when the second detection is more than a day older
/// than `now_jd`. Records without a usable detection are left out. With a
/// distance in Mpc, a column of absolute magnitudes is added.
pub fn candidate_table(
    candidates: &BTreeMap<String, AlertRecord>,
    matches: &HashMap<String, CatalogMatch>,
    now_jd: f64,
    distance_mpc: Option<f64>,
) -> String {
    let distance_mpc = distance_mpc.filter(|d| d.is_finite() && *d > 0.0);
    let (rule, header) = match distance_mpc {
        Some(_) => (
            format!("+{}+\n", "-".repeat(TABLE_RULE.len() - 3 + ABS_MAG_HEADER.len())),
            format!("{}{}\n", TABLE_HEADER.trim_end_matches('\n'), ABS_MAG_HEADER),
        ),
        None => (TABLE_RULE.to_string(), TABLE_HEADER.to_string()),
    };
    let mut table = String::new();
    table.push_str(&rule);
    table.push_str(&header);
    table.push_str(&rule);
    for (name, record) in candidates {
        let Some(latest) = record.latest_detection() else {
            warn!(object_id = %name, "no detection to tabulate");
            continue;
        };
        let (Some(ra), Some(dec), Some(mag), Some(mag_err)) =
            (latest.ra, latest.dec, latest.magpsf, latest.sigmapsf)
        else {
            warn!(object_id = %name, "latest detection lacks position or photometry");
            continue;
        };
        let mut jds: Vec<f64> = record.detections().filter_map(|d| d.jd).collect();
        jds.sort_by(f64::total_cmp);
        let late = jds
            .first()
            .and_then(|first| jds.iter().find(|jd| **jd > first + 0.01))
            .is_some_and(|second| now_jd - second > 1.0);
        let external = matches
            .get(name)
            .map(|found| found.name.as_str())
            .unwrap_or(NO_EXTERNAL_NAME);
        let mut row = format!(
            "| {} | {:<9} | {:011.7} | {:+011.7} | {}      | {:.2} | {:.2}   |",
            name,
            external,
            ra,
            dec,
            band_name(latest.fid.unwrap_or_default()),
            mag,
            mag_err,
        );
        if let Some(abs_mag) = distance_mpc.and_then(|d| absolute_magnitude(mag, d)) {
            let _ = write!(row, " {:>6.1} |", abs_mag);
        }
        let _ = writeln!(table, "{} {} ", row, if late { LATE_FLAG } else { "" });
    }
    table.push_str(&rule);
    table
}

/// The brightest detection of a candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeakMagnitude {
    pub object_id: String,
    pub magpsf: f64,
    pub band: &'static str,
    pub jd: f64,
}

impl PeakMagnitude {
    pub fn summary_line(&self) -> String {
        let when = match jd_to_datetime(self.jd) {
            Some(dt) => dt.format("%Y-%m-%d %H:%M UTC").to_string(),
            None => format!("JD {:.1}", self.jd),
        };
        format!(
            "Candidate {} peaked at {:.1} on {} with filter {}.",
            self.object_id, self.magpsf, when, self.band
        )
    }
}

/// Brightest detection of every candidate, ordered by object id.
///
/// Upper limits never count, and candidates without a detected magnitude
/// are left out.
pub fn peak_mag_summary(candidates: &BTreeMap<String, AlertRecord>) -> Vec<PeakMagnitude> {
    candidates
        .iter()
        .filter_map(|(name, record)| {
            let (detection, magpsf, jd) = record
                .detections()
                .filter_map(|d| Some((d, d.magpsf?, d.jd?)))
                .min_by(|a, b| a.1.total_cmp(&b.1))?;
            Some(PeakMagnitude {
                object_id: name.clone(),
                magpsf,
                band: band_name(detection.fid.unwrap_or_default()),
                jd,
            })
        })
        .collect()
}

/// One paragraph per candidate: timing relative to the event, the last
/// upper limit, a low-latitude note and the catalog match if any.
pub fn text_summary(
    candidates: &BTreeMap<String, AlertRecord>,
    event: &dyn EventContext,
    matches: &HashMap<String, CatalogMatch>,
) -> String {
    let mut text = String::new();
    for (name, record) in candidates {
        let Some(first_jd) = record.first_detection().and_then(|d| d.jd) else {
            continue;
        };
        text.push_str(&event.candidate_text(name, first_jd, record.last_upper_limit()));
        if let (Ok(ra), Ok(dec)) = (record.ra(), record.dec()) {
            let b = galactic_latitude(ra, dec);
            if b.abs() < LOW_LATITUDE_NOTE_DEG {
                let _ = write!(text, "It is located at a galactic latitude of {:.2} degrees. ", b);
            }
        }
        if let Some(found) = matches.get(name) {
            let _ = write!(
                text,
                "It matches {} entry {} at {:.1} arcsec",
                found.catalog, found.name, found.distance_arcsec
            );
            if let Some(group) = &found.group {
                let _ = write!(text, ", reported by {}", group);
            }
            if let Some(date) = &found.date {
                let _ = write!(text, " on {}", date);
            }
            text.push_str(". ");
            if let Some(redshift) = found.redshift.filter(|z| *z > 0.0) {
                let latest_mag = record.latest_detection().and_then(|d| d.magpsf);
                if let (Some(distance), Some(mag)) = (luminosity_distance_mpc(redshift), latest_mag) {
                    if let Some(abs_mag) = absolute_magnitude(mag, distance) {
                        let _ = write!(
                            text,
                            "It has a redshift of {:.3} [{:.0} Mpc] and an abs. mag of {:.1}. ",
                            redshift, distance, abs_mag
                        );
                    }
                }
            }
        }
        text.push('\n');
    }
    text
}

#[derive(Serialize)]
struct CandidateDump<'a> {
    event: &'a str,
    summary: &'a ScanSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    coverage: Option<&'a CoverageEstimate>,
    matches: &'a HashMap<String, CatalogMatch>,
    peaks: &'a [PeakMagnitude],
    candidates: &'a BTreeMap<String, AlertRecord>,
}

/// Writes `candidates.json`, `summary.txt` and `cutouts/` into a directory.
pub struct DirectoryReport {
    dir: PathBuf,
    matcher: Option<(Arc<dyn CatalogMatcher>, f64)>,
    cutouts: Option<Arc<dyn AlertArchive>>,
    observations: Option<Vec<FieldObservation>>,
    coverage_nside: u32,
    min_sep_days: f64,
}

impl DirectoryReport {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        DirectoryReport {
            dir: dir.as_ref().to_path_buf(),
            matcher: None,
            cutouts: None,
            observations: None,
            coverage_nside: 64,
            min_sep_days: crate::coverage::DEFAULT_MIN_SEP_DAYS,
        }
    }

    /// Look every candidate up in external catalogs within `radius_arcsec`.
    pub fn with_matcher(mut self, matcher: Arc<dyn CatalogMatcher>, radius_arcsec: f64) -> Self {
        self.matcher = Some((matcher, radius_arcsec));
        self
    }

    /// Fetch the cutouts of every candidate's latest alert.
    pub fn with_cutouts(mut self, archive: Arc<dyn AlertArchive>) -> Self {
        self.cutouts = Some(archive);
        self
    }

    /// Add a coverage estimate from survey pointings.
    pub fn with_observations(mut self, observations: Vec<FieldObservation>) -> Self {
        self.observations = Some(observations);
        self
    }

    pub fn with_coverage_nside(mut self, nside: u32) -> Self {
        self.coverage_nside = nside;
        self
    }

    async fn cross_match(
        &self,
        candidates: &BTreeMap<String, AlertRecord>,
    ) -> HashMap<String, CatalogMatch> {
        let mut matches = HashMap::new();
        let Some((matcher, radius_arcsec)) = &self.matcher else {
            return matches;
        };
        for (name, record) in candidates {
            let Some((ra, dec)) = record
                .latest_detection()
                .and_then(|latest| Some((latest.ra?, latest.dec?)))
            else {
                continue;
            };
            match matcher.best_match(ra, dec, *radius_arcsec).await {
                Ok(Some(found)) => {
                    matches.insert(name.clone(), found);
                }
                Ok(None) => {}
                Err(error) => log_error!(WARN, error, "catalog lookup failed for {}", name),
            }
        }
        matches
    }

    fn coverage(&self, event: &dyn EventContext) -> Result<Option<CoverageEstimate>, ReportError> {
        let Some(observations) = &self.observations else {
            return Ok(None);
        };
        let pixels = event.region().search_pixels(self.coverage_nside)?;
        match estimate_coverage(&pixels, observations, self.min_sep_days) {
            Ok(estimate) => Ok(Some(estimate)),
            Err(CoverageError::NoObservations) => {
                warn!(event = event.name(), "no observation overlaps the search region");
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn write_cutouts(&self, candidates: &BTreeMap<String, AlertRecord>) -> Result<(), ReportError> {
        let Some(archive) = &self.cutouts else {
            return Ok(());
        };
        for (name, record) in candidates {
            let Some(candid) = record.candid.or(record.candidate.candid) else {
                continue;
            };
            let cutouts = match archive.get_cutouts(candid).await {
                Ok(cutouts) => cutouts,
                Err(error) => {
                    log_error!(WARN, error, "could not fetch cutouts for {}", name);
                    continue;
                }
            };
            let dir = self.dir.join("cutouts").join(name);
            tokio::fs::create_dir_all(&dir).await?;
            for (kind, bytes) in cutouts {
                tokio::fs::write(dir.join(format!("{}.fits.gz", kind)), bytes).await?;
            }
            debug!(object_id = %name, candid, "cutouts written");
        }
        Ok(())
    }

    fn draft(
        report: &ScanReport<'_>,
        coverage: Option<&CoverageEstimate>,
        matches: &HashMap<String, CatalogMatch>,
        peaks: &[PeakMagnitude],
    ) -> String {
        let event = report.event;
        let mut text = format!(
            "We searched the localization region of the {}. {}",
            event.full_name(),
            event.tiling_line()
        );
        if let Some(coverage) = coverage {
            text.push_str(&coverage.summary_line());
        }
        let _ = write!(
            text,
            "\n\nWe rejected stellar sources and moving objects, applying machine-learned \
             quality cuts {}. We are left with the following {} candidates.\n\n{}\n",
            event.remove_variability_line(),
            report.candidates.len(),
            candidate_table(
                report.candidates,
                matches,
                now_jd(),
                event.distance().map(|distance| distance.mean_mpc),
            ),
        );
        if let Some(distance) = event.distance() {
            let _ = write!(
                text,
                "The distance estimate is {:.0} [{:.0} - {:.0}] Mpc.\n\n",
                distance.mean_mpc,
                distance.mean_mpc - distance.std_mpc,
                distance.mean_mpc + distance.std_mpc
            );
        }
        let _ = write!(
            text,
            "Amongst our candidates, \n{}\n",
            text_summary(report.candidates, event, matches)
        );
        for peak in peaks {
            text.push_str(&peak.summary_line());
            text.push('\n');
        }
        text
    }
}

#[async_trait]
impl ReportSink for DirectoryReport {
    #[instrument(skip_all, fields(dir = %self.dir.display(), event = report.event.name()), err)]
    async fn publish(&self, report: &ScanReport<'_>) -> Result<(), ReportError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let matches = self.cross_match(report.candidates).await;
        let coverage = self.coverage(report.event)?;
        let peaks = peak_mag_summary(report.candidates);

        let dump = CandidateDump {
            event: report.event.name(),
            summary: report.summary,
            coverage: coverage.as_ref(),
            matches: &matches,
            peaks: &peaks,
            candidates: report.candidates,
        };
        tokio::fs::write(
            self.dir.join("candidates.json"),
            serde_json::to_vec_pretty(&dump)?,
        )
        .await?;
        tokio::fs::write(
            self.dir.join("summary.txt"),
            Self::draft(report, coverage.as_ref(), &matches, &peaks),
        )
        .await?;
        self.write_cutouts(report.candidates).await?;

        info!(n_candidates = report.candidates.len(), "report written");
        Ok(())
    }
}
