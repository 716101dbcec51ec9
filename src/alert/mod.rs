//! Alert records returned by the archive, and the history merger.
pub mod merge;

pub use merge::merge;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::skip_serializing_none;
use std::collections::HashMap;

/// A record is missing a field that a filter stage or the merger needs.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("alert for {object_id} is missing required field '{field}'")]
pub struct MalformedAlert {
    pub object_id: String,
    pub field: &'static str,
}

fn deserialize_isdiffpos_option<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: serde_json::Value = Deserialize::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(Some(
            s.eq_ignore_ascii_case("t") || s.eq_ignore_ascii_case("true") || s == "1",
        )),
        serde_json::Value::Number(n) => Ok(Some(n.as_i64() == Some(1))),
        serde_json::Value::Bool(b) => Ok(Some(b)),
        _ => Ok(None),
    }
}

fn serialize_isdiffpos_option<S>(value: &Option<bool>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(true) => serializer.serialize_str("t"),
        Some(false) => serializer.serialize_str("f"),
        None => serializer.serialize_none(),
    }
}

fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One detection (or upper limit) of an object.
///
/// Everything is optional on the wire: previous upper limits carry little
/// more than `jd`, `fid` and `diffmaglim`. Fields the scanner never reads
/// are kept in `extra` so records survive a round trip.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub jd: Option<f64>,
    pub candid: Option<i64>,
    pub fid: Option<i32>,
    pub ra: Option<f64>,
    pub dec: Option<f64>,
    pub magpsf: Option<f64>,
    pub sigmapsf: Option<f64>,
    pub diffmaglim: Option<f64>,
    /// Positive subtraction flag; `None` marks a non-detection.
    #[serde(
        default,
        deserialize_with = "deserialize_isdiffpos_option",
        serialize_with = "serialize_isdiffpos_option"
    )]
    pub isdiffpos: Option<bool>,
    pub jdstarthist: Option<f64>,
    pub jdendhist: Option<f64>,
    pub ndethist: Option<i32>,
    pub rb: Option<f64>,
    pub drb: Option<f64>,
    pub fwhm: Option<f64>,
    pub elong: Option<f64>,
    pub magdiff: Option<f64>,
    pub nbad: Option<i32>,
    pub ssdistnr: Option<f64>,
    pub ssmagnr: Option<f64>,
    pub distpsnr1: Option<f64>,
    pub sgscore1: Option<f64>,
    pub programid: Option<i32>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Detection {
    pub fn is_detection(&self) -> bool {
        self.isdiffpos.is_some()
    }

    /// Whether this is a positive detection.
    pub fn is_positive(&self) -> bool {
        self.isdiffpos == Some(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    #[serde(rename = "objectId")]
    pub object_id: String,
    #[serde(default)]
    pub candid: Option<i64>,
    pub candidate: Detection,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub prv_candidates: Vec<Detection>,
}

impl AlertRecord {
    pub fn malformed(&self, field: &'static str) -> MalformedAlert {
        MalformedAlert {
            object_id: self.object_id.clone(),
            field,
        }
    }

    fn require<T>(&self, value: Option<T>, field: &'static str) -> Result<T, MalformedAlert> {
        value.ok_or_else(|| self.malformed(field))
    }

    pub fn jd(&self) -> Result<f64, MalformedAlert> {
        self.require(self.candidate.jd, "candidate.jd")
    }

    pub fn ra(&self) -> Result<f64, MalformedAlert> {
        self.require(self.candidate.ra, "candidate.ra")
    }

    pub fn dec(&self) -> Result<f64, MalformedAlert> {
        self.require(self.candidate.dec, "candidate.dec")
    }

    pub fn jdstarthist(&self) -> Result<f64, MalformedAlert> {
        self.require(self.candidate.jdstarthist, "candidate.jdstarthist")
    }

    pub fn jdendhist(&self) -> Result<f64, MalformedAlert> {
        self.require(self.candidate.jdendhist, "candidate.jdendhist")
    }

    pub fn isdiffpos(&self) -> Result<bool, MalformedAlert> {
        self.require(self.candidate.isdiffpos, "candidate.isdiffpos")
    }

    /// Previous entries followed by the current candidate.
    pub fn history(&self) -> impl Iterator<Item = &Detection> {
        self.prv_candidates
            .iter()
            .chain(std::iter::once(&self.candidate))
    }

    /// Real detections (not upper limits) with a known time.
    pub fn detections(&self) -> impl Iterator<Item = &Detection> {
        self.history().filter(|d| d.is_detection() && d.jd.is_some())
    }

    pub fn first_detection(&self) -> Option<&Detection> {
        self.detections()
            .min_by(|a, b| a.jd.unwrap_or(f64::MAX).total_cmp(&b.jd.unwrap_or(f64::MAX)))
    }

    pub fn latest_detection(&self) -> Option<&Detection> {
        self.detections()
            .max_by(|a, b| a.jd.unwrap_or(f64::MIN).total_cmp(&b.jd.unwrap_or(f64::MIN)))
    }

    /// Most recent non-detection preceding the first detection.
    pub fn last_upper_limit(&self) -> Option<&Detection> {
        let first_jd = self.first_detection()?.jd?;
        self.prv_candidates
            .iter()
            .filter(|d| !d.is_detection() && d.jd.is_some_and(|jd| jd < first_jd))
            .max_by(|a, b| a.jd.unwrap_or(f64::MIN).total_cmp(&b.jd.unwrap_or(f64::MIN)))
    }
}
