//! HEALPix sky maps stored as FITS binary tables.
//!
//! Files are opened with cfitsio, which also reads gzipped maps directly.
//! Header keys are looked up in the table HDU first, then in the primary
//! HDU.
use crate::conf::ConfigurationError;
use crate::skymap::{DistanceEstimate, Ordering, SkyMap};
use crate::utils::spatial::iso_to_jd;

use fitsio::hdu::{FitsHdu, HduInfo};
use fitsio::headers::ReadsKey;
use fitsio::FitsFile;
use std::path::Path;
use tracing::{debug, instrument, warn};

const PROB_KEYS: [&str; 2] = ["PROB", "PROBABILITY"];

#[derive(thiserror::Error, Debug)]
pub enum SkyMapReadError {
    #[error("failed to read FITS file")]
    Fits(#[from] fitsio::errors::Error),
    #[error("malformed sky map: {0}")]
    Format(String),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

fn format_error(message: impl Into<String>) -> SkyMapReadError {
    SkyMapReadError::Format(message.into())
}

/// First HDU in `hdus` that has `key`, if any.
fn read_key_optional<T: ReadsKey>(hdus: &[&FitsHdu], fptr: &mut FitsFile, key: &str) -> Option<T> {
    hdus.iter().find_map(|hdu| hdu.read_key(fptr, key).ok())
}

/// Read a sky map from a FITS file, gzipped or not.
#[instrument(skip_all, fields(path = %path.as_ref().display()), err)]
pub fn read_skymap(path: impl AsRef<Path>) -> Result<SkyMap, SkyMapReadError> {
    let mut fptr = FitsFile::open(path.as_ref())?;
    let primary = fptr.primary_hdu()?;
    let table = fptr.hdu(1)?;

    let (columns, num_rows) = match &table.info {
        HduInfo::TableInfo {
            column_descriptions,
            num_rows,
        } => (column_descriptions, *num_rows),
        _ => return Err(format_error("first extension is not a binary table")),
    };
    let column = columns
        .iter()
        .find(|column| {
            PROB_KEYS
                .iter()
                .any(|key| column.name.trim().eq_ignore_ascii_case(key))
        })
        .ok_or_else(|| {
            ConfigurationError::UnrecognizedSkyMap("No recognised probability key".to_string())
        })?;
    if column.data_type.repeat != 1 {
        return Err(format_error(format!(
            "column {} holds {} values per row, expected one",
            column.name, column.data_type.repeat
        )));
    }
    let column_name = column.name.clone();
    if !column_name.trim().eq_ignore_ascii_case("PROB") {
        debug!(column = %column_name, "renaming probability column to PROB");
    }

    let probabilities: Vec<f64> = table.read_col(&mut fptr, &column_name)?;
    if probabilities.len() != num_rows {
        return Err(format_error(format!(
            "read {} of {} table rows",
            probabilities.len(),
            num_rows
        )));
    }

    let hdus = [&table, &primary];
    let ordering = match read_key_optional::<String>(&hdus, &mut fptr, "ORDERING") {
        Some(raw) => raw.trim().parse::<Ordering>()?,
        None => {
            warn!("no ORDERING key, assuming RING");
            Ordering::Ring
        }
    };
    let nside = match read_key_optional::<i64>(&hdus, &mut fptr, "NSIDE") {
        Some(raw) => u32::try_from(raw)
            .map_err(|_| format_error(format!("NSIDE is out of range: {}", raw)))?,
        None => nside_from_len(probabilities.len())?,
    };

    let mut map = SkyMap::new(nside, ordering, probabilities)?;

    if let Some(date_obs) = read_key_optional::<String>(&hdus, &mut fptr, "DATE-OBS") {
        let jd = iso_to_jd(&date_obs).map_err(|e| format_error(e.to_string()))?;
        map = map.with_event_time(jd);
    }
    if let Some(object) = read_key_optional::<String>(&hdus, &mut fptr, "OBJECT") {
        map = map.with_object(object.trim());
    }
    let mean = read_key_optional::<f64>(&hdus, &mut fptr, "DISTMEAN");
    let std = read_key_optional::<f64>(&hdus, &mut fptr, "DISTSTD");
    if let (Some(mean_mpc), Some(std_mpc)) = (mean, std) {
        map = map.with_distance(DistanceEstimate { mean_mpc, std_mpc });
    }

    Ok(map)
}

fn nside_from_len(len: usize) -> Result<u32, SkyMapReadError> {
    let nside = ((len / 12) as f64).sqrt().round() as u32;
    if 12 * (nside as usize) * (nside as usize) != len {
        return Err(format_error(format!(
            "{} pixels is not a valid HEALPix map size",
            len
        )));
    }
    Ok(nside)
}
