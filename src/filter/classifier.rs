//! Veto of bogus subtractions, moving objects and stellar sources.
//!
//! The thresholds mirror the "decent" ZTF transient filter used for
//! multi-messenger follow-up: real-bogus score, PSF shape, photometric
//! consistency, bad pixels, proximity to known solar system objects and
//! to PS1 point sources, galactic latitude and history length.
use crate::alert::{AlertRecord, MalformedAlert};
use crate::conf::ClassifierConfig;
use crate::utils::spatial::galactic_latitude;

/// Catalog distances at or below zero mean "no counterpart" in ZTF packets.
fn has_counterpart(distance: Option<f64>) -> Option<f64> {
    distance.filter(|d| *d >= 0.0)
}

/// Why a record is vetoed, or `None` if it passes.
pub fn veto_reason(
    record: &AlertRecord,
    config: &ClassifierConfig,
) -> Result<Option<&'static str>, MalformedAlert> {
    let c = &record.candidate;

    let ndet = c.ndethist.ok_or_else(|| record.malformed("candidate.ndethist"))?;
    if ndet < config.min_ndet {
        return Ok(Some("too few detections"));
    }

    let tspan = record.jdendhist()? - record.jdstarthist()?;
    if tspan < config.min_tspan || tspan > config.max_tspan {
        return Ok(Some("detection history span out of range"));
    }

    let rb = c.rb.ok_or_else(|| record.malformed("candidate.rb"))?;
    if rb < config.min_rb {
        return Ok(Some("real-bogus score too low"));
    }
    if let Some(drb) = c.drb {
        if drb < config.min_drb {
            return Ok(Some("deep real-bogus score too low"));
        }
    }

    let fwhm = c.fwhm.ok_or_else(|| record.malformed("candidate.fwhm"))?;
    if fwhm > config.max_fwhm {
        return Ok(Some("PSF too broad"));
    }

    let elong = c.elong.ok_or_else(|| record.malformed("candidate.elong"))?;
    if elong > config.max_elong {
        return Ok(Some("source too elongated"));
    }

    let magdiff = c.magdiff.ok_or_else(|| record.malformed("candidate.magdiff"))?;
    if magdiff.abs() > config.max_magdiff {
        return Ok(Some("PSF and aperture magnitudes disagree"));
    }

    let nbad = c.nbad.ok_or_else(|| record.malformed("candidate.nbad"))?;
    if nbad > config.max_nbad {
        return Ok(Some("too many bad pixels"));
    }

    if let Some(distance) = has_counterpart(c.ssdistnr) {
        if distance < config.min_dist_to_sso {
            return Ok(Some("known solar system object nearby"));
        }
    }

    if config.min_gal_lat > 0.0 {
        let b = galactic_latitude(record.ra()?, record.dec()?);
        if b.abs() < config.min_gal_lat {
            return Ok(Some("too close to the galactic plane"));
        }
    }

    if let (Some(distance), Some(sgscore)) = (has_counterpart(c.distpsnr1), c.sgscore1) {
        if distance < config.ps1_sgveto_rad && sgscore > config.ps1_sgveto_sgth {
            return Ok(Some("coincident with a PS1 star"));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::testing::alert;

    #[test]
    fn test_clean_alert_passes() {
        let record = alert("ZTF1", 2459001.0);
        assert_eq!(veto_reason(&record, &ClassifierConfig::default()).unwrap(), None);
    }

    #[test]
    fn test_vetoes() {
        let config = ClassifierConfig::default();

        let mut record = alert("ZTF1", 2459001.0);
        record.candidate.rb = Some(0.1);
        assert_eq!(
            veto_reason(&record, &config).unwrap(),
            Some("real-bogus score too low")
        );

        let mut record = alert("ZTF1", 2459001.0);
        record.candidate.ssdistnr = Some(2.0);
        assert_eq!(
            veto_reason(&record, &config).unwrap(),
            Some("known solar system object nearby")
        );

        let mut record = alert("ZTF1", 2459001.0);
        record.candidate.ssdistnr = Some(-999.0);
        assert_eq!(veto_reason(&record, &config).unwrap(), None);

        let mut record = alert("ZTF1", 2459001.0);
        record.candidate.distpsnr1 = Some(0.4);
        record.candidate.sgscore1 = Some(0.95);
        assert_eq!(
            veto_reason(&record, &config).unwrap(),
            Some("coincident with a PS1 star")
        );
    }

    #[test]
    fn test_galactic_latitude_cut() {
        let config = ClassifierConfig {
            min_gal_lat: 14.0,
            ..Default::default()
        };
        let mut record = alert("ZTF1", 2459001.0);
        // galactic center
        record.candidate.ra = Some(266.405);
        record.candidate.dec = Some(-28.936);
        assert_eq!(
            veto_reason(&record, &config).unwrap(),
            Some("too close to the galactic plane")
        );
    }

    #[test]
    fn test_missing_real_bogus_is_malformed() {
        let mut record = alert("ZTF1", 2459001.0);
        record.candidate.rb = None;
        let error = veto_reason(&record, &ClassifierConfig::default()).unwrap_err();
        assert_eq!(error.field, "candidate.rb");
    }
}
