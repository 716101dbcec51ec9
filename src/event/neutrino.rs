use crate::alert::Detection;
use crate::conf::ConfigurationError;
use crate::event::{upper_limit_clause, EventContext};
use crate::skymap::SkyRegion;
use crate::utils::spatial::{great_circle_distance_deg, ra_offset, wrap_ra};

/// A rectangular RA/Dec error box with asymmetric uncertainties, as
/// published for high-energy neutrino alerts.
///
/// `ra_plus`/`ra_minus` and `dec_plus`/`dec_minus` are the positive extents
/// on either side of the best-fit position, in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorBox {
    pub ra: f64,
    pub dec: f64,
    pub ra_plus: f64,
    pub ra_minus: f64,
    pub dec_plus: f64,
    pub dec_minus: f64,
}

impl ErrorBox {
    pub fn new(
        ra: f64,
        dec: f64,
        ra_err: (f64, f64),
        dec_err: (f64, f64),
    ) -> Result<Self, ConfigurationError> {
        if ![ra, dec, ra_err.0, ra_err.1, dec_err.0, dec_err.1]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(ConfigurationError::invalid(
                "error box",
                "coordinates and errors must be finite",
            ));
        }
        if !(-90.0..=90.0).contains(&dec) {
            return Err(ConfigurationError::invalid(
                "dec",
                format!("must be within [-90, 90], got {}", dec),
            ));
        }
        // errors may be given signed, as in "+1.2 -0.8"
        let (ra_plus, ra_minus) = (ra_err.0.abs(), ra_err.1.abs());
        let (dec_plus, dec_minus) = (dec_err.0.abs(), dec_err.1.abs());
        if ra_plus + ra_minus <= 0.0 || dec_plus + dec_minus <= 0.0 {
            return Err(ConfigurationError::invalid(
                "error box",
                "extent must be positive in both RA and Dec",
            ));
        }
        if ra_plus + ra_minus >= 360.0 {
            return Err(ConfigurationError::invalid(
                "error box",
                "RA extent must be below 360 degrees",
            ));
        }
        Ok(ErrorBox {
            ra: wrap_ra(ra),
            dec,
            ra_plus,
            ra_minus,
            dec_plus,
            dec_minus,
        })
    }

    pub fn dec_range(&self) -> (f64, f64) {
        (
            (self.dec - self.dec_minus).max(-90.0),
            (self.dec + self.dec_plus).min(90.0),
        )
    }

    /// Approximate solid angle in square degrees.
    pub fn area_deg2(&self) -> f64 {
        let (dec_min, dec_max) = self.dec_range();
        let ra_width = (self.ra_plus + self.ra_minus).to_radians();
        let band = dec_max.to_radians().sin() - dec_min.to_radians().sin();
        (ra_width * band).to_degrees().to_degrees()
    }
}

impl SkyRegion for ErrorBox {
    fn contains(&self, ra: f64, dec: f64) -> bool {
        let (dec_min, dec_max) = self.dec_range();
        if dec < dec_min || dec > dec_max {
            return false;
        }
        let offset = ra_offset(ra, self.ra);
        -self.ra_minus <= offset && offset <= self.ra_plus
    }

    fn bounding_cone(&self) -> (f64, f64, f64) {
        // edges of constant declination bulge away from the center
        const STEPS: usize = 32;
        let (dec_min, dec_max) = self.dec_range();
        let width = self.ra_plus + self.ra_minus;
        let mut radius = 0.0_f64;
        for i in 0..=STEPS {
            let t = i as f64 / STEPS as f64;
            let ra = self.ra - self.ra_minus + t * width;
            let dec = dec_min + t * (dec_max - dec_min);
            for (pra, pdec) in [
                (ra, dec_min),
                (ra, dec_max),
                (self.ra - self.ra_minus, dec),
                (self.ra + self.ra_plus, dec),
            ] {
                let distance = great_circle_distance_deg(self.ra, self.dec, wrap_ra(pra), pdec);
                radius = radius.max(distance);
            }
        }
        (self.ra, self.dec, (radius * 1.001).min(180.0))
    }
}

/// A neutrino alert localised by an [`ErrorBox`].
#[derive(Debug, Clone)]
pub struct Neutrino {
    name: String,
    t_min_jd: f64,
    region: ErrorBox,
}

impl Neutrino {
    pub fn new(name: impl Into<String>, t_min_jd: f64, region: ErrorBox) -> Self {
        Neutrino {
            name: name.into(),
            t_min_jd,
            region,
        }
    }

    pub fn error_box(&self) -> &ErrorBox {
        &self.region
    }
}

impl EventContext for Neutrino {
    fn name(&self) -> &str {
        &self.name
    }

    fn full_name(&self) -> String {
        format!("neutrino event {}", self.name)
    }

    fn t_min_jd(&self) -> f64 {
        self.t_min_jd
    }

    fn region(&self) -> &dyn SkyRegion {
        &self.region
    }

    fn tiling_line(&self) -> String {
        format!(
            "The search covers the {:.1} sq deg rectangular error region of {}. ",
            self.region.area_deg2(),
            self.name
        )
    }

    fn remove_variability_line(&self) -> String {
        "and removing candidates with history of variability prior to the neutrino arrival time"
            .to_string()
    }

    fn candidate_text(
        &self,
        name: &str,
        first_detection_jd: f64,
        last_upper_limit: Option<&Detection>,
    ) -> String {
        format!(
            "{} was first detected {:.1} days after the neutrino arrival time. {}",
            name,
            first_detection_jd - self.t_min_jd,
            upper_limit_clause(first_detection_jd, last_upper_limit)
        )
    }
}
