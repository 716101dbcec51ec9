use crate::alert::Detection;
use crate::conf::ConfigurationError;
use crate::event::{upper_limit_clause, EventContext};
use crate::skymap::SkyRegion;
use crate::utils::spatial::{great_circle_distance_deg, wrap_ra};

/// All positions within `radius_deg` of a center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircleRegion {
    pub ra: f64,
    pub dec: f64,
    pub radius_deg: f64,
}

impl CircleRegion {
    pub fn new(ra: f64, dec: f64, radius_deg: f64) -> Result<Self, ConfigurationError> {
        if !ra.is_finite() {
            return Err(ConfigurationError::invalid(
                "ra",
                format!("must be finite, got {}", ra),
            ));
        }
        if !(-90.0..=90.0).contains(&dec) {
            return Err(ConfigurationError::invalid(
                "dec",
                format!("must be within [-90, 90], got {}", dec),
            ));
        }
        if !(radius_deg > 0.0 && radius_deg <= 180.0) {
            return Err(ConfigurationError::invalid(
                "radius",
                format!("must be in (0, 180] degrees, got {}", radius_deg),
            ));
        }
        Ok(CircleRegion {
            ra: wrap_ra(ra),
            dec,
            radius_deg,
        })
    }
}

impl SkyRegion for CircleRegion {
    fn contains(&self, ra: f64, dec: f64) -> bool {
        great_circle_distance_deg(self.ra, self.dec, ra, dec) <= self.radius_deg
    }

    fn bounding_cone(&self) -> (f64, f64, f64) {
        (self.ra, self.dec, self.radius_deg)
    }
}

/// An event localised by a circular error region, e.g. a GRB or an X-ray
/// transient.
#[derive(Debug, Clone)]
pub struct CircleEvent {
    name: String,
    t_min_jd: f64,
    region: CircleRegion,
}

impl CircleEvent {
    pub fn new(
        name: impl Into<String>,
        t_min_jd: f64,
        ra: f64,
        dec: f64,
        radius_deg: f64,
    ) -> Result<Self, ConfigurationError> {
        Ok(CircleEvent {
            name: name.into(),
            t_min_jd,
            region: CircleRegion::new(ra, dec, radius_deg)?,
        })
    }

    pub fn circle(&self) -> &CircleRegion {
        &self.region
    }
}

impl EventContext for CircleEvent {
    fn name(&self) -> &str {
        &self.name
    }

    fn full_name(&self) -> String {
        format!("event {}", self.name)
    }

    fn t_min_jd(&self) -> f64 {
        self.t_min_jd
    }

    fn region(&self) -> &dyn SkyRegion {
        &self.region
    }

    fn remove_variability_line(&self) -> String {
        "and removing candidates with history of variability prior to the event time".to_string()
    }

    fn candidate_text(
        &self,
        name: &str,
        first_detection_jd: f64,
        last_upper_limit: Option<&Detection>,
    ) -> String {
        format!(
            "{} was first detected {:.1} days after {}. {}",
            name,
            first_detection_jd - self.t_min_jd,
            self.name,
            upper_limit_clause(first_detection_jd, last_upper_limit)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circle_contains() {
        let region = CircleRegion::new(-10.0, 20.0, 1.5).unwrap();
        assert_eq!(region.ra, 350.0);
        assert!(region.contains(350.0, 21.0));
        assert!(!region.contains(1.0, 20.0));
        assert!(region.contains(351.0, 20.5));
    }

    #[test]
    fn test_invalid_circle() {
        assert!(CircleRegion::new(0.0, 95.0, 1.0).is_err());
        assert!(CircleRegion::new(0.0, 0.0, 0.0).is_err());
        assert!(CircleRegion::new(f64::NAN, 0.0, 1.0).is_err());
        assert!(CircleRegion::new(f64::INFINITY, 0.0, 1.0).is_err());
    }

    #[test]
    fn test_tiny_region_still_has_a_pixel() {
        let region = CircleRegion::new(45.0, 45.0, 1e-4).unwrap();
        let pixels = region.search_pixels(8).unwrap();
        assert_eq!(pixels.pixels.len(), 1);
        assert_eq!(pixels.pixels[0], crate::skymap::pixel_at(3, 45.0, 45.0));
    }
}
