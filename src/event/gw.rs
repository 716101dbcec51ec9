use crate::alert::Detection;
use crate::conf::ConfigurationError;
use crate::event::{upper_limit_clause, EventContext, EventError};
use crate::skymap::fits::read_skymap;
use crate::skymap::{threshold_mask, CredibleRegion, DistanceEstimate, PixelSet, SkyMap, SkyRegion};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, instrument};

/// Kind of the notice that carried the sky map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeType {
    Preliminary,
    Initial,
    Update,
    Retraction,
}

impl FromStr for NoticeType {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "preliminary" => Ok(NoticeType::Preliminary),
            "initial" => Ok(NoticeType::Initial),
            "update" => Ok(NoticeType::Update),
            "retraction" => Ok(NoticeType::Retraction),
            other => Err(ConfigurationError::invalid(
                "notice",
                format!("unknown notice type '{}'", other),
            )),
        }
    }
}

/// A gravitational-wave trigger localised by a probability sky map.
#[derive(Debug, Clone)]
pub struct GravitationalWave {
    name: String,
    notice: NoticeType,
    t_min_jd: f64,
    region: CredibleRegion,
}

impl GravitationalWave {
    /// Select the credible region of `map` at `prob_threshold`.
    ///
    /// The merger time is the map's `DATE-OBS` unless `t_min_jd` is given.
    /// A retracted event is refused.
    #[instrument(skip(map), fields(nside = map.nside()), err)]
    pub fn new(
        name: &str,
        notice: NoticeType,
        map: SkyMap,
        prob_threshold: f64,
        t_min_jd: Option<f64>,
    ) -> Result<Self, EventError> {
        if notice == NoticeType::Retraction {
            return Err(EventError::Retracted {
                name: name.to_string(),
            });
        }
        let t_min_jd = t_min_jd
            .or(map.event_time_jd())
            .ok_or_else(|| ConfigurationError::InvalidSkyMap("no DATE-OBS in header".to_string()))?;
        let region = threshold_mask(Arc::new(map), prob_threshold)?;
        info!(
            n_pixels = region.pixels().len(),
            area_deg2 = region.area_deg2(),
            pixel_threshold = region.pixel_threshold(),
            "credible region selected"
        );
        Ok(GravitationalWave {
            name: name.to_string(),
            notice,
            t_min_jd,
            region,
        })
    }

    /// Read the map from a FITS file and build the event.
    pub fn from_file(
        name: Option<&str>,
        notice: NoticeType,
        path: impl AsRef<Path>,
        prob_threshold: f64,
    ) -> Result<Self, EventError> {
        // refuse before reading a possibly large map
        if notice == NoticeType::Retraction {
            return Err(EventError::Retracted {
                name: name.unwrap_or("unnamed").to_string(),
            });
        }
        let map = read_skymap(path)?;
        let name = name
            .map(str::to_string)
            .or_else(|| map.object().map(str::to_string))
            .unwrap_or_else(|| "unnamed".to_string());
        GravitationalWave::new(&name, notice, map, prob_threshold, None)
    }

    pub fn notice(&self) -> NoticeType {
        self.notice
    }

    pub fn credible_region(&self) -> &CredibleRegion {
        &self.region
    }
}

impl EventContext for GravitationalWave {
    fn name(&self) -> &str {
        &self.name
    }

    fn full_name(&self) -> String {
        format!("gravitational-wave trigger {}", self.name)
    }

    fn t_min_jd(&self) -> f64 {
        self.t_min_jd
    }

    fn region(&self) -> &dyn SkyRegion {
        &self.region
    }

    /// The credible-region pixels at the map's own resolution.
    fn search_pixels(&self, cone_nside: u32) -> Result<PixelSet, ConfigurationError> {
        self.region.search_pixels(cone_nside)
    }

    fn distance(&self) -> Option<DistanceEstimate> {
        self.region.map().distance()
    }

    fn tiling_line(&self) -> String {
        format!(
            "The {:.0}% credible region spans {:.1} sq deg. ",
            100.0 * self.region.prob_threshold(),
            self.region.area_deg2()
        )
    }

    fn remove_variability_line(&self) -> String {
        "and removing candidates with history of variability prior to the merger time".to_string()
    }

    fn candidate_text(
        &self,
        name: &str,
        first_detection_jd: f64,
        last_upper_limit: Option<&Detection>,
    ) -> String {
        format!(
            "{} was first detected {:.1} hours after the merger. {}",
            name,
            24.0 * (first_detection_jd - self.t_min_jd),
            upper_limit_clause(first_detection_jd, last_upper_limit)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skymap::Ordering;

    fn map() -> SkyMap {
        let mut probs = vec![0.0; 48];
        probs[5] = 0.6;
        probs[6] = 0.3;
        probs[7] = 0.1;
        SkyMap::new(2, Ordering::Nested, probs)
            .unwrap()
            .with_event_time(2458598.8459)
            .with_distance(DistanceEstimate {
                mean_mpc: 156.0,
                std_mpc: 41.0,
            })
    }

    #[test]
    fn test_retraction_is_refused() {
        let error = GravitationalWave::new("S190901ap", NoticeType::Retraction, map(), 0.9, None)
            .unwrap_err();
        assert!(matches!(error, EventError::Retracted { name } if name == "S190901ap"));
    }

    #[test]
    fn test_event_time_from_map() {
        let event = GravitationalWave::new("S190425z", NoticeType::Initial, map(), 0.9, None).unwrap();
        assert_eq!(event.t_min_jd(), 2458598.8459);
        assert_eq!(event.distance().unwrap().mean_mpc, 156.0);
        assert_eq!(event.credible_region().pixels(), &[5, 6, 7]);

        let event =
            GravitationalWave::new("S190425z", NoticeType::Update, map(), 0.9, Some(2458599.0))
                .unwrap();
        assert_eq!(event.t_min_jd(), 2458599.0);
    }

    #[test]
    fn test_missing_event_time() {
        let mut probs = vec![0.0; 12];
        probs[0] = 1.0;
        let map = SkyMap::new(1, Ordering::Nested, probs).unwrap();
        let error = GravitationalWave::new("S1", NoticeType::Initial, map, 0.5, None).unwrap_err();
        assert!(matches!(
            error,
            EventError::Configuration(ConfigurationError::InvalidSkyMap(_))
        ));
    }

    #[test]
    fn test_cones_come_from_credible_region() {
        let event = GravitationalWave::new("S190425z", NoticeType::Initial, map(), 0.9, None).unwrap();
        // three nside 2 pixels inside base pixel 1
        let cones = event.cones(1).unwrap();
        assert_eq!(cones.cone_ids().into_iter().collect::<Vec<_>>(), vec![1]);
        let text = event.candidate_text("ZTF19aarykkb", 2458599.8459, None);
        assert!(text.starts_with("ZTF19aarykkb was first detected 24.0 hours after the merger."));
    }

    #[test]
    fn test_notice_from_str() {
        assert_eq!("Initial".parse::<NoticeType>().unwrap(), NoticeType::Initial);
        assert!("bogus".parse::<NoticeType>().is_err());
    }
}
