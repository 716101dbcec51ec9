//! HEALPix probability sky maps and the regions derived from them.
//!
//! Maps are always held in nested ordering; ring-ordered input is converted
//! when the map is built. Angles are degrees at the API surface and radians
//! when handed to `cdshealpix`.
pub mod fits;
pub mod partition;

pub use partition::{max_pixrad, tessellate, threshold_mask, Cone, CredibleRegion, Tessellation};

use crate::conf::ConfigurationError;
use cdshealpix::nested;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Full sky in square degrees.
pub const FULL_SKY_DEG2: f64 = 41_252.961_249_419_27;

/// Pixel ordering scheme of a HEALPix map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Ordering {
    Nested,
    Ring,
}

impl FromStr for Ordering {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NESTED" | "NEST" => Ok(Ordering::Nested),
            "RING" => Ok(Ordering::Ring),
            other => Err(ConfigurationError::UnrecognizedSkyMap(format!(
                "unsupported pixel ordering '{}'",
                other
            ))),
        }
    }
}

/// HEALPix depth of a power-of-two nside.
pub fn depth_of(nside: u32) -> Result<u8, ConfigurationError> {
    if nside == 0 || !nside.is_power_of_two() || nside > (1 << 29) {
        return Err(ConfigurationError::InvalidNside(nside));
    }
    Ok(nside.trailing_zeros() as u8)
}

pub fn n_pixels(nside: u32) -> u64 {
    12 * (nside as u64) * (nside as u64)
}

/// Center of a nested pixel as (ra, dec) in degrees.
pub fn pixel_center(depth: u8, hash: u64) -> (f64, f64) {
    let (lon, lat) = nested::center(depth, hash);
    (lon.to_degrees(), lat.to_degrees())
}

/// Nested pixel containing (ra, dec) in degrees.
pub fn pixel_at(depth: u8, ra: f64, dec: f64) -> u64 {
    nested::hash(depth, ra.to_radians(), dec.to_radians())
}

/// Optional luminosity distance carried in a GW sky map header.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistanceEstimate {
    pub mean_mpc: f64,
    pub std_mpc: f64,
}

/// A probability sky map, immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct SkyMap {
    nside: u32,
    depth: u8,
    probabilities: Vec<f64>,
    event_time_jd: Option<f64>,
    object: Option<String>,
    distance: Option<DistanceEstimate>,
}

impl SkyMap {
    /// Build a map from per-pixel probabilities in the given ordering.
    ///
    /// The pixel count must be `12 * nside^2` and every value finite and
    /// non-negative. The total is not required to be exactly one.
    pub fn new(
        nside: u32,
        ordering: Ordering,
        probabilities: Vec<f64>,
    ) -> Result<Self, ConfigurationError> {
        let depth = depth_of(nside)?;
        let expected = n_pixels(nside);
        if probabilities.len() as u64 != expected {
            return Err(ConfigurationError::InvalidSkyMap(format!(
                "expected {} pixels for nside {}, got {}",
                expected,
                nside,
                probabilities.len()
            )));
        }
        if let Some(bad) = probabilities.iter().position(|p| !p.is_finite() || *p < 0.0) {
            return Err(ConfigurationError::InvalidSkyMap(format!(
                "pixel {} has invalid probability {}",
                bad, probabilities[bad]
            )));
        }

        let probabilities = match ordering {
            Ordering::Nested => probabilities,
            Ordering::Ring => {
                let layer = nested::get(depth);
                let mut nested_probs = vec![0.0; probabilities.len()];
                for (ring_idx, p) in probabilities.into_iter().enumerate() {
                    nested_probs[layer.from_ring(ring_idx as u64) as usize] = p;
                }
                nested_probs
            }
        };

        Ok(SkyMap {
            nside,
            depth,
            probabilities,
            event_time_jd: None,
            object: None,
            distance: None,
        })
    }

    pub fn with_event_time(mut self, jd: f64) -> Self {
        self.event_time_jd = Some(jd);
        self
    }

    pub fn with_object(mut self, object: impl Into<String>) -> Self {
        self.object = Some(object.into());
        self
    }

    pub fn with_distance(mut self, distance: DistanceEstimate) -> Self {
        self.distance = Some(distance);
        self
    }

    pub fn nside(&self) -> u32 {
        self.nside
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Per-pixel probabilities in nested order.
    pub fn probabilities(&self) -> &[f64] {
        &self.probabilities
    }

    pub fn event_time_jd(&self) -> Option<f64> {
        self.event_time_jd
    }

    pub fn object(&self) -> Option<&str> {
        self.object.as_deref()
    }

    pub fn distance(&self) -> Option<DistanceEstimate> {
        self.distance
    }

    pub fn total_probability(&self) -> f64 {
        self.probabilities.iter().sum()
    }

    pub fn pixel_area_deg2(&self) -> f64 {
        FULL_SKY_DEG2 / n_pixels(self.nside) as f64
    }

    pub fn pixel_probability(&self, hash: u64) -> Option<f64> {
        self.probabilities.get(hash as usize).copied()
    }

    /// Bilinear interpolation of the map at (ra, dec) in degrees.
    pub fn interpolate(&self, ra: f64, dec: f64) -> f64 {
        let layer = nested::get(self.depth);
        layer
            .bilinear_interpolation(ra.to_radians(), dec.to_radians())
            .iter()
            .map(|(hash, weight)| self.probabilities[*hash as usize] * weight)
            .sum()
    }
}

/// Nested pixels covering a region, with a weight per pixel.
///
/// For sky maps the weight is the pixel probability; for analytic regions
/// the weights are uniform and sum to one.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelSet {
    pub nside: u32,
    pub pixels: Vec<u64>,
    pub weights: Vec<f64>,
}

impl PixelSet {
    pub fn total_weight(&self) -> f64 {
        self.weights.iter().sum()
    }
}

/// A localisation that can answer point-in-region queries.
pub trait SkyRegion: Send + Sync {
    /// Whether (ra, dec) in degrees lies inside the region.
    fn contains(&self, ra: f64, dec: f64) -> bool;

    /// A cone (ra, dec, radius, degrees) enclosing the whole region.
    fn bounding_cone(&self) -> (f64, f64, f64);

    /// Pixels at `nside` whose centers lie inside the region.
    ///
    /// A region smaller than one pixel yields the pixel holding the center
    /// of its bounding cone.
    fn search_pixels(&self, nside: u32) -> Result<PixelSet, ConfigurationError> {
        let depth = depth_of(nside)?;
        let (ra, dec, radius) = self.bounding_cone();
        let radius = radius.clamp(1e-6, 180.0 - 1e-6);
        let coverage =
            nested::cone_coverage_approx(depth, ra.to_radians(), dec.to_radians(), radius.to_radians());
        let mut pixels: Vec<u64> = coverage
            .flat_iter()
            .filter(|hash| {
                let (pra, pdec) = pixel_center(depth, *hash);
                self.contains(pra, pdec)
            })
            .collect();
        if pixels.is_empty() {
            pixels.push(pixel_at(depth, ra, dec));
        }
        pixels.sort_unstable();
        pixels.dedup();
        let weight = 1.0 / pixels.len() as f64;
        Ok(PixelSet {
            nside,
            weights: vec![weight; pixels.len()],
            pixels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_of() {
        assert_eq!(depth_of(1).unwrap(), 0);
        assert_eq!(depth_of(64).unwrap(), 6);
        assert!(depth_of(0).is_err());
        assert!(depth_of(48).is_err());
    }

    #[test]
    fn test_new_rejects_bad_maps() {
        assert!(SkyMap::new(1, Ordering::Nested, vec![0.0; 11]).is_err());
        let mut probs = vec![0.0; 12];
        probs[3] = -1.0;
        assert!(SkyMap::new(1, Ordering::Nested, probs).is_err());
        assert!(SkyMap::new(3, Ordering::Nested, vec![0.0; 108]).is_err());
    }

    #[test]
    fn test_ring_is_converted_to_nested() {
        let nside = 4;
        let depth = depth_of(nside).unwrap();
        let layer = nested::get(depth);
        let ring: Vec<f64> = (0..n_pixels(nside)).map(|i| i as f64).collect();
        let map = SkyMap::new(nside, Ordering::Ring, ring).unwrap();
        for nested_idx in [0u64, 17, 100, 191] {
            let ring_idx = layer.to_ring(nested_idx);
            assert_eq!(map.pixel_probability(nested_idx), Some(ring_idx as f64));
        }
    }

    #[test]
    fn test_interpolate_constant_map() {
        let map = SkyMap::new(2, Ordering::Nested, vec![0.5; 48]).unwrap();
        for (ra, dec) in [(0.0, 0.0), (123.4, -56.7), (359.9, 89.0)] {
            assert!((map.interpolate(ra, dec) - 0.5).abs() < 1e-12);
        }
    }

    #[test]
    fn test_ordering_from_str() {
        assert_eq!("NESTED".parse::<Ordering>().unwrap(), Ordering::Nested);
        assert_eq!("ring".parse::<Ordering>().unwrap(), Ordering::Ring);
        assert!("NUNIQ".parse::<Ordering>().is_err());
    }
}
