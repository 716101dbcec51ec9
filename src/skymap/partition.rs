//! Credible-region masks and coarse cone tessellations.
use crate::conf::ConfigurationError;
use crate::skymap::{depth_of, pixel_at, pixel_center, PixelSet, SkyMap, SkyRegion};

use serde::Serialize;
use std::collections::BTreeSet;
use std::f64::consts::PI;
use std::sync::Arc;
use tracing::{debug, instrument};

/// The top-probability pixels of a map whose cumulative sum first exceeds a
/// threshold.
///
/// Every pixel with probability at or above `pixel_threshold` is included,
/// so ties at the breakpoint can push the coverage slightly past the
/// requested threshold.
#[derive(Debug, Clone)]
pub struct CredibleRegion {
    map: Arc<SkyMap>,
    pixels: Vec<u64>,
    pixel_threshold: f64,
    prob_threshold: f64,
    cumulative_probability: f64,
}

impl CredibleRegion {
    pub fn map(&self) -> &SkyMap {
        &self.map
    }

    pub fn nside(&self) -> u32 {
        self.map.nside()
    }

    /// Selected nested pixel indices, ascending.
    pub fn pixels(&self) -> &[u64] {
        &self.pixels
    }

    /// Probabilities of the selected pixels, parallel to `pixels()`.
    pub fn pixel_probabilities(&self) -> Vec<f64> {
        self.pixels
            .iter()
            .map(|hash| self.map.probabilities()[*hash as usize])
            .collect()
    }

    pub fn pixel_threshold(&self) -> f64 {
        self.pixel_threshold
    }

    pub fn prob_threshold(&self) -> f64 {
        self.prob_threshold
    }

    /// Summed probability of the selected pixels.
    pub fn cumulative_probability(&self) -> f64 {
        self.cumulative_probability
    }

    pub fn area_deg2(&self) -> f64 {
        self.pixels.len() as f64 * self.map.pixel_area_deg2()
    }
}

impl SkyRegion for CredibleRegion {
    fn contains(&self, ra: f64, dec: f64) -> bool {
        self.map.interpolate(ra, dec) >= self.pixel_threshold
    }

    fn bounding_cone(&self) -> (f64, f64, f64) {
        // the most probable pixel is a good enough anchor, the radius spans
        // every selected pixel
        let depth = self.map.depth();
        let anchor = self
            .pixels
            .iter()
            .copied()
            .max_by(|a, b| {
                self.map.probabilities()[*a as usize]
                    .total_cmp(&self.map.probabilities()[*b as usize])
            })
            .unwrap_or(0);
        let (ra, dec) = pixel_center(depth, anchor);
        let pixrad = max_pixrad(self.map.nside()).to_degrees();
        let radius = self
            .pixels
            .iter()
            .map(|hash| {
                let (pra, pdec) = pixel_center(depth, *hash);
                crate::utils::spatial::great_circle_distance_deg(ra, dec, pra, pdec)
            })
            .fold(0.0_f64, f64::max);
        (ra, dec, (radius + pixrad).min(180.0))
    }

    /// The mask itself, at the map's own resolution. `nside` is ignored.
    fn search_pixels(&self, _nside: u32) -> Result<PixelSet, ConfigurationError> {
        Ok(PixelSet {
            nside: self.map.nside(),
            pixels: self.pixels.clone(),
            weights: self.pixel_probabilities(),
        })
    }
}

/// Select the credible region of `map` at cumulative probability `prob`.
///
/// Pixels are accumulated in descending probability until the running sum
/// strictly exceeds `prob`; the probability at that point becomes the
/// `pixel_threshold`. A threshold the map never reaches is a configuration
/// error rather than an empty region.
#[instrument(skip(map), fields(nside = map.nside()), err)]
pub fn threshold_mask(map: Arc<SkyMap>, prob: f64) -> Result<CredibleRegion, ConfigurationError> {
    if !(prob > 0.0) || !prob.is_finite() {
        return Err(ConfigurationError::invalid(
            "prob_threshold",
            format!("must be a positive number, got {}", prob),
        ));
    }

    let mut sorted: Vec<f64> = map.probabilities().to_vec();
    sorted.sort_unstable_by(|a, b| b.total_cmp(a));

    let mut cumulative = 0.0;
    let mut pixel_threshold = None;
    for p in sorted.iter() {
        cumulative += p;
        if cumulative > prob {
            pixel_threshold = Some(*p);
            break;
        }
    }
    let pixel_threshold = pixel_threshold.ok_or(ConfigurationError::UnreachableThreshold {
        threshold: prob,
        total: cumulative,
    })?;

    let mut pixels = Vec::new();
    let mut covered = 0.0;
    for (hash, p) in map.probabilities().iter().enumerate() {
        if *p >= pixel_threshold {
            pixels.push(hash as u64);
            covered += p;
        }
    }

    debug!(
        pixel_threshold,
        n_pixels = pixels.len(),
        covered,
        "selected credible region"
    );

    Ok(CredibleRegion {
        map,
        pixels,
        pixel_threshold,
        prob_threshold: prob,
        cumulative_probability: covered,
    })
}

/// A coarse search cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Cone {
    /// Nested pixel index at the tessellation's `cone_nside`.
    pub id: u64,
    pub ra: f64,
    pub dec: f64,
}

/// The cones covering a set of pixels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tessellation {
    pub cone_nside: u32,
    /// Search radius of every cone, in degrees.
    pub radius_deg: f64,
    /// Cones ordered by ascending id.
    pub cones: Vec<Cone>,
}

impl Tessellation {
    pub fn cone_ids(&self) -> BTreeSet<u64> {
        self.cones.iter().map(|cone| cone.id).collect()
    }

    pub fn len(&self) -> usize {
        self.cones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cones.is_empty()
    }
}

/// Group fine pixels into the coarse pixels that contain their centers.
///
/// The cone center is the coarse pixel's own center and the radius is the
/// coarse resolution's maximum pixel radius, so each cone covers its whole
/// cell.
pub fn tessellate(
    pixels: &[u64],
    nside: u32,
    cone_nside: u32,
) -> Result<Tessellation, ConfigurationError> {
    let depth = depth_of(nside)?;
    let cone_depth = depth_of(cone_nside)?;

    let ids: BTreeSet<u64> = pixels
        .iter()
        .map(|hash| {
            let (ra, dec) = pixel_center(depth, *hash);
            pixel_at(cone_depth, ra, dec)
        })
        .collect();

    let cones = ids
        .into_iter()
        .map(|id| {
            let (ra, dec) = pixel_center(cone_depth, id);
            Cone { id, ra, dec }
        })
        .collect();

    Ok(Tessellation {
        cone_nside,
        radius_deg: max_pixrad(cone_nside).to_degrees(),
        cones,
    })
}

fn unit_vector(z: f64, phi: f64) -> [f64; 3] {
    let sin_theta = (1.0 - z * z).max(0.0).sqrt();
    [sin_theta * phi.cos(), sin_theta * phi.sin(), z]
}

fn vector_angle(a: [f64; 3], b: [f64; 3]) -> f64 {
    let cross = [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ];
    let cross_norm = (cross[0] * cross[0] + cross[1] * cross[1] + cross[2] * cross[2]).sqrt();
    let dot = a[0] * b[0] + a[1] * b[1] + a[2] * b[2];
    cross_norm.atan2(dot)
}

/// Maximum angular distance (radians) between any pixel center and its
/// corners at `nside`.
///
/// The extreme pixel sits at the transition between the equatorial and
/// polar zones, so the distance is taken between the center of that pixel
/// and its corner toward the pole.
pub fn max_pixrad(nside: u32) -> f64 {
    let n = nside as f64;
    let va = unit_vector(2.0 / 3.0, PI / (4.0 * n));
    let t1 = (1.0 - 1.0 / n).powi(2);
    let vb = unit_vector(1.0 - t1 / 3.0, 0.0);
    vector_angle(va, vb)
}
