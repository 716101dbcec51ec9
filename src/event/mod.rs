//! What is being followed up: a gravitational-wave sky map, a neutrino
//! error box or a plain circular error region.
//!
//! Each kind implements [`EventContext`], which supplies the search region,
//! the start of the search window, the filter stages and the narrative
//! hooks used by the report. [`Event`] picks the implementation.
pub mod circle;
pub mod gw;
pub mod neutrino;

pub use circle::{CircleEvent, CircleRegion};
pub use gw::{GravitationalWave, NoticeType};
pub use neutrino::{ErrorBox, Neutrino};

use crate::alert::Detection;
use crate::conf::ConfigurationError;
use crate::filter::{FilterMode, FilterPipeline};
use crate::skymap::fits::SkyMapReadError;
use crate::skymap::{tessellate, DistanceEstimate, PixelSet, SkyRegion, Tessellation};

/// Search pixels of analytic regions are this many times finer than the
/// cone resolution.
pub const SEARCH_OVERSAMPLING: u32 = 4;

#[derive(thiserror::Error, Debug)]
pub enum EventError {
    #[error("event {name} was retracted")]
    Retracted { name: String },
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("could not load the sky map")]
    SkyMap(#[from] SkyMapReadError),
}

/// Capabilities the scanner and the report need from an event.
pub trait EventContext: Send + Sync {
    /// Short name, e.g. `S190425z`.
    fn name(&self) -> &str;

    /// Name used in prose, e.g. `gravitational-wave trigger S190425z`.
    fn full_name(&self) -> String;

    /// Start of the search window: the event time.
    fn t_min_jd(&self) -> f64;

    /// End of the search window when the caller gives none.
    fn default_t_max_jd(&self, window_days: f64) -> f64 {
        self.t_min_jd() + window_days
    }

    fn region(&self) -> &dyn SkyRegion;

    /// Pixels to tessellate into search cones.
    fn search_pixels(&self, cone_nside: u32) -> Result<PixelSet, ConfigurationError> {
        self.region()
            .search_pixels(cone_nside.saturating_mul(SEARCH_OVERSAMPLING))
    }

    fn cones(&self, cone_nside: u32) -> Result<Tessellation, ConfigurationError> {
        let pixels = self.search_pixels(cone_nside)?;
        tessellate(&pixels.pixels, pixels.nside, cone_nside)
    }

    fn pipeline(&self, mode: FilterMode) -> FilterPipeline {
        FilterPipeline::for_mode(mode)
    }

    fn distance(&self) -> Option<DistanceEstimate> {
        None
    }

    fn tiling_line(&self) -> String {
        String::new()
    }

    fn remove_variability_line(&self) -> String;

    /// One narrative sentence about a candidate.
    fn candidate_text(
        &self,
        name: &str,
        first_detection_jd: f64,
        last_upper_limit: Option<&Detection>,
    ) -> String;
}

/// The event being followed up.
pub enum Event {
    GravitationalWave(GravitationalWave),
    Neutrino(Neutrino),
    Circle(CircleEvent),
}

impl Event {
    pub fn context(&self) -> &dyn EventContext {
        match self {
            Event::GravitationalWave(event) => event,
            Event::Neutrino(event) => event,
            Event::Circle(event) => event,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::GravitationalWave(_) => "gravitational_wave",
            Event::Neutrino(_) => "neutrino",
            Event::Circle(_) => "circle",
        }
    }
}

impl From<GravitationalWave> for Event {
    fn from(event: GravitationalWave) -> Self {
        Event::GravitationalWave(event)
    }
}

impl From<Neutrino> for Event {
    fn from(event: Neutrino) -> Self {
        Event::Neutrino(event)
    }
}

impl From<CircleEvent> for Event {
    fn from(event: CircleEvent) -> Self {
        Event::Circle(event)
    }
}

/// Shared wording for the delay between the last non-detection and the
/// first detection.
pub(crate) fn upper_limit_clause(first_detection_jd: f64, last_upper_limit: Option<&Detection>) -> String {
    match last_upper_limit.and_then(|limit| Some((limit.jd?, limit.diffmaglim?))) {
        Some((jd, mag)) => format!(
            "The last upper limit of {:.2} mag was {:.1} days before the first detection. ",
            mag,
            first_detection_jd - jd
        ),
        None => "There is no recent upper limit before the first detection. ".to_string(),
    }
}
