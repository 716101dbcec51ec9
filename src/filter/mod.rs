//! Ordered, pure predicate stages applied to alert records.
//!
//! Two variants share one predicate set. The `NoPrv` pass looks only at the
//! current detection and is cheap enough to prune cone-search results; the
//! `History` pass adds the checks that need the full detection history.
pub mod classifier;

use crate::alert::{AlertRecord, MalformedAlert};
use crate::conf::FilterConfig;
use crate::skymap::SkyRegion;

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// A predicate stage. The derive order is the evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStage {
    /// The current detection is a positive subtraction.
    Polarity,
    /// Variability started no earlier than the event.
    Recency,
    /// The position lies inside the localisation.
    Containment,
    /// First and last detection are far enough apart.
    Duration,
    /// Another positive detection falls inside the event window.
    Significance,
    /// Contaminant and real-bogus veto.
    Classifier,
}

impl std::fmt::Display for FilterStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FilterStage::Polarity => "polarity",
            FilterStage::Recency => "recency",
            FilterStage::Containment => "containment",
            FilterStage::Duration => "duration",
            FilterStage::Significance => "significance",
            FilterStage::Classifier => "classifier",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    NoPrv,
    History,
}

impl FilterMode {
    pub fn stages(&self) -> Vec<FilterStage> {
        match self {
            FilterMode::NoPrv => vec![
                FilterStage::Polarity,
                FilterStage::Recency,
                FilterStage::Containment,
                FilterStage::Classifier,
            ],
            FilterMode::History => vec![
                FilterStage::Polarity,
                FilterStage::Recency,
                FilterStage::Containment,
                FilterStage::Duration,
                FilterStage::Significance,
                FilterStage::Classifier,
            ],
        }
    }
}

/// Everything a predicate may depend on besides the record itself.
#[derive(Clone, Copy)]
pub struct FilterContext<'a> {
    pub t_min_jd: f64,
    pub t_max_jd: f64,
    pub region: &'a dyn SkyRegion,
    pub config: &'a FilterConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    Passed,
    Rejected(FilterStage),
}

impl FilterOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, FilterOutcome::Passed)
    }
}

/// Counts from filtering one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterStats {
    pub evaluated: usize,
    pub passed: usize,
    pub rejected: BTreeMap<FilterStage, usize>,
    pub malformed: usize,
}

impl FilterStats {
    pub fn absorb(&mut self, other: &FilterStats) {
        self.evaluated += other.evaluated;
        self.passed += other.passed;
        self.malformed += other.malformed;
        for (stage, count) in &other.rejected {
            *self.rejected.entry(*stage).or_default() += count;
        }
    }
}

/// Evaluate a single stage.
pub fn evaluate_stage(
    stage: FilterStage,
    record: &AlertRecord,
    ctx: &FilterContext,
) -> Result<bool, MalformedAlert> {
    match stage {
        FilterStage::Polarity => record.isdiffpos(),
        FilterStage::Recency => Ok(record.jdstarthist()? >= ctx.t_min_jd),
        FilterStage::Containment => Ok(ctx.region.contains(record.ra()?, record.dec()?)),
        FilterStage::Duration => Ok(
            record.jdendhist()? - record.jdstarthist()? >= ctx.config.min_detection_span_days
        ),
        FilterStage::Significance => Ok(record.prv_candidates.iter().any(|d| {
            d.is_positive() && d.jd.is_some_and(|jd| jd > ctx.t_min_jd && jd < ctx.t_max_jd)
        })),
        FilterStage::Classifier => {
            let veto = classifier::veto_reason(record, &ctx.config.classifier)?;
            if let Some(reason) = veto {
                debug!(object_id = %record.object_id, reason, "classifier veto");
            }
            Ok(veto.is_none())
        }
    }
}

/// A fixed-order sequence of stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterPipeline {
    stages: Vec<FilterStage>,
}

impl FilterPipeline {
    /// Build a pipeline; stages are put in their fixed order whatever the
    /// order given.
    pub fn new(mut stages: Vec<FilterStage>) -> Self {
        stages.sort();
        stages.dedup();
        FilterPipeline { stages }
    }

    pub fn for_mode(mode: FilterMode) -> Self {
        FilterPipeline::new(mode.stages())
    }

    pub fn stages(&self) -> &[FilterStage] {
        &self.stages
    }

    /// Run the stages in order, stopping at the first rejection.
    pub fn evaluate(
        &self,
        record: &AlertRecord,
        ctx: &FilterContext,
    ) -> Result<FilterOutcome, MalformedAlert> {
        for stage in &self.stages {
            if !evaluate_stage(*stage, record, ctx)? {
                return Ok(FilterOutcome::Rejected(*stage));
            }
        }
        Ok(FilterOutcome::Passed)
    }

    /// Run every stage, without stopping, for diagnostics.
    pub fn explain(
        &self,
        record: &AlertRecord,
        ctx: &FilterContext,
    ) -> Vec<(FilterStage, Result<bool, MalformedAlert>)> {
        self.stages
            .iter()
            .map(|stage| (*stage, evaluate_stage(*stage, record, ctx)))
            .collect()
    }

    /// Keep the records that pass. Malformed records are logged, counted and
    /// dropped.
    pub fn retain(
        &self,
        records: Vec<AlertRecord>,
        ctx: &FilterContext,
    ) -> (Vec<AlertRecord>, FilterStats) {
        let mut stats = FilterStats::default();
        let mut kept = Vec::new();
        for record in records {
            stats.evaluated += 1;
            match self.evaluate(&record, ctx) {
                Ok(FilterOutcome::Passed) => {
                    stats.passed += 1;
                    kept.push(record);
                }
                Ok(FilterOutcome::Rejected(stage)) => {
                    *stats.rejected.entry(stage).or_default() += 1;
                }
                Err(error) => {
                    warn!(error.message = %error, "skipping malformed alert");
                    stats.malformed += 1;
                }
            }
        }
        (kept, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::testing::{alert, Everywhere};

    const T_MIN: f64 = 2459000.0;
    const T_MAX: f64 = 2459010.0;

    fn ctx<'a>(region: &'a dyn SkyRegion, config: &'a FilterConfig) -> FilterContext<'a> {
        FilterContext {
            t_min_jd: T_MIN,
            t_max_jd: T_MAX,
            region,
            config,
        }
    }

    #[test]
    fn test_stage_order_is_fixed() {
        let pipeline = FilterPipeline::new(vec![
            FilterStage::Classifier,
            FilterStage::Polarity,
            FilterStage::Containment,
            FilterStage::Polarity,
        ]);
        assert_eq!(
            pipeline.stages(),
            &[
                FilterStage::Polarity,
                FilterStage::Containment,
                FilterStage::Classifier
            ]
        );
    }

    #[test]
    fn test_negative_subtraction_is_rejected_first() {
        let config = FilterConfig::default();
        let mut record = alert("ZTF1", T_MIN + 1.0);
        record.candidate.isdiffpos = Some(false);
        let outcome = FilterPipeline::for_mode(FilterMode::NoPrv)
            .evaluate(&record, &ctx(&Everywhere, &config))
            .unwrap();
        assert_eq!(outcome, FilterOutcome::Rejected(FilterStage::Polarity));
    }

    #[test]
    fn test_old_variability_is_rejected() {
        let config = FilterConfig::default();
        let mut record = alert("ZTF1", T_MIN + 1.0);
        record.candidate.jdstarthist = Some(T_MIN - 30.0);
        let outcome = FilterPipeline::for_mode(FilterMode::NoPrv)
            .evaluate(&record, &ctx(&Everywhere, &config))
            .unwrap();
        assert_eq!(outcome, FilterOutcome::Rejected(FilterStage::Recency));
    }

    #[test]
    fn test_history_requires_second_positive_detection() {
        let config = FilterConfig::default();
        let mut record = alert("ZTF1", T_MIN + 1.0);
        let history = FilterPipeline::for_mode(FilterMode::History);
        assert_eq!(
            history.evaluate(&record, &ctx(&Everywhere, &config)).unwrap(),
            FilterOutcome::Passed
        );

        // only a negative previous detection left
        record.prv_candidates[0].isdiffpos = Some(false);
        assert_eq!(
            history.evaluate(&record, &ctx(&Everywhere, &config)).unwrap(),
            FilterOutcome::Rejected(FilterStage::Significance)
        );
    }

    #[test]
    fn test_short_span_is_rejected() {
        let config = FilterConfig::default();
        let mut record = alert("ZTF1", T_MIN + 1.0);
        record.candidate.jdendhist = record.candidate.jdstarthist.map(|jd| jd + 0.001);
        let outcome = FilterPipeline::for_mode(FilterMode::History)
            .evaluate(&record, &ctx(&Everywhere, &config))
            .unwrap();
        assert_eq!(outcome, FilterOutcome::Rejected(FilterStage::Duration));
    }

    #[test]
    fn test_missing_field_is_an_error() {
        let config = FilterConfig::default();
        let mut record = alert("ZTF1", T_MIN + 1.0);
        record.candidate.jdstarthist = None;
        let error = FilterPipeline::for_mode(FilterMode::NoPrv)
            .evaluate(&record, &ctx(&Everywhere, &config))
            .unwrap_err();
        assert_eq!(error.field, "candidate.jdstarthist");

        let (kept, stats) = FilterPipeline::for_mode(FilterMode::NoPrv)
            .retain(vec![record, alert("ZTF2", T_MIN + 1.0)], &ctx(&Everywhere, &config));
        assert_eq!(kept.len(), 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.passed, 1);
    }

    #[test]
    fn test_explain_reports_every_stage() {
        let config = FilterConfig::default();
        let mut record = alert("ZTF1", T_MIN + 1.0);
        record.candidate.isdiffpos = Some(false);
        let trace = FilterPipeline::for_mode(FilterMode::History)
            .explain(&record, &ctx(&Everywhere, &config));
        assert_eq!(trace.len(), 6);
        assert_eq!(trace[0], (FilterStage::Polarity, Ok(false)));
        assert_eq!(trace[1], (FilterStage::Recency, Ok(true)));
    }
}
