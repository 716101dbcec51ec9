//! The scan driver: cones, first-pass filter, history resolution, cache.
//!
//! A [`ScanOrchestrator`] owns one event's cone tessellation and the state
//! that makes scans incremental. Cones are marked scanned as soon as their
//! search succeeds and object ids found in them stay pending until their
//! history is resolved, so calling [`ScanOrchestrator::scan_cones`] again
//! after a failure or an abort never repeats a cone search and never loses
//! an id.
use crate::alert::{merge, AlertRecord, MalformedAlert};
use crate::archive::{AlertArchive, ArchiveError};
use crate::cache::{CandidateCache, UpsertStats};
use crate::conf::{ConfigurationError, FilterConfig, ScanConfig};
use crate::event::{Event, EventContext};
use crate::filter::{FilterContext, FilterMode, FilterStage, FilterStats};
use crate::report::{ReportError, ReportSink, ScanReport};
use crate::skymap::{Cone, Tessellation};

use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("archive request failed")]
    Archive(#[from] ArchiveError),
    #[error("scan aborted")]
    Aborted,
    #[error("failed to publish report")]
    Report(#[from] ReportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    Tessellating,
    /// Searching the cone at this position of the tessellation.
    ScanningCones(usize),
    ResolvingHistory,
    Done,
    Error,
}

/// Stops a running scan at the next cone boundary.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Running totals over the lifetime of an orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanSummary {
    pub run_id: String,
    pub event: String,
    pub cones_total: usize,
    pub cones_scanned: usize,
    pub cone_searches: usize,
    pub alerts_received: usize,
    pub no_prv: FilterStats,
    pub history: FilterStats,
    pub objects_resolved: usize,
    pub malformed: usize,
    pub cache: UpsertStats,
    pub pending: usize,
    pub candidates: usize,
}

/// Outcome of every stage for one record of an object, for debugging why
/// an object is (not) a candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordCheck {
    pub candid: Option<i64>,
    pub jd: Option<f64>,
    pub no_prv: Vec<(FilterStage, Result<bool, MalformedAlert>)>,
    pub history: Vec<(FilterStage, Result<bool, MalformedAlert>)>,
}

impl RecordCheck {
    fn all_pass(trace: &[(FilterStage, Result<bool, MalformedAlert>)]) -> bool {
        trace.iter().all(|(_, outcome)| matches!(outcome, Ok(true)))
    }

    pub fn passed(&self) -> bool {
        Self::all_pass(&self.no_prv) && Self::all_pass(&self.history)
    }
}

pub struct ScanOrchestrator {
    run_id: Uuid,
    archive: Arc<dyn AlertArchive>,
    event: Event,
    scan: ScanConfig,
    filter: FilterConfig,
    cones: Tessellation,
    scanned: BTreeSet<u64>,
    pending: BTreeSet<String>,
    cache: CandidateCache,
    state: ScanState,
    abort: AbortHandle,
    summary: ScanSummary,
    show_progress: bool,
}

impl ScanOrchestrator {
    /// Validate the configuration and tessellate the event's region once.
    #[instrument(skip_all, fields(event = event.context().name()), err)]
    pub fn new(
        archive: Arc<dyn AlertArchive>,
        event: Event,
        scan: ScanConfig,
        filter: FilterConfig,
    ) -> Result<Self, ScanError> {
        scan.validate()?;
        let cones = event.context().cones(scan.cone_nside)?;
        info!(
            n_cones = cones.len(),
            radius_deg = cones.radius_deg,
            cone_nside = cones.cone_nside,
            "tessellated search region"
        );
        Ok(Self::build(archive, event, scan, filter, cones))
    }

    /// Use precomputed cones instead of tessellating the event's region.
    pub fn with_cones(
        archive: Arc<dyn AlertArchive>,
        event: Event,
        scan: ScanConfig,
        filter: FilterConfig,
        cones: Tessellation,
    ) -> Result<Self, ScanError> {
        scan.validate()?;
        Ok(Self::build(archive, event, scan, filter, cones))
    }

    fn build(
        archive: Arc<dyn AlertArchive>,
        event: Event,
        scan: ScanConfig,
        filter: FilterConfig,
        cones: Tessellation,
    ) -> Self {
        let run_id = Uuid::new_v4();
        let summary = ScanSummary {
            run_id: run_id.to_string(),
            event: event.context().name().to_string(),
            cones_total: cones.len(),
            ..Default::default()
        };
        ScanOrchestrator {
            run_id,
            archive,
            event,
            scan,
            filter,
            cones,
            scanned: BTreeSet::new(),
            pending: BTreeSet::new(),
            cache: CandidateCache::new(),
            state: ScanState::Idle,
            abort: AbortHandle::default(),
            summary,
            show_progress: false,
        }
    }

    /// Draw a progress bar over the cone loop.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn cones(&self) -> &Tessellation {
        &self.cones
    }

    pub fn scanned_cones(&self) -> &BTreeSet<u64> {
        &self.scanned
    }

    /// Object ids found in scanned cones whose history is not resolved yet.
    pub fn pending(&self) -> &BTreeSet<String> {
        &self.pending
    }

    pub fn cache(&self) -> &CandidateCache {
        &self.cache
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn summary(&self) -> ScanSummary {
        let mut summary = self.summary.clone();
        summary.cones_scanned = self.scanned.len();
        summary.pending = self.pending.len();
        summary.candidates = self.cache.len();
        summary
    }

    fn window(&self, t_max_jd: Option<f64>) -> Result<(f64, f64), ConfigurationError> {
        let context = self.event.context();
        let t_min_jd = context.t_min_jd();
        let t_max_jd = t_max_jd.unwrap_or_else(|| context.default_t_max_jd(self.scan.window_days));
        if !(t_max_jd > t_min_jd) {
            return Err(ConfigurationError::invalid(
                "t_max",
                format!("{} is not after the event time {}", t_max_jd, t_min_jd),
            ));
        }
        Ok((t_min_jd, t_max_jd))
    }

    fn fail<T>(&mut self, error: ScanError) -> Result<T, ScanError> {
        warn!(error.message = %error, state = ?self.state, "scan stopped");
        self.state = ScanState::Error;
        Err(error)
    }

    /// Search up to `max_cones` cones not scanned yet, then resolve the
    /// history of every pending object id and update the cache.
    ///
    /// `max_cones` falls back to the configured cap, and `t_max_jd` to the
    /// event's default window end.
    #[instrument(skip(self), fields(run_id = %self.run_id, event = self.event.context().name()), err)]
    pub async fn scan_cones(
        &mut self,
        t_max_jd: Option<f64>,
        max_cones: Option<usize>,
    ) -> Result<ScanSummary, ScanError> {
        let (t_min_jd, t_max_jd) = match self.window(t_max_jd) {
            Ok(window) => window,
            Err(error) => return self.fail(error.into()),
        };
        self.state = ScanState::Tessellating;

        let limit = max_cones.or(self.scan.max_cones).unwrap_or(usize::MAX);
        let todo: Vec<(usize, Cone)> = self
            .cones
            .cones
            .iter()
            .enumerate()
            .filter(|(_, cone)| !self.scanned.contains(&cone.id))
            .take(limit)
            .map(|(index, cone)| (index, *cone))
            .collect();
        info!(
            already_scanned = self.scanned.len(),
            total = self.cones.len(),
            to_scan = todo.len(),
            radius_deg = self.cones.radius_deg,
            "scanning cones"
        );

        if let Err(error) = self.search_cones(&todo, t_min_jd, t_max_jd).await {
            return self.fail(error);
        }
        if let Err(error) = self.resolve_pending(t_min_jd, t_max_jd).await {
            return self.fail(error);
        }

        self.state = ScanState::Done;
        let summary = self.summary();
        info!(
            cones_scanned = summary.cones_scanned,
            candidates = summary.candidates,
            "scan finished"
        );
        Ok(summary)
    }

    async fn search_cones(
        &mut self,
        todo: &[(usize, Cone)],
        t_min_jd: f64,
        t_max_jd: f64,
    ) -> Result<(), ScanError> {
        let progress = if self.show_progress {
            ProgressBar::new(todo.len() as u64)
                .with_message(format!("Scanning cones of {}", self.event.context().name()))
                .with_style(
                    ProgressStyle::default_bar()
                        .template("{spinner:.green} {msg} {wide_bar} [{elapsed_precise}] {human_pos}/{human_len} ({eta})")
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                )
        } else {
            ProgressBar::hidden()
        };

        let context = self.event.context();
        let pipeline = context.pipeline(FilterMode::NoPrv);
        let filter_ctx = FilterContext {
            t_min_jd,
            t_max_jd,
            region: context.region(),
            config: &self.filter,
        };
        let radius_deg = self.cones.radius_deg;

        for (index, cone) in todo {
            if self.abort.is_aborted() {
                progress.abandon();
                return Err(ScanError::Aborted);
            }
            self.state = ScanState::ScanningCones(*index);

            let records = self
                .archive
                .cone_search(cone.ra, cone.dec, radius_deg, t_min_jd, t_max_jd)
                .instrument(info_span!("cone", cone.id = cone.id))
                .await?;
            self.summary.cone_searches += 1;
            self.summary.alerts_received += records.len();

            let (kept, stats) = pipeline.retain(records, &filter_ctx);
            debug!(cone.id = cone.id, passed = stats.passed, "cone searched");
            self.summary.no_prv.absorb(&stats);
            self.summary.malformed += stats.malformed;
            self.pending.extend(kept.into_iter().map(|record| record.object_id));
            self.scanned.insert(cone.id);
            progress.inc(1);
        }
        progress.finish_and_clear();
        Ok(())
    }

    async fn resolve_pending(&mut self, t_min_jd: f64, t_max_jd: f64) -> Result<(), ScanError> {
        self.state = ScanState::ResolvingHistory;
        let ids: Vec<String> = self.pending.iter().cloned().collect();
        if ids.is_empty() {
            return Ok(());
        }
        let fast = self.scan.fast_query;
        info!(n_objects = ids.len(), fast, "resolving object histories");

        let context = self.event.context();
        let mode = if fast {
            FilterMode::NoPrv
        } else {
            FilterMode::History
        };
        let pipeline = context.pipeline(mode);
        let filter_ctx = FilterContext {
            t_min_jd,
            t_max_jd,
            region: context.region(),
            config: &self.filter,
        };

        let archive = Arc::clone(&self.archive);
        let mut lookups = stream::iter(ids)
            .map(|object_id| {
                let archive = Arc::clone(&archive);
                async move {
                    let result = archive.object_search(&object_id, !fast).await;
                    (object_id, result)
                }
            })
            .buffer_unordered(self.scan.history_concurrency.max(1));

        while let Some((object_id, result)) = lookups.next().await {
            // a failed id stays pending for the next call
            let records = result?;
            let (kept, stats) = pipeline.retain(records, &filter_ctx);
            self.summary.history.absorb(&stats);
            self.summary.malformed += stats.malformed;

            let kept = if fast {
                kept
            } else {
                match merge(kept) {
                    Ok(merged) => merged,
                    Err(error) => {
                        warn!(error.message = %error, "could not merge alert history");
                        self.summary.malformed += 1;
                        Vec::new()
                    }
                }
            };
            let upserted = self.cache.upsert(kept);
            self.summary.cache.absorb(upserted);
            self.summary.malformed += upserted.malformed;
            self.summary.objects_resolved += 1;
            self.pending.remove(&object_id);
        }
        Ok(())
    }

    /// Scan every alert issued in the window instead of searching cones.
    ///
    /// Results go through the same first-pass filter and history resolution
    /// as cone results.
    #[instrument(skip(self), fields(run_id = %self.run_id), err)]
    pub async fn scan_timerange(
        &mut self,
        t_max_jd: Option<f64>,
        chunk_size: usize,
    ) -> Result<ScanSummary, ScanError> {
        let (t_min_jd, t_max_jd) = match self.window(t_max_jd) {
            Ok(window) => window,
            Err(error) => return self.fail(error.into()),
        };
        self.state = ScanState::ScanningCones(0);
        let records = match self
            .archive
            .timerange_search(t_min_jd, t_max_jd, false, chunk_size)
            .await
        {
            Ok(records) => records,
            Err(error) => return self.fail(error.into()),
        };
        self.summary.alerts_received += records.len();

        let context = self.event.context();
        let filter_ctx = FilterContext {
            t_min_jd,
            t_max_jd,
            region: context.region(),
            config: &self.filter,
        };
        let (kept, stats) = context
            .pipeline(FilterMode::NoPrv)
            .retain(records, &filter_ctx);
        self.summary.no_prv.absorb(&stats);
        self.summary.malformed += stats.malformed;
        self.pending.extend(kept.into_iter().map(|record| record.object_id));

        if let Err(error) = self.resolve_pending(t_min_jd, t_max_jd).await {
            return self.fail(error);
        }
        self.state = ScanState::Done;
        Ok(self.summary())
    }

    /// Add objects by name, bypassing the filters.
    #[instrument(skip(self), err)]
    pub async fn add_objects(&mut self, object_ids: &[&str]) -> Result<UpsertStats, ScanError> {
        let mut total = UpsertStats::default();
        for object_id in object_ids {
            let records = self.archive.object_search(object_id, true).await?;
            let merged = match merge(records) {
                Ok(merged) => merged,
                Err(error) => {
                    warn!(error.message = %error, "could not merge alert history");
                    total.malformed += 1;
                    continue;
                }
            };
            total.absorb(self.cache.upsert(merged));
        }
        self.summary.cache.absorb(total);
        Ok(total)
    }

    /// Evaluate every stage of both passes on every record of one object.
    #[instrument(skip(self), err)]
    pub async fn check_object(
        &self,
        object_id: &str,
        t_max_jd: Option<f64>,
    ) -> Result<Vec<RecordCheck>, ScanError> {
        let (t_min_jd, t_max_jd) = self.window(t_max_jd)?;
        let records = self.archive.object_search(object_id, true).await?;
        let context = self.event.context();
        let filter_ctx = FilterContext {
            t_min_jd,
            t_max_jd,
            region: context.region(),
            config: &self.filter,
        };
        let no_prv = context.pipeline(FilterMode::NoPrv);
        let history = context.pipeline(FilterMode::History);
        let checks: Vec<RecordCheck> = records
            .iter()
            .map(|record| RecordCheck {
                candid: record.candid.or(record.candidate.candid),
                jd: record.candidate.jd,
                no_prv: no_prv.explain(record, &filter_ctx),
                history: history.explain(record, &filter_ctx),
            })
            .collect();
        for check in &checks {
            info!(
                object_id,
                candid = ?check.candid,
                no_prv = ?check.no_prv,
                history = ?check.history,
                passed = check.passed(),
                "filter check"
            );
        }
        Ok(checks)
    }

    /// Hand the cache snapshot to a report sink.
    #[instrument(skip_all, fields(run_id = %self.run_id), err)]
    pub async fn finish(&mut self, sink: &dyn ReportSink) -> Result<ScanSummary, ScanError> {
        let summary = self.summary();
        let report = ScanReport {
            event: self.event.context(),
            candidates: self.cache.snapshot(),
            summary: &summary,
        };
        if let Err(error) = sink.publish(&report).await {
            return self.fail(error.into());
        }
        self.state = ScanState::Done;
        Ok(summary)
    }

    /// The cached records, ordered by object id.
    pub fn candidates(&self) -> &BTreeMap<String, AlertRecord> {
        self.cache.snapshot()
    }
}
