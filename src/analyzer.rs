//! Two-stage detection per source.
//!
//! Every source runs one long-lived analyzer: a timer fires every
//! `screen_interval_s`, the screener looks at the newest frame of the short
//! window, and a positive escalates to the confirmer over the long window
//! snapshotted at that instant. The confirmer's job is to veto screener
//! false positives while staying permissive to real incidents whose signal
//! is concentrated in one key moment, so the confirmation threshold defaults
//! to 1-of-3 representative frames.
//!
//! Screening on one source is strictly serialized: the loop runs one cycle
//! at a time and missed ticks are dropped, never queued. Failure policy is
//! asymmetric by design: screener errors count as negatives (a quiet period
//! is cheaper than a false alarm), while confirmer errors after a screener
//! positive fail open and emit with a fallback marker, so alerting keeps
//! working through provider outages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::ring::FrameRing;
use crate::vision::{AnalysisContext, VisionClient, VisionError, VisionRole};
use crate::{
    now_epoch_s, AnalysisVerdict, ConfirmedIncident, ConfirmerSource, Frame, IncidentCandidate,
};

// -------------------- Single analysis cycle --------------------

/// Identity of the source being analyzed, carried into every emitted
/// incident.
#[derive(Clone, Debug)]
pub struct SourceContext {
    pub tenant_id: i64,
    pub source_id: String,
    pub source_name: String,
}

/// Everything one screening tick can produce. The timer loop only acts on
/// `Confirmed`; the on-demand API reports the full shape including vetoes.
#[derive(Debug)]
pub enum StageOutcome {
    /// Nothing fresh enough in the short window to screen.
    NoFrames,
    ScreenerNegative {
        verdict: AnalysisVerdict,
    },
    /// Screener failed; treated as negative (fail-closed).
    ScreenerError {
        error: VisionError,
    },
    /// Screener positive, confirmer disagreed on every representative frame.
    Veto {
        screener: AnalysisVerdict,
        confirmer: AnalysisVerdict,
    },
    Confirmed(Box<ConfirmedIncident>),
}

/// Pick {start, middle, end} representatives from the window, collapsing
/// duplicates when fewer than three frames exist.
pub(crate) fn representatives(window: &[Arc<Frame>]) -> Vec<Arc<Frame>> {
    let mut picked: Vec<Arc<Frame>> = Vec::with_capacity(3);
    if window.is_empty() {
        return picked;
    }
    for idx in [0, window.len() / 2, window.len() - 1] {
        let frame = &window[idx];
        if picked.last().map(|f: &Arc<Frame>| f.seq) != Some(frame.seq) {
            picked.push(frame.clone());
        }
    }
    picked
}

/// Run one full screen-then-confirm cycle against the ring's current
/// contents. Takes the long-window snapshot at the screening instant and
/// carries it through, so downstream stages see exactly what the screener
/// saw.
pub fn analyze_source_once(
    ctx: &SourceContext,
    ring: &RwLock<FrameRing>,
    vision: &dyn VisionClient,
    pipeline: &PipelineConfig,
) -> StageOutcome {
    let now = now_epoch_s();
    let (screen_frame, long_window) = {
        let ring = ring.read().expect("frame ring poisoned");
        let short = ring.window_ending_at(pipeline.short_window_s as f64, now);
        let Some(newest) = short.last().cloned() else {
            return StageOutcome::NoFrames;
        };
        let long = ring.window_ending_at(pipeline.long_window_s as f64, now);
        (newest, long)
    };

    let screen_ctx = AnalysisContext {
        source_name: ctx.source_name.clone(),
        detail: None,
    };
    let screener_verdict =
        match vision.analyze(VisionRole::Screener, &[screen_frame], &screen_ctx) {
            Ok(verdict) => verdict,
            Err(error) => {
                log::warn!(
                    "screener_error source={} treating tick as negative: {}",
                    ctx.source_id,
                    error
                );
                return StageOutcome::ScreenerError { error };
            }
        };

    if !screener_verdict.incident {
        return StageOutcome::ScreenerNegative {
            verdict: screener_verdict,
        };
    }

    log::info!(
        "screener_positive source={} kind={} escalating to confirmer",
        ctx.source_id,
        screener_verdict.incident_kind
    );

    // From here on the candidate carries the exact frames the screener saw.
    let candidate = IncidentCandidate {
        tenant_id: ctx.tenant_id,
        source_id: ctx.source_id.clone(),
        source_name: ctx.source_name.clone(),
        detected_at: now,
        screener_verdict,
        window: long_window,
    };

    let reps = representatives(&candidate.window);
    let confirm_ctx = AnalysisContext {
        source_name: ctx.source_name.clone(),
        detail: Some(candidate.screener_verdict.narrative.clone()),
    };

    match vision.analyze(VisionRole::Confirmer, &reps, &confirm_ctx) {
        Ok(confirmer_verdict) => {
            let flagged = confirmer_verdict.incident_frame_count();
            if flagged >= pipeline.confirm_threshold {
                log::info!(
                    "confirmed source={} frames_flagged={}/{} threshold={}",
                    ctx.source_id,
                    flagged,
                    confirmer_verdict.per_frame.len(),
                    pipeline.confirm_threshold
                );
                StageOutcome::Confirmed(Box::new(
                    candidate.confirm(Some(confirmer_verdict), ConfirmerSource::Confirmer),
                ))
            } else {
                log::info!(
                    "veto source={} screener_narrative={:?}",
                    ctx.source_id,
                    candidate.screener_verdict.narrative
                );
                StageOutcome::Veto {
                    screener: candidate.screener_verdict,
                    confirmer: confirmer_verdict,
                }
            }
        }
        Err(error) => {
            // Screener said incident and the confirmer is unreachable: a hit
            // with no confirmation signal is better reported than silently
            // dropped, so dedup and alerting still run downstream.
            log::warn!(
                "confirmer_fallback source={} emitting on screener only: {}",
                ctx.source_id,
                error
            );
            StageOutcome::Confirmed(Box::new(
                candidate.confirm(None, ConfirmerSource::FallbackScreenerOnly),
            ))
        }
    }
}

// -------------------- Timer-driven analyzer task --------------------

const STOP_POLL: Duration = Duration::from_millis(100);

/// Handle to one source's analyzer thread.
pub struct SourceAnalyzer {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl SourceAnalyzer {
    /// Spawn the per-source loop. Confirmed incidents go out over the
    /// bounded channel; when the coordinator falls behind, the newest
    /// incident is dropped with a warning rather than stalling analysis.
    pub fn spawn(
        ctx: SourceContext,
        ring: Arc<RwLock<FrameRing>>,
        vision: Arc<dyn VisionClient>,
        pipeline: PipelineConfig,
        incidents: SyncSender<ConfirmedIncident>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let join = std::thread::spawn(move || {
            run_analyzer_loop(&ctx, &ring, vision.as_ref(), &pipeline, &incidents, &stop_thread);
        });
        Self {
            stop,
            join: Some(join),
        }
    }

    /// Signal the loop to stop. No new vision calls are started; an in-flight
    /// call finishes naturally and its result is discarded.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wait for the loop to exit, up to `grace`. Returns false if the thread
    /// is still running (stuck in a slow provider call) and was abandoned.
    pub fn join_with_grace(&mut self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self
                .join
                .as_ref()
                .map(|handle| handle.is_finished())
                .unwrap_or(true)
            {
                if let Some(handle) = self.join.take() {
                    let _ = handle.join();
                }
                return true;
            }
            std::thread::sleep(STOP_POLL);
        }
        false
    }
}

fn run_analyzer_loop(
    ctx: &SourceContext,
    ring: &RwLock<FrameRing>,
    vision: &dyn VisionClient,
    pipeline: &PipelineConfig,
    incidents: &SyncSender<ConfirmedIncident>,
    stop: &AtomicBool,
) {
    let interval = Duration::from_secs(pipeline.screen_interval_s.max(1));
    let mut next_tick = Instant::now() + interval;
    log::info!(
        "analyzer started tenant={} source={} interval={}s",
        ctx.tenant_id,
        ctx.source_id,
        pipeline.screen_interval_s
    );

    loop {
        // Sleep in short slices so shutdown stays responsive.
        while Instant::now() < next_tick {
            if stop.load(Ordering::SeqCst) {
                log::info!("analyzer stopped source={}", ctx.source_id);
                return;
            }
            std::thread::sleep(STOP_POLL.min(next_tick.saturating_duration_since(Instant::now())));
        }
        if stop.load(Ordering::SeqCst) {
            log::info!("analyzer stopped source={}", ctx.source_id);
            return;
        }

        let outcome = analyze_source_once(ctx, ring, vision, pipeline);
        if stop.load(Ordering::SeqCst) {
            // Result of the in-flight cycle is discarded on shutdown.
            log::info!("analyzer stopped source={} (cycle discarded)", ctx.source_id);
            return;
        }
        if let StageOutcome::Confirmed(incident) = outcome {
            match incidents.try_send(*incident) {
                Ok(()) => {}
                Err(TrySendError::Full(dropped)) => {
                    log::warn!(
                        "incident channel full, dropping confirmed incident source={} kind={}",
                        dropped.source_id,
                        dropped.incident_kind()
                    );
                }
                Err(TrySendError::Disconnected(_)) => {
                    log::info!("incident channel closed, analyzer exiting source={}", ctx.source_id);
                    return;
                }
            }
        }

        // A cycle longer than the interval consumes the ticks it covered;
        // they are dropped, not queued.
        let now = Instant::now();
        while next_tick <= now {
            next_tick += interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted vision client: pops one pre-seeded response per role call.
    pub(crate) struct ScriptedVision {
        screener: Mutex<VecDeque<Result<AnalysisVerdict, VisionError>>>,
        confirmer: Mutex<VecDeque<Result<AnalysisVerdict, VisionError>>>,
        pub confirmer_frame_counts: Mutex<Vec<usize>>,
    }

    impl ScriptedVision {
        pub(crate) fn new() -> Self {
            Self {
                screener: Mutex::new(VecDeque::new()),
                confirmer: Mutex::new(VecDeque::new()),
                confirmer_frame_counts: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn push_screener(&self, result: Result<AnalysisVerdict, VisionError>) {
            self.screener.lock().unwrap().push_back(result);
        }

        pub(crate) fn push_confirmer(&self, result: Result<AnalysisVerdict, VisionError>) {
            self.confirmer.lock().unwrap().push_back(result);
        }
    }

    impl VisionClient for ScriptedVision {
        fn analyze(
            &self,
            role: VisionRole,
            frames: &[Arc<Frame>],
            _context: &AnalysisContext,
        ) -> Result<AnalysisVerdict, VisionError> {
            match role {
                VisionRole::Screener => self
                    .screener
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| Ok(AnalysisVerdict::default())),
                VisionRole::Confirmer => {
                    self.confirmer_frame_counts.lock().unwrap().push(frames.len());
                    self.confirmer
                        .lock()
                        .unwrap()
                        .pop_front()
                        .unwrap_or_else(|| Ok(AnalysisVerdict::default()))
                }
            }
        }
    }

    fn positive_screener() -> AnalysisVerdict {
        AnalysisVerdict {
            incident: true,
            incident_kind: "intrusion".to_string(),
            confidence: 0.9,
            narrative: "figure at the fence line".to_string(),
            per_frame: vec![],
        }
    }

    fn confirmer_with(flags: &[bool]) -> AnalysisVerdict {
        AnalysisVerdict {
            incident: flags.iter().any(|&f| f),
            incident_kind: "intrusion".to_string(),
            confidence: 0.8,
            narrative: "reviewed window".to_string(),
            per_frame: flags
                .iter()
                .enumerate()
                .map(|(i, &incident)| crate::FrameVerdict {
                    position: crate::vision::position_for_index(i, flags.len()),
                    incident,
                    narrative: String::new(),
                })
                .collect(),
        }
    }

    fn ring_with_frames(count: usize) -> Arc<RwLock<FrameRing>> {
        let mut ring = FrameRing::new(256);
        let now = now_epoch_s();
        let start = now - (count as f64 - 1.0) * 0.04;
        for i in 0..count {
            ring.append_at(vec![i as u8; 16], start + i as f64 * 0.04);
        }
        Arc::new(RwLock::new(ring))
    }

    fn test_ctx() -> SourceContext {
        SourceContext {
            tenant_id: 1,
            source_id: "cam-1".to_string(),
            source_name: "Front lot".to_string(),
        }
    }

    #[test]
    fn representatives_pick_start_middle_end() {
        let frames: Vec<Arc<Frame>> = (0..9).map(|i| Frame::new(i, i as f64, vec![])).collect();
        let reps = representatives(&frames);
        let seqs: Vec<u64> = reps.iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![0, 4, 8]);
    }

    #[test]
    fn representatives_collapse_small_windows() {
        let frames: Vec<Arc<Frame>> = (0..2).map(|i| Frame::new(i, i as f64, vec![])).collect();
        let reps = representatives(&frames);
        let seqs: Vec<u64> = reps.iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![0, 1]);
        assert!(representatives(&[]).is_empty());
    }

    #[test]
    fn empty_ring_produces_no_frames() {
        let ring = Arc::new(RwLock::new(FrameRing::new(8)));
        let vision = ScriptedVision::new();
        let outcome =
            analyze_source_once(&test_ctx(), &ring, &vision, &PipelineConfig::default());
        assert!(matches!(outcome, StageOutcome::NoFrames));
    }

    #[test]
    fn screener_negative_stops_the_cycle() {
        let ring = ring_with_frames(50);
        let vision = ScriptedVision::new();
        vision.push_screener(Ok(AnalysisVerdict::default()));
        let outcome =
            analyze_source_once(&test_ctx(), &ring, &vision, &PipelineConfig::default());
        assert!(matches!(outcome, StageOutcome::ScreenerNegative { .. }));
        assert!(vision.confirmer_frame_counts.lock().unwrap().is_empty());
    }

    #[test]
    fn screener_error_fails_closed() {
        let ring = ring_with_frames(50);
        let vision = ScriptedVision::new();
        vision.push_screener(Err(VisionError::transient("rate limited")));
        let outcome =
            analyze_source_once(&test_ctx(), &ring, &vision, &PipelineConfig::default());
        assert!(matches!(outcome, StageOutcome::ScreenerError { .. }));
        assert!(vision.confirmer_frame_counts.lock().unwrap().is_empty());
    }

    #[test]
    fn confirmer_all_negative_vetoes() {
        let ring = ring_with_frames(250);
        let vision = ScriptedVision::new();
        vision.push_screener(Ok(positive_screener()));
        vision.push_confirmer(Ok(confirmer_with(&[false, false, false])));
        let outcome =
            analyze_source_once(&test_ctx(), &ring, &vision, &PipelineConfig::default());
        match outcome {
            StageOutcome::Veto { screener, confirmer } => {
                assert_eq!(screener.narrative, "figure at the fence line");
                assert_eq!(confirmer.incident_frame_count(), 0);
            }
            other => panic!("expected veto, got {:?}", other),
        }
    }

    #[test]
    fn one_flagged_frame_confirms_at_default_threshold() {
        let ring = ring_with_frames(250);
        let vision = ScriptedVision::new();
        vision.push_screener(Ok(positive_screener()));
        vision.push_confirmer(Ok(confirmer_with(&[false, true, false])));
        let outcome =
            analyze_source_once(&test_ctx(), &ring, &vision, &PipelineConfig::default());
        match outcome {
            StageOutcome::Confirmed(incident) => {
                assert_eq!(incident.confirmer_source, ConfirmerSource::Confirmer);
                assert!(!incident.window.is_empty());
                assert_eq!(incident.incident_kind(), "intrusion");
            }
            other => panic!("expected confirmed, got {:?}", other),
        }
        // Confirmer saw the three representatives.
        assert_eq!(*vision.confirmer_frame_counts.lock().unwrap(), vec![3]);
    }

    #[test]
    fn threshold_above_flag_count_vetoes() {
        let ring = ring_with_frames(250);
        let vision = ScriptedVision::new();
        vision.push_screener(Ok(positive_screener()));
        vision.push_confirmer(Ok(confirmer_with(&[false, true, false])));
        let pipeline = PipelineConfig {
            confirm_threshold: 2,
            ..PipelineConfig::default()
        };
        let outcome = analyze_source_once(&test_ctx(), &ring, &vision, &pipeline);
        assert!(matches!(outcome, StageOutcome::Veto { .. }));
    }

    #[test]
    fn confirmer_error_fails_open_with_marker() {
        let ring = ring_with_frames(250);
        let vision = ScriptedVision::new();
        vision.push_screener(Ok(positive_screener()));
        vision.push_confirmer(Err(VisionError::transient("provider outage")));
        let outcome =
            analyze_source_once(&test_ctx(), &ring, &vision, &PipelineConfig::default());
        match outcome {
            StageOutcome::Confirmed(incident) => {
                assert_eq!(incident.confirmer_source, ConfirmerSource::FallbackScreenerOnly);
                assert!(incident.confirmer_verdict.is_none());
            }
            other => panic!("expected fail-open confirmation, got {:?}", other),
        }
    }

    #[test]
    fn spawned_analyzer_stops_on_request() {
        let ring = ring_with_frames(10);
        let vision = Arc::new(ScriptedVision::new());
        let (tx, _rx) = std::sync::mpsc::sync_channel(4);
        let mut analyzer = SourceAnalyzer::spawn(
            test_ctx(),
            ring,
            vision,
            PipelineConfig::default(),
            tx,
        );
        analyzer.request_stop();
        assert!(analyzer.join_with_grace(Duration::from_secs(5)));
    }
}
