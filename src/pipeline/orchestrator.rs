// src/pipeline/orchestrator.rs
//
// The control loop. One event in flight at a time:
//
//   Idle → AwaitingEvent → Correlating → Capturing → Classifying → Recording → AwaitingEvent
//
// ShuttingDown is entered from any state once the shutdown signal is seen
// (checked between stages); Failed only on link loss while awaiting events.

use super::session::{SessionCounters, SessionSummary};
use super::shutdown::ShutdownSignal;
use crate::event_source::EventSource;
use crate::frame_acquirer::FrameAcquirer;
use crate::geolocator::{FixBudget, GeoLocator};
use crate::recorder::{EventRecorder, PersistedPaths};
use crate::surface::SurfaceClassifier;
use crate::types::{Config, DetectionResult, Label, LocationFix, VibrationEvent};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    AwaitingEvent,
    Correlating,
    Capturing,
    Classifying,
    Recording,
    ShuttingDown,
    Failed,
}

/// How a single event left the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Recorded {
        label: Label,
        confidence: f32,
        /// `None` when persisting failed; the event still counts.
        paths: Option<PersistedPaths>,
    },
    CaptureSkipped {
        reason: &'static str,
    },
    /// Shutdown arrived mid-event; nothing was persisted.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Cancelled,
    LinkLost(String),
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub summary: SessionSummary,
}

/// Loop timing and the per-event GPS budget.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub fix_budget: FixBudget,
    pub poll_interval: Duration,
    pub cooldown: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            fix_budget: FixBudget::from_config(&config.gps),
            poll_interval: Duration::from_millis(config.link.poll_interval_ms.max(1)),
            cooldown: Duration::from_millis(config.pipeline.cooldown_ms),
        }
    }
}

pub struct PipelineOrchestrator {
    state: PipelineState,
    source: EventSource,
    locator: GeoLocator,
    camera: Box<dyn FrameAcquirer>,
    classifier: SurfaceClassifier,
    recorder: EventRecorder,
    settings: PipelineSettings,
    counters: SessionCounters,
    capture_skips: u64,
    started_at: Instant,
}

impl PipelineOrchestrator {
    pub fn new(
        source: EventSource,
        locator: GeoLocator,
        camera: Box<dyn FrameAcquirer>,
        classifier: SurfaceClassifier,
        recorder: EventRecorder,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            state: PipelineState::Idle,
            source,
            locator,
            camera,
            classifier,
            recorder,
            settings,
            counters: SessionCounters::default(),
            capture_skips: 0,
            started_at: Instant::now(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> PipelineState {
        self.state
    }

    #[cfg(test)]
    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    fn transition(&mut self, next: PipelineState) {
        if self.state != next {
            debug!("pipeline: {:?} → {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Run until shutdown or link loss. Resources are released and the
    /// summary produced on both paths.
    pub fn run(mut self, shutdown: &ShutdownSignal) -> RunReport {
        info!("👂 Listening for vibration events on {}", self.source.port());
        self.transition(PipelineState::AwaitingEvent);

        let outcome = loop {
            if shutdown.is_triggered() {
                break RunOutcome::Cancelled;
            }

            match self.source.next_event() {
                Ok(Some(event)) => {
                    if self.process_event(event, shutdown) == EventOutcome::Abandoned {
                        break RunOutcome::Cancelled;
                    }
                    if !shutdown.sleep(self.settings.cooldown) {
                        break RunOutcome::Cancelled;
                    }
                }
                Ok(None) => {
                    shutdown.sleep(self.settings.poll_interval);
                }
                Err(e) => {
                    error!("link: {}", e);
                    self.transition(PipelineState::Failed);
                    break RunOutcome::LinkLost(e.to_string());
                }
            }
        };

        let summary = self.shut_down();
        RunReport { outcome, summary }
    }

    /// Take one event through correlate, capture, classify, record.
    pub fn process_event(&mut self, event: VibrationEvent, shutdown: &ShutdownSignal) -> EventOutcome {
        info!(
            "📳 Vibration event #{} (magnitude {:.2}, sensor time {})",
            event.sequence, event.magnitude, event.raw_timestamp
        );

        self.transition(PipelineState::Correlating);
        let fix = self.locator.current_fix(&self.settings.fix_budget);
        if shutdown.is_triggered() {
            return self.abandon(&event);
        }

        self.transition(PipelineState::Capturing);
        let frame = match self.camera.capture() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    "capture: skipping event #{} ({}): {}",
                    event.sequence,
                    e.reason(),
                    e
                );
                self.capture_skips += 1;
                self.transition(PipelineState::AwaitingEvent);
                return EventOutcome::CaptureSkipped { reason: e.reason() };
            }
        };
        if shutdown.is_triggered() {
            return self.abandon(&event);
        }

        self.transition(PipelineState::Classifying);
        let result = self.classifier.classify(&frame);
        if shutdown.is_triggered() {
            return self.abandon(&event);
        }

        self.transition(PipelineState::Recording);
        let paths = match self.recorder.record(&frame, &result, &event, &fix) {
            Ok(paths) => Some(paths),
            Err(e) => {
                warn!("recorder: event #{} not persisted: {:#}", event.sequence, e);
                None
            }
        };
        self.counters = self.counters.record(result.label);
        self.report(&event, &result, &fix);

        self.transition(PipelineState::AwaitingEvent);
        EventOutcome::Recorded {
            label: result.label,
            confidence: result.confidence,
            paths,
        }
    }

    fn abandon(&mut self, event: &VibrationEvent) -> EventOutcome {
        info!("Shutdown requested, abandoning event #{}", event.sequence);
        self.transition(PipelineState::ShuttingDown);
        EventOutcome::Abandoned
    }

    fn report(&self, event: &VibrationEvent, result: &DetectionResult, fix: &LocationFix) {
        let icon = match result.label {
            Label::Pothole => "🕳️ ",
            Label::Uncertain => "❓",
            Label::NonPothole => "✅",
        };
        info!(
            "{} #{}: {} ({:.0}% confidence, {} qualifying region(s)) | GPS: {} | totals: {} events, {} potholes, {} uncertain",
            icon,
            event.sequence,
            result.label,
            result.confidence * 100.0,
            result.qualifying_regions,
            fix,
            self.counters.total_events,
            self.counters.pothole_count,
            self.counters.uncertain_count
        );
    }

    /// Release the link, the camera and the GPS, then summarize.
    fn shut_down(&mut self) -> SessionSummary {
        if self.state != PipelineState::Failed {
            self.transition(PipelineState::ShuttingDown);
        }

        self.source.close();
        self.camera.release();
        self.locator.release();

        let summary = SessionSummary::new(self.counters, self.capture_skips, self.started_at.elapsed());
        info!("{}", summary);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_acquirer::CaptureError;
    use crate::link::EofPolicy;
    use crate::recorder::load_log;
    use crate::surface::test_frames::{plain_road, pothole_frame};
    use crate::surface::ClassifierConfig;
    use crate::types::{CapturedFrame, RecorderConfig};
    use image::RgbImage;
    use std::io::Cursor;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    enum Shot {
        Frame(RgbImage),
        Fail,
    }

    struct FakeCamera {
        shot: Shot,
        captures: Arc<AtomicU32>,
        on_capture: Option<ShutdownSignal>,
    }

    impl FrameAcquirer for FakeCamera {
        fn name(&self) -> &str {
            "fake"
        }

        fn capture(&mut self) -> Result<CapturedFrame, CaptureError> {
            self.captures.fetch_add(1, Ordering::SeqCst);
            if let Some(signal) = &self.on_capture {
                signal.trigger();
            }
            match &self.shot {
                Shot::Frame(image) => Ok(CapturedFrame::new(image.clone())),
                Shot::Fail => Err(CaptureError::TriggerFailed("device busy".to_string())),
            }
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        output_dir: std::path::PathBuf,
        log_file: std::path::PathBuf,
        captures: Arc<AtomicU32>,
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            fix_budget: FixBudget {
                attempts: 1,
                duration: Duration::from_millis(10),
                attempt_timeout: Duration::from_millis(10),
            },
            poll_interval: Duration::from_millis(2),
            cooldown: Duration::ZERO,
        }
    }

    fn build(link_data: &str, shot: Shot, on_capture: Option<ShutdownSignal>) -> (PipelineOrchestrator, Harness) {
        let dir = tempfile::tempdir().unwrap();
        let output_dir = dir.path().join("images");
        let log_file = dir.path().join("log.json");
        let captures = Arc::new(AtomicU32::new(0));

        let source = EventSource::from_reader(
            Cursor::new(link_data.as_bytes().to_vec()),
            "test-link",
            "Sudden vibration detected",
            EofPolicy::Disconnect,
        )
        .unwrap();
        let camera = FakeCamera {
            shot,
            captures: captures.clone(),
            on_capture,
        };
        let recorder = EventRecorder::new(&RecorderConfig {
            output_dir: output_dir.display().to_string(),
            log_file: log_file.display().to_string(),
            jpeg_quality: 90,
        })
        .unwrap();

        let orchestrator = PipelineOrchestrator::new(
            source,
            GeoLocator::new(None),
            Box::new(camera),
            SurfaceClassifier::new(ClassifierConfig::default()),
            recorder,
            settings(),
        );
        (
            orchestrator,
            Harness {
                _dir: dir,
                output_dir,
                log_file,
                captures,
            },
        )
    }

    fn files_in(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    fn event(magnitude: f64) -> VibrationEvent {
        VibrationEvent {
            magnitude,
            raw_timestamp: "20240101_120000".to_string(),
            sequence: 1,
        }
    }

    #[test]
    fn test_pothole_event_end_to_end() {
        let (orchestrator, h) = build(
            "EVENT,2.35,20240101_120000\n",
            Shot::Frame(pothole_frame(320, 240, 160, 120, 120, 60)),
            None,
        );
        let report = orchestrator.run(&ShutdownSignal::new());

        // The replayed stream ends after the event: that is a lost link.
        assert!(matches!(report.outcome, RunOutcome::LinkLost(_)));
        assert_eq!(report.summary.total_events, 1);
        assert_eq!(report.summary.pothole_count, 1);
        assert_eq!(report.summary.capture_skips, 0);

        assert_eq!(files_in(&h.output_dir.join("potholes")), 1);
        assert_eq!(files_in(&h.output_dir.join("non_potholes")), 0);
        let entries = load_log(&h.log_file);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].label, Label::Pothole);
        assert_eq!(entries[0].vibration_magnitude, 2.35);
        assert!(!entries[0].location.available);
    }

    #[test]
    fn test_plain_road_is_filed_but_not_logged() {
        let (mut orchestrator, h) = build("", Shot::Frame(plain_road(320, 240)), None);
        let outcome = orchestrator.process_event(event(2.35), &ShutdownSignal::new());

        match outcome {
            EventOutcome::Recorded {
                label,
                confidence,
                paths,
            } => {
                assert_eq!(label, Label::NonPothole);
                assert_eq!(confidence, 0.0);
                assert_eq!(paths.unwrap().log, None);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(orchestrator.state(), PipelineState::AwaitingEvent);
        assert_eq!(files_in(&h.output_dir.join("non_potholes")), 1);
        assert!(load_log(&h.log_file).is_empty());
        assert_eq!(orchestrator.counters().total_events, 1);
        assert_eq!(orchestrator.counters().pothole_count, 0);
    }

    #[test]
    fn test_capture_failure_skips_without_counting() {
        let (mut orchestrator, h) = build("", Shot::Fail, None);
        let outcome = orchestrator.process_event(event(2.35), &ShutdownSignal::new());

        assert_eq!(outcome, EventOutcome::CaptureSkipped { reason: "trigger" });
        assert_eq!(orchestrator.state(), PipelineState::AwaitingEvent);
        assert_eq!(orchestrator.counters(), SessionCounters::default());
        for label in Label::ALL {
            assert_eq!(files_in(&h.output_dir.join(label.storage_dir())), 0);
        }
        assert!(!h.log_file.exists());

        let report = orchestrator.run(&ShutdownSignal::new());
        assert_eq!(report.summary.capture_skips, 1);
        assert_eq!(report.summary.total_events, 0);
    }

    #[test]
    fn test_shutdown_before_run_is_cancelled() {
        let (orchestrator, h) = build(
            "EVENT,1.0,t\n",
            Shot::Frame(plain_road(64, 64)),
            None,
        );
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        let report = orchestrator.run(&shutdown);

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.summary.total_events, 0);
        assert_eq!(h.captures.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shutdown_mid_event_abandons_it() {
        let shutdown = ShutdownSignal::new();
        let (orchestrator, h) = build(
            "EVENT,1.0,t\nEVENT,2.0,t\n",
            Shot::Frame(pothole_frame(320, 240, 160, 120, 120, 60)),
            Some(shutdown.clone()),
        );
        let report = orchestrator.run(&shutdown);

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.summary.total_events, 0);
        assert_eq!(h.captures.load(Ordering::SeqCst), 1);
        assert_eq!(files_in(&h.output_dir.join("potholes")), 0);
        assert!(!h.log_file.exists());
    }

    #[test]
    fn test_events_processed_in_arrival_order() {
        let (orchestrator, h) = build(
            "EVENT,1.5,a\nnoise\nEVENT,2.5,b\n",
            Shot::Frame(pothole_frame(320, 240, 160, 120, 120, 60)),
            None,
        );
        let report = orchestrator.run(&ShutdownSignal::new());

        assert_eq!(report.summary.total_events, 2);
        let magnitudes: Vec<f64> = load_log(&h.log_file)
            .iter()
            .map(|e| e.vibration_magnitude)
            .collect();
        assert_eq!(magnitudes, vec![1.5, 2.5]);
    }
}
