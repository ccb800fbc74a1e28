//! Integration tests for threshold and telemetry synchronization
//!
//! These tests run the analysis service, a `LocalBus`, a viewer and an admin
//! surface together and check what each party ends up seeing.

use async_trait::async_trait;
use decibender_core::domain::{
    Adjustment, AnalysisConfig, AnalysisService, ClassificationState, Event, InitOutcome,
    InitRequest, LinkStatus, LoudnessSample, Reactions, RmsSeconds, Surface, SurfaceRole,
    SurfaceSnapshot, SyncChannel, ThresholdField, ThresholdSet, Transition,
};
use decibender_infra::{LocalBus, ManualFeed, ManualSource};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct RecordingReactions {
    transitions: Mutex<Vec<Transition>>,
    adjustments: Mutex<Vec<Adjustment>>,
}

#[async_trait]
impl Reactions for RecordingReactions {
    async fn on_transition(&self, transition: Transition) -> anyhow::Result<()> {
        self.transitions.lock().unwrap().push(transition);
        Ok(())
    }

    async fn on_adjustment(&self, adjustment: Adjustment) -> anyhow::Result<()> {
        self.adjustments.lock().unwrap().push(adjustment);
        Ok(())
    }
}

struct Harness {
    bus: Arc<LocalBus>,
    service: AnalysisService,
    feed: ManualFeed,
    reactions: Arc<RecordingReactions>,
    viewer: Surface,
    admin: Surface,
}

impl Harness {
    fn new(analysis: AnalysisConfig) -> Self {
        let bus = Arc::new(LocalBus::new().unwrap());
        let channel: Arc<dyn SyncChannel> = bus.clone();
        let (source, feed) = ManualSource::new();
        let reactions = Arc::new(RecordingReactions::default());
        let service = AnalysisService::new(
            channel.clone(),
            Arc::new(source),
            reactions.clone(),
            analysis,
        );

        Self {
            bus,
            service,
            feed,
            reactions,
            viewer: Surface::new(SurfaceRole::viewer(), channel.clone()),
            admin: Surface::new(SurfaceRole::admin(), channel),
        }
    }

    /// Viewer mounted, analysis seeded by the admin, admin mounted
    async fn started(analysis: AnalysisConfig) -> Self {
        let mut harness = Self::new(analysis);
        harness.viewer.mount().unwrap();
        let outcome = harness.service.init(harness.admin.init_request()).unwrap();
        assert_eq!(outcome, InitOutcome::Started);
        harness.admin.mount().unwrap();
        harness.settle().await;
        harness
    }

    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let bus = self.bus.clone();
        tokio::task::spawn_blocking(move || bus.flush()).await.unwrap();
    }

    fn viewer_view(&self) -> SurfaceSnapshot {
        self.viewer.snapshot(Instant::now())
    }

    /// Poll until `check` holds on the viewer, settling between attempts
    async fn eventually(&self, check: impl Fn(&SurfaceSnapshot) -> bool) -> SurfaceSnapshot {
        for _ in 0..100 {
            let snapshot = self.viewer_view();
            if check(&snapshot) {
                return snapshot;
            }
            self.settle().await;
        }
        panic!("condition never held, last view: {:?}", self.viewer_view());
    }

    /// Poll until a reaction hook has recorded what `check` expects
    async fn reacted(&self, check: impl Fn(&RecordingReactions) -> bool) {
        for _ in 0..100 {
            if check(&self.reactions) {
                return;
            }
            self.settle().await;
        }
        panic!("reaction never observed");
    }
}

fn no_hold() -> AnalysisConfig {
    AnalysisConfig {
        adjustment_hold_secs: 0.0,
        ..AnalysisConfig::default()
    }
}

fn set(too_loud: f32, too_quiet: f32, grace: f32) -> ThresholdSet {
    ThresholdSet::new(too_loud, too_quiet, grace).unwrap()
}

// ============================================================================
// THRESHOLD SYNC
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_viewer_converges_on_handshake() {
    let harness = Harness::started(no_hold()).await;

    let view = harness
        .eventually(|view| view.revision == Some(0) && view.state.is_some())
        .await;
    assert_eq!(view.thresholds, ThresholdSet::ADMIN_SEED);
    assert_eq!(view.state, Some(ClassificationState::Acceptable));
    assert_eq!(view.link, LinkStatus::Live);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_admin_edit_round_trips_to_viewer() {
    let harness = Harness::started(no_hold()).await;

    let edited = harness
        .admin
        .set_field(ThresholdField::TooLoud, -30.0)
        .unwrap();
    assert_eq!(edited, set(-30.0, -75.0, 6.0));

    let view = harness.eventually(|view| view.revision == Some(1)).await;
    assert_eq!(view.thresholds.too_loud(), edited.too_loud());
    assert_eq!(view.thresholds.too_quiet(), edited.too_quiet());
    assert_eq!(view.thresholds.grace(), edited.grace());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repeated_edit_is_idempotent() {
    let harness = Harness::started(no_hold()).await;
    let target = set(-25.0, -70.0, 4.0);

    harness.admin.set_thresholds(target).unwrap();
    harness.eventually(|view| view.revision == Some(1)).await;

    harness.admin.set_thresholds(target).unwrap();
    harness.settle().await;
    harness.settle().await;

    let view = harness.viewer_view();
    assert_eq!(view.revision, Some(1));
    assert_eq!(view.thresholds, target);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_louder_is_optimistic_then_acknowledged() {
    let harness = Harness::started(no_hold()).await;
    harness.eventually(|view| view.revision == Some(0)).await;

    let shown = harness.viewer.adjust(Adjustment::Louder).unwrap();
    assert_eq!(shown, set(-29.0, -69.0, 6.0));
    assert_eq!(harness.viewer_view().thresholds, shown);

    let view = harness
        .eventually(|view| view.pending_edits == 0 && view.revision == Some(1))
        .await;
    assert_eq!(view.thresholds, shown);
    harness
        .reacted(|reactions| *reactions.adjustments.lock().unwrap() == vec![Adjustment::Louder])
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_edits_dropped() {
    let harness = Harness::started(no_hold()).await;
    harness.eventually(|view| view.revision == Some(0)).await;

    harness
        .bus
        .publish(Event::new("thresholds", r#"{"too_loud": "loud"}"#))
        .unwrap();
    harness
        .bus
        .publish(Event::new(
            "thresholds",
            r#"{"too_loud": -90, "too_quiet": -10, "grace": 8}"#,
        ))
        .unwrap();
    harness.settle().await;
    assert_eq!(harness.viewer_view().revision, Some(0));

    // Handlers survive the bad messages; a valid edit with the legacy spelling still lands
    harness
        .bus
        .publish(Event::new(
            "thresholds",
            r#"{"too_loud": -12, "too_quite": -60, "grace": 3}"#,
        ))
        .unwrap();
    let view = harness.eventually(|view| view.revision == Some(1)).await;
    assert_eq!(view.thresholds, set(-12.0, -60.0, 3.0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_command_sent_before_init_is_not_replayed() {
    let mut harness = Harness::new(no_hold());
    harness.viewer.mount().unwrap();

    // Nothing is listening for louder yet
    harness.viewer.adjust(Adjustment::Louder).unwrap();
    harness.settle().await;

    harness
        .service
        .init(harness.admin.init_request())
        .unwrap();
    harness.admin.mount().unwrap();
    harness.eventually(|view| view.revision == Some(0)).await;

    let target = set(-30.0, -70.0, 5.0);
    harness.admin.set_thresholds(target).unwrap();
    let view = harness.eventually(|view| view.revision == Some(1)).await;
    assert_eq!(view.thresholds, target);
    assert_eq!(view.pending_edits, 0);
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hysteresis_scenario_end_to_end() {
    let mut harness = Harness::new(no_hold());
    harness.viewer.mount().unwrap();
    harness
        .service
        .init(InitRequest {
            initial_thresholds: Some(set(-20.0, -80.0, 8.0)),
            initial_rms_seconds: None,
        })
        .unwrap();

    let steps = [
        (-15.0, ClassificationState::TooLoud),
        // Above too_loud - grace = -28
        (-25.0, ClassificationState::TooLoud),
        (-29.0, ClassificationState::Acceptable),
    ];
    for (loudness, expected) in steps {
        assert!(harness.feed.push(loudness));
        let view = harness
            .eventually(|view| view.loudness == Some(LoudnessSample::new(loudness)))
            .await;
        let view = if view.state == Some(expected) {
            view
        } else {
            harness.eventually(|view| view.state == Some(expected)).await
        };
        assert_eq!(view.state, Some(expected), "after {loudness} dB");
    }

    harness
        .reacted(|reactions| {
            reactions
                .transitions
                .lock()
                .unwrap()
                .last()
                .is_some_and(|transition| transition.to == ClassificationState::Acceptable)
        })
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_adjustment_hold_keeps_state() {
    let harness = Harness::started(AnalysisConfig::default()).await;
    harness.eventually(|view| view.revision == Some(0)).await;

    harness.viewer.adjust(Adjustment::Quieter).unwrap();
    harness.eventually(|view| view.pending_edits == 0).await;

    // Far above too_loud, but the 7 s hold suspends classification
    harness.feed.push(-1.0);
    let view = harness
        .eventually(|view| view.loudness == Some(LoudnessSample::new(-1.0)))
        .await;
    assert_eq!(view.state, Some(ClassificationState::Acceptable));
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_init_is_idempotent() {
    let harness = Harness::started(no_hold()).await;

    let again = harness
        .service
        .init(harness.viewer.init_request())
        .unwrap();
    assert_eq!(again, InitOutcome::AlreadyInitialized);
    assert_eq!(harness.bus.subscriber_count("louder"), 1);
    assert_eq!(harness.bus.subscriber_count("thresholds"), 2);

    harness.settle().await;
    assert_eq!(harness.viewer_view().thresholds, ThresholdSet::ADMIN_SEED);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_replaces_viewer_thresholds() {
    let harness = Harness::started(no_hold()).await;
    harness
        .admin
        .set_field(ThresholdField::TooLoud, -30.0)
        .unwrap();
    harness.eventually(|view| view.revision == Some(1)).await;

    harness.service.shutdown();
    assert!(!harness.service.is_running());

    let restarted = set(-10.0, -90.0, 2.0);
    let outcome = harness
        .service
        .init(InitRequest {
            initial_thresholds: Some(restarted),
            initial_rms_seconds: None,
        })
        .unwrap();
    assert_eq!(outcome, InitOutcome::Started);
    assert_eq!(harness.bus.subscriber_count("thresholds"), 2);

    let view = harness.eventually(|view| view.thresholds == restarted).await;
    assert_eq!(view.revision, Some(0));

    // The reopened source feeds the new loop
    assert!(harness.feed.push(-5.0));
    harness
        .eventually(|view| view.state == Some(ClassificationState::TooLoud))
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_window_change_reaches_source() {
    let harness = Harness::started(no_hold()).await;
    assert_eq!(harness.feed.window(), Some(RmsSeconds::DEFAULT));

    harness.admin.set_rms_seconds(1.5).unwrap();
    for _ in 0..100 {
        if harness.feed.window() == RmsSeconds::new(1.5).ok() {
            return;
        }
        harness.settle().await;
    }
    panic!("window change never reached the loudness source");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unmount_releases_every_handler() {
    let mut harness = Harness::started(no_hold()).await;
    harness.eventually(|view| view.state.is_some()).await;

    assert_eq!(harness.viewer.unmount(), 3);
    assert_eq!(harness.bus.subscriber_count("state"), 0);
    assert_eq!(harness.bus.subscriber_count("loudness"), 0);

    harness.feed.push(-5.0);
    harness.settle().await;
    harness.settle().await;

    let view = harness.viewer_view();
    assert_eq!(view.loudness, None);
    assert_eq!(view.state, Some(ClassificationState::Acceptable));
    assert_eq!(view.link, LinkStatus::Unobserved);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_link_waits_while_analysis_absent() {
    let mut harness = Harness::new(no_hold());
    harness.viewer.mount().unwrap();
    // The admin's seed edit reaches the viewer but is not analysis output
    harness.admin.mount().unwrap();
    harness.settle().await;

    let view = harness.viewer_view();
    assert_eq!(view.link, LinkStatus::Waiting);
    assert_eq!(view.revision, None);
    assert_eq!(view.state, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_closed_channel_reported_as_disconnected() {
    let harness = Harness::started(no_hold()).await;
    harness.eventually(|view| view.revision == Some(0)).await;

    harness.service.shutdown();
    harness.bus.shutdown();

    let shown = harness.viewer.adjust(Adjustment::Quieter).unwrap();
    let view = harness.viewer_view();
    assert_eq!(view.link, LinkStatus::Disconnected);
    assert_eq!(view.queued, 1);
    assert_eq!(view.thresholds, shown);
    assert_eq!(harness.viewer.retry_outbox(), 1);
}
