//! Operator surfaces
//!
//! A surface is one independently running operator window. Viewer and admin
//! windows share this single implementation and differ only in their
//! [`SurfaceRole`]: which edits they may make, the seed they start from, the
//! clamp ranges of their inputs, and whether they read analysis output back
//! ([`SyncMode::ReadReconcile`]) or only publish ([`SyncMode::WriteOnly`]).
//!
//! Surfaces never classify loudness themselves; they display the `state`
//! broadcast by the analysis process.

use crate::domain::channel::{ChannelError, HandlerError, Subscription, SyncChannel};
use crate::domain::classifier::ClassificationState;
use crate::domain::lock;
use crate::domain::loudness::{LoudnessSample, RmsSeconds, WindowError};
use crate::domain::protocol::{Channel, Event, InitRequest, Message, SurfaceId, ThresholdEdit};
use crate::domain::replica::{PendingEdit, Reconciled, SyncMode, ThresholdReplica};
use crate::domain::thresholds::{
    Adjustment, EditBounds, ThresholdError, ThresholdField, ThresholdSet,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub type Result<T> = std::result::Result<T, SurfaceError>;

/// Maximum number of messages held while the channel is unavailable
pub const OUTBOX_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("surface '{surface}' is not permitted to {action}")]
    NotPermitted {
        surface: SurfaceId,
        action: &'static str,
    },

    #[error(transparent)]
    Threshold(#[from] ThresholdError),

    #[error(transparent)]
    Window(#[from] WindowError),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Declares what a surface may do and how it syncs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceRole {
    pub id: SurfaceId,
    pub mode: SyncMode,
    /// May replace threshold fields
    #[serde(default)]
    pub edits_thresholds: bool,
    /// May change the RMS window
    #[serde(default)]
    pub edits_window: bool,
    /// May issue louder/quieter
    #[serde(default = "default_true")]
    pub issues_adjustments: bool,
    pub seed: ThresholdSet,
    #[serde(default)]
    pub seed_rms_seconds: RmsSeconds,
    #[serde(default)]
    pub bounds: EditBounds,
    /// Shift used for the optimistic overlay of louder/quieter
    #[serde(default = "default_step")]
    pub shift_step_db: f32,
    /// Telemetry silence after which the link is reported stale
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: f32,
}

fn default_true() -> bool {
    true
}

fn default_step() -> f32 {
    Adjustment::DEFAULT_STEP_DB
}

fn default_stale_after() -> f32 {
    5.0
}

impl SurfaceRole {
    /// Read-reconcile surface showing telemetry and issuing coarse adjustments
    pub fn viewer() -> Self {
        Self {
            id: SurfaceId::new("viewer"),
            mode: SyncMode::ReadReconcile,
            edits_thresholds: false,
            edits_window: false,
            issues_adjustments: true,
            seed: ThresholdSet::VIEWER_SEED,
            seed_rms_seconds: RmsSeconds::DEFAULT,
            bounds: EditBounds::FULL_SCALE,
            shift_step_db: default_step(),
            stale_after_secs: default_stale_after(),
        }
    }

    /// Write-only surface that owns threshold and window edits
    pub fn admin() -> Self {
        Self {
            id: SurfaceId::new("admin"),
            mode: SyncMode::WriteOnly,
            edits_thresholds: true,
            edits_window: true,
            issues_adjustments: true,
            seed: ThresholdSet::ADMIN_SEED,
            seed_rms_seconds: RmsSeconds::DEFAULT,
            bounds: EditBounds::FULL_SCALE,
            shift_step_db: default_step(),
            stale_after_secs: default_stale_after(),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.id.as_str().is_empty() {
            return Err("surface id must not be empty".to_string());
        }
        if let Some(range) = self.bounds.invalid_range() {
            return Err(format!("{}: bounds for {range} are invalid", self.id));
        }
        if !(self.shift_step_db.is_finite() && self.shift_step_db > 0.0) {
            return Err(format!("{}: shift_step_db must be positive", self.id));
        }
        if !(self.stale_after_secs.is_finite() && self.stale_after_secs > 0.0) {
            return Err(format!("{}: stale_after_secs must be positive", self.id));
        }
        Ok(())
    }

    fn stale_after(&self) -> Duration {
        Duration::try_from_secs_f32(self.stale_after_secs).unwrap_or(Duration::MAX)
    }

    fn not_permitted(&self, action: &'static str) -> SurfaceError {
        SurfaceError::NotPermitted {
            surface: self.id.clone(),
            action,
        }
    }
}

/// Connection to the analysis process as seen by one surface
///
/// Kept apart from the classification state so a silent analysis process is
/// never mistaken for `Acceptable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    /// The surface does not read analysis output
    Unobserved,
    /// Mounted, nothing received yet
    Waiting,
    Live,
    /// No telemetry within the stale window
    Stale,
    /// Publishes are queued because the channel refused them
    Disconnected,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LinkStatus::Unobserved => "unobserved",
            LinkStatus::Waiting => "waiting",
            LinkStatus::Live => "live",
            LinkStatus::Stale => "stale",
            LinkStatus::Disconnected => "disconnected from analysis",
        };
        f.write_str(label)
    }
}

/// Everything a renderer needs for one frame
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceSnapshot {
    pub surface: SurfaceId,
    pub mode: SyncMode,
    pub thresholds: ThresholdSet,
    pub pending_edits: usize,
    pub revision: Option<u64>,
    pub rms_seconds: RmsSeconds,
    pub loudness: Option<LoudnessSample>,
    pub state: Option<ClassificationState>,
    pub link: LinkStatus,
    pub queued: usize,
}

impl SurfaceSnapshot {
    pub fn meter_percent(&self) -> f32 {
        self.loudness.map_or(0.0, |sample| sample.meter_percent())
    }

    pub fn status_line(&self) -> String {
        let state = self.state.map_or("-", |state| state.as_str());
        let loudness = self
            .loudness
            .map_or_else(|| "--".to_string(), |sample| format!("{:.1} dB", sample.db()));
        let revision = self
            .revision
            .map_or_else(|| "-".to_string(), |revision| revision.to_string());
        format!(
            "{} [{}] {state} {loudness} | {} | rms {:.1} s | rev {revision} pending {}",
            self.surface,
            self.link,
            self.thresholds,
            self.rms_seconds.seconds(),
            self.pending_edits
        )
    }
}

struct SurfaceView {
    replica: ThresholdReplica,
    rms_seconds: RmsSeconds,
    loudness: Option<LoudnessSample>,
    state: Option<ClassificationState>,
    last_telemetry: Option<Instant>,
}

impl SurfaceView {
    fn receive(&mut self, surface: &SurfaceId, event: &Event) -> std::result::Result<(), HandlerError> {
        let message = Message::decode(event)?;
        let now = Instant::now();
        match message {
            Message::Thresholds(broadcast) => {
                if self.replica.apply_broadcast(&broadcast, now) == Reconciled::Stale {
                    debug!(
                        surface = %surface,
                        session = broadcast.session,
                        revision = broadcast.revision,
                        "Dropped stale thresholds broadcast"
                    );
                }
            }
            // Edit requests come from other surfaces and say nothing about analysis
            Message::EditThresholds(_) => return Ok(()),
            Message::Loudness(sample) => self.loudness = Some(sample),
            Message::State(state) => self.state = Some(state),
            other => {
                return Err(HandlerError::Rejected(format!(
                    "surface does not consume '{}'",
                    other.channel()
                )))
            }
        }
        self.last_telemetry = Some(now);
        Ok(())
    }
}

/// Messages waiting for the channel to accept them
///
/// Snapshot channels keep only their latest value; commands are all kept.
struct Outbox {
    queue: VecDeque<Message>,
    capacity: usize,
}

impl Outbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
        }
    }

    fn push(&mut self, message: Message) -> Option<Message> {
        let channel = message.channel();
        if channel.is_snapshot() {
            self.queue.retain(|queued| queued.channel() != channel);
        }
        let overflow = if self.queue.len() >= self.capacity {
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(message);
        overflow
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

pub struct Surface {
    role: SurfaceRole,
    channel: Arc<dyn SyncChannel>,
    view: Arc<Mutex<SurfaceView>>,
    outbox: Mutex<Outbox>,
    mounted: Option<Vec<Subscription>>,
}

impl Surface {
    pub fn new(role: SurfaceRole, channel: Arc<dyn SyncChannel>) -> Self {
        let view = SurfaceView {
            replica: ThresholdReplica::new(role.id.clone(), role.mode, role.seed),
            rms_seconds: role.seed_rms_seconds,
            loudness: None,
            state: None,
            last_telemetry: None,
        };
        Self {
            role,
            channel,
            view: Arc::new(Mutex::new(view)),
            outbox: Mutex::new(Outbox::new(OUTBOX_CAPACITY)),
            mounted: None,
        }
    }

    pub fn role(&self) -> &SurfaceRole {
        &self.role
    }

    pub fn id(&self) -> &SurfaceId {
        &self.role.id
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.is_some()
    }

    /// Attach to the channel. Calling it again while mounted does nothing.
    ///
    /// Read-reconcile surfaces subscribe to analysis output; write-only
    /// surfaces push their seeded model outward instead.
    pub fn mount(&mut self) -> Result<()> {
        if self.mounted.is_some() {
            return Ok(());
        }

        let mut subscriptions = Vec::new();
        match self.role.mode {
            SyncMode::ReadReconcile => {
                for channel in [Channel::Thresholds, Channel::Loudness, Channel::State] {
                    let view = Arc::clone(&self.view);
                    let surface = self.role.id.clone();
                    subscriptions.push(self.channel.subscribe(
                        channel.name(),
                        Box::new(move |event: &Event| lock(&view).receive(&surface, event)),
                    )?);
                }
            }
            SyncMode::WriteOnly => {
                let view = lock(&self.view);
                if self.role.edits_thresholds {
                    self.dispatch(Message::EditThresholds(ThresholdEdit {
                        thresholds: view.replica.displayed(),
                        tag: None,
                    }));
                }
                if self.role.edits_window {
                    self.dispatch(Message::RmsSeconds(view.rms_seconds));
                }
            }
        }

        info!(
            surface = %self.role.id,
            mode = ?self.role.mode,
            subscriptions = subscriptions.len(),
            "Surface mounted"
        );
        self.mounted = Some(subscriptions);
        Ok(())
    }

    /// Release every subscription taken by [`Surface::mount`]; returns how many
    pub fn unmount(&mut self) -> usize {
        let Some(subscriptions) = self.mounted.take() else {
            return 0;
        };
        let released = subscriptions.len();
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        info!(surface = %self.role.id, released, "Surface unmounted");
        released
    }

    /// Replace one threshold field, clamped to this surface's bounds
    pub fn set_field(&self, field: ThresholdField, value: f32) -> Result<ThresholdSet> {
        if !self.role.edits_thresholds {
            return Err(self.role.not_permitted("edit thresholds"));
        }
        let value = self.role.bounds.clamp(field, value);
        let mut view = lock(&self.view);
        let next = view.replica.displayed().with_field(field, value)?;
        self.commit_thresholds(&mut view, next)
    }

    /// Replace the whole threshold set, each field clamped to this surface's bounds
    pub fn set_thresholds(&self, thresholds: ThresholdSet) -> Result<ThresholdSet> {
        if !self.role.edits_thresholds {
            return Err(self.role.not_permitted("edit thresholds"));
        }
        let bounds = &self.role.bounds;
        let next = ThresholdSet::new(
            bounds.clamp(ThresholdField::TooLoud, thresholds.too_loud()),
            bounds.clamp(ThresholdField::TooQuiet, thresholds.too_quiet()),
            bounds.clamp(ThresholdField::Grace, thresholds.grace()),
        )?;
        let mut view = lock(&self.view);
        self.commit_thresholds(&mut view, next)
    }

    fn commit_thresholds(&self, view: &mut SurfaceView, next: ThresholdSet) -> Result<ThresholdSet> {
        let tag = view.replica.record_local(PendingEdit::Replace(next), Instant::now())?;
        debug!(surface = %self.role.id, thresholds = %next, "Threshold edit");
        self.dispatch(Message::EditThresholds(ThresholdEdit {
            thresholds: next,
            tag,
        }));
        Ok(view.replica.displayed())
    }

    /// Issue louder/quieter, showing the shift before it is confirmed
    pub fn adjust(&self, adjustment: Adjustment) -> Result<ThresholdSet> {
        if !self.role.issues_adjustments {
            return Err(self.role.not_permitted("adjust thresholds"));
        }
        let delta = adjustment.delta(self.role.shift_step_db);
        let mut view = lock(&self.view);
        let tag = view.replica.record_local(PendingEdit::Shift(delta), Instant::now())?;
        debug!(surface = %self.role.id, %adjustment, "Adjustment issued");
        self.dispatch(Message::Adjust { adjustment, tag });
        Ok(view.replica.displayed())
    }

    /// Change the RMS window, clamped to this surface's bounds
    pub fn set_rms_seconds(&self, seconds: f32) -> Result<RmsSeconds> {
        if !self.role.edits_window {
            return Err(self.role.not_permitted("change the RMS window"));
        }
        let window = RmsSeconds::new(self.role.bounds.clamp_window(seconds))?;
        let mut view = lock(&self.view);
        view.rms_seconds = window;
        self.dispatch(Message::RmsSeconds(window));
        Ok(window)
    }

    /// Try to flush queued publishes; returns how many remain queued
    pub fn retry_outbox(&self) -> usize {
        let mut outbox = lock(&self.outbox);
        self.drain(&mut outbox)
    }

    /// Handshake payload for the analysis process
    pub fn init_request(&self) -> InitRequest {
        let view = lock(&self.view);
        InitRequest {
            initial_thresholds: Some(view.replica.displayed()),
            initial_rms_seconds: self.role.edits_window.then_some(view.rms_seconds),
        }
    }

    /// Current view; unacknowledged edits older than the pending timeout are dropped first
    pub fn snapshot(&self, now: Instant) -> SurfaceSnapshot {
        let mut view = lock(&self.view);
        view.replica.expire(now);
        let queued = lock(&self.outbox).len();
        let link = if queued > 0 {
            LinkStatus::Disconnected
        } else if self.role.mode == SyncMode::WriteOnly || !self.is_mounted() {
            LinkStatus::Unobserved
        } else {
            match view.last_telemetry {
                None => LinkStatus::Waiting,
                Some(at) if now.saturating_duration_since(at) > self.role.stale_after() => {
                    LinkStatus::Stale
                }
                Some(_) => LinkStatus::Live,
            }
        };

        SurfaceSnapshot {
            surface: self.role.id.clone(),
            mode: self.role.mode,
            thresholds: view.replica.displayed(),
            pending_edits: view.replica.pending_len(),
            revision: view.replica.revision(),
            rms_seconds: view.rms_seconds,
            loudness: view.loudness,
            state: view.state,
            link,
            queued,
        }
    }

    /// Queue a message behind anything already waiting, then flush
    fn dispatch(&self, message: Message) {
        let mut outbox = lock(&self.outbox);
        if let Some(dropped) = outbox.push(message) {
            warn!(
                surface = %self.role.id,
                channel = %dropped.channel(),
                "Outbox full, dropped oldest message"
            );
        }
        self.drain(&mut outbox);
    }

    fn drain(&self, outbox: &mut Outbox) -> usize {
        while let Some(message) = outbox.queue.front() {
            match self.channel.send(message) {
                Ok(()) => {}
                Err(err @ ChannelError::Encode { .. }) => {
                    error!(surface = %self.role.id, "Dropping unencodable message: {}", err);
                }
                Err(err) => {
                    warn!(
                        surface = %self.role.id,
                        channel = %message.channel(),
                        queued = outbox.len(),
                        "Publish failed, keeping message queued: {}",
                        err
                    );
                    break;
                }
            }
            outbox.queue.pop_front();
        }
        outbox.len()
    }
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("role", &self.role)
            .field("mounted", &self.is_mounted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::channel::Handler;
    use crate::domain::protocol::{RequestTag, ThresholdBroadcast};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Weak;

    type Handlers = Mutex<HashMap<String, Vec<(u64, Arc<Handler>)>>>;

    /// Synchronous in-test channel: publishes are recorded, deliveries are manual
    #[derive(Default)]
    struct FakeChannel {
        published: Mutex<Vec<Event>>,
        handlers: Arc<Handlers>,
        next_id: AtomicU64,
        offline: AtomicBool,
    }

    impl FakeChannel {
        fn deliver(&self, event: Event) -> Vec<std::result::Result<(), HandlerError>> {
            let handlers: Vec<Arc<Handler>> = self
                .handlers
                .lock()
                .unwrap()
                .get(&event.name)
                .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default();
            handlers.iter().map(|handler| handler(&event)).collect()
        }

        fn subscribers(&self, name: &str) -> usize {
            self.handlers.lock().unwrap().get(name).map_or(0, Vec::len)
        }

        fn published(&self) -> Vec<Message> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .map(|event| Message::decode(event).unwrap())
                .collect()
        }
    }

    impl SyncChannel for FakeChannel {
        fn publish(&self, event: Event) -> crate::domain::channel::Result<()> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(ChannelError::Closed);
            }
            self.published.lock().unwrap().push(event);
            Ok(())
        }

        fn subscribe(
            &self,
            name: &str,
            handler: Handler,
        ) -> crate::domain::channel::Result<Subscription> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.handlers
                .lock()
                .unwrap()
                .entry(name.to_string())
                .or_default()
                .push((id, Arc::new(handler)));

            let handlers: Weak<Handlers> = Arc::downgrade(&self.handlers);
            let key = name.to_string();
            Ok(Subscription::new(name, move || {
                if let Some(handlers) = handlers.upgrade() {
                    if let Some(entries) = handlers.lock().unwrap().get_mut(&key) {
                        entries.retain(|(entry, _)| *entry != id);
                    }
                }
            }))
        }
    }

    fn surface(role: SurfaceRole) -> (Surface, Arc<FakeChannel>) {
        let channel = Arc::new(FakeChannel::default());
        let surface = Surface::new(role, channel.clone() as Arc<dyn SyncChannel>);
        (surface, channel)
    }

    fn broadcast(thresholds: ThresholdSet, revision: u64, ack: Option<RequestTag>) -> Event {
        Message::Thresholds(ThresholdBroadcast {
            thresholds,
            session: 1,
            revision,
            ack,
        })
        .to_event()
        .unwrap()
    }

    #[test]
    fn test_viewer_mount_cycle() {
        let (mut viewer, channel) = surface(SurfaceRole::viewer());
        viewer.mount().unwrap();
        viewer.mount().unwrap();
        for name in ["thresholds", "loudness", "state"] {
            assert_eq!(channel.subscribers(name), 1);
        }

        assert_eq!(viewer.unmount(), 3);
        assert_eq!(viewer.unmount(), 0);
        assert_eq!(channel.subscribers("state"), 0);
        assert!(channel.deliver(Event::new("state", "\"TooLoud\"")).is_empty());
        assert_eq!(viewer.snapshot(Instant::now()).state, None);
    }

    #[test]
    fn test_admin_publishes_seed_and_clamped_edits() {
        let (mut admin, channel) = surface(SurfaceRole::admin());
        admin.mount().unwrap();
        assert_eq!(channel.subscribers("thresholds"), 0);

        let next = admin.set_field(ThresholdField::TooLoud, 12.0).unwrap();
        assert_eq!(next.too_loud(), 0.0);

        let published = channel.published();
        assert_eq!(
            published,
            vec![
                Message::EditThresholds(ThresholdEdit {
                    thresholds: ThresholdSet::ADMIN_SEED,
                    tag: None
                }),
                Message::RmsSeconds(RmsSeconds::DEFAULT),
                Message::EditThresholds(ThresholdEdit {
                    thresholds: next,
                    tag: None
                }),
            ]
        );
        assert_eq!(admin.snapshot(Instant::now()).link, LinkStatus::Unobserved);
    }

    #[test]
    fn test_inverted_edit_rejected_and_not_published() {
        let (admin, channel) = surface(SurfaceRole::admin());
        let err = admin.set_field(ThresholdField::TooQuiet, -10.0).unwrap_err();
        assert!(matches!(err, SurfaceError::Threshold(ThresholdError::Inverted { .. })));
        assert!(channel.published().is_empty());
    }

    #[test]
    fn test_viewer_cannot_edit_thresholds() {
        let (viewer, _channel) = surface(SurfaceRole::viewer());
        assert!(matches!(
            viewer.set_field(ThresholdField::Grace, 3.0),
            Err(SurfaceError::NotPermitted { .. })
        ));
        assert!(matches!(
            viewer.set_rms_seconds(1.0),
            Err(SurfaceError::NotPermitted { .. })
        ));
    }

    #[test]
    fn test_optimistic_adjustment_survives_older_broadcast() {
        let (mut viewer, channel) = surface(SurfaceRole::viewer());
        viewer.mount().unwrap();
        channel.deliver(broadcast(ThresholdSet::VIEWER_SEED, 1, None));

        let shown = viewer.adjust(Adjustment::Louder).unwrap();
        assert_eq!(shown.too_loud(), -14.0);

        let tag = match channel.published().last() {
            Some(Message::Adjust {
                adjustment: Adjustment::Louder,
                tag: Some(tag),
            }) => tag.clone(),
            other => panic!("expected tagged louder, got {other:?}"),
        };

        // A stale echo must not clobber the pending shift
        channel.deliver(broadcast(ThresholdSet::VIEWER_SEED, 0, None));
        assert_eq!(viewer.snapshot(Instant::now()).thresholds.too_loud(), -14.0);

        let confirmed = ThresholdSet::new(-14.0, -74.0, 8.0).unwrap();
        channel.deliver(broadcast(confirmed, 2, Some(tag)));
        let snapshot = viewer.snapshot(Instant::now());
        assert_eq!(snapshot.thresholds, confirmed);
        assert_eq!(snapshot.pending_edits, 0);
        assert_eq!(snapshot.revision, Some(2));
    }

    #[test]
    fn test_malformed_payload_dropped() {
        let (mut viewer, channel) = surface(SurfaceRole::viewer());
        viewer.mount().unwrap();

        let results = channel.deliver(Event::new("loudness", "{\"loudness\": \"loud\"}"));
        assert!(matches!(results[..], [Err(HandlerError::Decode(_))]));

        channel.deliver(Event::new("loudness", "{\"loudness\": -30.0}"));
        let snapshot = viewer.snapshot(Instant::now());
        assert_eq!(snapshot.loudness, Some(LoudnessSample::new(-30.0)));
        assert!((snapshot.meter_percent() - 70.0).abs() < 1e-3);
    }

    #[test]
    fn test_link_status_follows_telemetry() {
        let (mut viewer, channel) = surface(SurfaceRole::viewer());
        assert_eq!(viewer.snapshot(Instant::now()).link, LinkStatus::Unobserved);

        viewer.mount().unwrap();
        assert_eq!(viewer.snapshot(Instant::now()).link, LinkStatus::Waiting);

        channel.deliver(Event::new("state", "\"Acceptable\""));
        assert_eq!(viewer.snapshot(Instant::now()).link, LinkStatus::Live);

        let later = Instant::now() + Duration::from_secs(10);
        assert_eq!(viewer.snapshot(later).link, LinkStatus::Stale);
    }

    #[test]
    fn test_edit_requests_do_not_count_as_analysis_output() {
        let (mut viewer, channel) = surface(SurfaceRole::viewer());
        viewer.mount().unwrap();

        // An admin pushing its seed while no analysis process is running
        let edit = Message::EditThresholds(ThresholdEdit {
            thresholds: ThresholdSet::ADMIN_SEED,
            tag: None,
        })
        .to_event()
        .unwrap();
        assert!(channel.deliver(edit).iter().all(|result| result.is_ok()));

        let snapshot = viewer.snapshot(Instant::now());
        assert_eq!(snapshot.link, LinkStatus::Waiting);
        assert_eq!(snapshot.thresholds, ThresholdSet::VIEWER_SEED);
        assert_eq!(snapshot.revision, None);
    }

    #[test]
    fn test_unacknowledged_adjustment_expires_from_view() {
        let (mut viewer, channel) = surface(SurfaceRole::viewer());
        viewer.mount().unwrap();
        channel.deliver(broadcast(ThresholdSet::VIEWER_SEED, 0, None));

        viewer.adjust(Adjustment::Quieter).unwrap();
        assert_eq!(viewer.snapshot(Instant::now()).pending_edits, 1);

        let later = Instant::now() + crate::domain::replica::PENDING_TIMEOUT;
        let snapshot = viewer.snapshot(later);
        assert_eq!(snapshot.pending_edits, 0);
        assert_eq!(snapshot.thresholds, ThresholdSet::VIEWER_SEED);
    }

    #[test]
    fn test_outbox_coalesces_and_retries_in_order() {
        let (admin, channel) = surface(SurfaceRole::admin());
        channel.offline.store(true, Ordering::SeqCst);

        admin.set_field(ThresholdField::TooLoud, -30.0).unwrap();
        let latest = admin.set_field(ThresholdField::TooLoud, -25.0).unwrap();
        admin.adjust(Adjustment::Quieter).unwrap();

        let snapshot = admin.snapshot(Instant::now());
        assert_eq!(snapshot.link, LinkStatus::Disconnected);
        assert_eq!(snapshot.queued, 2);
        assert_eq!(admin.retry_outbox(), 2);

        channel.offline.store(false, Ordering::SeqCst);
        assert_eq!(admin.retry_outbox(), 0);
        assert_eq!(
            channel.published(),
            vec![
                Message::EditThresholds(ThresholdEdit {
                    thresholds: latest,
                    tag: None
                }),
                Message::Adjust {
                    adjustment: Adjustment::Quieter,
                    tag: None
                },
            ]
        );
    }

    #[test]
    fn test_init_request_by_role() {
        let (viewer, _) = surface(SurfaceRole::viewer());
        let request = viewer.init_request();
        assert_eq!(request.initial_thresholds, Some(ThresholdSet::VIEWER_SEED));
        assert_eq!(request.initial_rms_seconds, None);

        let (admin, _) = surface(SurfaceRole::admin());
        admin.set_rms_seconds(60.0).unwrap();
        let request = admin.init_request();
        assert_eq!(request.initial_thresholds, Some(ThresholdSet::ADMIN_SEED));
        assert_eq!(request.initial_rms_seconds, Some(RmsSeconds::new(10.0).unwrap()));
    }

    #[test]
    fn test_status_line_mentions_link_and_state() {
        let (mut viewer, channel) = surface(SurfaceRole::viewer());
        viewer.mount().unwrap();
        channel.deliver(Event::new("state", "\"TooQuiet\""));
        let line = viewer.snapshot(Instant::now()).status_line();
        assert!(line.starts_with("viewer [live] TooQuiet"));
    }
}
