//! Analysis process: the single authority for thresholds and classification
//!
//! [`Analyzer`] is the pure core. It owns the authoritative [`ThresholdSet`]
//! with a monotonically increasing revision inside one session, runs the [`Classifier`] on every
//! loudness sample, and answers each input with a list of [`Effect`]s.
//! [`AnalysisService`] wires it to a [`SyncChannel`] and a [`LoudnessSource`]
//! on the tokio runtime and carries the effects out.

use crate::domain::channel::{ChannelError, HandlerError, Subscription, SyncChannel};
use crate::domain::classifier::{ClassificationState, Classifier, Transition};
use crate::domain::config::AnalysisConfig;
use crate::domain::lock;
use crate::domain::loudness::{LoudnessSample, RmsSeconds};
use crate::domain::protocol::{
    Channel, Event, InitRequest, Message, RequestTag, ThresholdBroadcast,
};
use crate::domain::thresholds::{Adjustment, ThresholdSet};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

pub type Result<T> = std::result::Result<T, AnalysisError>;

/// Capacity of the queue between a loudness source and the analysis loop
pub const SAMPLE_BUFFER: usize = 1024;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("loudness source failed: {0}")]
    Source(String),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("analysis service needs a running tokio runtime")]
    NoRuntime,
}

/// Something the analysis core wants done
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Publish(Message),
    /// The loudness source must switch to a new window
    Window(RmsSeconds),
    Transition(Transition),
    Adjusted(Adjustment),
    ThresholdsChanged {
        thresholds: ThresholdSet,
        revision: u64,
    },
}

#[derive(Debug, Clone)]
pub struct Analyzer {
    thresholds: ThresholdSet,
    session: u64,
    revision: u64,
    window: RmsSeconds,
    classifier: Classifier,
    hold_until: Option<Instant>,
    shift_step_db: f32,
    adjustment_hold: Duration,
}

impl Analyzer {
    /// Seed from the handshake, falling back to configured values
    ///
    /// `session` must grow from one run to the next so that surfaces can tell
    /// a restarted process from a late broadcast of the previous one.
    pub fn new(config: &AnalysisConfig, request: &InitRequest, session: u64) -> Self {
        Self {
            thresholds: request
                .initial_thresholds
                .unwrap_or(config.initial_thresholds),
            session,
            revision: 0,
            window: request
                .initial_rms_seconds
                .unwrap_or(config.initial_rms_seconds),
            classifier: Classifier::new(),
            hold_until: None,
            shift_step_db: config.shift_step_db,
            adjustment_hold: config.adjustment_hold(),
        }
    }

    pub fn thresholds(&self) -> ThresholdSet {
        self.thresholds
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn window(&self) -> RmsSeconds {
        self.window
    }

    pub fn state(&self) -> ClassificationState {
        self.classifier.state()
    }

    pub fn is_holding(&self, now: Instant) -> bool {
        self.hold_until.is_some_and(|until| now < until)
    }

    /// Messages that bring a freshly attached surface up to date
    pub fn announce(&self) -> Vec<Message> {
        vec![
            self.broadcast(None),
            Message::State(self.classifier.state()),
        ]
    }

    fn broadcast(&self, ack: Option<RequestTag>) -> Message {
        Message::Thresholds(ThresholdBroadcast {
            thresholds: self.thresholds,
            session: self.session,
            revision: self.revision,
            ack,
        })
    }

    fn replace_thresholds(&mut self, next: ThresholdSet, effects: &mut Vec<Effect>) {
        if next == self.thresholds {
            return;
        }
        self.thresholds = next;
        self.revision += 1;
        info!(revision = self.revision, thresholds = %next, "Thresholds updated");
        effects.push(Effect::ThresholdsChanged {
            thresholds: next,
            revision: self.revision,
        });
    }

    /// Apply one inbound command
    pub fn handle(&mut self, message: Message, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        match message {
            Message::EditThresholds(edit) => {
                self.replace_thresholds(edit.thresholds, &mut effects);
                // Rebroadcast even when unchanged so the editor gets its ack
                effects.push(Effect::Publish(self.broadcast(edit.tag)));
            }
            Message::Adjust { adjustment, tag } => {
                match self.thresholds.apply(adjustment, self.shift_step_db) {
                    Ok(next) => {
                        if !self.adjustment_hold.is_zero() {
                            self.hold_until = Some(now + self.adjustment_hold);
                        }
                        effects.push(Effect::Adjusted(adjustment));
                        self.replace_thresholds(next, &mut effects);
                    }
                    Err(err) => warn!(%adjustment, "Adjustment rejected: {}", err),
                }
                effects.push(Effect::Publish(self.broadcast(tag)));
            }
            Message::RmsSeconds(window) => {
                if window != self.window {
                    info!(rms_seconds = window.seconds(), "RMS window changed");
                    self.window = window;
                    effects.push(Effect::Window(window));
                }
            }
            // Analysis output, including this process's own broadcasts
            Message::Thresholds(_) | Message::Loudness(_) | Message::State(_) => {
                trace!("Ignoring analysis output on inbound path");
            }
        }
        effects
    }

    /// Classify one loudness sample
    ///
    /// The sample is always published. Classification is suspended while an
    /// adjustment hold is active.
    pub fn observe(&mut self, sample: LoudnessSample, now: Instant) -> Vec<Effect> {
        let mut effects = vec![Effect::Publish(Message::Loudness(sample))];

        if let Some(until) = self.hold_until {
            if now < until {
                return effects;
            }
            debug!("Adjustment hold elapsed");
            self.hold_until = None;
        }

        if let Some(transition) = self.classifier.observe(sample.db(), &self.thresholds) {
            effects.push(Effect::Publish(Message::State(transition.to)));
            effects.push(Effect::Transition(transition));
        }
        effects
    }
}

/// Hooks run by the analysis service
///
/// Each call runs on its own task. A new transition aborts a still-running
/// reaction to the previous one. Errors are logged.
#[async_trait]
pub trait Reactions: Send + Sync {
    async fn on_transition(&self, transition: Transition) -> anyhow::Result<()>;

    async fn on_adjustment(&self, _adjustment: Adjustment) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_thresholds(&self, _thresholds: ThresholdSet, _revision: u64) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Reactions that only log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReactions;

#[async_trait]
impl Reactions for LogReactions {
    async fn on_transition(&self, transition: Transition) -> anyhow::Result<()> {
        info!(
            from = %transition.from,
            to = %transition.to,
            loudness = transition.loudness,
            "Classification transition"
        );
        Ok(())
    }

    async fn on_adjustment(&self, adjustment: Adjustment) -> anyhow::Result<()> {
        info!(%adjustment, "Operator adjustment");
        Ok(())
    }
}

/// Produces loudness samples for the analysis loop
pub trait LoudnessSource: Send + Sync {
    /// Start producing samples, following `window` for the RMS integration time
    fn open(&self, window: watch::Receiver<RmsSeconds>) -> Result<mpsc::Receiver<LoudnessSample>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Started,
    AlreadyInitialized,
}

struct Running {
    task: JoinHandle<()>,
    subscriptions: Vec<Subscription>,
}

/// Runs an [`Analyzer`] against a channel and a loudness source
pub struct AnalysisService {
    channel: Arc<dyn SyncChannel>,
    source: Arc<dyn LoudnessSource>,
    reactions: Arc<dyn Reactions>,
    config: AnalysisConfig,
    running: Mutex<Option<Running>>,
    last_session: Mutex<u64>,
}

impl AnalysisService {
    pub fn new(
        channel: Arc<dyn SyncChannel>,
        source: Arc<dyn LoudnessSource>,
        reactions: Arc<dyn Reactions>,
        config: AnalysisConfig,
    ) -> Self {
        Self {
            channel,
            source,
            reactions,
            config,
            running: Mutex::new(None),
            last_session: Mutex::new(0),
        }
    }

    /// Wall-clock milliseconds, bumped past the previous session if the clock lags
    fn next_session(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        let mut last = lock(&self.last_session);
        *last = now.max(last.saturating_add(1));
        *last
    }

    /// One-time handshake; later calls leave the running session untouched
    pub fn init(&self, request: InitRequest) -> Result<InitOutcome> {
        let mut running = lock(&self.running);
        if running.is_some() {
            debug!("Analysis already initialized, ignoring handshake");
            return Ok(InitOutcome::AlreadyInitialized);
        }

        let runtime = Handle::try_current().map_err(|_| AnalysisError::NoRuntime)?;
        let analyzer = Analyzer::new(&self.config, &request, self.next_session());
        let (window_tx, window_rx) = watch::channel(analyzer.window());
        let samples = self.source.open(window_rx)?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let mut subscriptions = Vec::new();
        for channel in [
            Channel::Thresholds,
            Channel::RmsSeconds,
            Channel::Louder,
            Channel::Quieter,
        ] {
            let inbound = inbound_tx.clone();
            subscriptions.push(self.channel.subscribe(
                channel.name(),
                Box::new(move |event: &Event| {
                    let message = Message::decode(event)?;
                    inbound.send(message).map_err(|_| {
                        HandlerError::Disconnected("analysis loop stopped".to_string())
                    })
                }),
            )?);
        }

        for message in analyzer.announce() {
            self.channel.send(&message)?;
        }

        info!(
            session = analyzer.session(),
            thresholds = %analyzer.thresholds(),
            rms_seconds = analyzer.window().seconds(),
            "Analysis started"
        );

        let runner = Runner {
            channel: Arc::clone(&self.channel),
            reactions: Arc::clone(&self.reactions),
            window_tx,
            transition_reaction: None,
        };
        let task = runtime.spawn(runner.run(analyzer, inbound_rx, samples));
        *running = Some(Running {
            task,
            subscriptions,
        });
        Ok(InitOutcome::Started)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Stop the loop and release its subscriptions
    ///
    /// A later `init` reopens the loudness source and starts a new session
    /// with a larger session id, so surfaces replace what they hold.
    pub fn shutdown(&self) {
        if let Some(running) = lock(&self.running).take() {
            for subscription in running.subscriptions {
                subscription.unsubscribe();
            }
            running.task.abort();
            info!("Analysis stopped");
        }
    }
}

impl Drop for AnalysisService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Runner {
    channel: Arc<dyn SyncChannel>,
    reactions: Arc<dyn Reactions>,
    window_tx: watch::Sender<RmsSeconds>,
    transition_reaction: Option<JoinHandle<()>>,
}

impl Runner {
    async fn run(
        mut self,
        mut analyzer: Analyzer,
        mut inbound: mpsc::UnboundedReceiver<Message>,
        mut samples: mpsc::Receiver<LoudnessSample>,
    ) {
        let mut source_open = true;
        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => {
                        let effects = analyzer.handle(message, Instant::now());
                        self.apply(effects);
                    }
                    None => break,
                },
                sample = samples.recv(), if source_open => match sample {
                    Some(sample) => {
                        let effects = analyzer.observe(sample, Instant::now());
                        self.apply(effects);
                    }
                    None => {
                        warn!("Loudness source closed, classification state holds");
                        source_open = false;
                    }
                },
            }
        }
        debug!("Analysis loop finished");
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Publish(message) => {
                    if let Err(err) = self.channel.send(&message) {
                        warn!(channel = %message.channel(), "Failed to publish: {}", err);
                    }
                }
                Effect::Window(window) => {
                    self.window_tx.send_replace(window);
                }
                Effect::Transition(transition) => {
                    if let Some(previous) = self.transition_reaction.take() {
                        previous.abort();
                    }
                    let reactions = Arc::clone(&self.reactions);
                    self.transition_reaction = Some(tokio::spawn(async move {
                        if let Err(err) = reactions.on_transition(transition).await {
                            warn!(to = %transition.to, "Transition reaction failed: {:#}", err);
                        }
                    }));
                }
                Effect::Adjusted(adjustment) => {
                    let reactions = Arc::clone(&self.reactions);
                    tokio::spawn(async move {
                        if let Err(err) = reactions.on_adjustment(adjustment).await {
                            warn!(%adjustment, "Adjustment reaction failed: {:#}", err);
                        }
                    });
                }
                Effect::ThresholdsChanged {
                    thresholds,
                    revision,
                } => {
                    let reactions = Arc::clone(&self.reactions);
                    tokio::spawn(async move {
                        if let Err(err) = reactions.on_thresholds(thresholds, revision).await {
                            warn!(revision, "Thresholds reaction failed: {:#}", err);
                        }
                    });
                }
            }
        }
    }
}
