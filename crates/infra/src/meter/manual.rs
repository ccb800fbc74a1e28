//! Loudness source driven by hand

use decibender_core::domain::analysis::{self, LoudnessSource, SAMPLE_BUFFER};
use decibender_core::domain::{LoudnessSample, RmsSeconds};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type SampleSlot = Arc<Mutex<Option<mpsc::Sender<LoudnessSample>>>>;
type WindowSlot = Arc<Mutex<Option<watch::Receiver<RmsSeconds>>>>;

/// [`LoudnessSource`] whose readings come from a [`ManualFeed`]
///
/// Every `open` starts a fresh sample queue; readings pushed while no
/// analysis loop is attached are dropped.
pub struct ManualSource {
    samples: SampleSlot,
    window: WindowSlot,
}

/// Pushes readings into a [`ManualSource`]
#[derive(Clone)]
pub struct ManualFeed {
    samples: SampleSlot,
    window: WindowSlot,
}

impl ManualSource {
    pub fn new() -> (Self, ManualFeed) {
        let samples: SampleSlot = Arc::new(Mutex::new(None));
        let window: WindowSlot = Arc::new(Mutex::new(None));
        let source = Self {
            samples: Arc::clone(&samples),
            window: Arc::clone(&window),
        };
        (source, ManualFeed { samples, window })
    }
}

impl LoudnessSource for ManualSource {
    fn open(
        &self,
        window: watch::Receiver<RmsSeconds>,
    ) -> analysis::Result<mpsc::Receiver<LoudnessSample>> {
        let (tx, rx) = mpsc::channel(SAMPLE_BUFFER);
        if lock(&self.samples).replace(tx).is_some() {
            debug!("Manual source reopened");
        }
        *lock(&self.window) = Some(window);
        Ok(rx)
    }
}

impl ManualFeed {
    /// Queue one reading in dBFS; returns `false` if it was dropped
    pub fn push(&self, db: f32) -> bool {
        let samples = lock(&self.samples);
        let Some(tx) = samples.as_ref() else {
            warn!(db, "Loudness reading dropped: no analysis loop attached");
            return false;
        };
        match tx.try_send(LoudnessSample::new(db)) {
            Ok(()) => true,
            Err(err) => {
                warn!(db, "Loudness reading dropped: {}", err);
                false
            }
        }
    }

    /// Window currently requested by the analysis service, once it has opened the source
    pub fn window(&self) -> Option<RmsSeconds> {
        lock(&self.window).as_ref().map(|rx| *rx.borrow())
    }
}
