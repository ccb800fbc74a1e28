//! Block-based loudness feed
//!
//! The capture callback computes one mean-square value per audio block and
//! hands it to a [`BlockSender`]. A meter thread runs the blocks through an
//! [`RmsWindow`] sized by the current `rms-seconds` value and forwards every
//! reading to the analysis loop. Each `open` replaces the previous meter
//! thread, so the feed survives an analysis restart.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use decibender_core::domain::analysis::{self, AnalysisError, LoudnessSource, SAMPLE_BUFFER};
use decibender_core::domain::loudness::mean_square;
use decibender_core::domain::{LoudnessSample, RmsSeconds, RmsWindow};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// How often an idle meter thread checks whether it should stop
const METER_POLL: Duration = Duration::from_millis(50);

/// Producer half handed to the capture callback
#[derive(Debug, Clone)]
pub struct BlockSender {
    blocks: Sender<f32>,
}

impl BlockSender {
    /// Queue one block's mean-square power without blocking.
    ///
    /// Returns `false` when the block was dropped because the meter is behind
    /// or gone.
    pub fn push(&self, mean_square: f32) -> bool {
        match self.blocks.try_send(mean_square) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Meter queue full, dropping block");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Queue one block of raw samples
    pub fn push_samples(&self, samples: &[f32]) -> bool {
        self.push(mean_square(samples))
    }
}

struct Meter {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// [`LoudnessSource`] fed with per-block mean-square power
pub struct BlockFeed {
    block_rate_hz: f32,
    blocks: Receiver<f32>,
    meter: Mutex<Option<Meter>>,
}

impl BlockFeed {
    /// `block_rate_hz` is the number of blocks the capture delivers per second
    pub fn new(block_rate_hz: f32) -> (Self, BlockSender) {
        let (tx, rx) = bounded(SAMPLE_BUFFER);
        let feed = Self {
            block_rate_hz,
            blocks: rx,
            meter: Mutex::new(None),
        };
        (feed, BlockSender { blocks: tx })
    }
}

impl LoudnessSource for BlockFeed {
    fn open(
        &self,
        window: watch::Receiver<RmsSeconds>,
    ) -> analysis::Result<mpsc::Receiver<LoudnessSample>> {
        let mut meter = self.meter.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = meter.take() {
            previous.stop.store(true, Ordering::SeqCst);
            if previous.thread.join().is_err() {
                warn!("Previous meter thread panicked");
            }
            debug!("Previous meter thread stopped");
        }

        let (samples_tx, samples_rx) = mpsc::channel(SAMPLE_BUFFER);
        let stop = Arc::new(AtomicBool::new(false));
        let blocks = self.blocks.clone();
        let block_rate_hz = self.block_rate_hz;
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("decibender-meter".to_string())
            .spawn(move || meter_loop(blocks, window, samples_tx, block_rate_hz, thread_stop))
            .map_err(|e| AnalysisError::Source(e.to_string()))?;
        *meter = Some(Meter { stop, thread });

        info!(block_rate_hz, "Block feed opened");
        Ok(samples_rx)
    }
}

fn meter_loop(
    blocks: Receiver<f32>,
    window: watch::Receiver<RmsSeconds>,
    samples: mpsc::Sender<LoudnessSample>,
    block_rate_hz: f32,
    stop: Arc<AtomicBool>,
) {
    let mut rms = RmsWindow::new(block_rate_hz);
    while !stop.load(Ordering::SeqCst) && !samples.is_closed() {
        let block = match blocks.recv_timeout(METER_POLL) {
            Ok(block) => block,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let current = *window.borrow();
        let sample = rms.push(block, current);
        match samples.try_send(sample) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Analysis loop behind, dropping loudness sample");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
    debug!("Meter thread finished");
}
