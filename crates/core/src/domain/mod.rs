//! Domain entities and business rules

pub mod analysis;
pub mod channel;
pub mod classifier;
pub mod config;
pub mod loudness;
pub mod protocol;
pub mod replica;
pub mod surface;
pub mod thresholds;

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-export specific items to avoid ambiguous glob imports
pub use analysis::{
    AnalysisError, AnalysisService, Analyzer, Effect, InitOutcome, LogReactions, LoudnessSource,
    Reactions,
};
pub use channel::{ChannelError, Handler, HandlerError, Subscription, SyncChannel};
pub use classifier::{ClassificationState, Classifier, Transition};
pub use config::{AnalysisConfig, ConfigError, ConfigManager, DecibenderConfig};
pub use loudness::{LoudnessSample, RmsSeconds, RmsWindow, WindowError, SILENCE_FLOOR_DB};
pub use protocol::{
    Channel, DecodeError, Event, InitRequest, Message, RequestTag, SurfaceId, ThresholdBroadcast,
    ThresholdEdit,
};
pub use replica::{PendingEdit, Reconciled, SyncMode, ThresholdReplica, PENDING_TIMEOUT};
pub use surface::{LinkStatus, Surface, SurfaceError, SurfaceRole, SurfaceSnapshot};
pub use thresholds::{
    Adjustment, EditBounds, ThresholdError, ThresholdField, ThresholdSet, ValueRange,
};

/// Locks a mutex, recovering the guard if a previous holder panicked.
///
/// Every value guarded in this crate is replaced wholesale, so a poisoned
/// guard still holds a complete value.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
