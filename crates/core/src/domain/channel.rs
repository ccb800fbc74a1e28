//! Named-event channel shared by the analysis process and every surface
//!
//! The transport itself lives in the infrastructure crate; the domain only
//! needs to publish events and register handlers with an explicit lifetime.

use crate::domain::protocol::{Channel, DecodeError, Event, Message};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Errors raised by a channel implementation
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,

    #[error("failed to encode '{channel}' payload: {source}")]
    Encode {
        channel: Channel,
        source: serde_json::Error,
    },
}

/// Failure reported by a handler for one event
///
/// A handler error never unregisters the handler; the channel logs it and
/// keeps delivering.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("receiver disconnected: {0}")]
    Disconnected(String),

    #[error("rejected: {0}")]
    Rejected(String),
}

/// Callback invoked for every event published under a subscribed name
pub type Handler = Box<dyn Fn(&Event) -> std::result::Result<(), HandlerError> + Send + Sync>;

/// Publish/subscribe transport keyed by channel name
pub trait SyncChannel: Send + Sync {
    /// Queue an event for delivery to every current subscriber of its name
    fn publish(&self, event: Event) -> Result<()>;

    /// Register a handler; it stays active until the returned guard is released
    fn subscribe(&self, name: &str, handler: Handler) -> Result<Subscription>;

    /// Encode and publish a protocol message
    fn send(&self, message: &Message) -> Result<()> {
        let event = message.to_event().map_err(|source| ChannelError::Encode {
            channel: message.channel(),
            source,
        })?;
        self.publish(event)
    }
}

/// Guard for one registered handler
///
/// Releasing happens exactly once, either through [`Subscription::unsubscribe`]
/// or on drop. After release the handler is never invoked again.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    name: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(name: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name: name.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unsubscribe(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("active", &self.release.is_some())
            .finish()
    }
}
