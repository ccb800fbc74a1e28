//! Sync channel transports

pub mod local;

pub use local::LocalBus;
