//! Infrastructure for decibender
//!
//! - [`bus`]: in-process sync channel with a dedicated dispatcher thread
//! - [`meter`]: loudness sources feeding the analysis service

pub mod bus;
pub mod meter;

pub use bus::LocalBus;
pub use meter::{BlockFeed, BlockSender, ManualFeed, ManualSource};
