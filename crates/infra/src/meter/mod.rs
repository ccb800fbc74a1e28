//! Loudness sources for the analysis service
//!
//! [`BlockFeed`] turns per-block mean-square power from a capture callback
//! into windowed dBFS readings. [`ManualSource`] forwards readings pushed by
//! hand, for scripted sessions and tests.

pub mod feed;
pub mod manual;

pub use feed::{BlockFeed, BlockSender};
pub use manual::{ManualFeed, ManualSource};
