//! Decibender core: loudness classification and surface synchronization
//!
//! The domain layer defines the threshold model, the hysteresis classifier run
//! by the analysis process, the wire protocol carried by the sync channel and
//! the surface-side reconciliation of local edits with inbound broadcasts.

pub mod domain;
