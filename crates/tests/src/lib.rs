//! Cross-crate integration tests for decibender
//!
//! The analysis service, the in-process bus and both surfaces run together
//! here exactly as the CLI wires them.

#[cfg(test)]
mod sync_integration;
