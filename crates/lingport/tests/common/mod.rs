//! Shared test utilities for lingport integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated workspaces backed by temp directories
//! - Fake converter/validator tools driven through `sh -c`
//! - A builder for test configurations

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::*;
