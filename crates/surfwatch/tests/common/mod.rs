//! Shared test utilities for surfwatch integration tests.
//!
//! This module provides:
//! - `TestHarness` with an on-disk store that several handles can open
//! - Builders for targets, tool definitions and configuration

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{TestHarness, WORKSPACE_ID};
