//! Test support for inferflow pipelines.
//!
//! This module provides:
//! - Scripted stage executors and recording compensators
//! - Assertions over lifecycle notifications
//! - An in-memory engine harness

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_not_notified, assert_notified_in_order, assert_notified_once, assert_notified_times,
    assert_stage_notified_times,
};
pub use fixtures::{fast_config, TestHarness, TestHarnessBuilder};
pub use mocks::{compensation_log, CompensationLog, RecordingCompensator, ScriptedExecutor};
