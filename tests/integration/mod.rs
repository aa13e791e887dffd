//! Integration test suite for conductor.
//!
//! These tests exercise the full pipeline from issue to pull request,
//! including parallel task execution, failure recovery, and merge
//! conflict resolution, using mock collaborators throughout.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Full stage-machine execution tests
//! - `parallel_execution`: Implementation-stage scheduling correctness
//! - `conflict_resolution`: Branch integration and conflict handling
//! - `recovery`: Strategy selection and escalation tests
//!
//! # CI Compatibility
//!
//! No network, no real code host, no real agent: everything runs
//! against in-memory mocks and temp directories.

mod fixtures;

mod parallel_execution;
mod recovery;
