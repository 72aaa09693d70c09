//! Checkpointed research workflow runner.
//!
//! A research task moves through a fixed graph of phases (planning,
//! validation, implementation, experiments, reporting), one agent per phase.
//! Progress survives crashes at two granularities: whole-workflow checkpoints
//! with output snapshots, and step-level micro-checkpoints inside long
//! operations. The crate is split as follows:
//!
//! - **[`core`]**: Pure logic (phase graph, transitions, session state).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Config, checkpoint stores and process execution.
//!
//! [`executor`] runs retryable multi-step operations and [`driver`] is the
//! root loop; [`workflow`] wires both to a project directory for the CLI.

pub mod core;
pub mod driver;
pub mod executor;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
