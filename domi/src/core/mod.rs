//! Deterministic, pure logic shared by the workflow core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod markers;
pub mod operation;
pub mod phase;
pub mod phase_machine;
pub mod phase_table;
pub mod session;
pub mod transition;
