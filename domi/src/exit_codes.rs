//! Stable exit codes for domi CLI commands.

/// Command succeeded (for `run`: the workflow completed).
pub const OK: i32 = 0;
/// Invalid config or arguments, or any other error.
pub const INVALID: i32 = 1;
/// The task file or the requested checkpoint does not exist.
pub const NOT_FOUND: i32 = 2;
/// `domi run` stopped before a terminal phase completed.
pub const HALTED: i32 = 3;
