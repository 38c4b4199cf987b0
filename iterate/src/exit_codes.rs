//! Stable exit codes for iterate CLI commands.

/// Command succeeded; for `run`, the work is complete and verified (or
/// verification was switched off).
pub const OK: i32 = 0;
/// Invalid input, missing workspace, spawn failure, or any other error.
pub const ERROR: i32 = 1;
/// Verification failed with no resume left, or asked for human review.
pub const VERIFICATION_FAILED: i32 = 2;
/// The remaining count stopped moving.
pub const STAGNATED: i32 = 3;
/// The iteration budget ran out before completion.
pub const MAX_ITERATIONS: i32 = 4;
/// Interrupted by Ctrl-C / SIGTERM.
pub const INTERRUPTED: i32 = 130;
