//! Iterative driver for an external autonomous coding tool.
//!
//! `iterate` runs the tool in short sessions against a workspace directory,
//! decides when the work is done, and has the tool verify the result before
//! declaring success. The crate keeps a strict split:
//!
//! - **[`core`]**: pure, deterministic logic (config resolution, completion
//!   oracle, report parsing, resume decisions). No I/O.
//! - **[`io`]**: side effects (layer files, workspace store, process
//!   supervision, status watching, prompt rendering).
//!
//! Orchestration modules ([`looping`], [`verify`], [`run`]) combine the two to
//! implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verify;
