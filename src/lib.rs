//! Mochi Spawn
//!
//! Runs a program on a fresh pseudoterminal while the calling process sits
//! between that pseudoterminal and its own terminal. The child believes it
//! talks to an interactive terminal; the caller sees (and may rewrite) every
//! byte in both directions, and window resizes of the real terminal are
//! forwarded to the child.
//!
//! This is the plumbing behind session recorders such as `mochi-script`.
//!
//! ```no_run
//! let status = mochi_spawn::spawn(&["sh", "-c", "echo hi"]).unwrap();
//! assert!(status.success());
//! ```

#[cfg(unix)]
pub mod pty;

#[cfg(unix)]
pub use pty::{spawn, PtyError, PtyResult, SpawnOptions, Spawner};
