//! PTY (Pseudoterminal) session spawning
//!
//! This module interposes the current process between the invoking terminal
//! and a child program running on a fresh pseudoterminal:
//!
//! - `size`: window geometry get/set (TIOCGWINSZ / TIOCSWINSZ)
//! - `mode`: terminal line-discipline snapshots and raw/cbreak transforms
//! - `alloc`: master/slave pair allocation
//! - `login`: making a terminal the controlling tty and stdio of a process
//! - `winch`: SIGWINCH propagation from the invoking terminal to the slave
//! - `copy`: the master <-> stdio copy loop
//! - `spawn`: the orchestrator tying all of the above together

mod alloc;
mod copy;
mod login;
mod mode;
mod signals;
mod size;
mod spawn;
mod winch;

pub use alloc::{slave_name, PtyAllocator, PtyPair};
pub use copy::{default_read, write_all, CopyLoop};
pub use login::login_tty;
pub use mode::TerminalMode;
pub use signals::SignalMask;
pub use size::WindowSize;
pub use spawn::{fork_pty, spawn, Fork, SpawnOptions, Spawner};
pub use winch::{ResizeWatcher, RESIZE_SIGNAL_SUPPORTED};

use std::process::ExitStatus;

/// Error type for PTY operations
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Out of pty devices")]
    Exhausted,

    #[error("Failed to open PTY pair: {0}")]
    OpenPty(#[source] nix::Error),

    #[error("Failed to open PTY slave: {0}")]
    OpenSlave(#[source] nix::Error),

    #[error("Failed to get PTY slave name: {0}")]
    SlaveName(#[source] nix::Error),

    #[error("Descriptor is not a terminal: {0}")]
    NotATerminal(#[source] nix::Error),

    #[error("Failed to set terminal attributes: {0}")]
    Termios(#[source] nix::Error),

    #[error("Failed to set window size: {0}")]
    WindowSize(#[source] nix::Error),

    #[error("Failed to change signal mask: {0}")]
    SignalMask(#[source] nix::Error),

    #[error("Failed to install signal handler: {0}")]
    SignalHandler(#[source] nix::Error),

    #[error("Resize handler already owned by another session")]
    WatcherBusy,

    #[error("Failed to fork: {0}")]
    Fork(#[source] nix::Error),

    #[error("Failed to create session: {0}")]
    Setsid(#[source] nix::Error),

    #[error("Failed to duplicate file descriptor: {0}")]
    Dup2(#[source] nix::Error),

    #[error("Failed to execute program: {0}")]
    Exec(#[source] nix::Error),

    #[error("Failed to poll: {0}")]
    Poll(#[source] nix::Error),

    #[error("Failed to read: {0}")]
    Read(#[source] nix::Error),

    #[error("Failed to write: {0}")]
    Write(#[source] nix::Error),

    #[error("Failed to wait for child: {0}")]
    Wait(#[source] nix::Error),

    #[error("Teardown failed after child exited with {status}: {source}")]
    Teardown {
        status: ExitStatus,
        #[source]
        source: Box<PtyError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;
