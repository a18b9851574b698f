//! Session spawning
//!
//! [`Spawner::run`] puts a program on a fresh pty and relays it to the
//! invoking terminal until it exits:
//!
//! 1. block all signals, snapshot the invoking terminal's mode and size
//! 2. allocate a pair seeded with that mode (echo adjusted) and size
//! 3. put the invoking terminal in raw mode
//! 4. install the SIGWINCH watcher if asked to and a size is known
//! 5. fork; the child becomes a session leader on the slave and execs
//! 6. the parent runs the copy loop, then tears everything down and reaps
//!    the child
//!
//! The invoking terminal keeps raw mode only while the copy loop runs; the
//! slave keeps the cooked mode so the child sees a normal line discipline.

use std::ffi::{CString, OsStr};
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::libc::{self, STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};
use nix::sys::termios::SetArg;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvp, fork, ForkResult, Pid};
use serde::{Deserialize, Serialize};

use super::copy::{child_exited, default_read, CopyLoop};
use super::{
    login_tty, PtyAllocator, PtyError, PtyPair, PtyResult, ResizeWatcher, SignalMask,
    TerminalMode, WindowSize, RESIZE_SIGNAL_SUPPORTED,
};

/// Knobs for a spawn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnOptions {
    /// Leave ECHO on for the slave
    pub slave_echo: bool,
    /// Forward SIGWINCH from the invoking terminal to the slave
    pub handle_resize: bool,
    /// Largest single read from either side, in bytes
    pub chunk_size: usize,
    /// How long the copy loop waits on a quiet master once input is closed
    pub drain_timeout_ms: u64,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        SpawnOptions {
            slave_echo: true,
            handle_resize: false,
            chunk_size: 1024,
            drain_timeout_ms: 100,
        }
    }
}

/// Spawns programs on a pty relayed to the invoking terminal
#[derive(Debug, Clone)]
pub struct Spawner {
    options: SpawnOptions,
    allocator: PtyAllocator,
    input: RawFd,
    output: RawFd,
}

impl Default for Spawner {
    fn default() -> Self {
        Self::new(SpawnOptions::default())
    }
}

impl Spawner {
    pub fn new(options: SpawnOptions) -> Self {
        Spawner {
            options,
            allocator: PtyAllocator::new(),
            input: STDIN_FILENO,
            output: STDOUT_FILENO,
        }
    }

    pub fn options(&self) -> &SpawnOptions {
        &self.options
    }

    pub fn allocator(mut self, allocator: PtyAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    /// Relay `input`/`output` instead of stdin/stdout. `input` also plays
    /// the invoking terminal whose mode and size are transplanted. Both
    /// must stay open until `run` returns.
    pub fn with_stdio(mut self, input: RawFd, output: RawFd) -> Self {
        self.input = input;
        self.output = output;
        self
    }

    /// [`Spawner::run`] with plain reads on both sides.
    pub fn run_default<S: AsRef<OsStr>>(&self, argv: &[S]) -> PtyResult<ExitStatus> {
        self.run(argv, default_read, default_read)
    }

    /// Run `argv` (looked up on `PATH`, `argv[0]` included) on a new pty
    /// and relay it until the master closes. Returns the child's status.
    ///
    /// `read_master` and `read_input` are handed to the copy loop; see
    /// [`CopyLoop::run`].
    pub fn run<S, M, I>(&self, argv: &[S], read_master: M, read_input: I) -> PtyResult<ExitStatus>
    where
        S: AsRef<OsStr>,
        M: FnMut(RawFd, &mut [u8]) -> io::Result<usize>,
        I: FnMut(RawFd, &mut [u8]) -> io::Result<usize>,
    {
        let argv = to_cstrings(argv)?;
        let mask = SignalMask::block_all()?;

        let mode = TerminalMode::capture(self.input).ok();
        let size = WindowSize::get(self.input).ok();
        if mode.is_none() {
            tracing::debug!("input {} is not a terminal", self.input);
        }

        let slave_mode = mode.as_ref().map(|m| m.with_echo(self.options.slave_echo));
        let pair = self.allocator.open(slave_mode.as_ref(), size)?;
        let slave = pair.slave_fd().ok_or(PtyError::OpenSlave(Errno::EBADF))?;
        if slave_mode.is_none() {
            TerminalMode::capture(slave)?
                .with_echo(self.options.slave_echo)
                .apply(slave, SetArg::TCSAFLUSH)?;
        }

        if let Some(mode) = &mode {
            mode.raw().apply(self.input, SetArg::TCSAFLUSH)?;
        }

        let watcher = if self.options.handle_resize && size.is_some() && RESIZE_SIGNAL_SUPPORTED {
            match ResizeWatcher::install(slave, self.input) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    tracing::warn!("resize propagation disabled: {}", e);
                    None
                },
            }
        } else {
            None
        };

        let mut session = Session {
            input: self.input,
            mode,
            watcher,
            pair,
        };

        // SAFETY: the child only makes async-signal-safe calls before exec
        let child = match unsafe { fork() } {
            Ok(ForkResult::Child) => exec_child(&mut session.pair, &argv, mask.saved()),
            Ok(ForkResult::Parent { child }) => child,
            Err(e) => {
                for failure in session.teardown() {
                    tracing::warn!("teardown after failed fork: {}", failure);
                }
                return Err(PtyError::Fork(e));
            },
        };
        tracing::debug!("spawned {:?} as pid {}", argv[0], child);

        if let Err(e) = session.pair.close_slave() {
            tracing::warn!("failed to close pty slave: {}", e);
        }

        let drain_timeout = Duration::from_millis(self.options.drain_timeout_ms);
        let outcome = match session.pair.master_fd() {
            Some(master) => CopyLoop::new(master)
                .stdio(self.input, self.output)
                .chunk_size(self.options.chunk_size)
                .drain_timeout(drain_timeout)
                .child(child)
                .run(&mask, read_master, read_input),
            None => Err(PtyError::OpenPty(Errno::EBADF)),
        };

        // The master reads EIO as soon as the child closes its terminal,
        // which may be before it exits. Closing the master then would hang
        // the child up.
        if !await_exit(child, drain_timeout) {
            tracing::debug!("pid {} still running, hanging up its terminal", child);
        }

        let mut failures = session.teardown();
        if let Err(e) = mask.restore() {
            failures.push(e);
        }
        for failure in &failures {
            tracing::warn!("teardown step failed: {}", failure);
        }

        let status = wait_child(child)?;
        tracing::debug!("pid {} finished with {}", child, status);

        outcome?;
        match failures.into_iter().next() {
            Some(first) => Err(PtyError::Teardown {
                status,
                source: Box::new(first),
            }),
            None => Ok(status),
        }
    }
}

/// Run `argv` with default options on stdin/stdout.
pub fn spawn<S: AsRef<OsStr>>(argv: &[S]) -> PtyResult<ExitStatus> {
    Spawner::default().run_default(argv)
}

/// Parent-side state that must be undone whatever happens.
struct Session {
    input: RawFd,
    mode: Option<TerminalMode>,
    watcher: Option<ResizeWatcher>,
    pair: PtyPair,
}

impl Session {
    /// Restore the invoking terminal, the SIGWINCH handler, and close the
    /// master. Every step runs; failures are collected.
    fn teardown(&mut self) -> Vec<PtyError> {
        let mut failures = Vec::new();

        if let Some(mode) = self.mode.take() {
            if let Err(e) = mode.apply(self.input, SetArg::TCSAFLUSH) {
                failures.push(e);
            }
        }
        if let Some(watcher) = self.watcher.take() {
            if let Err(e) = watcher.uninstall() {
                failures.push(e);
            }
        }
        if let Err(e) = self.pair.close_slave() {
            failures.push(e);
        }
        if let Err(e) = self.pair.close_master() {
            failures.push(e);
        }

        failures
    }
}

/// Outcome of [`fork_pty`]
#[derive(Debug)]
pub enum Fork {
    /// In the parent: the child's pid and the master side of its terminal
    Parent { child: Pid, master: OwnedFd },
    /// In the child: now a session leader with the slave as its terminal
    Child,
}

/// Fork with the child attached to a new pty as its controlling terminal
/// and stdio. A child that fails to attach exits with status 1.
///
/// # Safety
///
/// Same contract as fork(2): in a multithreaded program the child may only
/// make async-signal-safe calls until it execs or exits.
pub unsafe fn fork_pty() -> PtyResult<Fork> {
    let mut pair = PtyAllocator::new().open(None, None)?;

    match fork().map_err(PtyError::Fork)? {
        ForkResult::Child => {
            drop(pair.take_master());
            match pair.take_slave().map(login_tty) {
                Some(Ok(())) => Ok(Fork::Child),
                _ => child_abort(b"mochi-spawn: failed to attach pty\n", 1),
            }
        },
        ForkResult::Parent { child } => {
            if let Err(e) = pair.close_slave() {
                tracing::warn!("failed to close pty slave: {}", e);
            }
            let master = pair.take_master().ok_or(PtyError::OpenPty(Errno::EBADF))?;
            Ok(Fork::Parent { child, master })
        },
    }
}

fn to_cstrings<S: AsRef<OsStr>>(argv: &[S]) -> PtyResult<Vec<CString>> {
    if argv.is_empty() {
        return Err(PtyError::InvalidArgument("argv must not be empty".to_string()));
    }
    argv.iter()
        .map(|arg| {
            CString::new(arg.as_ref().as_bytes())
                .map_err(|e| PtyError::InvalidArgument(e.to_string()))
        })
        .collect()
}

/// Child side after fork: never returns.
fn exec_child(pair: &mut PtyPair, argv: &[CString], saved: &SigSet) -> ! {
    drop(pair.take_master());

    match pair.take_slave().map(login_tty) {
        Some(Ok(())) => {},
        _ => child_abort(b"mochi-spawn: failed to attach pty\n", 1),
    }

    let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(saved), None);
    let _ = execvp(&argv[0], argv);

    child_abort(b"mochi-spawn: exec failed\n", 127)
}

fn child_abort(msg: &[u8], code: libc::c_int) -> ! {
    // SAFETY: write(2) and _exit(2) are async-signal-safe
    unsafe {
        libc::write(STDERR_FILENO, msg.as_ptr().cast(), msg.len());
        libc::_exit(code)
    }
}

/// Poll until `child` has exited, without reaping it, for at most
/// `timeout`.
fn await_exit(child: Pid, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if child_exited(child) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Block until `child` terminates.
fn wait_child(child: Pid) -> PtyResult<ExitStatus> {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ExitStatus::from_raw(code << 8)),
            Ok(WaitStatus::Signaled(_, signal, core)) => {
                let core = if core { 0x80 } else { 0 };
                return Ok(ExitStatus::from_raw(signal as i32 | core));
            },
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => return Err(PtyError::Wait(e)),
        }
    }
}
