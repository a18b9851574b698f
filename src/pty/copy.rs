//! The parent side copy loop
//!
//! Copies
//!
//! - pty master -> output (stdout by default)
//! - input (stdin by default) -> pty master
//!
//! on a single thread, blocking only in poll(2). Signals are let through
//! only while waiting; everything else runs with all signals blocked.
//!
//! The master stops being readable in one of two ways depending on the
//! platform: the BSDs return an empty read, Linux fails the read with EIO
//! once every slave descriptor is closed and the child is gone. Both mean
//! "master closed" here.

use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::libc::{self, STDIN_FILENO, STDOUT_FILENO};
use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd::{read, write, Pid};

use super::{PtyError, PtyResult, SignalMask};

/// Read up to `buf.len()` bytes from `fd`.
pub fn default_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    read(fd, buf).map_err(io::Error::from)
}

/// Write all of `data` to `fd`, retrying short and interrupted writes.
pub fn write_all(fd: RawFd, mut data: &[u8]) -> nix::Result<()> {
    while !data.is_empty() {
        match write(fd, data) {
            Ok(0) => return Err(Errno::EIO),
            Ok(n) => data = &data[n..],
            Err(Errno::EINTR) => {},
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Descriptors still being watched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Watched {
    master: bool,
    input: bool,
}

impl Watched {
    fn any(&self) -> bool {
        self.master || self.input
    }
}

/// Descriptors reported ready by one wait.
#[derive(Debug, Clone, Copy, Default)]
struct Ready {
    master: bool,
    input: bool,
}

/// What became of the master after servicing it.
enum Master {
    Open,
    Closed,
}

/// Shuttles bytes between a pty master and a pair of stdio descriptors
#[derive(Debug, Clone)]
pub struct CopyLoop {
    master: RawFd,
    input: RawFd,
    output: RawFd,
    chunk_size: usize,
    drain_timeout: Duration,
    child: Option<Pid>,
}

impl CopyLoop {
    pub fn new(master: RawFd) -> Self {
        CopyLoop {
            master,
            input: STDIN_FILENO,
            output: STDOUT_FILENO,
            chunk_size: 1024,
            drain_timeout: Duration::from_millis(100),
            child: None,
        }
    }

    /// Use `input`/`output` in place of stdin/stdout.
    pub fn stdio(mut self, input: RawFd, output: RawFd) -> Self {
        self.input = input;
        self.output = output;
        self
    }

    /// Largest single read from either side.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Poll timeout once only the master is left.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Child on the other end of the master. When input is closed and the
    /// master stays quiet past the drain timeout, an exited child ends the
    /// loop even if the platform never reports EOF on the master.
    pub fn child(mut self, pid: Pid) -> Self {
        self.child = Some(pid);
        self
    }

    /// Run until both sides are closed.
    ///
    /// `mask` must currently have all signals blocked; they are let through
    /// only while waiting. `read_master` and `read_input` fill the buffer
    /// from their descriptor and may observe or rewrite the bytes; an empty
    /// read or an error closes that side.
    ///
    /// Closing the master also closes input, since input has nowhere left
    /// to go. A failed write to the output is returned as an error.
    pub fn run<M, I>(&self, mask: &SignalMask, mut read_master: M, mut read_input: I) -> PtyResult<()>
    where
        M: FnMut(RawFd, &mut [u8]) -> io::Result<usize>,
        I: FnMut(RawFd, &mut [u8]) -> io::Result<usize>,
    {
        let mut buf = vec![0u8; self.chunk_size];
        let mut watched = Watched {
            master: true,
            input: true,
        };

        while watched.any() {
            let timeout = if watched.input {
                -1
            } else {
                self.drain_timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int
            };

            let ready = match mask.while_unblocked(|| self.wait(watched, timeout))? {
                Ok(ready) => ready,
                // A handler ran; nothing is ready this round.
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(PtyError::Poll(e)),
            };

            if !ready.master && !ready.input {
                if !watched.input && self.child_exited() {
                    tracing::debug!("child exited without master EOF, draining");
                    self.drain(&mut read_master, &mut buf)?;
                    watched.master = false;
                }
                continue;
            }

            if ready.master {
                if let Master::Closed = self.pump_master(&mut read_master, &mut buf)? {
                    tracing::debug!("pty master closed");
                    watched.master = false;
                    watched.input = false;
                    continue;
                }
            }

            if ready.input {
                match read_input(self.input, &mut buf) {
                    Ok(0) | Err(_) => {
                        tracing::debug!("input closed");
                        watched.input = false;
                    },
                    Ok(n) => match write_all(self.master, &buf[..n]) {
                        Ok(()) => {},
                        Err(Errno::EIO) => {
                            tracing::debug!("pty master hung up");
                            watched.master = false;
                            watched.input = false;
                        },
                        Err(e) => return Err(PtyError::Write(e)),
                    },
                }
            }
        }

        Ok(())
    }

    /// Block until a watched descriptor is ready or `timeout_ms` passes.
    fn wait(&self, watched: Watched, timeout_ms: libc::c_int) -> nix::Result<Ready> {
        // SAFETY: both descriptors stay open for the lifetime of the loop
        let master = unsafe { BorrowedFd::borrow_raw(self.master) };
        let input = unsafe { BorrowedFd::borrow_raw(self.input) };

        let mut fds = Vec::with_capacity(2);
        if watched.master {
            fds.push(PollFd::new(&master, PollFlags::POLLIN));
        }
        if watched.input {
            fds.push(PollFd::new(&input, PollFlags::POLLIN));
        }

        if poll(&mut fds, timeout_ms)? == 0 {
            return Ok(Ready::default());
        }

        let readable =
            PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL;
        let is_ready = |fd: &PollFd| fd.revents().is_some_and(|r| r.intersects(readable));

        let mut ready = Ready::default();
        let mut fds = fds.iter();
        if watched.master {
            ready.master = fds.next().is_some_and(is_ready);
        }
        if watched.input {
            ready.input = fds.next().is_some_and(is_ready);
        }
        Ok(ready)
    }

    fn pump_master<M>(&self, read_master: &mut M, buf: &mut [u8]) -> PtyResult<Master>
    where
        M: FnMut(RawFd, &mut [u8]) -> io::Result<usize>,
    {
        match read_master(self.master, buf) {
            Ok(0) | Err(_) => Ok(Master::Closed),
            Ok(n) => {
                write_all(self.output, &buf[..n]).map_err(PtyError::Write)?;
                Ok(Master::Open)
            },
        }
    }

    /// Forward whatever the master still holds without blocking.
    fn drain<M>(&self, read_master: &mut M, buf: &mut [u8]) -> PtyResult<()>
    where
        M: FnMut(RawFd, &mut [u8]) -> io::Result<usize>,
    {
        let only_master = Watched {
            master: true,
            input: false,
        };
        loop {
            match self.wait(only_master, 0) {
                Ok(ready) if ready.master => {},
                Ok(_) | Err(_) => return Ok(()),
            }
            if let Master::Closed = self.pump_master(read_master, buf)? {
                return Ok(());
            }
        }
    }

    /// Has the child exited? Leaves it unreaped.
    fn child_exited(&self) -> bool {
        self.child.is_some_and(child_exited)
    }
}

/// Has `pid` exited? Leaves it unreaped. A child that is already gone
/// counts as exited.
pub(crate) fn child_exited(pid: Pid) -> bool {
    // SAFETY: siginfo_t is plain old data
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    // SAFETY: info outlives the call
    let rc = unsafe {
        libc::waitid(
            libc::P_PID,
            pid.as_raw() as libc::id_t,
            &mut info,
            libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
        )
    };
    if rc == -1 {
        return Errno::last() == Errno::ECHILD;
    }
    siginfo_pid(&info) != 0
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn siginfo_pid(info: &libc::siginfo_t) -> libc::pid_t {
    // SAFETY: waitid filled in a SIGCHLD siginfo
    unsafe { info.si_pid() }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn siginfo_pid(info: &libc::siginfo_t) -> libc::pid_t {
    info.si_pid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::winch::WATCHER_TEST_LOCK;
    use crate::pty::{PtyAllocator, ResizeWatcher, WindowSize};
    use std::io::{Read, Write};
    use std::net::Shutdown;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc;
    use std::thread;

    /// Loop-side ends and test-side ends of master, input and output.
    struct Harness {
        master: UnixStream,
        input: UnixStream,
        output: UnixStream,
        master_peer: UnixStream,
        input_peer: UnixStream,
        output_peer: UnixStream,
    }

    impl Harness {
        fn new() -> Self {
            let (master, master_peer) = UnixStream::pair().unwrap();
            let (input, input_peer) = UnixStream::pair().unwrap();
            let (output, output_peer) = UnixStream::pair().unwrap();
            Harness {
                master,
                input,
                output,
                master_peer,
                input_peer,
                output_peer,
            }
        }
    }

    /// Run the loop on its own thread, owning the loop-side ends.
    fn run_loop<M, I>(
        master: UnixStream,
        input: UnixStream,
        output: UnixStream,
        read_master: M,
        read_input: I,
    ) -> thread::JoinHandle<PtyResult<()>>
    where
        M: FnMut(RawFd, &mut [u8]) -> io::Result<usize> + Send + 'static,
        I: FnMut(RawFd, &mut [u8]) -> io::Result<usize> + Send + 'static,
    {
        thread::spawn(move || {
            let mask = SignalMask::block_all()?;
            let result = CopyLoop::new(master.as_raw_fd())
                .stdio(input.as_raw_fd(), output.as_raw_fd())
                .drain_timeout(Duration::from_millis(10))
                .run(&mask, read_master, read_input);
            drop((master, input, output));
            result
        })
    }

    fn read_to_end(mut stream: UnixStream) -> Vec<u8> {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_copy_to_each() {
        let h = Harness::new();
        let mut master_peer = h.master_peer;
        let mut input_peer = h.input_peer;

        master_peer.write_all(b"from master").unwrap();
        input_peer.write_all(b"from stdin").unwrap();

        let handle = run_loop(h.master, h.input, h.output, default_read, default_read);

        let mut got = [0u8; 10];
        master_peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"from stdin");

        drop(input_peer);
        drop(master_peer);
        handle.join().unwrap().unwrap();

        assert_eq!(read_to_end(h.output_peer), b"from master");
    }

    #[test]
    fn test_eof_on_all() {
        let h = Harness::new();
        drop(h.master_peer);
        drop(h.input_peer);

        let handle = run_loop(h.master, h.input, h.output, default_read, default_read);
        handle.join().unwrap().unwrap();
        assert!(read_to_end(h.output_peer).is_empty());
    }

    #[test]
    fn test_master_empty_read_ends_loop() {
        let mut h = Harness::new();
        h.master_peer.write_all(b"x").unwrap();

        // Input stays open the whole time.
        let handle = run_loop(h.master, h.input, h.output, |_, _| Ok(0), default_read);
        handle.join().unwrap().unwrap();
        assert!(read_to_end(h.output_peer).is_empty());
        drop(h.input_peer);
    }

    #[test]
    fn test_master_read_error_ends_loop() {
        let mut h = Harness::new();
        h.master_peer.write_all(b"x").unwrap();

        let handle = run_loop(
            h.master,
            h.input,
            h.output,
            |_, _| Err(io::Error::from_raw_os_error(libc::EIO)),
            default_read,
        );
        handle.join().unwrap().unwrap();
        assert!(read_to_end(h.output_peer).is_empty());
        drop(h.input_peer);
    }

    #[test]
    fn test_master_outlives_input() {
        let h = Harness::new();
        let mut master_peer = h.master_peer;
        drop(h.input_peer);

        let handle = run_loop(h.master, h.input, h.output, default_read, default_read);

        // Give the loop a chance to see input EOF first.
        thread::sleep(Duration::from_millis(30));
        master_peer.write_all(b"late output").unwrap();
        master_peer.shutdown(Shutdown::Write).unwrap();

        handle.join().unwrap().unwrap();
        assert_eq!(read_to_end(h.output_peer), b"late output");
    }

    #[test]
    fn test_read_hook_can_rewrite() {
        let h = Harness::new();
        let mut master_peer = h.master_peer;
        drop(h.input_peer);
        master_peer.write_all(b"quiet please").unwrap();
        drop(master_peer);

        let shout = |fd: RawFd, buf: &mut [u8]| {
            let n = default_read(fd, buf)?;
            buf[..n].make_ascii_uppercase();
            Ok(n)
        };
        let handle = run_loop(h.master, h.input, h.output, shout, default_read);
        handle.join().unwrap().unwrap();
        assert_eq!(read_to_end(h.output_peer), b"QUIET PLEASE");
    }

    #[test]
    fn test_output_write_failure_is_fatal() {
        let mut h = Harness::new();
        drop(h.output_peer);
        h.master_peer.write_all(b"nobody listens").unwrap();

        let handle = run_loop(h.master, h.input, h.output, default_read, default_read);
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, PtyError::Write(Errno::EPIPE)));
    }

    // pthread_t is only Send where it is an integer.
    #[cfg(target_os = "linux")]
    #[test]
    fn test_resize_storm_keeps_streams_intact() {
        use nix::sys::pthread::{pthread_kill, pthread_self};
        use nix::sys::signal::Signal;

        let _guard = WATCHER_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let source = PtyAllocator::new().open(None, None).unwrap();
        let target = PtyAllocator::new().open(None, None).unwrap();
        let geometry = WindowSize::new(33, 99);
        geometry.set(source.slave_fd().unwrap()).unwrap();

        let h = Harness::new();
        let master_peer = h.master_peer;
        let input_peer = h.input_peer;
        let output_peer = h.output_peer;

        let to_master: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let to_input: Vec<u8> = (0..64 * 1024).map(|i| (i % 241) as u8).collect();

        let (tid_tx, tid_rx) = mpsc::channel();
        let (source_fd, target_fd) = (source.slave_fd().unwrap(), target.slave_fd().unwrap());
        let (master, input, output) = (h.master, h.input, h.output);
        let looper = thread::spawn(move || -> PtyResult<()> {
            let mask = SignalMask::block_all()?;
            let watcher = ResizeWatcher::install(target_fd, source_fd)?;
            tid_tx.send(pthread_self()).unwrap();
            let result = CopyLoop::new(master.as_raw_fd())
                .stdio(input.as_raw_fd(), output.as_raw_fd())
                .drain_timeout(Duration::from_millis(10))
                .run(&mask, default_read, default_read);
            watcher.uninstall()?;
            drop((master, input, output));
            result
        });
        let loop_thread = tid_rx.recv().unwrap();

        let output_reader = thread::spawn(move || read_to_end(output_peer));

        let mut master_writer_end = master_peer.try_clone().unwrap();
        let master_data = to_master.clone();
        let master_writer = thread::spawn(move || master_writer_end.write_all(&master_data).unwrap());

        let mut master_reader_end = master_peer.try_clone().unwrap();
        let expected_len = to_input.len();
        let master_reader = thread::spawn(move || {
            let mut got = vec![0u8; expected_len];
            master_reader_end.read_exact(&mut got).unwrap();
            got
        });

        let input_data = to_input.clone();
        let input_writer = thread::spawn(move || {
            let mut input_peer = input_peer;
            input_peer.write_all(&input_data).unwrap();
        });

        for _ in 0..1000 {
            pthread_kill(loop_thread, Signal::SIGWINCH).unwrap();
            thread::yield_now();
        }

        input_writer.join().unwrap();
        master_writer.join().unwrap();
        assert_eq!(master_reader.join().unwrap(), to_input);

        master_peer.shutdown(Shutdown::Write).unwrap();
        looper.join().unwrap().unwrap();
        assert_eq!(output_reader.join().unwrap(), to_master);

        assert_eq!(WindowSize::get(target.master_fd().unwrap()).unwrap(), geometry);
    }
}
