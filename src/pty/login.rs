//! Session promotion
//!
//! Runs in a freshly forked child, so everything here sticks to
//! async-signal-safe calls and never allocates.

use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};

use nix::libc::{self, STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::unistd::{dup2, setsid};

use super::alloc::tty_name_into;
use super::{PtyError, PtyResult};

/// Make the calling process a session leader with `tty` as its controlling
/// terminal, stdin, stdout and stderr.
///
/// `tty` is consumed: it is closed unless it already occupies one of the
/// three standard slots.
pub fn login_tty(tty: OwnedFd) -> PtyResult<()> {
    setsid().map_err(PtyError::Setsid)?;

    let fd = tty.as_raw_fd();

    // SAFETY: TIOCSCTTY takes no pointer argument
    if unsafe { libc::ioctl(fd, libc::TIOCSCTTY as _, 0) } < 0 {
        // System V style: a session leader acquires the first terminal it
        // opens that has no session yet.
        let mut buf = [0u8; 256];
        if let Ok(path) = tty_name_into(fd, &mut buf) {
            // SAFETY: path is NUL-terminated and outlives the call
            let tmp = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
            if tmp >= 0 {
                // SAFETY: tmp was just opened here
                unsafe { libc::close(tmp) };
            }
        }
    }

    dup2(fd, STDIN_FILENO).map_err(PtyError::Dup2)?;
    dup2(fd, STDOUT_FILENO).map_err(PtyError::Dup2)?;
    dup2(fd, STDERR_FILENO).map_err(PtyError::Dup2)?;

    if fd <= STDERR_FILENO {
        // Already one of the standard slots; keep it open.
        let _ = tty.into_raw_fd();
    }

    Ok(())
}
