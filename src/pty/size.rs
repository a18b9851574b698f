//! Window size management for terminals

use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::libc;

use super::{PtyError, PtyResult};

/// Window size in rows, columns, and pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSize {
    /// Number of rows (lines)
    pub rows: u16,
    /// Number of columns (characters per line)
    pub cols: u16,
    /// Width in pixels (optional, can be 0)
    pub pixel_width: u16,
    /// Height in pixels (optional, can be 0)
    pub pixel_height: u16,
}

impl WindowSize {
    /// Create a new window size
    pub fn new(rows: u16, cols: u16) -> Self {
        WindowSize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    /// Create a new window size with pixel dimensions
    pub fn with_pixels(rows: u16, cols: u16, pixel_width: u16, pixel_height: u16) -> Self {
        WindowSize {
            rows,
            cols,
            pixel_width,
            pixel_height,
        }
    }

    /// Query the window size of the terminal behind `fd`.
    ///
    /// Fails with [`PtyError::NotATerminal`] when `fd` is not a terminal.
    /// Only issues a single ioctl, so it may be called from a signal handler.
    pub fn get(fd: RawFd) -> PtyResult<Self> {
        let mut ws = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        // SAFETY: TIOCGWINSZ writes into a winsize we own
        let result = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) };
        if result == -1 {
            Err(PtyError::NotATerminal(Errno::last()))
        } else {
            Ok(WindowSize::from(ws))
        }
    }

    /// Apply this window size to the terminal behind `fd`.
    ///
    /// Signal-safe for the same reason as [`WindowSize::get`].
    pub fn set(&self, fd: RawFd) -> PtyResult<()> {
        let ws = libc::winsize::from(*self);

        // SAFETY: TIOCSWINSZ only reads the winsize
        let result = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &ws) };
        if result == -1 {
            Err(PtyError::WindowSize(Errno::last()))
        } else {
            Ok(())
        }
    }
}

impl From<WindowSize> for libc::winsize {
    fn from(size: WindowSize) -> Self {
        libc::winsize {
            ws_row: size.rows,
            ws_col: size.cols,
            ws_xpixel: size.pixel_width,
            ws_ypixel: size.pixel_height,
        }
    }
}

impl From<libc::winsize> for WindowSize {
    fn from(ws: libc::winsize) -> Self {
        WindowSize {
            rows: ws.ws_row,
            cols: ws.ws_col,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        }
    }
}
