//! Terminal line-discipline snapshots
//!
//! A [`TerminalMode`] is a value: every transform returns a new mode and
//! leaves the receiver untouched. The spawner derives two diverging modes
//! from one snapshot (echo-adjusted for the slave, raw for the invoking
//! terminal) and relies on that.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;

use nix::sys::termios::{
    self, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices,
    Termios,
};

use super::{PtyError, PtyResult};

/// Snapshot of a terminal's input/output/control/local flags and control characters
#[derive(Clone, Debug)]
pub struct TerminalMode {
    termios: Termios,
}

impl TerminalMode {
    /// Read the current mode of the terminal behind `fd`.
    pub fn capture(fd: RawFd) -> PtyResult<Self> {
        // SAFETY: the caller keeps `fd` open for the duration of the call
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        termios::tcgetattr(fd)
            .map(Self::from)
            .map_err(PtyError::NotATerminal)
    }

    /// Push this mode to the terminal behind `fd`.
    pub fn apply(&self, fd: RawFd, when: SetArg) -> PtyResult<()> {
        // SAFETY: the caller keeps `fd` open for the duration of the call
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        termios::tcsetattr(fd, when, &self.termios).map_err(PtyError::Termios)
    }

    /// Put the terminal behind `fd` into raw mode, returning the mode it had before.
    pub fn set_raw(fd: RawFd) -> PtyResult<Self> {
        let original = Self::capture(fd)?;
        original.raw().apply(fd, SetArg::TCSAFLUSH)?;
        Ok(original)
    }

    /// Put the terminal behind `fd` into cbreak mode, returning the mode it had before.
    pub fn set_cbreak(fd: RawFd) -> PtyResult<Self> {
        let original = Self::capture(fd)?;
        original.cbreak().apply(fd, SetArg::TCSAFLUSH)?;
        Ok(original)
    }

    /// Raw mode: no input translation, no output post-processing, 8-bit
    /// characters, no echo, no canonical buffering, no signal characters.
    /// Reads return as soon as one byte is available.
    pub fn raw(&self) -> Self {
        let mut t = self.termios.clone();

        t.input_flags.remove(
            InputFlags::IGNBRK
                | InputFlags::BRKINT
                | InputFlags::IGNPAR
                | InputFlags::PARMRK
                | InputFlags::INPCK
                | InputFlags::ISTRIP
                | InputFlags::INLCR
                | InputFlags::IGNCR
                | InputFlags::ICRNL
                | InputFlags::IXON
                | InputFlags::IXANY
                | InputFlags::IXOFF,
        );
        t.output_flags.remove(OutputFlags::OPOST);
        t.control_flags.remove(ControlFlags::PARENB | ControlFlags::CSIZE);
        t.control_flags.insert(ControlFlags::CS8);
        t.local_flags.remove(
            LocalFlags::ECHO
                | LocalFlags::ECHONL
                | LocalFlags::ICANON
                | LocalFlags::ISIG
                | LocalFlags::IEXTEN,
        );
        t.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        t.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

        Self { termios: t }
    }

    /// Cbreak mode: like raw for input buffering and echo, but signal
    /// characters and output processing stay in effect.
    pub fn cbreak(&self) -> Self {
        let mut t = self.termios.clone();

        t.input_flags.remove(InputFlags::ICRNL);
        t.local_flags.remove(LocalFlags::ECHO | LocalFlags::ICANON);
        t.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        t.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

        Self { termios: t }
    }

    /// Same mode with ECHO switched on or off.
    pub fn with_echo(&self, echo: bool) -> Self {
        let mut t = self.termios.clone();
        t.local_flags.set(LocalFlags::ECHO, echo);
        Self { termios: t }
    }

    pub fn echo(&self) -> bool {
        self.termios.local_flags.contains(LocalFlags::ECHO)
    }

    pub fn termios(&self) -> &Termios {
        &self.termios
    }
}

impl From<Termios> for TerminalMode {
    fn from(termios: Termios) -> Self {
        Self { termios }
    }
}

impl PartialEq for TerminalMode {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (&self.termios, &other.termios);
        a.input_flags == b.input_flags
            && a.output_flags == b.output_flags
            && a.control_flags == b.control_flags
            && a.local_flags == b.local_flags
            && a.control_chars == b.control_chars
    }
}

impl Eq for TerminalMode {}
