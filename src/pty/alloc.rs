//! PTY pair allocation
//!
//! Uses openpty(3) when the platform provides it. Otherwise falls back to
//! probing the legacy BSD multiplexer nodes `/dev/pty[p-zP-T][0-9a-f]` for a
//! free master and opening the matching `/dev/tty..` slave.

use std::ffi::{CStr, OsStr};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{fcntl, open, FcntlArg, FdFlag, OFlag};
use nix::libc;
use nix::pty::openpty;
use nix::sys::stat::Mode;
use nix::sys::termios::SetArg;
use nix::unistd::close;

use super::{PtyError, PtyResult, TerminalMode, WindowSize};

const LEGACY_BANKS: &[u8] = b"pqrstuvwxyzPQRST";
const LEGACY_UNITS: &[u8] = b"0123456789abcdef";

/// A connected master/slave pair.
///
/// Each side is closed at most once: either explicitly through
/// [`PtyPair::close_master`] / [`PtyPair::close_slave`], by handing it off
/// with `take_*`, or when the pair is dropped.
#[derive(Debug)]
pub struct PtyPair {
    master: Option<OwnedFd>,
    slave: Option<OwnedFd>,
    slave_path: Option<PathBuf>,
}

impl PtyPair {
    fn new(master: OwnedFd, slave: OwnedFd, slave_path: Option<PathBuf>) -> Self {
        PtyPair {
            master: Some(master),
            slave: Some(slave),
            slave_path,
        }
    }

    pub fn master_fd(&self) -> Option<RawFd> {
        self.master.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn slave_fd(&self) -> Option<RawFd> {
        self.slave.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn take_master(&mut self) -> Option<OwnedFd> {
        self.master.take()
    }

    pub fn take_slave(&mut self) -> Option<OwnedFd> {
        self.slave.take()
    }

    /// Close the master. Returns `false` if it was already closed or handed off.
    pub fn close_master(&mut self) -> PtyResult<bool> {
        close_once(&mut self.master)
    }

    /// Close the slave. Returns `false` if it was already closed or handed off.
    pub fn close_slave(&mut self) -> PtyResult<bool> {
        close_once(&mut self.slave)
    }

    /// Device path of the slave side.
    pub fn slave_name(&self) -> PtyResult<PathBuf> {
        if let Some(path) = &self.slave_path {
            return Ok(path.clone());
        }
        match self.slave_fd() {
            Some(fd) => slave_name(fd),
            None => Err(PtyError::SlaveName(Errno::EBADF)),
        }
    }
}

fn close_once(slot: &mut Option<OwnedFd>) -> PtyResult<bool> {
    match slot.take() {
        Some(fd) => {
            close(fd.into_raw_fd()).map_err(|e| PtyError::Io(e.into()))?;
            Ok(true)
        },
        None => Ok(false),
    }
}

/// Allocates [`PtyPair`]s.
#[derive(Debug, Clone)]
pub struct PtyAllocator {
    native: bool,
    legacy_dir: PathBuf,
}

impl Default for PtyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PtyAllocator {
    pub fn new() -> Self {
        PtyAllocator {
            native: true,
            legacy_dir: PathBuf::from("/dev"),
        }
    }

    /// Enable or disable openpty(3). With it disabled only the legacy scan runs.
    pub fn native(mut self, native: bool) -> Self {
        self.native = native;
        self
    }

    /// Directory holding the legacy `pty..`/`tty..` nodes.
    pub fn legacy_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.legacy_dir = dir.into();
        self
    }

    /// Open a pair, optionally seeding the slave with `mode` and `size`.
    ///
    /// Fails with [`PtyError::Exhausted`] when neither openpty(3) nor any
    /// legacy node yields a master.
    pub fn open(&self, mode: Option<&TerminalMode>, size: Option<WindowSize>) -> PtyResult<PtyPair> {
        let pair = match self.open_native()? {
            Some(pair) => pair,
            None => self.open_legacy()?,
        };

        let slave = pair
            .slave_fd()
            .ok_or(PtyError::OpenSlave(Errno::EBADF))?;
        if let Some(mode) = mode {
            mode.apply(slave, SetArg::TCSAFLUSH)?;
        }
        if let Some(size) = size {
            size.set(slave)?;
        }

        Ok(pair)
    }

    fn open_native(&self) -> PtyResult<Option<PtyPair>> {
        if !self.native {
            return Ok(None);
        }
        match openpty(None, None) {
            Ok(result) => {
                // Keep both sides out of programs other threads exec
                set_cloexec(&result.master).map_err(PtyError::OpenPty)?;
                set_cloexec(&result.slave).map_err(PtyError::OpenPty)?;
                Ok(Some(PtyPair::new(result.master, result.slave, None)))
            },
            Err(e) => {
                tracing::debug!("openpty failed ({}), scanning legacy devices", e);
                Ok(None)
            },
        }
    }

    fn open_legacy(&self) -> PtyResult<PtyPair> {
        for &bank in LEGACY_BANKS {
            for &unit in LEGACY_UNITS {
                let suffix = [bank, unit];
                let suffix = OsStr::from_bytes(&suffix).to_string_lossy();
                let master_path = self.legacy_dir.join(format!("pty{}", suffix));

                let master = match open_rdwr(&master_path) {
                    Ok(fd) => fd,
                    Err(_) => continue,
                };

                let slave_path = self.legacy_dir.join(format!("tty{}", suffix));
                let slave = open_rdwr(&slave_path).map_err(PtyError::OpenSlave)?;
                tracing::debug!("allocated legacy pty {}", master_path.display());
                return Ok(PtyPair::new(master, slave, Some(slave_path)));
            }
        }

        Err(PtyError::Exhausted)
    }
}

fn open_rdwr(path: &Path) -> nix::Result<OwnedFd> {
    let fd = open(path, OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC, Mode::empty())?;
    // SAFETY: open just returned this descriptor and nothing else owns it
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn set_cloexec(fd: &OwnedFd) -> nix::Result<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map(|_| ())
}

/// Device path of the terminal behind `fd`.
pub fn slave_name(fd: RawFd) -> PtyResult<PathBuf> {
    let mut buf = [0u8; 256];
    let name = tty_name_into(fd, &mut buf).map_err(PtyError::SlaveName)?;
    Ok(PathBuf::from(OsStr::from_bytes(name.to_bytes())))
}

/// ttyname_r(3) into a caller-provided buffer. Does not allocate.
pub(crate) fn tty_name_into(fd: RawFd, buf: &mut [u8]) -> nix::Result<&CStr> {
    // SAFETY: ttyname_r writes at most buf.len() bytes, NUL included
    let rc = unsafe { libc::ttyname_r(fd, buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc != 0 {
        return Err(Errno::from_i32(rc));
    }
    CStr::from_bytes_until_nul(buf).map_err(|_| Errno::ERANGE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};

    #[test]
    fn test_native_pair_is_a_terminal() {
        let pair = PtyAllocator::new().open(None, None).unwrap();
        let name = pair.slave_name().unwrap();
        assert!(name.starts_with("/dev/"), "unexpected slave path {:?}", name);
        assert!(TerminalMode::capture(pair.slave_fd().unwrap()).is_ok());
    }

    #[test]
    fn test_open_seeds_mode_and_size() {
        let template = PtyAllocator::new().open(None, None).unwrap();
        let mode = TerminalMode::capture(template.slave_fd().unwrap())
            .unwrap()
            .with_echo(false);
        let size = WindowSize::with_pixels(40, 132, 1056, 640);

        let pair = PtyAllocator::new().open(Some(&mode), Some(size)).unwrap();
        let slave = pair.slave_fd().unwrap();
        assert!(!TerminalMode::capture(slave).unwrap().echo());
        assert_eq!(WindowSize::get(slave).unwrap(), size);
    }

    #[test]
    fn test_empty_legacy_dir_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let err = PtyAllocator::new()
            .native(false)
            .legacy_dir(dir.path())
            .open(None, None)
            .unwrap_err();
        assert!(matches!(err, PtyError::Exhausted));
    }

    #[test]
    fn test_legacy_scan_skips_busy_nodes() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened read-write, so it looks busy.
        fs::create_dir(dir.path().join("ptyp0")).unwrap();
        File::create(dir.path().join("ptyq3")).unwrap();
        File::create(dir.path().join("ttyq3")).unwrap();

        let pair = PtyAllocator::new()
            .native(false)
            .legacy_dir(dir.path())
            .open(None, None)
            .unwrap();
        assert_eq!(pair.slave_name().unwrap(), dir.path().join("ttyq3"));
    }

    #[test]
    fn test_legacy_master_without_slave_fails() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("ptyS7")).unwrap();

        let err = PtyAllocator::new()
            .native(false)
            .legacy_dir(dir.path())
            .open(None, None)
            .unwrap_err();
        assert!(matches!(err, PtyError::OpenSlave(Errno::ENOENT)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut pair = PtyAllocator::new().open(None, None).unwrap();
        assert!(pair.close_slave().unwrap());
        assert!(pair.close_master().unwrap());
        assert!(!pair.close_master().unwrap());
        assert!(!pair.close_slave().unwrap());
        assert!(pair.master_fd().is_none());
    }

    #[test]
    fn test_taken_side_is_not_closed_by_pair() {
        let mut pair = PtyAllocator::new().open(None, None).unwrap();
        let slave = pair.take_slave().unwrap();
        assert!(!pair.close_slave().unwrap());
        drop(pair);
        let flags = nix::fcntl::fcntl(slave.as_raw_fd(), nix::fcntl::FcntlArg::F_GETFD);
        assert!(flags.is_ok(), "slave closed along with the pair");
    }

    fn is_cloexec(fd: RawFd) -> bool {
        let flags = nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD).unwrap();
        FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC)
    }

    #[test]
    fn test_native_pair_is_close_on_exec() {
        let pair = PtyAllocator::new().open(None, None).unwrap();
        assert!(is_cloexec(pair.master_fd().unwrap()));
        assert!(is_cloexec(pair.slave_fd().unwrap()));
    }

    #[test]
    fn test_legacy_pair_is_close_on_exec() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("ptyp0")).unwrap();
        File::create(dir.path().join("ttyp0")).unwrap();

        let pair = PtyAllocator::new()
            .native(false)
            .legacy_dir(dir.path())
            .open(None, None)
            .unwrap();
        assert!(is_cloexec(pair.master_fd().unwrap()));
        assert!(is_cloexec(pair.slave_fd().unwrap()));
    }
}
