//! SIGWINCH propagation
//!
//! While a session runs, resizes of the invoking terminal are copied onto
//! the pty slave from a SIGWINCH handler. The handler never touches a
//! descriptor owned by the rest of the program: it reopens the slave by the
//! path captured at install time, copies the geometry, and closes its own
//! descriptor again, all with every signal blocked.
//!
//! There is exactly one SIGWINCH disposition per process, so only one
//! [`ResizeWatcher`] can exist at a time. A second install while one is
//! alive fails with [`PtyError::WatcherBusy`]; concurrent sessions in one
//! process simply run without resize propagation.

use std::ffi::CString;
use std::marker::PhantomData;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use nix::libc;
use nix::sys::signal::{
    pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};

use super::{slave_name, PtyError, PtyResult, WindowSize};

/// Whether this platform delivers a terminal-resize signal.
pub const RESIZE_SIGNAL_SUPPORTED: bool = true;

/// What the handler needs; only read from signal context.
struct Watch {
    slave_path: CString,
    source: RawFd,
}

static OWNED: AtomicBool = AtomicBool::new(false);
static ACTIVE: AtomicPtr<Watch> = AtomicPtr::new(ptr::null_mut());
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// Owns the process-wide SIGWINCH disposition for the duration of a session.
///
/// Dropping it (or calling [`ResizeWatcher::uninstall`]) puts the previous
/// disposition back. Install and uninstall are meant to run with all
/// signals blocked on the calling thread.
#[derive(Debug)]
pub struct ResizeWatcher {
    previous: SigAction,
    released: bool,
    // The disposition belongs to the installing thread's session.
    _not_send: PhantomData<*const ()>,
}

impl ResizeWatcher {
    /// Start copying the geometry of `source` onto the terminal at `slave`'s
    /// path on every SIGWINCH.
    ///
    /// The path is resolved now; `slave` itself may be closed right after.
    pub fn install(slave: RawFd, source: RawFd) -> PtyResult<Self> {
        let path = slave_name(slave)?;
        let slave_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| PtyError::InvalidArgument(e.to_string()))?;

        if OWNED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PtyError::WatcherBusy);
        }

        let watch = Box::into_raw(Box::new(Watch { slave_path, source }));
        ACTIVE.store(watch, Ordering::SeqCst);

        let action = SigAction::new(
            SigHandler::Handler(on_resize),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: on_resize only performs async-signal-safe calls
        match unsafe { sigaction(Signal::SIGWINCH, &action) } {
            Ok(previous) => {
                tracing::debug!("resize watcher installed for {}", path.display());
                Ok(ResizeWatcher {
                    previous,
                    released: false,
                    _not_send: PhantomData,
                })
            },
            Err(e) => {
                clear_watch();
                OWNED.store(false, Ordering::Release);
                Err(PtyError::SignalHandler(e))
            },
        }
    }

    /// Restore the SIGWINCH disposition that was in place before install.
    pub fn uninstall(mut self) -> PtyResult<()> {
        self.release()
    }

    fn release(&mut self) -> PtyResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        // SAFETY: restoring a disposition the kernel handed back to us
        let restored = unsafe { sigaction(Signal::SIGWINCH, &self.previous) };
        clear_watch();
        OWNED.store(false, Ordering::Release);

        restored.map(|_| ()).map_err(PtyError::SignalHandler)
    }
}

impl Drop for ResizeWatcher {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!("failed to restore SIGWINCH handler: {}", e);
        }
    }
}

/// Detach the handler state and free it once no handler is using it.
fn clear_watch() {
    let watch = ACTIVE.swap(ptr::null_mut(), Ordering::SeqCst);
    // A handler running on another thread may still hold the old pointer.
    while IN_FLIGHT.load(Ordering::SeqCst) != 0 {
        std::hint::spin_loop();
    }
    if !watch.is_null() {
        // SAFETY: produced by Box::into_raw in install, and no longer reachable
        drop(unsafe { Box::from_raw(watch) });
    }
}

extern "C" fn on_resize(_: libc::c_int) {
    let saved_errno = errno::get();
    IN_FLIGHT.fetch_add(1, Ordering::SeqCst);

    let watch = ACTIVE.load(Ordering::SeqCst);
    if !watch.is_null() {
        // SAFETY: clear_watch waits for IN_FLIGHT to drain before freeing
        let watch = unsafe { &*watch };

        let mut previous = SigSet::empty();
        let blocked =
            pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&SigSet::all()), Some(&mut previous))
                .is_ok();

        // SAFETY: slave_path is NUL-terminated; the descriptor is ours alone
        let flags = libc::O_RDWR | libc::O_NOCTTY | libc::O_CLOEXEC;
        let fd = unsafe { libc::open(watch.slave_path.as_ptr(), flags) };
        if fd >= 0 {
            if let Ok(size) = WindowSize::get(watch.source) {
                let _ = size.set(fd);
            }
            // SAFETY: fd was opened above
            unsafe { libc::close(fd) };
        }

        if blocked {
            let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None);
        }
    }

    IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
    errno::set(saved_errno);
}

/// errno must survive a signal handler untouched.
mod errno {
    use nix::libc;

    #[cfg(any(target_os = "linux", target_os = "emscripten", target_os = "redox"))]
    unsafe fn location() -> *mut libc::c_int {
        libc::__errno_location()
    }

    #[cfg(any(target_os = "android", target_os = "netbsd", target_os = "openbsd"))]
    unsafe fn location() -> *mut libc::c_int {
        libc::__errno()
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly"
    ))]
    unsafe fn location() -> *mut libc::c_int {
        libc::__error()
    }

    pub(super) fn get() -> libc::c_int {
        // SAFETY: the errno location is valid for the current thread
        unsafe { *location() }
    }

    pub(super) fn set(value: libc::c_int) {
        // SAFETY: as above
        unsafe { *location() = value }
    }
}

/// Serialises tests that own the process-wide SIGWINCH disposition.
#[cfg(test)]
pub(crate) static WATCHER_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
