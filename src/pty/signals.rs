//! Signal mask bookkeeping for a spawn call
//!
//! The spawner runs with every signal blocked and only lets them through
//! while it sits in the readiness wait. [`SignalMask`] remembers the mask
//! the caller had and puts it back when asked (or when dropped).

use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};

use super::{PtyError, PtyResult};

/// The caller's signal mask, saved while everything is blocked
#[derive(Debug)]
pub struct SignalMask {
    saved: SigSet,
    restored: bool,
}

impl SignalMask {
    /// Save the current mask and block all signals.
    pub fn block_all() -> PtyResult<Self> {
        let mut saved = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&SigSet::all()), Some(&mut saved))
            .map_err(PtyError::SignalMask)?;
        Ok(SignalMask {
            saved,
            restored: false,
        })
    }

    pub fn saved(&self) -> &SigSet {
        &self.saved
    }

    /// Block all signals again after [`SignalMask::unblock`].
    pub fn block(&self) -> PtyResult<()> {
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&SigSet::all()), None)
            .map_err(PtyError::SignalMask)
    }

    /// Switch back to the saved mask without giving up ownership.
    pub fn unblock(&self) -> PtyResult<()> {
        pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.saved), None)
            .map_err(PtyError::SignalMask)
    }

    /// Run `f` with the saved mask in effect, then block everything again.
    pub fn while_unblocked<T, F: FnOnce() -> T>(&self, f: F) -> PtyResult<T> {
        self.unblock()?;
        let out = f();
        self.block()?;
        Ok(out)
    }

    /// Restore the saved mask for good.
    pub fn restore(mut self) -> PtyResult<()> {
        self.restored = true;
        self.unblock()
    }
}

impl Drop for SignalMask {
    fn drop(&mut self) {
        if !self.restored {
            let _ = self.unblock();
        }
    }
}
