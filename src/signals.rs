/*!
 * Signal-Safe I/O Gate
 *
 * The process normally blocks the fixed I/O signal set so non-I/O code is
 * never interrupted mid-mutation. Around a blocking wait, a scoped gate
 * unblocks exactly that set and restores the saved mask on the way out,
 * normal exit and unwind alike. The paired readiness wait takes an explicit
 * mask so the mask change and the wait happen in one `ppoll` call.
 */

use crate::errors::OpResult;
use crate::scope::ResourceContext;
use nix::poll::PollFd;
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::time::TimeSpec;
use std::os::raw::c_int;
use std::time::Duration;

/// The fixed set of signals unblocked only around blocking I/O.
pub fn io_signal_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGHUP);
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGQUIT);
    set
}

/// Process-wide gate state: holds the I/O signal set blocked and remembers
/// the mask to restore at uninstall.
pub struct SignalGate {
    allowed: SigSet,
    saved: SigSet,
}

/// Scoped unblock of the gate's signal set. Dropping it restores the mask
/// saved at entry, however the enclosing operation exits.
pub struct IoAllowed {
    saved: SigSet,
}

impl ResourceContext {
    /// Block the I/O signal set process-wide and return the gate.
    pub fn install_signal_gate(&self) -> OpResult<SignalGate> {
        let allowed = io_signal_set();
        let mut saved = SigSet::empty();
        match sigprocmask(SigmaskHow::SIG_BLOCK, Some(&allowed), Some(&mut saved)) {
            Ok(()) => Ok(SignalGate { allowed, saved }),
            Err(errno) => self.raise_os(errno, format_args!("block I/O signal set")),
        }
    }

    /// Timed multi-descriptor readiness wait with an explicit signal mask.
    ///
    /// On Linux this is a real `ppoll`: the mask swap and the wait are one
    /// atomic call. On platforms that emulate it there is a race window
    /// between mask change and wait entry, and callers must provide an
    /// independent wakeup (a self-pipe written from the signal handler) to
    /// avoid a missed-signal deadlock. An interrupted wait raises `EINTR`,
    /// which classifies as temporary.
    pub fn wait_io(
        &self,
        fds: &mut [PollFd<'_>],
        timeout: Option<Duration>,
        mask: Option<&SigSet>,
    ) -> OpResult<c_int> {
        match nix::poll::ppoll(fds, timeout.map(TimeSpec::from), mask.copied()) {
            Ok(ready) => Ok(ready),
            Err(errno) => self.raise_os(errno, format_args!("wait for descriptor readiness")),
        }
    }
}

impl SignalGate {
    /// Unblock the gate's signal set for the duration of the returned
    /// guard. Gates nest: each guard restores the exact mask it saw.
    pub fn allow_io(&self, ctx: &ResourceContext) -> OpResult<IoAllowed> {
        let mut saved = SigSet::empty();
        match sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&self.allowed), Some(&mut saved)) {
            Ok(()) => Ok(IoAllowed { saved }),
            Err(errno) => ctx.raise_os(errno, format_args!("unblock I/O signal set")),
        }
    }

    /// The mask that was in effect before the gate was installed.
    pub fn original_mask(&self) -> &SigSet {
        &self.saved
    }

    /// Restore the pre-install mask.
    pub fn uninstall(self, ctx: &ResourceContext) -> OpResult<()> {
        match sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.saved), None) {
            Ok(()) => Ok(()),
            Err(errno) => ctx.raise_os(errno, format_args!("restore signal mask")),
        }
    }
}

impl Drop for IoAllowed {
    fn drop(&mut self) {
        // Runs during unwinding as well; failure is logged, never raised.
        if let Err(e) = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.saved), None) {
            log::warn!("restoring signal mask failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::poll::PollFlags;
    use serial_test::serial;
    use std::os::fd::BorrowedFd;

    fn current_mask() -> SigSet {
        let mut mask = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, None, Some(&mut mask)).unwrap();
        mask
    }

    fn masks_equal(a: &SigSet, b: &SigSet) -> bool {
        Signal::iterator().all(|sig| a.contains(sig) == b.contains(sig))
    }

    #[test]
    #[serial]
    fn gate_blocks_and_uninstall_restores() {
        let mut ctx = ResourceContext::new();
        let before = current_mask();
        let gate = ctx.catch(true, |ctx| ctx.install_signal_gate()).unwrap();
        assert!(current_mask().contains(Signal::SIGINT));
        ctx.catch(true, |ctx| gate.uninstall(ctx)).unwrap();
        assert!(masks_equal(&current_mask(), &before));
    }

    #[test]
    #[serial]
    fn nested_allow_guards_restore_exactly() {
        let mut ctx = ResourceContext::new();
        let before = current_mask();
        ctx.catch(true, |ctx| {
            let gate = ctx.install_signal_gate()?;
            {
                let _outer = gate.allow_io(ctx)?;
                assert!(!current_mask().contains(Signal::SIGINT));
                {
                    let _inner = gate.allow_io(ctx)?;
                    assert!(!current_mask().contains(Signal::SIGINT));
                }
                assert!(!current_mask().contains(Signal::SIGINT));
            }
            assert!(current_mask().contains(Signal::SIGINT));
            gate.uninstall(ctx)
        })
        .unwrap();
        assert!(masks_equal(&current_mask(), &before));
    }

    #[test]
    #[serial]
    fn allow_guard_restores_on_unwind() {
        let mut ctx = ResourceContext::new();
        let before = current_mask();
        let err = ctx
            .catch(true, |ctx| -> OpResult<()> {
                let gate = ctx.install_signal_gate()?;
                let result = {
                    let _allowed = gate.allow_io(ctx)?;
                    ctx.raise::<()>(
                        nix::errno::Errno::EIO as i32,
                        format_args!("interrupted transfer"),
                    )
                };
                gate.uninstall(ctx)?;
                result
            })
            .unwrap_err();
        assert_eq!(err.code, nix::errno::Errno::EIO as i32);
        assert!(masks_equal(&current_mask(), &before));
    }

    #[test]
    fn wait_io_reports_readiness_and_timeout() {
        let mut ctx = ResourceContext::new();
        ctx.catch(true, |ctx| {
            ctx.with_scope(|ctx| {
                let (read_fd, write_fd) = ctx.pipe()?;
                let borrowed = unsafe { BorrowedFd::borrow_raw(read_fd) };

                let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
                let ready = ctx.wait_io(&mut fds, Some(Duration::from_millis(10)), None)?;
                assert_eq!(ready, 0); // nothing written yet

                ctx.write_all(write_fd, b"x")?;
                let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
                let ready = ctx.wait_io(&mut fds, Some(Duration::from_millis(100)), None)?;
                assert_eq!(ready, 1);
                assert!(fds[0]
                    .revents()
                    .map(|r| r.contains(PollFlags::POLLIN))
                    .unwrap_or(false));
                Ok(())
            })
        })
        .unwrap();
    }
}
