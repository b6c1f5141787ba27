/*!
 * Error Boundary
 *
 * Raising a failure hands a [`Fault`] up the call chain; recovery happens
 * only at [`catch`](ResourceContext::catch), which is also the unit of scope
 * promotion. Everything created after the boundary was entered and not
 * redirected into an ancestor scope is destroyed, LIFO, before the caller
 * sees the error. Raising with no active boundary is fatal to the process.
 */

use crate::errors::{ErrInfo, Fault, OpResult};
use crate::scope::{ResourceContext, ScopeId};
use nix::errno::Errno;
use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

impl ResourceContext {
    /// Enter an error boundary and run `work` with a fresh scope current.
    ///
    /// On normal completion the fresh scope's members are promoted into the
    /// scope that was current before entry. On a raise the fresh scope is
    /// destroyed and the innermost fault becomes the returned [`ErrInfo`];
    /// with `want_msg = false` raise sites skip message formatting and the
    /// report carries only the code.
    pub fn catch<T>(
        &mut self,
        want_msg: bool,
        work: impl FnOnce(&mut Self) -> OpResult<T>,
    ) -> Result<T, ErrInfo> {
        let outer = self.current_scope();
        self.boundaries.push(want_msg);
        let fresh = match self.create_scope() {
            Ok(scope) => scope,
            Err(fault) => {
                self.boundaries.pop();
                return Err(self.err_info(fault));
            }
        };
        let prev = self.enter(fresh);
        let out = catch_unwind(AssertUnwindSafe(|| work(self)));
        self.leave(prev);
        self.boundaries.pop();
        match out {
            Ok(Ok(value)) => {
                self.transfer(outer, fresh);
                self.destroy_scope(fresh);
                Ok(value)
            }
            Ok(Err(fault)) => {
                self.destroy_scope(fresh);
                log::debug!("operation failed at boundary: {fault}");
                Err(self.err_info(fault))
            }
            Err(panic) => {
                self.destroy_scope(fresh);
                resume_unwind(panic)
            }
        }
    }

    fn err_info(&self, fault: Fault) -> ErrInfo {
        ErrInfo {
            code: fault.code(),
            msg: fault.message().map(str::to_owned),
            progname: self.progname().to_owned(),
        }
    }

    /// Raise a failure with an explicit code. Always returns `Err`; control
    /// resolves at the nearest active boundary.
    pub fn raise<T>(&self, code: i32, msg: fmt::Arguments<'_>) -> OpResult<T> {
        Err(self.fault(code, msg))
    }

    /// Raise from an OS call failure, attaching the failing call's errno.
    pub fn raise_os<T>(&self, errno: Errno, msg: fmt::Arguments<'_>) -> OpResult<T> {
        let code = errno as i32;
        let want = self.want_msg(code, &msg);
        let msg = want.then(|| Cow::Owned(format!("{msg}: {}", errno.desc())));
        Err(Fault::new(code, msg))
    }

    /// Raise from a `std::io` failure. Wrapper errors (path context added by
    /// other crates) hide the OS code behind `source()`; the innermost code
    /// found wins, and only a genuinely codeless error maps to `EIO`.
    pub fn raise_io<T>(&self, err: std::io::Error, msg: fmt::Arguments<'_>) -> OpResult<T> {
        self.raise_os(io_errno(&err), msg)
    }

    fn fault(&self, code: i32, msg: fmt::Arguments<'_>) -> Fault {
        let want = self.want_msg(code, &msg);
        let msg = want.then(|| Cow::Owned(fmt::format(msg)));
        Fault::new(code, msg)
    }

    fn want_msg(&self, code: i32, msg: &fmt::Arguments<'_>) -> bool {
        match self.boundaries.last() {
            Some(want) => *want,
            None => panic!(
                "fatal: raise({code}) with no active error boundary: {msg}"
            ),
        }
    }

    fn enter(&mut self, scope: ScopeId) -> ScopeId {
        let prev = self.current_scope();
        self.set_current(scope);
        prev
    }

    fn leave(&mut self, prev: ScopeId) {
        self.set_current(prev);
    }
}

fn io_errno(err: &std::io::Error) -> Errno {
    if let Some(code) = err.raw_os_error() {
        return Errno::from_raw(code);
    }
    let mut cause: Option<&(dyn Error + 'static)> = err.get_ref().map(|e| e as _);
    while let Some(inner) = cause {
        if let Some(code) = inner
            .downcast_ref::<std::io::Error>()
            .and_then(std::io::Error::raw_os_error)
        {
            return Errno::from_raw(code);
        }
        cause = inner.source();
    }
    kind_errno(err.kind())
}

fn kind_errno(kind: std::io::ErrorKind) -> Errno {
    use std::io::ErrorKind;
    match kind {
        ErrorKind::NotFound => Errno::ENOENT,
        ErrorKind::PermissionDenied => Errno::EACCES,
        ErrorKind::AlreadyExists => Errno::EEXIST,
        ErrorKind::InvalidInput => Errno::EINVAL,
        ErrorKind::Interrupted => Errno::EINTR,
        ErrorKind::WouldBlock => Errno::EAGAIN,
        ErrorKind::BrokenPipe => Errno::EPIPE,
        ErrorKind::TimedOut => Errno::ETIMEDOUT,
        _ => Errno::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_resolves_at_boundary_with_code_and_message() {
        let mut ctx = ResourceContext::new();
        let err = ctx
            .catch(true, |ctx| -> OpResult<()> {
                ctx.raise(Errno::ECONNRESET as i32, format_args!("peer went away"))
            })
            .unwrap_err();
        assert_eq!(err.code, Errno::ECONNRESET as i32);
        assert_eq!(err.msg.as_deref(), Some("peer went away"));
    }

    #[test]
    fn want_msg_false_suppresses_message() {
        let mut ctx = ResourceContext::new();
        let err = ctx
            .catch(false, |ctx| -> OpResult<()> {
                ctx.raise(Errno::EPIPE as i32, format_args!("never formatted"))
            })
            .unwrap_err();
        assert_eq!(err.code, Errno::EPIPE as i32);
        assert!(err.msg.is_none());
    }

    #[test]
    fn nested_boundary_uses_its_own_want_flag() {
        let mut ctx = ResourceContext::new();
        ctx.catch(false, |ctx| {
            let inner = ctx.catch(true, |ctx| -> OpResult<()> {
                ctx.raise(Errno::EIO as i32, format_args!("inner detail"))
            });
            assert_eq!(inner.unwrap_err().msg.as_deref(), Some("inner detail"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn err_info_carries_progname() {
        let mut ctx = ResourceContext::new();
        ctx.set_progname("rexec-test");
        let err = ctx
            .catch(true, |ctx| -> OpResult<()> {
                ctx.raise(Errno::EINVAL as i32, format_args!("bad flag"))
            })
            .unwrap_err();
        assert_eq!(err.progname, "rexec-test");
        assert_eq!(err.to_string(), "rexec-test: bad flag");
    }

    #[test]
    fn raise_io_recovers_the_code_from_a_wrapper_error() {
        let mut ctx = ResourceContext::new();
        let err = ctx
            .catch(true, |ctx| -> OpResult<()> {
                let inner = std::io::Error::from_raw_os_error(Errno::ENOENT as i32);
                let wrapped = std::io::Error::new(std::io::ErrorKind::NotFound, inner);
                assert!(wrapped.raw_os_error().is_none());
                ctx.raise_io(wrapped, format_args!("open spool"))
            })
            .unwrap_err();
        assert_eq!(err.code, Errno::ENOENT as i32);
    }

    #[test]
    #[should_panic(expected = "no active error boundary")]
    fn raise_without_boundary_is_fatal() {
        let ctx = ResourceContext::new();
        let _: OpResult<()> = ctx.raise(Errno::EIO as i32, format_args!("top level"));
    }
}
