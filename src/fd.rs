/*!
 * Scoped File Descriptors
 *
 * Every descriptor acquired here follows the reserve/acquire/commit pattern:
 * the cleanup slot exists before the OS resource does, so an allocation
 * failure can never strand an open descriptor. Descriptors are opened
 * close-on-exec by default; [`allow_inherit`](ResourceContext::allow_inherit)
 * is the explicit opt-out for handing one to a spawned child or pty.
 */

use crate::errors::OpResult;
use crate::scope::{ResourceContext, ScopeId};
use nix::fcntl::{fcntl, open, FcntlArg, FdFlag, OFlag};
use nix::sys::stat::Mode;
use nix::unistd;
use std::io::{Read, Write};
use std::os::fd::{BorrowedFd, IntoRawFd};
use std::os::unix::io::RawFd;
use std::path::Path;

impl ResourceContext {
    /// Open a file. The descriptor is owned by the current scope and is
    /// close-on-exec.
    pub fn open(&mut self, path: &Path, flags: OFlag, mode: Mode) -> OpResult<RawFd> {
        let slot = self.cleanup_reserve()?;
        let fd = match open(path, flags | OFlag::O_CLOEXEC, mode) {
            Ok(fd) => fd,
            Err(errno) => {
                self.cleanup_forget(slot);
                return self.raise_os(errno, format_args!("open {}", path.display()));
            }
        };
        self.cleanup_commit_close_fd(&slot, fd);
        Ok(fd)
    }

    /// Close a tracked descriptor now, removing its cleanup registration so
    /// scope teardown will not touch it again. Closing a descriptor not
    /// currently tracked as open is a contract violation.
    pub fn close(&mut self, fd: RawFd) -> OpResult<()> {
        let node = match self.fds.remove(&fd) {
            Some(node) => node,
            None => panic!("close of untracked descriptor {fd}"),
        };
        let _ = self.arena.take_cleanup_action(node);
        self.arena.unlink(node);
        self.arena.free(node);
        match unistd::close(fd) {
            Ok(()) => Ok(()),
            Err(errno) => self.raise_os(errno, format_args!("close fd {fd}")),
        }
    }

    /// Duplicate a descriptor. The new descriptor shares the underlying OS
    /// object, is close-on-exec, and is owned by the current scope; the
    /// original's lifetime is unaffected.
    pub fn dup(&mut self, fd: RawFd) -> OpResult<RawFd> {
        let slot = self.cleanup_reserve()?;
        let new_fd = match unistd::dup(fd) {
            Ok(new_fd) => new_fd,
            Err(errno) => {
                self.cleanup_forget(slot);
                return self.raise_os(errno, format_args!("dup fd {fd}"));
            }
        };
        if let Err(errno) = fcntl(new_fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)) {
            if let Err(e) = unistd::close(new_fd) {
                log::warn!("close({new_fd}) failed while backing out dup: {e}");
            }
            self.cleanup_forget(slot);
            return self.raise_os(errno, format_args!("set close-on-exec on fd {new_fd}"));
        }
        self.cleanup_commit_close_fd(&slot, new_fd);
        Ok(new_fd)
    }

    /// Create a pipe. Both ends are close-on-exec and owned by the current
    /// scope. Returns (read end, write end).
    pub fn pipe(&mut self) -> OpResult<(RawFd, RawFd)> {
        let read_slot = self.cleanup_reserve()?;
        let write_slot = match self.cleanup_reserve() {
            Ok(slot) => slot,
            Err(fault) => {
                self.cleanup_forget(read_slot);
                return Err(fault);
            }
        };
        let (read_end, write_end) = match unistd::pipe2(OFlag::O_CLOEXEC) {
            Ok(ends) => ends,
            Err(errno) => {
                self.cleanup_forget(write_slot);
                self.cleanup_forget(read_slot);
                return self.raise_os(errno, format_args!("create pipe"));
            }
        };
        let read_fd = read_end.into_raw_fd();
        let write_fd = write_end.into_raw_fd();
        self.cleanup_commit_close_fd(&read_slot, read_fd);
        self.cleanup_commit_close_fd(&write_slot, write_fd);
        Ok((read_fd, write_fd))
    }

    /// Allow a specific descriptor to be inherited across process
    /// replacement, clearing the default close-on-exec flag.
    pub fn allow_inherit(&self, fd: RawFd) -> OpResult<()> {
        let bits = match fcntl(fd, FcntlArg::F_GETFD) {
            Ok(bits) => bits,
            Err(errno) => return self.raise_os(errno, format_args!("get flags of fd {fd}")),
        };
        let flags = FdFlag::from_bits_truncate(bits) & !FdFlag::FD_CLOEXEC;
        match fcntl(fd, FcntlArg::F_SETFD(flags)) {
            Ok(_) => Ok(()),
            Err(errno) => self.raise_os(errno, format_args!("clear close-on-exec on fd {fd}")),
        }
    }

    /// Wrap a descriptor as a byte stream without taking ownership of it:
    /// the stream reads and writes through a duplicate owned by the current
    /// scope. Wrap the result in `BufReader`/`BufWriter` for buffering.
    pub fn stream(&mut self, fd: RawFd) -> OpResult<FdIo> {
        let dup_fd = self.dup(fd)?;
        Ok(FdIo { fd: dup_fd })
    }

    /// Duplicate a descriptor into a handle with an independently
    /// controllable lifetime: the duplicate lives in a private one-purpose
    /// scope, so it can be released before (or survive until) whatever the
    /// current scope does.
    pub fn fd_handle_dup(&mut self, fd: RawFd) -> OpResult<FdHandle> {
        let scope = self.create_scope()?;
        match self.with_current(scope, |ctx| ctx.dup(fd)) {
            Ok(dup_fd) => Ok(FdHandle { scope, fd: dup_fd }),
            Err(fault) => {
                self.destroy_scope(scope);
                Err(fault)
            }
        }
    }

    /// Release an [`FdHandle`], closing its descriptor and destroying its
    /// private scope. No other member of the creating scope is touched.
    pub fn fd_handle_destroy(&mut self, handle: FdHandle) {
        self.destroy_scope(handle.scope);
    }
}

/// A descriptor bundled with the private scope that owns it, for release
/// timing independent of the lexical scope that created it.
#[derive(Debug)]
pub struct FdHandle {
    scope: ScopeId,
    fd: RawFd,
}

impl FdHandle {
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

/// Non-owning byte stream over a scope-owned descriptor.
///
/// The descriptor stays valid until the owning scope unwinds; using the
/// stream past that point fails with `EBADF` like any stale descriptor.
#[derive(Debug)]
pub struct FdIo {
    fd: RawFd,
}

impl FdIo {
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        unistd::read(self.fd, buf).map_err(|e| std::io::Error::from_raw_os_error(e as i32))
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        unistd::write(fd, buf).map_err(|e| std::io::Error::from_raw_os_error(e as i32))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
