/*!
 * Leaf I/O Helpers
 *
 * The retrying read/write calls the multiplexer issues under the signal
 * gate, plus the blocking-mode toggle for descriptors driven by the
 * readiness wait.
 */

use crate::errors::OpResult;
use crate::scope::ResourceContext;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingMode {
    Blocking,
    NonBlocking,
}

impl ResourceContext {
    /// Read up to `buf.len()` bytes from `fd`, retrying on `EINTR`. Returns
    /// short only at end of file.
    pub fn read_all(&self, fd: RawFd, buf: &mut [u8]) -> OpResult<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match unistd::read(fd, &mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(Errno::EINTR) => continue,
                Err(errno) => return self.raise_os(errno, format_args!("read fd {fd}")),
            }
        }
        Ok(filled)
    }

    /// Write all of `buf` to `fd`, retrying on `EINTR`.
    pub fn write_all(&self, fd: RawFd, buf: &[u8]) -> OpResult<()> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut sent = 0;
        while sent < buf.len() {
            match unistd::write(borrowed, &buf[sent..]) {
                Ok(n) => sent += n,
                Err(Errno::EINTR) => continue,
                Err(errno) => return self.raise_os(errno, format_args!("write fd {fd}")),
            }
        }
        Ok(())
    }

    /// Set a descriptor's blocking mode, returning the mode it had before.
    pub fn set_blocking_mode(&self, fd: RawFd, mode: BlockingMode) -> OpResult<BlockingMode> {
        let bits = match fcntl(fd, FcntlArg::F_GETFL) {
            Ok(bits) => bits,
            Err(errno) => return self.raise_os(errno, format_args!("get status of fd {fd}")),
        };
        let mut flags = OFlag::from_bits_truncate(bits);
        let previous = if flags.contains(OFlag::O_NONBLOCK) {
            BlockingMode::NonBlocking
        } else {
            BlockingMode::Blocking
        };
        flags.set(OFlag::O_NONBLOCK, mode == BlockingMode::NonBlocking);
        match fcntl(fd, FcntlArg::F_SETFL(flags)) {
            Ok(_) => Ok(previous),
            Err(errno) => self.raise_os(errno, format_args!("set status of fd {fd}")),
        }
    }
}
