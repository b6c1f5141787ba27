/*!
 * Scoped Temporary Files
 *
 * Named temp creation with both the unlink and the close owned by the
 * current scope. The `tempfile` crate does the race-free create; ownership
 * is then handed to the scope machinery so teardown order and explicit
 * early release follow the same rules as every other descriptor.
 */

use crate::errors::OpResult;
use crate::scope::ResourceContext;
use std::os::fd::IntoRawFd;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

/// A named temporary file: path plus an open descriptor. Both the unlink
/// and the close are registered in the scope that created it.
#[derive(Debug)]
pub struct NamedTemp {
    pub path: PathBuf,
    pub fd: RawFd,
}

impl ResourceContext {
    /// Create a named temporary file in `dir`. At scope teardown the
    /// descriptor is closed first, then the name is unlinked; either step
    /// failing is logged and ignored. Which directory to use is the
    /// caller's policy.
    pub fn named_tempfile(&mut self, dir: &Path) -> OpResult<NamedTemp> {
        let unlink_slot = self.cleanup_reserve()?;
        let close_slot = match self.cleanup_reserve() {
            Ok(slot) => slot,
            Err(fault) => {
                self.cleanup_forget(unlink_slot);
                return Err(fault);
            }
        };
        let file = match tempfile::Builder::new()
            .prefix("rexec-")
            .tempfile_in(dir)
        {
            Ok(file) => file,
            Err(err) => {
                self.cleanup_forget(close_slot);
                self.cleanup_forget(unlink_slot);
                return self.raise_io(
                    err,
                    format_args!("create temporary file in {}", dir.display()),
                );
            }
        };
        // Take over deletion from the tempfile crate; the scope owns it now.
        let (file, path) = match file.keep() {
            Ok(kept) => kept,
            Err(err) => {
                self.cleanup_forget(close_slot);
                self.cleanup_forget(unlink_slot);
                return self.raise_io(
                    err.error,
                    format_args!("retain temporary file in {}", dir.display()),
                );
            }
        };
        let fd = file.into_raw_fd();
        // Unlink commits first so the later-committed close runs before it.
        self.cleanup_commit_unlink(&unlink_slot, path.clone());
        self.cleanup_commit_close_fd(&close_slot, fd);
        Ok(NamedTemp { path, fd })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tempfile_is_unlinked_at_scope_teardown() {
        let mut ctx = ResourceContext::new();
        let dir = std::env::temp_dir();
        let path = ctx
            .catch(true, |ctx| {
                ctx.with_scope(|ctx| {
                    let tmp = ctx.named_tempfile(&dir)?;
                    assert!(tmp.path.exists());
                    ctx.write_all(tmp.fd, b"scratch")?;
                    Ok(tmp.path)
                })
            })
            .unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn tempfile_survives_via_promotion() {
        let mut ctx = ResourceContext::new();
        let dir = std::env::temp_dir();
        let path = ctx
            .catch(true, |ctx| ctx.named_tempfile(&dir).map(|tmp| tmp.path))
            .unwrap();
        // Promoted into the scope current before the boundary (the process
        // scope); still present until that scope goes away.
        assert!(path.exists());
        drop(ctx);
        assert!(!path.exists());
    }

    #[test]
    fn tempfile_creation_failure_raises() {
        let mut ctx = ResourceContext::new();
        let err = ctx
            .catch(true, |ctx| {
                ctx.named_tempfile(Path::new("/nonexistent/rexec-core-test"))
            })
            .unwrap_err();
        assert_eq!(err.code, nix::errno::Errno::ENOENT as i32);
    }
}
