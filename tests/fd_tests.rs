/*!
 * Descriptor Ownership Tests
 *
 * Scope-driven close, explicit early close, independent-lifetime handles,
 * close-on-exec defaults, and temp file teardown, all against real
 * descriptors.
 */

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::stat::Mode;
use rexec_core::ResourceContext;
use serial_test::serial;
use std::io::{Read, Write};
use std::os::unix::io::RawFd;
use std::path::Path;

fn fd_is_open(fd: RawFd) -> bool {
    fcntl(fd, FcntlArg::F_GETFD).is_ok()
}

fn fd_is_cloexec(fd: RawFd) -> bool {
    let bits = fcntl(fd, FcntlArg::F_GETFD).unwrap();
    FdFlag::from_bits_truncate(bits).contains(FdFlag::FD_CLOEXEC)
}

fn dev_null(ctx: &mut ResourceContext) -> rexec_core::OpResult<RawFd> {
    ctx.open(Path::new("/dev/null"), OFlag::O_RDWR, Mode::empty())
}

#[test]
#[serial]
fn descriptors_default_to_close_on_exec() {
    let mut ctx = ResourceContext::new();
    ctx.catch(true, |ctx| {
        ctx.with_scope(|ctx| {
            let fd = dev_null(ctx)?;
            assert!(fd_is_cloexec(fd));

            let dup_fd = ctx.dup(fd)?;
            assert!(fd_is_cloexec(dup_fd));

            let (read_fd, write_fd) = ctx.pipe()?;
            assert!(fd_is_cloexec(read_fd));
            assert!(fd_is_cloexec(write_fd));

            ctx.allow_inherit(write_fd)?;
            assert!(!fd_is_cloexec(write_fd));
            Ok(())
        })
    })
    .unwrap();
}

#[test]
#[serial]
fn scope_teardown_closes_everything_it_owns() {
    let mut ctx = ResourceContext::new();
    let fds = ctx
        .catch(true, |ctx| {
            ctx.with_scope(|ctx| {
                let fd = dev_null(ctx)?;
                let (read_fd, write_fd) = ctx.pipe()?;
                assert!(fd_is_open(fd) && fd_is_open(read_fd) && fd_is_open(write_fd));
                Ok([fd, read_fd, write_fd])
            })
        })
        .unwrap();
    for fd in fds {
        assert!(!fd_is_open(fd));
    }
}

#[test]
#[serial]
fn raise_closes_descriptors_opened_since_the_boundary() {
    let mut ctx = ResourceContext::new();
    let mut leaked: Option<RawFd> = None;
    let err = ctx
        .catch(true, |ctx| -> rexec_core::OpResult<()> {
            let fd = dev_null(ctx)?;
            leaked = Some(fd);
            ctx.raise(
                nix::errno::Errno::EPROTO as i32,
                format_args!("handshake rejected"),
            )
        })
        .unwrap_err();
    assert_eq!(err.code, nix::errno::Errno::EPROTO as i32);
    assert!(!fd_is_open(leaked.unwrap()));
}

#[test]
#[serial]
fn fd_handle_releases_independently_of_its_creating_scope() {
    let mut ctx = ResourceContext::new();
    ctx.catch(true, |ctx| {
        ctx.with_scope(|ctx| {
            let kept = dev_null(ctx)?;
            let original = dev_null(ctx)?;

            let handle = ctx.fd_handle_dup(original)?;
            let handle_fd = handle.fd();
            assert!(fd_is_open(handle_fd));

            // Early, independent release: only the handle's descriptor goes.
            ctx.fd_handle_destroy(handle);
            assert!(!fd_is_open(handle_fd));
            assert!(fd_is_open(original));
            assert!(fd_is_open(kept));

            // The kernel reuses the lowest free number; if the creating
            // scope re-released the handle's descriptor at teardown it
            // would close this reoccupant.
            let reoccupant = dev_null(ctx)?;
            assert_eq!(reoccupant, handle_fd);
            Ok(())
        })
    })
    .unwrap();
}

#[test]
#[serial]
fn fd_handle_outlives_a_lexical_scope_when_created_outside_it() {
    let mut ctx = ResourceContext::new();
    ctx.catch(true, |ctx| {
        let original = dev_null(ctx)?;
        let handle = ctx.fd_handle_dup(original)?;
        let handle_fd = handle.fd();

        ctx.with_scope(|ctx| {
            let transient = dev_null(ctx)?;
            assert!(fd_is_open(transient));
            Ok(())
        })?;

        assert!(fd_is_open(handle_fd));
        ctx.fd_handle_destroy(handle);
        assert!(!fd_is_open(handle_fd));
        Ok(())
    })
    .unwrap();
}

#[test]
#[serial]
fn stream_wraps_a_duplicate_not_the_original() {
    let mut ctx = ResourceContext::new();
    ctx.catch(true, |ctx| {
        let (read_fd, write_fd) = ctx.pipe()?;

        let mut writer = ctx.with_scope(|ctx| ctx.stream(write_fd))?;
        // The duplicate died with the lexical scope; the wrapper is stale.
        assert!(writer.write(b"x").is_err());
        // The wrapped original is untouched.
        assert!(fd_is_open(write_fd));

        let mut writer = ctx.stream(write_fd)?;
        writer.write_all(b"framed").unwrap();
        let mut reader = ctx.stream(read_fd)?;
        let mut buf = [0u8; 6];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"framed");
        Ok(())
    })
    .unwrap();
}

#[test]
#[serial]
fn tempfile_closes_then_unlinks_at_teardown() {
    let mut ctx = ResourceContext::new();
    let dir = std::env::temp_dir();
    let (path, fd) = ctx
        .catch(true, |ctx| {
            ctx.with_scope(|ctx| {
                let tmp = ctx.named_tempfile(&dir)?;
                assert!(tmp.path.starts_with(&dir));
                assert!(tmp.path.exists());
                assert!(fd_is_open(tmp.fd));
                ctx.write_all(tmp.fd, b"spool")?;
                Ok((tmp.path, tmp.fd))
            })
        })
        .unwrap();
    assert!(!fd_is_open(fd));
    assert!(!path.exists());
}

#[test]
#[serial]
fn explicit_close_is_final_for_the_owning_scope() {
    let mut ctx = ResourceContext::new();
    ctx.catch(true, |ctx| {
        ctx.with_scope(|ctx| {
            let fd = dev_null(ctx)?;
            ctx.close(fd)?;
            // The number can be reused immediately; teardown of the scope
            // must not close the reoccupant.
            let reoccupant = dev_null(ctx)?;
            assert_eq!(reoccupant, fd);
            ctx.with_scope(|_| Ok(()))?;
            assert!(fd_is_open(reoccupant));
            Ok(())
        })
    })
    .unwrap();
}
