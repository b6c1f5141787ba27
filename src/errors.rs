/*!
 * Error Types
 *
 * The raise payload (`Fault`) carried up the call chain by `OpResult`, and
 * the boundary-produced report (`ErrInfo`) consumed by callers deciding what
 * is user-visible versus silently retried.
 */

use nix::errno::Errno;
use serde::Serialize;
use std::borrow::Cow;
use thiserror::Error;

/// Result type for every fallible operation in the substrate.
///
/// A `Fault` travels with `?` until it reaches the nearest
/// [`catch`](crate::ResourceContext::catch) boundary; intermediate scopes
/// release their resources as it propagates.
pub type OpResult<T> = Result<T, Fault>;

/// A raised failure: an errno-style code plus an optional message.
///
/// The message is absent when the innermost boundary was entered with
/// `want_msg = false`; the raise site skips formatting entirely on that path.
#[derive(Debug, Error, Serialize)]
#[error("{}", self.describe())]
pub struct Fault {
    code: i32,
    msg: Option<Cow<'static, str>>,
}

impl Fault {
    pub(crate) fn new(code: i32, msg: Option<Cow<'static, str>>) -> Self {
        Self { code, msg }
    }

    /// The errno-style error code.
    pub fn code(&self) -> i32 {
        self.code
    }

    /// The formatted message, if the boundary asked for one.
    pub fn message(&self) -> Option<&str> {
        self.msg.as_deref()
    }

    /// Human-readable description: the message if present, otherwise the
    /// OS description of the code.
    pub fn describe(&self) -> Cow<'_, str> {
        match &self.msg {
            Some(m) => Cow::Borrowed(m.as_ref()),
            None => Cow::Borrowed(Errno::from_raw(self.code).desc()),
        }
    }

    /// Whether the failure is worth retrying (interrupted or would-block).
    pub fn is_temporary(&self) -> bool {
        matches!(
            Errno::from_raw(self.code),
            Errno::EINTR | Errno::EAGAIN
        )
    }
}

/// Error report produced at a boundary from the innermost raise.
///
/// Never mutated after production; `msg` is `None` when the boundary was
/// entered with `want_msg = false`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrInfo {
    /// Errno-style error code from the raise.
    pub code: i32,
    /// Formatted message, when the boundary asked for one.
    pub msg: Option<String>,
    /// Program name in effect when the boundary resolved.
    pub progname: String,
}

impl std::fmt::Display for ErrInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.msg {
            Some(m) => write!(f, "{}: {}", self.progname, m),
            None => write!(
                f,
                "{}: {}",
                self.progname,
                Errno::from_raw(self.code).desc()
            ),
        }
    }
}
