/*!
 * rexec-core
 *
 * Resource-lifetime and error-recovery substrate for the rexec
 * remote-execution client. The stream multiplexer, transport negotiation,
 * pty/process management, and compression layers all build on the
 * primitives here:
 *
 * - **Scopes**: ordered owners of resources, released LIFO, nested scopes
 *   composing as ordinary members ([`ResourceContext`], [`ScopeId`]).
 * - **Two-phase cleanup registration**: reserve the tracking slot before
 *   the risky acquisition, commit after, so nothing acquired is ever
 *   untracked ([`CleanupSlot`]).
 * - **Error boundary**: raises propagate as [`OpResult`] faults and resolve
 *   at [`catch`](ResourceContext::catch), which promotes resources on
 *   success and destroys exactly the delta on failure.
 * - **Descriptor ownership**: scoped open/dup/pipe/tempfile, close-on-exec
 *   by default, explicit early close, and [`FdHandle`] for independently
 *   timed release.
 * - **Signal-safe I/O gate**: scoped unblocking of the I/O signal set
 *   around the `ppoll`-based readiness wait ([`SignalGate`]).
 *
 * One [`ResourceContext`] serves one logical thread of control; for
 * multi-threaded hosts, create one context per thread.
 */

mod boundary;
pub mod errors;
pub mod fd;
pub mod io;
pub mod scope;
pub mod signals;
pub mod tmpfile;

pub use errors::{ErrInfo, Fault, OpResult};
pub use fd::{FdHandle, FdIo};
pub use io::BlockingMode;
pub use scope::{CleanupSlot, ResourceContext, ScopeId};
pub use signals::{io_signal_set, IoAllowed, SignalGate};
pub use tmpfile::NamedTemp;
