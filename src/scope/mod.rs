/*!
 * Scopes and the Cleanup Engine
 *
 * A scope is an ordered owner of resources: destroying it releases its
 * members in strict reverse-of-commit order, recursing into nested scopes
 * where their chain position is reached. Every acquisition goes through the
 * two-phase reserve/commit protocol so there is never a window where a
 * created resource is untracked.
 *
 * All of it hangs off [`ResourceContext`], the explicit current-scope
 * context threaded through the client's call chains. One context serves one
 * logical thread; cleanup actions are not required to be `Send`, so the
 * context itself is single-thread by construction.
 */

mod arena;

use crate::errors::{Fault, OpResult};
use arena::{Action, Arena, Body, NodeId, NIL};
use std::borrow::Cow;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::path::PathBuf;

/// Handle to a scope owned by a [`ResourceContext`].
///
/// Handles carry the arena generation of their node, so using one after its
/// scope was destroyed panics even when the underlying slot has been reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeId {
    pub(crate) node: NodeId,
    pub(crate) gen: u32,
}

/// A reserved cleanup slot: tracked by the current scope but not yet bound
/// to a release action. Commit it once the risky acquisition has succeeded;
/// forget it if the registration turns out to be unnecessary, before or
/// after committing. Dropping the handle without doing either leaves the
/// node in place: pending nodes are freed silently when their scope
/// unwinds, committed ones run their action.
#[derive(Debug)]
#[must_use = "reserved cleanup slots should be committed or forgotten"]
pub struct CleanupSlot {
    pub(crate) node: NodeId,
    pub(crate) gen: u32,
}

/// The current-scope context: node arena, scope stack, tracked-descriptor
/// table, and the active error-boundary frames.
pub struct ResourceContext {
    pub(crate) arena: Arena,
    root: NodeId,
    current: NodeId,
    /// Committed close-fd cleanup node per tracked open descriptor.
    pub(crate) fds: HashMap<RawFd, NodeId>,
    /// want_msg flag per active boundary, innermost last.
    pub(crate) boundaries: Vec<bool>,
    progname: Cow<'static, str>,
}

impl ResourceContext {
    /// Create a context with an empty process scope as current.
    pub fn new() -> Self {
        let mut arena = Arena::new();
        let head = arena
            .try_alloc(Body::Head)
            .expect("arena bootstrap allocation");
        arena.init_head(head);
        let root = arena
            .try_alloc(Body::Scope { parent: NIL, head })
            .expect("arena bootstrap allocation");
        Self {
            arena,
            root,
            current: root,
            fds: HashMap::new(),
            boundaries: Vec::new(),
            progname: Cow::Borrowed("rexec"),
        }
    }

    /// The process scope. Destroyed only when the context is dropped.
    pub fn root_scope(&self) -> ScopeId {
        self.scope_handle(self.root)
    }

    /// The scope new resources currently attach to.
    pub fn current_scope(&self) -> ScopeId {
        self.scope_handle(self.current)
    }

    pub(crate) fn set_current(&mut self, scope: ScopeId) {
        self.check_scope(scope);
        self.current = scope.node;
    }

    fn scope_handle(&self, node: NodeId) -> ScopeId {
        ScopeId {
            node,
            gen: self.arena.gen(node),
        }
    }

    fn check_scope(&self, scope: ScopeId) {
        if !self.arena.is_live(scope.node, scope.gen) || !self.arena.is_scope(scope.node) {
            panic!("stale or invalid scope handle");
        }
    }

    fn check_slot(&self, slot: &CleanupSlot) {
        if !self.arena.is_live(slot.node, slot.gen) {
            panic!("stale or invalid cleanup handle");
        }
    }

    /// The scope that was current when `scope` was created; `None` for the
    /// process scope.
    pub fn scope_parent(&self, scope: ScopeId) -> Option<ScopeId> {
        self.check_scope(scope);
        let parent = self.arena.scope_parent(scope.node);
        (parent != NIL).then(|| self.scope_handle(parent))
    }

    pub fn set_progname(&mut self, name: impl Into<Cow<'static, str>>) {
        self.progname = name.into();
    }

    pub fn progname(&self) -> &str {
        &self.progname
    }

    /// Create a new empty scope owned by the current scope. Does not make
    /// the new scope current.
    pub fn create_scope(&mut self) -> OpResult<ScopeId> {
        let head = match self.arena.try_alloc(Body::Head) {
            Ok(id) => id,
            Err(()) => return self.raise_oom(),
        };
        let node = match self.arena.try_alloc(Body::Scope {
            parent: self.current,
            head,
        }) {
            Ok(id) => id,
            Err(()) => {
                self.arena.free(head);
                return self.raise_oom();
            }
        };
        self.arena.init_head(head);
        let cur_head = self.arena.scope_head(self.current);
        self.arena.link_after(cur_head, node);
        log::trace!("scope {node} created under {}", self.current);
        Ok(self.scope_handle(node))
    }

    /// Destroy a scope, releasing its members in LIFO order, recursively.
    /// Never fails; cleanup failures are logged and swallowed.
    pub fn destroy_scope(&mut self, scope: ScopeId) {
        assert!(
            scope.node != self.root,
            "the process scope cannot be destroyed explicitly"
        );
        self.check_scope(scope);
        self.arena.unlink(scope.node);
        self.destroy_detached(scope.node);
    }

    fn destroy_detached(&mut self, scope_node: NodeId) {
        let head = self.arena.scope_head(scope_node);
        while !self.arena.chain_is_empty(head) {
            let member = self.arena.slot(head).next;
            self.arena.unlink(member);
            if self.arena.is_scope(member) {
                self.destroy_detached(member);
            } else {
                let action = self.arena.take_cleanup_action(member);
                self.arena.free(member);
                if let Some(action) = action {
                    self.run_action(action);
                }
            }
        }
        self.arena.free(head);
        self.arena.free(scope_node);
    }

    /// Run one release action during teardown. Runs in unwinding context, so
    /// a failing action is logged, never re-raised.
    fn run_action(&mut self, action: Action) {
        match action {
            Action::Run(f) => {
                if catch_unwind(AssertUnwindSafe(f)).is_err() {
                    log::error!("cleanup action panicked; continuing teardown");
                }
            }
            Action::CloseFd(fd) => {
                self.fds.remove(&fd);
                if let Err(e) = nix::unistd::close(fd) {
                    log::warn!("close({fd}) failed during teardown: {e}");
                }
            }
            Action::Unlink(path) => {
                if let Err(e) = std::fs::remove_file(&path) {
                    log::warn!("unlink of {} failed during teardown: {e}", path.display());
                }
            }
        }
    }

    /// Splice every member of `from` onto the head of `to`'s chain,
    /// preserving relative order and running nothing. `from` becomes empty:
    /// when `to` is destroyed, the transferred members release first.
    pub fn transfer(&mut self, to: ScopeId, from: ScopeId) {
        assert!(to != from, "transfer between a scope and itself");
        self.check_scope(to);
        self.check_scope(from);
        let to_head = self.arena.scope_head(to.node);
        let from_head = self.arena.scope_head(from.node);
        self.arena.splice_chain(to_head, from_head);
    }

    /// Run `work` with a fresh scope as current; the scope is destroyed on
    /// the way out whether `work` succeeds, raises, or panics. Resources
    /// that must survive are transferred out or created via
    /// [`with_current`](Self::with_current).
    pub fn with_scope<T>(
        &mut self,
        work: impl FnOnce(&mut Self) -> OpResult<T>,
    ) -> OpResult<T> {
        let scope = self.create_scope()?;
        let prev = self.current;
        self.current = scope.node;
        let out = catch_unwind(AssertUnwindSafe(|| work(self)));
        self.current = prev;
        self.destroy_scope(scope);
        match out {
            Ok(result) => result,
            Err(panic) => resume_unwind(panic),
        }
    }

    /// Run `work` with an existing scope as current, without creating a new
    /// one. Used to intentionally allocate into an ancestor scope from deep
    /// in a call chain.
    pub fn with_current<T>(
        &mut self,
        scope: ScopeId,
        work: impl FnOnce(&mut Self) -> OpResult<T>,
    ) -> OpResult<T> {
        self.check_scope(scope);
        let prev = self.current;
        self.current = scope.node;
        let out = catch_unwind(AssertUnwindSafe(|| work(self)));
        self.current = prev;
        match out {
            Ok(result) => result,
            Err(panic) => resume_unwind(panic),
        }
    }

    /// Reserve a cleanup slot in the current scope, before the resource it
    /// will guard exists. Only this step can fail; commit cannot, so there
    /// is no window where an acquired resource is untracked.
    pub fn cleanup_reserve(&mut self) -> OpResult<CleanupSlot> {
        let node = match self.arena.try_alloc(Body::Cleanup {
            action: None,
            committed: false,
        }) {
            Ok(id) => id,
            Err(()) => return self.raise_oom(),
        };
        let head = self.arena.scope_head(self.current);
        self.arena.link_after(head, node);
        Ok(CleanupSlot {
            node,
            gen: self.arena.gen(node),
        })
    }

    /// Bind a release closure to a reserved slot and re-insert it at the
    /// head of the current scope's chain: most recently committed cleans up
    /// first. The handle stays usable for [`cleanup_forget`](Self::cleanup_forget).
    pub fn cleanup_commit(&mut self, slot: &CleanupSlot, release: impl FnOnce() + 'static) {
        self.commit_action(slot, Action::Run(Box::new(release)));
    }

    /// Commit a reserved slot to closing `fd`, and track the descriptor as
    /// open so [`close`](Self::close) and duplicate-release checks work.
    pub fn cleanup_commit_close_fd(&mut self, slot: &CleanupSlot, fd: RawFd) {
        self.commit_action(slot, Action::CloseFd(fd));
        self.fds.insert(fd, slot.node);
    }

    /// Commit a reserved slot to unlinking `path`. Failure to unlink at
    /// teardown is ignored.
    pub fn cleanup_commit_unlink(&mut self, slot: &CleanupSlot, path: PathBuf) {
        self.commit_action(slot, Action::Unlink(path));
    }

    fn commit_action(&mut self, slot: &CleanupSlot, action: Action) {
        self.check_slot(slot);
        match &mut self.arena.slot_mut(slot.node).body {
            Body::Cleanup {
                action: bound,
                committed,
            } => {
                assert!(!*committed, "cleanup slot committed twice");
                *bound = Some(action);
                *committed = true;
            }
            _ => panic!("stale or invalid cleanup handle"),
        }
        self.arena.unlink(slot.node);
        let head = self.arena.scope_head(self.current);
        self.arena.link_after(head, slot.node);
    }

    /// Deregister and deallocate a cleanup slot without running anything it
    /// may have been committed to.
    pub fn cleanup_forget(&mut self, slot: CleanupSlot) {
        self.check_slot(&slot);
        let action = self.arena.take_cleanup_action(slot.node);
        if let Some(Action::CloseFd(fd)) = &action {
            self.fds.remove(fd);
        }
        self.arena.unlink(slot.node);
        self.arena.free(slot.node);
    }

    /// Give the current scope ownership of an arbitrary value; it is
    /// dropped at teardown in LIFO position, like any other cleanup.
    pub fn adopt<T: 'static>(&mut self, value: T) -> OpResult<()> {
        let slot = self.cleanup_reserve()?;
        self.cleanup_commit(&slot, move || drop(value));
        Ok(())
    }

    pub(crate) fn raise_oom<T>(&self) -> OpResult<T> {
        let want = match self.boundaries.last() {
            Some(w) => *w,
            None => panic!("fatal: out of memory with no active error boundary"),
        };
        // Fixed borrowed message: this path must not allocate.
        let msg = want.then_some(Cow::Borrowed("out of memory"));
        Err(Fault::new(nix::errno::Errno::ENOMEM as i32, msg))
    }
}

impl Default for ResourceContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ResourceContext {
    fn drop(&mut self) {
        // Process-scope teardown: release everything still tracked.
        self.destroy_detached(self.root);
    }
}
