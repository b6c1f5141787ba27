/*!
 * Node Arena
 *
 * Slab of resource nodes addressed by stable indices, intrusively linked
 * into circular chains. Each scope contributes two nodes: its membership
 * node (a member of the parent's chain) and a sentinel heading its own
 * chain. All chain mutation is an O(1) splice on `prev`/`next` indices.
 */

use std::os::unix::io::RawFd;
use std::path::PathBuf;

pub(crate) type NodeId = u32;

/// Sentinel index meaning "no node".
pub(crate) const NIL: NodeId = u32::MAX;

/// A release action bound to a committed cleanup node.
///
/// Descriptor close and file unlink are structured variants so teardown can
/// keep the context's descriptor table consistent; everything else is an
/// opaque closure.
pub(crate) enum Action {
    Run(Box<dyn FnOnce()>),
    CloseFd(RawFd),
    Unlink(PathBuf),
}

pub(crate) enum Body {
    Vacant { next_free: NodeId },
    /// A scope's membership node. `parent` is the owning scope's node
    /// (NIL for the process scope); `head` is this scope's chain sentinel.
    Scope { parent: NodeId, head: NodeId },
    /// Chain sentinel. Its `prev`/`next` are the chain itself.
    Head,
    /// A cleanup slot: pending (`action` unset) until committed.
    Cleanup {
        action: Option<Action>,
        committed: bool,
    },
}

pub(crate) struct Slot {
    pub prev: NodeId,
    pub next: NodeId,
    /// Bumped on free; handles embed the generation they were issued with,
    /// so a stale handle is detectable even after the slot is reused.
    pub gen: u32,
    pub body: Body,
}

pub(crate) struct Arena {
    slots: Vec<Slot>,
    free: NodeId,
}

impl Arena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: NIL,
        }
    }

    /// Allocate a node. Fails only on memory exhaustion; the caller maps
    /// that to an out-of-memory raise.
    pub fn try_alloc(&mut self, body: Body) -> Result<NodeId, ()> {
        if self.free != NIL {
            let id = self.free;
            let slot = &mut self.slots[id as usize];
            self.free = match slot.body {
                Body::Vacant { next_free } => next_free,
                _ => unreachable!("free list points at a live node"),
            };
            slot.prev = NIL;
            slot.next = NIL;
            slot.body = body;
            return Ok(id);
        }
        if self.slots.len() >= NIL as usize {
            return Err(());
        }
        self.slots.try_reserve(1).map_err(|_| ())?;
        self.slots.push(Slot {
            prev: NIL,
            next: NIL,
            gen: 0,
            body,
        });
        Ok((self.slots.len() - 1) as NodeId)
    }

    pub fn free(&mut self, id: NodeId) {
        let slot = &mut self.slots[id as usize];
        debug_assert!(!matches!(slot.body, Body::Vacant { .. }), "double free");
        slot.prev = NIL;
        slot.next = NIL;
        slot.gen = slot.gen.wrapping_add(1);
        slot.body = Body::Vacant {
            next_free: self.free,
        };
        self.free = id;
    }

    pub fn gen(&self, id: NodeId) -> u32 {
        self.slots[id as usize].gen
    }

    /// Whether `gen` still names the live occupant of `id`.
    pub fn is_live(&self, id: NodeId, gen: u32) -> bool {
        let slot = &self.slots[id as usize];
        slot.gen == gen && !matches!(slot.body, Body::Vacant { .. })
    }

    pub fn slot(&self, id: NodeId) -> &Slot {
        &self.slots[id as usize]
    }

    pub fn slot_mut(&mut self, id: NodeId) -> &mut Slot {
        &mut self.slots[id as usize]
    }

    /// Make `head` an empty chain (self-linked sentinel).
    pub fn init_head(&mut self, head: NodeId) {
        let slot = &mut self.slots[head as usize];
        slot.prev = head;
        slot.next = head;
    }

    /// Insert `node` immediately after `anchor`.
    pub fn link_after(&mut self, anchor: NodeId, node: NodeId) {
        let follower = self.slots[anchor as usize].next;
        self.slots[node as usize].prev = anchor;
        self.slots[node as usize].next = follower;
        self.slots[anchor as usize].next = node;
        self.slots[follower as usize].prev = node;
    }

    /// Remove `node` from whatever chain holds it.
    pub fn unlink(&mut self, node: NodeId) {
        let Slot { prev, next, .. } = self.slots[node as usize];
        debug_assert!(prev != NIL && next != NIL, "unlink of detached node");
        self.slots[prev as usize].next = next;
        self.slots[next as usize].prev = prev;
        self.slots[node as usize].prev = NIL;
        self.slots[node as usize].next = NIL;
    }

    /// Splice every member of the chain headed by `from` onto the head of
    /// the chain headed by `to`, preserving relative order. `from` is left
    /// empty. No action runs.
    pub fn splice_chain(&mut self, to: NodeId, from: NodeId) {
        let first = self.slots[from as usize].next;
        if first == from {
            return; // donor empty
        }
        let last = self.slots[from as usize].prev;
        let old_first = self.slots[to as usize].next;

        self.slots[to as usize].next = first;
        self.slots[first as usize].prev = to;
        self.slots[last as usize].next = old_first;
        self.slots[old_first as usize].prev = last;

        self.init_head(from);
    }

    pub fn chain_is_empty(&self, head: NodeId) -> bool {
        self.slots[head as usize].next == head
    }

    /// The sentinel of the scope whose membership node is `scope_node`.
    pub fn scope_head(&self, scope_node: NodeId) -> NodeId {
        match self.slots[scope_node as usize].body {
            Body::Scope { head, .. } => head,
            _ => panic!("stale or invalid scope handle"),
        }
    }

    /// The parent scope's membership node, NIL for the process scope.
    pub fn scope_parent(&self, scope_node: NodeId) -> NodeId {
        match self.slots[scope_node as usize].body {
            Body::Scope { parent, .. } => parent,
            _ => panic!("stale or invalid scope handle"),
        }
    }

    pub fn is_scope(&self, node: NodeId) -> bool {
        matches!(self.slots[node as usize].body, Body::Scope { .. })
    }

    /// Take the action out of a cleanup node, leaving it pending-empty.
    /// Panics if the node is not a cleanup slot.
    pub fn take_cleanup_action(&mut self, node: NodeId) -> Option<Action> {
        match &mut self.slots[node as usize].body {
            Body::Cleanup { action, .. } => action.take(),
            _ => panic!("stale or invalid cleanup handle"),
        }
    }
}
