// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Age-tagged secondary buffer pool.
//!
//! Scratch buffers live in a fixed arena and are threaded onto an intrusive
//! doubly linked freelist by index, with a reserved sentinel head node whose
//! age is permanently [`AGE_IN_USE`] so insertion never special-cases an
//! empty list. The list is LRU-ordered: the tail is the oldest entry, and it
//! is safe to hand out once its age falls below the last completed dispatch
//! generation.
//!
//! Reinsertion is deliberately asymmetric. A buffer discarded while still
//! checked out (hardware never saw it) goes to the tail with its age reset
//! to FREE, so it is immediately reusable and the discarding caller cannot
//! deadlock waiting for a completion that will never come. A buffer retired
//! through dispatch keeps its generation age and is inserted next to the
//! head, preserving age ordering. Do not "fix" this.

use log::error;

use crate::error::{Error, Result};
use crate::hw::DmaHandle;

/// Age tag of a buffer sitting idle on the freelist.
pub const AGE_FREE: u32 = 0;
/// Age tag of a checked-out buffer. Neither tag is ever used as a dispatch
/// generation.
pub const AGE_IN_USE: u32 = 0xffff_ffff;

/// Invalid arena index, used as the list terminator.
const NIL: u32 = u32::MAX;
/// Arena index of the sentinel head node.
const HEAD: u32 = 0;

/// Identifier of a secondary buffer; an index into the fixed arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(u32);

impl BufferId {
    pub fn index(&self) -> usize {
        self.0 as usize - 1
    }

    /// Raw arena index, for diagnostics.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// Owner of a checked-out buffer.
pub type ProcessId = u32;

struct Node {
    handle: DmaHandle,
    size: usize,
    owner: Option<ProcessId>,
    age: u32,
    prev: u32,
    next: u32,
    linked: bool,
}

/// The secondary buffer arena plus its intrusive freelist.
pub struct Freelist {
    nodes: Box<[Node]>,
    tail: u32,
}

impl Freelist {
    /// Build the sentinel-headed list with every buffer tagged FREE.
    pub fn new(blocks: Vec<(DmaHandle, usize)>) -> Self {
        let mut nodes = Vec::with_capacity(blocks.len() + 1);
        nodes.push(Node {
            handle: DmaHandle { phys: 0 },
            size: 0,
            owner: None,
            age: AGE_IN_USE,
            prev: NIL,
            next: NIL,
            linked: true,
        });
        for (handle, size) in blocks {
            nodes.push(Node {
                handle,
                size,
                owner: None,
                age: AGE_FREE,
                prev: NIL,
                next: NIL,
                linked: false,
            });
        }
        let mut list = Self {
            nodes: nodes.into_boxed_slice(),
            tail: HEAD,
        };
        for idx in 1..list.nodes.len() as u32 {
            list.link_after_head(idx);
        }
        list
    }

    /// Number of buffers in the arena (the sentinel is not counted).
    pub fn capacity(&self) -> usize {
        self.nodes.len() - 1
    }

    fn node(&self, id: BufferId) -> Result<&Node> {
        match self.nodes.get(id.0 as usize) {
            Some(node) if id.0 != HEAD => Ok(node),
            _ => {
                error!("invalid secondary buffer id {}", id.0);
                Err(Error::ProtocolViolation)
            }
        }
    }

    fn link_after_head(&mut self, idx: u32) {
        let old_next = self.nodes[HEAD as usize].next;
        self.nodes[HEAD as usize].next = idx;
        let node = &mut self.nodes[idx as usize];
        node.prev = HEAD;
        node.next = old_next;
        node.linked = true;
        if old_next == NIL {
            self.tail = idx;
        } else {
            self.nodes[old_next as usize].prev = idx;
        }
    }

    fn link_at_tail(&mut self, idx: u32) {
        let old_tail = self.tail;
        self.nodes[old_tail as usize].next = idx;
        let node = &mut self.nodes[idx as usize];
        node.prev = old_tail;
        node.next = NIL;
        node.linked = true;
        self.tail = idx;
    }

    /// Age of the tail entry; [`AGE_IN_USE`] (the sentinel) when empty.
    pub fn tail_age(&self) -> u32 {
        self.nodes[self.tail as usize].age
    }

    /// Whether the tail entry is safe to recycle.
    pub fn tail_eligible(&self, last_completed: u32) -> bool {
        self.tail_age() < last_completed
    }

    /// Detach and return the tail entry if its work has completed.
    pub fn checkout(&mut self, last_completed: u32) -> Option<BufferId> {
        let idx = self.tail;
        if self.nodes[idx as usize].age >= last_completed {
            return None;
        }
        let prev = self.nodes[idx as usize].prev;
        self.nodes[prev as usize].next = NIL;
        self.tail = prev;
        let node = &mut self.nodes[idx as usize];
        node.prev = NIL;
        node.next = NIL;
        node.linked = false;
        node.age = AGE_IN_USE;
        Some(BufferId(idx))
    }

    /// Tag a checked-out buffer with the dispatch generation it was folded
    /// into. Must precede [`Freelist::reclaim`] on the dispatch path.
    pub fn tag_dispatched(&mut self, id: BufferId, generation: u32) -> Result<()> {
        self.node(id)?;
        let node = &mut self.nodes[id.0 as usize];
        if node.linked || node.age != AGE_IN_USE {
            error!("buffer {} dispatched while not checked out", id.0);
            return Err(Error::ProtocolViolation);
        }
        node.age = generation;
        Ok(())
    }

    /// Return a buffer to the list.
    ///
    /// Checked-out (discarded) buffers go to the tail with their age reset
    /// to FREE; generation-tagged buffers go head-adjacent with their age
    /// preserved. See the module docs for why the two paths differ.
    pub fn reclaim(&mut self, id: BufferId) -> Result<()> {
        self.node(id)?;
        let node = &self.nodes[id.0 as usize];
        if node.linked {
            error!("buffer {} reclaimed twice", id.0);
            return Err(Error::ProtocolViolation);
        }
        match node.age {
            AGE_IN_USE => {
                self.nodes[id.0 as usize].age = AGE_FREE;
                self.link_at_tail(id.0);
            }
            AGE_FREE => {
                error!("buffer {} reclaimed while already free", id.0);
                return Err(Error::ProtocolViolation);
            }
            _ => self.link_after_head(id.0),
        }
        Ok(())
    }

    /// Force every idle buffer's age back to FREE. Used only when the
    /// generation counter is about to pass a sentinel value; checked-out
    /// buffers keep their IN_USE tag so the exactly-once invariant holds.
    pub fn reset_all(&mut self) {
        for node in self.nodes.iter_mut().skip(1) {
            if node.age != AGE_IN_USE {
                node.age = AGE_FREE;
            }
        }
    }

    /// Forcibly return every buffer owned by `pid` to FREE, regardless of
    /// hardware completion status. Checked-out buffers re-enter through the
    /// tail path; generation-tagged ones are cleared in place. Returns the
    /// number of buffers reclaimed.
    pub fn reclaim_all_for(&mut self, pid: ProcessId) -> usize {
        let mut reclaimed = 0;
        for idx in 1..self.nodes.len() as u32 {
            let node = &mut self.nodes[idx as usize];
            if node.owner != Some(pid) {
                continue;
            }
            node.owner = None;
            if !node.linked && node.age == AGE_IN_USE {
                node.age = AGE_FREE;
                self.link_at_tail(idx);
                reclaimed += 1;
            } else if node.linked && node.age != AGE_FREE && node.age != AGE_IN_USE {
                node.age = AGE_FREE;
                reclaimed += 1;
            }
        }
        reclaimed
    }

    pub fn set_owner(&mut self, id: BufferId, owner: Option<ProcessId>) -> Result<()> {
        self.node(id)?;
        self.nodes[id.0 as usize].owner = owner;
        Ok(())
    }

    pub fn owner(&self, id: BufferId) -> Result<Option<ProcessId>> {
        Ok(self.node(id)?.owner)
    }

    pub fn age(&self, id: BufferId) -> Result<u32> {
        Ok(self.node(id)?.age)
    }

    /// Physical base and word capacity of a buffer.
    pub fn backing(&self, id: BufferId) -> Result<(DmaHandle, usize)> {
        let node = self.node(id)?;
        Ok((node.handle, node.size / 4))
    }

    /// Backing blocks of every buffer, for teardown.
    pub fn blocks(&self) -> impl Iterator<Item = (DmaHandle, usize)> + '_ {
        self.nodes.iter().skip(1).map(|n| (n.handle, n.size))
    }

    /// Number of buffers currently threaded on the list.
    pub fn linked_count(&self) -> usize {
        self.nodes.iter().skip(1).filter(|n| n.linked).count()
    }

    /// Walk the list from the head, for tests and diagnostics.
    #[cfg(test)]
    fn walk(&self) -> Vec<u32> {
        let mut out = Vec::new();
        let mut idx = self.nodes[HEAD as usize].next;
        let mut prev = HEAD;
        while idx != NIL {
            let node = &self.nodes[idx as usize];
            assert_eq!(node.prev, prev, "broken prev link at {idx}");
            assert!(node.linked);
            out.push(idx);
            prev = idx;
            idx = node.next;
        }
        assert_eq!(self.tail, prev, "tail does not match walk");
        out
    }
}
