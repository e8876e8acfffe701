//! Sparse packet queue pool: one FIFO per TM leaf queue.
//!
//! A pool declares how many queues and how many queued packets it may ever
//! hold, but allocates nothing per queue until the queue is created, and
//! nothing per packet until a packet is appended. Memory therefore tracks the
//! queues that actually carry traffic rather than the declared maximum.
//!
//! Packets are chained through a pool-wide node arena with a free list; each
//! queue descriptor only stores head, tail and length. Queue ids are
//! generation-tagged slots, so the id of a destroyed queue stays invalid even
//! after its slot is handed to a new queue.
//!
//! The pool performs no locking. All mutation goes through `&mut self`.

use crate::config::MAX_POOL_QUEUES;
use crate::error::{ObjectKind, TmError, TmResult};
use crate::handle::{PktQueueId, Slab};
use serde::Serialize;

const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
struct QueueDesc {
    head: u32,
    tail: u32,
    len: u32,
}

#[derive(Debug)]
struct PktNode<P> {
    next: u32,
    pkt: Option<P>,
}

/// Counters describing pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueuePoolStats {
    pub max_queues: u32,
    pub max_queued_pkts: u32,
    pub live_queues: u32,
    pub queued_pkts: u32,
    pub peak_queued_pkts: u32,
    pub total_appends: u64,
    pub total_removes: u64,
}

#[derive(Debug)]
pub struct QueuePool<P> {
    queues: Slab<QueueDesc>,
    nodes: Vec<PktNode<P>>,
    free_head: u32,
    max_queued_pkts: u32,
    queued: u32,
    peak_queued: u32,
    total_appends: u64,
    total_removes: u64,
}

impl<P> QueuePool<P> {
    /// Declare a pool of up to `max_queues` queues holding at most
    /// `max_queued_pkts` packets in total.
    pub fn new(max_queues: u32, max_queued_pkts: u32) -> TmResult<Self> {
        if max_queues > MAX_POOL_QUEUES {
            return Err(TmError::CapacityExceeded {
                kind: ObjectKind::PktQueue,
                max: MAX_POOL_QUEUES as u64,
            });
        }
        Ok(Self {
            queues: Slab::new(ObjectKind::PktQueue, max_queues),
            nodes: Vec::new(),
            free_head: NIL,
            max_queued_pkts,
            queued: 0,
            peak_queued: 0,
            total_appends: 0,
            total_removes: 0,
        })
    }

    pub fn create_queue(&mut self) -> TmResult<PktQueueId> {
        let handle = self.queues.insert(QueueDesc {
            head: NIL,
            tail: NIL,
            len: 0,
        })?;
        Ok(handle.into())
    }

    /// O(1) tail insert.
    pub fn append(&mut self, queue: PktQueueId, pkt: P) -> TmResult<()> {
        self.queues.get(queue.handle())?;
        if self.queued >= self.max_queued_pkts {
            return Err(TmError::CapacityExceeded {
                kind: ObjectKind::QueuedPacket,
                max: self.max_queued_pkts as u64,
            });
        }

        let node = self.alloc_node(pkt);
        let desc = self.queues.get_mut(queue.handle())?;
        if desc.tail == NIL {
            desc.head = node;
        } else {
            self.nodes[desc.tail as usize].next = node;
        }
        desc.tail = node;
        desc.len += 1;

        self.queued += 1;
        self.peak_queued = self.peak_queued.max(self.queued);
        self.total_appends += 1;
        Ok(())
    }

    /// O(1) head removal. An empty queue, or a slot index below the declared
    /// maximum that was never created, yields `None`.
    pub fn remove(&mut self, queue: PktQueueId) -> TmResult<Option<P>> {
        if self.queues.is_untouched_index(queue.index()) {
            return Ok(None);
        }
        let desc = self.queues.get_mut(queue.handle())?;
        let head = desc.head;
        if head == NIL {
            return Ok(None);
        }

        let next = self.nodes[head as usize].next;
        desc.head = next;
        if next == NIL {
            desc.tail = NIL;
        }
        desc.len -= 1;

        self.queued -= 1;
        self.total_removes += 1;
        Ok(Some(self.release_node(head)))
    }

    /// Oldest packet without removing it.
    pub fn peek(&self, queue: PktQueueId) -> TmResult<Option<&P>> {
        if self.queues.is_untouched_index(queue.index()) {
            return Ok(None);
        }
        let desc = self.queues.get(queue.handle())?;
        if desc.head == NIL {
            return Ok(None);
        }
        Ok(self.nodes[desc.head as usize].pkt.as_ref())
    }

    pub fn len(&self, queue: PktQueueId) -> TmResult<u32> {
        if self.queues.is_untouched_index(queue.index()) {
            return Ok(0);
        }
        Ok(self.queues.get(queue.handle())?.len)
    }

    pub fn is_empty(&self, queue: PktQueueId) -> TmResult<bool> {
        Ok(self.len(queue)? == 0)
    }

    /// Retire a drained queue; its id becomes permanently invalid.
    pub fn destroy_queue(&mut self, queue: PktQueueId) -> TmResult<()> {
        let pending = self.queues.get(queue.handle())?.len;
        if pending > 0 {
            return Err(TmError::NotEmpty {
                kind: ObjectKind::PktQueue,
                pending: pending as u64,
            });
        }
        self.queues.remove(queue.handle())?;
        Ok(())
    }

    pub fn stats(&self) -> QueuePoolStats {
        QueuePoolStats {
            max_queues: self.queues.max(),
            max_queued_pkts: self.max_queued_pkts,
            live_queues: self.queues.len(),
            queued_pkts: self.queued,
            peak_queued_pkts: self.peak_queued,
            total_appends: self.total_appends,
            total_removes: self.total_removes,
        }
    }

    fn alloc_node(&mut self, pkt: P) -> u32 {
        if self.free_head != NIL {
            let index = self.free_head;
            let node = &mut self.nodes[index as usize];
            self.free_head = node.next;
            node.next = NIL;
            node.pkt = Some(pkt);
            index
        } else {
            self.nodes.push(PktNode {
                next: NIL,
                pkt: Some(pkt),
            });
            (self.nodes.len() - 1) as u32
        }
    }

    fn release_node(&mut self, index: u32) -> P {
        let node = &mut self.nodes[index as usize];
        let pkt = node.pkt.take().expect("linked packet node must hold a packet");
        node.next = self.free_head;
        self.free_head = index;
        pkt
    }
}
