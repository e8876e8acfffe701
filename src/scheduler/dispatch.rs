//! Packet path: admission at the leaves and dispatch from the outputs.
//!
//! Dispatch for one output:
//! 1. Pop the best ready child of the output (lowest priority class, then
//!    lowest WFQ finish time) and keep popping down the tree to a queue
//! 2. Take the head packet of that queue
//! 3. Charge every shaper on the path, queue first; a shaper that runs out of
//!    credit parks its entity and schedules a timer wakeup
//! 4. Re-rank the path bottom-up and hand the packet to the output channel
//!
//! Timer wakeups are processed at the start of every [`TmSystem::run`].

use super::entity::{split_key, EntityRef, Parent};
use super::system::TmSystem;
use super::wred::{self, WredVerdict};
use crate::error::{ObjectKind, TmError, TmResult};
use crate::handle::TmQueueId;
use crate::packet::TmPacket;
use tracing::{trace, warn};

/// Outcome of [`TmSystem::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Enqueued,
    /// Accepted with the ECN congestion-experienced mark set by WRED.
    EcnMarked,
    /// Rejected by a threshold profile on the queue or one of its ancestors.
    ThresholdDrop,
    /// Rejected by a WRED draw.
    WredDrop,
}

impl Admission {
    pub fn is_accepted(self) -> bool {
        matches!(self, Admission::Enqueued | Admission::EcnMarked)
    }
}

impl<P: TmPacket> TmSystem<P> {
    /// Admit one packet into `queue`.
    ///
    /// Threshold profiles are checked first, on the queue and then on every
    /// ancestor node, and reject deterministically. WRED runs next over the
    /// same chain. Dropped packets are consumed and counted; only an invalid
    /// queue or an exhausted packet budget is reported as an error.
    pub fn enqueue(&mut self, queue: TmQueueId, mut pkt: P) -> TmResult<Admission> {
        self.sync_profiles();
        let parent = self.queues.get(queue.into())?.state.parent;

        let mut chain = std::mem::take(&mut self.path);
        chain.clear();
        chain.push(EntityRef::Queue(queue));
        let mut up = parent;
        while let Some(Parent::Node(node)) = up {
            chain.push(EntityRef::Node(node));
            up = self.node(node).state.parent;
        }

        let result = match self.admit(&chain, queue, &mut pkt) {
            Ok(admission) if admission.is_accepted() => {
                self.store(&chain, queue, pkt).map(|()| admission)
            }
            other => other,
        };
        self.path = chain;
        result
    }

    fn admit(&mut self, chain: &[EntityRef], queue: TmQueueId, pkt: &mut P) -> TmResult<Admission> {
        let len = pkt.len();
        let color = pkt.color();

        for &entity in chain {
            let state = self.state_mut(entity)?;
            if state.over_threshold(len) {
                state.counters.threshold_drops += 1;
                self.totals.threshold_drops += 1;
                trace!(%queue, ?entity, len, "threshold drop");
                return Ok(Admission::ThresholdDrop);
            }
        }

        let mut marked = false;
        for &entity in chain {
            let state = self.state(entity)?;
            let Some(profile) = &state.wred else {
                continue;
            };
            let params = profile.params;
            let Some(fullness) = state.fullness(params.use_byte_fullness) else {
                continue;
            };
            if wred::evaluate(&params, color, fullness, &mut self.rng) == WredVerdict::Pass {
                continue;
            }

            let mark = params.mark_ecn && pkt.mark_ecn();
            let state = self.state_mut(entity)?;
            if mark {
                state.counters.ecn_marks += 1;
                self.totals.ecn_marks += 1;
                marked = true;
            } else {
                state.counters.wred_drops += 1;
                self.totals.wred_drops += 1;
                trace!(%queue, ?entity, len, ?fullness, "wred drop");
                return Ok(Admission::WredDrop);
            }
        }

        Ok(if marked {
            Admission::EcnMarked
        } else {
            Admission::Enqueued
        })
    }

    fn store(&mut self, chain: &[EntityRef], queue: TmQueueId, pkt: P) -> TmResult<()> {
        if self.queued_pkts >= self.requirements.max_queued_pkts {
            return Err(TmError::CapacityExceeded {
                kind: ObjectKind::QueuedPacket,
                max: self.requirements.max_queued_pkts as u64,
            });
        }
        let len = pkt.len() as u64;
        let entity = self.queues.get(queue.into())?;
        let (pool, pkt_queue) = (entity.pool, entity.pkt_queue);
        self.pools[pool].append(pkt_queue, pkt)?;

        let entity = self.queues.get_mut(queue.into())?;
        entity.enqueued_pkts += 1;
        entity.enqueued_bytes += len;

        for &member in chain {
            let counters = &mut self.state_mut(member)?.counters;
            counters.queued_pkts += 1;
            counters.queued_bytes += len;
        }
        self.queued_pkts += 1;
        self.totals.enqueued_pkts += 1;
        self.update_congestion(queue);
        self.refresh(EntityRef::Queue(queue));
        trace!(%queue, len, "enqueued");
        Ok(())
    }

    /// Advance scheduler time to `now` and send up to `budget` packets,
    /// visiting the outputs round-robin. Returns the number of packets sent.
    ///
    /// A `now` earlier than the last call is treated as the last call's time.
    pub fn run(&mut self, now: u64, budget: usize) -> usize {
        self.sync_profiles();
        let now = now.max(self.timers.current_time());
        self.process_wakes(now);

        let outputs = self.outputs.len();
        let mut sent = 0;
        let mut idle = 0;
        while sent < budget && idle < outputs {
            let output = self.next_output;
            self.next_output = (output + 1) % outputs;
            if self.dispatch(output, now) {
                sent += 1;
                idle = 0;
            } else {
                idle += 1;
            }
        }
        sent
    }

    fn process_wakes(&mut self, now: u64) {
        self.timers.curr_time_update(now);
        while let Some(target) = self.timers.next_expired() {
            // Entries of destroyed entities fail the generation check.
            let Ok(state) = self.state_mut(target) else {
                continue;
            };
            if !state.wake_pending {
                continue;
            }
            state.wake_pending = false;
            let still_blocked = match &mut state.shaper {
                Some(shaper) => {
                    shaper.state.refill(now);
                    shaper.state.is_blocked()
                }
                None => false,
            };
            state.blocked = still_blocked;
            self.totals.timer_wakes += 1;
            trace!(?target, still_blocked, now, "shaper wakeup");

            if still_blocked {
                self.schedule_wake(target);
            } else {
                self.refresh(target);
            }
        }
    }

    /// Register a wakeup for a shaper-blocked entity. If the wheel is full
    /// the entity is released unshaped rather than left stranded.
    fn schedule_wake(&mut self, entity: EntityRef) {
        let current = self.timers.current_time();
        let floor = current + 1;
        let ceiling = current.saturating_add(self.horizon);

        let Ok(state) = self.state_mut(entity) else {
            return;
        };
        if state.wake_pending {
            return;
        }
        let Some(shaper) = &state.shaper else {
            state.blocked = false;
            return;
        };
        let wake = shaper.state.wake_time().clamp(floor, ceiling);

        match self.timers.insert(wake, entity) {
            Ok(()) => {
                if let Ok(state) = self.state_mut(entity) {
                    state.wake_pending = true;
                }
            }
            Err(err) => {
                warn!(?entity, %err, "no timer for shaper wakeup, releasing entity");
                if let Ok(state) = self.state_mut(entity) {
                    state.blocked = false;
                }
            }
        }
    }

    fn dispatch(&mut self, output: usize, now: u64) -> bool {
        let mut path = std::mem::take(&mut self.path);
        let sent = loop {
            path.clear();
            match self.descend(output, &mut path) {
                None => break false,
                Some(Some(pkt)) => {
                    self.complete(output, &path, pkt, now);
                    break true;
                }
                Some(None) => {
                    // Stale ready entry: re-rank what was popped and retry.
                    for &entity in path.iter().rev() {
                        self.refresh(entity);
                    }
                }
            }
        };
        self.path = path;
        sent
    }

    /// Pop from the output down to a queue, recording the path top-down.
    ///
    /// `None` when the output has nothing ready; `Some(None)` when a popped
    /// entry turned out to have no work.
    fn descend(&mut self, output: usize, path: &mut Vec<EntityRef>) -> Option<Option<P>> {
        let ready = self.outputs[output].ready;
        let (key, mut entity) = self
            .sorted
            .remove(ready)
            .expect("output ready list is allocated at creation")?;
        let (class, finish) = split_key(key);
        self.outputs[output].vtime[class] = finish;

        loop {
            path.push(entity);
            self.state_mut(entity)
                .expect("ready entries refer to live entities")
                .in_parent_list = false;

            match entity {
                EntityRef::Queue(queue) => {
                    let q = self
                        .queues
                        .get(queue.into())
                        .expect("ready entries refer to live entities");
                    let (pool, pkt_queue) = (q.pool, q.pkt_queue);
                    let pkt = self.pools[pool]
                        .remove(pkt_queue)
                        .expect("a live tm queue owns its packet queue");
                    return Some(pkt);
                }
                EntityRef::Node(node) => {
                    let list = self.node(node).ready;
                    let popped = self
                        .sorted
                        .remove(list)
                        .expect("node ready list is allocated with the node");
                    match popped {
                        Some((key, child)) => {
                            let (class, finish) = split_key(key);
                            self.node_mut(node).vtime[class] = finish;
                            entity = child;
                        }
                        None => return Some(None),
                    }
                }
            }
        }
    }

    fn complete(&mut self, output: usize, path: &[EntityRef], pkt: P, now: u64) {
        let len = pkt.len();

        for &entity in path.iter().rev() {
            let state = self
                .state_mut(entity)
                .expect("ready entries refer to live entities");
            let counters = &mut state.counters;
            counters.queued_pkts = counters.queued_pkts.saturating_sub(1);
            counters.queued_bytes = counters.queued_bytes.saturating_sub(len as u64);
            counters.dequeued_pkts += 1;
            counters.dequeued_bytes += len as u64;

            let out_of_credit = match &mut state.shaper {
                Some(shaper) => {
                    shaper.state.refill(now);
                    let color = shaper.state.charge(len);
                    state.counters.shaper_colors.record(color);
                    shaper.state.is_blocked()
                }
                None => false,
            };
            if out_of_credit {
                state.blocked = true;
                self.schedule_wake(entity);
            }
            if let EntityRef::Node(node) = entity {
                self.node_mut(node).last_len = len;
            }
        }
        self.queued_pkts = self.queued_pkts.saturating_sub(1);
        self.totals.dequeued_pkts += 1;
        if let Some(&EntityRef::Queue(queue)) = path.last() {
            self.update_congestion(queue);
        }

        for &entity in path.iter().rev() {
            self.refresh(entity);
        }

        let slot = &mut self.outputs[output];
        let delivered = match &slot.tx {
            Some(tx) => tx.try_send(pkt).is_ok(),
            None => false,
        };
        if delivered {
            slot.stats.sent_pkts += 1;
            slot.stats.sent_bytes += len as u64;
        } else {
            slot.stats.egress_drops += 1;
            self.totals.egress_drops += 1;
        }
        trace!(output, len, delivered, path_len = path.len(), "dispatched");
    }
}
