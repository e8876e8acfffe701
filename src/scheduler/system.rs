//! One TM system: the node/queue tree, its profile bindings and its queries.
//!
//! The packet path (admission and dispatch) lives in `dispatch.rs`; this file
//! owns topology changes and the readiness bookkeeping both sides share.

use super::entity::{
    sort_key, split_key, Attached, EntityRef, NodeEntity, Output, Parent, QueueEntity, SchedState,
    ShaperSlot, WakeTarget, WFQ_REBASE_AT,
};
use super::shaper::ShaperState;
use crate::config::{TmConfig, TmRequirements, MAX_POOL_QUEUES};
use crate::context::SystemLease;
use crate::error::{ObjectKind, TmError, TmResult};
use crate::handle::{SchedId, ShaperId, Slab, ThresholdId, TmNodeId, TmQueueId, WredId};
use crate::metrics::{NodeStats, OutputStats, QueueStats, SystemStats, TmSnapshot};
use crate::name_table::NameTable;
use crate::packet::{Color, TmPacket};
use crate::pkt_queue::QueuePool;
use crate::priority::{Priority, PriorityTable};
use crate::profile::{ProfileId, Profiles};
use crate::sorted_list::{SortedListId, SortedPool};
use crate::timer_wheel::TimerWheel;
use crossbeam_channel::Sender;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::Cell;
use std::marker::PhantomData;
use tracing::debug;

/// System-wide packet totals.
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct Totals {
    pub enqueued_pkts: u64,
    pub dequeued_pkts: u64,
    pub threshold_drops: u64,
    pub wred_drops: u64,
    pub ecn_marks: u64,
    pub egress_drops: u64,
    pub timer_wakes: u64,
}

/// A hierarchical traffic manager instance.
///
/// Queues and nodes form a tree of at most `max_levels` node levels under
/// up to 256 egress outputs. Packets enter at queues through
/// [`TmSystem::enqueue`] and leave through the output channels when the
/// owner drives [`TmSystem::run`].
///
/// A system is driven by exactly one thread: every operation takes
/// `&mut self`, and the type is `Send` but not `Sync`, so it can be moved
/// onto a dedicated scheduling thread but never shared.
pub struct TmSystem<P> {
    lease: SystemLease,
    pub(super) requirements: TmRequirements,
    pub(super) profiles: Profiles,
    pub(super) profile_version: u64,
    pub(super) sorted: SortedPool<EntityRef>,
    pub(super) timers: TimerWheel<WakeTarget>,
    pub(super) horizon: u64,
    pub(super) pools: Vec<QueuePool<P>>,
    pub(super) queues: Slab<QueueEntity>,
    pub(super) nodes: Slab<NodeEntity>,
    pub(super) outputs: Vec<Output<P>>,
    free_lists: Vec<SortedListId>,
    names: NameTable,
    pub(super) rng: StdRng,
    pub(super) totals: Totals,
    /// Packets held across every pool.
    pub(super) queued_pkts: u32,
    /// Scratch buffer reused for admission chains and dispatch paths.
    pub(super) path: Vec<EntityRef>,
    pub(super) next_output: usize,
    _single_owner: PhantomData<Cell<()>>,
}

impl<P> std::fmt::Debug for TmSystem<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TmSystem")
            .field("name", &self.lease.name())
            .field("queues", &self.queues.len())
            .field("nodes", &self.nodes.len())
            .field("outputs", &self.outputs.len())
            .field("queued_pkts", &self.queued_pkts)
            .finish()
    }
}

impl<P: TmPacket> TmSystem<P> {
    pub(crate) fn new(
        lease: SystemLease,
        requirements: TmRequirements,
        config: &TmConfig,
        profiles: Profiles,
        serial: u64,
    ) -> TmResult<Self> {
        let max_lists = requirements.num_outputs as u32 + requirements.max_tm_nodes;
        let mut sorted = SortedPool::new(max_lists);
        let mut outputs = Vec::with_capacity(requirements.num_outputs as usize);
        for index in 0..requirements.num_outputs {
            outputs.push(Output {
                ready: sorted.create_list()?,
                fanin: 0,
                vtime: PriorityTable::splat(0),
                tx: None,
                stats: OutputStats {
                    index,
                    ..OutputStats::default()
                },
            });
        }

        Ok(Self {
            timers: TimerWheel::with_config(requirements.max_timers, 0, config.wheel),
            horizon: config.wheel.horizon_cycles,
            pools: Vec::new(),
            queues: Slab::new(ObjectKind::Queue, requirements.max_tm_queues),
            nodes: Slab::new(ObjectKind::Node, requirements.max_tm_nodes),
            outputs,
            sorted,
            free_lists: Vec::new(),
            names: NameTable::new(),
            rng: StdRng::seed_from_u64(config.wred_seed ^ serial.wrapping_mul(0x9e37_79b9_7f4a_7c15)),
            totals: Totals::default(),
            queued_pkts: 0,
            path: Vec::with_capacity(requirements.max_levels as usize + 1),
            next_output: 0,
            profile_version: profiles.version(),
            profiles,
            requirements,
            lease,
            _single_owner: PhantomData,
        })
    }

    /// Name given at creation, if any.
    pub fn name(&self) -> Option<&str> {
        self.lease.name()
    }

    /// Capacity bounds the system was created with.
    pub fn requirements(&self) -> &TmRequirements {
        &self.requirements
    }

    /// Registry shared with the owning context.
    pub fn profiles(&self) -> &Profiles {
        &self.profiles
    }

    /// Scheduler time reached by the last [`TmSystem::run`].
    pub fn now(&self) -> u64 {
        self.timers.current_time()
    }

    fn check_priority(&self, priority: Priority) -> TmResult<()> {
        if priority.value() >= self.requirements.max_priorities {
            return Err(TmError::invalid_param(
                "priority",
                format!(
                    "{priority} exceeds the {} classes of this system",
                    self.requirements.max_priorities
                ),
            ));
        }
        Ok(())
    }

    /// Create a leaf queue in strict-priority class `priority`.
    ///
    /// No packet storage is allocated until the first packet arrives.
    pub fn create_queue(&mut self, name: Option<&str>, priority: Priority) -> TmResult<TmQueueId> {
        self.check_priority(priority)?;
        if let Some(name) = name {
            self.names.check(ObjectKind::Queue, name)?;
        }
        if self.queues.len() >= self.queues.max() {
            return Err(TmError::CapacityExceeded {
                kind: ObjectKind::Queue,
                max: self.queues.max() as u64,
            });
        }

        let pool = self.pool_with_room()?;
        let pkt_queue = self.pools[pool].create_queue()?;
        let handle = self.queues.insert(QueueEntity {
            state: SchedState::new(name.map(str::to_owned), priority),
            pool,
            pkt_queue,
            congestion: Color::Green,
            enqueued_pkts: 0,
            enqueued_bytes: 0,
        })?;
        let id = TmQueueId::from(handle);
        if let Some(name) = name {
            self.names.add(ObjectKind::Queue, name, id.to_u64())?;
        }
        debug!(queue = %id, ?name, %priority, "tm queue created");
        Ok(id)
    }

    /// Index of a packet pool with a free queue slot, opening a new pool
    /// once the existing ones are full.
    fn pool_with_room(&mut self) -> TmResult<usize> {
        if let Some(index) = self.pools.iter().position(|pool| {
            let stats = pool.stats();
            stats.live_queues < stats.max_queues
        }) {
            return Ok(index);
        }
        let opened = self.pools.len() as u64 * MAX_POOL_QUEUES as u64;
        let remaining = (self.requirements.max_tm_queues as u64).saturating_sub(opened);
        let size = remaining.min(MAX_POOL_QUEUES as u64) as u32;
        if size == 0 {
            return Err(TmError::CapacityExceeded {
                kind: ObjectKind::PktQueue,
                max: self.requirements.max_tm_queues as u64,
            });
        }
        self.pools
            .push(QueuePool::new(size, self.requirements.max_queued_pkts)?);
        Ok(self.pools.len() - 1)
    }

    /// Create a scheduling node at `level` (0 attaches to an output).
    pub fn create_node(
        &mut self,
        name: Option<&str>,
        level: u8,
        priority: Priority,
    ) -> TmResult<TmNodeId> {
        if level >= self.requirements.max_levels {
            return Err(TmError::invalid_param(
                "level",
                format!("{level} is outside 0..{}", self.requirements.max_levels),
            ));
        }
        self.check_priority(priority)?;
        if let Some(name) = name {
            self.names.check(ObjectKind::Node, name)?;
        }
        if self.nodes.len() >= self.nodes.max() {
            return Err(TmError::CapacityExceeded {
                kind: ObjectKind::Node,
                max: self.nodes.max() as u64,
            });
        }

        let ready = match self.free_lists.pop() {
            Some(list) => list,
            None => self.sorted.create_list()?,
        };
        let handle = self.nodes.insert(NodeEntity {
            state: SchedState::new(name.map(str::to_owned), priority),
            level,
            ready,
            fanin: 0,
            vtime: PriorityTable::splat(0),
            last_len: 0,
        })?;
        let id = TmNodeId::from(handle);
        if let Some(name) = name {
            self.names.add(ObjectKind::Node, name, id.to_u64())?;
        }
        debug!(node = %id, ?name, level, %priority, "tm node created");
        Ok(id)
    }

    /// Attach a queue under a node or directly under an output.
    ///
    /// Packets already held by the queue start counting toward the new
    /// ancestors, and the queue becomes schedulable if it has work.
    ///
    /// # Arguments
    /// * `queue` - A live, currently disconnected queue
    /// * `parent` - Output index or node to attach to
    ///
    /// # Returns
    /// `AlreadyConnected` if the queue has a parent, a capacity error when the
    /// parent's fan-in is full, `InvalidHandle` for a stale id or output.
    pub fn connect_queue(&mut self, queue: TmQueueId, parent: Parent) -> TmResult<()> {
        self.connect(EntityRef::Queue(queue), parent)
    }

    /// Attach a node under an output (level 0 only) or under a node of a
    /// strictly lower level.
    pub fn connect_node(&mut self, node: TmNodeId, parent: Parent) -> TmResult<()> {
        self.connect(EntityRef::Node(node), parent)
    }

    /// Detach a queue from its parent. Its packets stay queued and are
    /// removed from the ancestors' backlog until it is connected again.
    pub fn disconnect_queue(&mut self, queue: TmQueueId) -> TmResult<()> {
        self.disconnect(EntityRef::Queue(queue))
    }

    /// Detach a node and its whole subtree from its parent.
    pub fn disconnect_node(&mut self, node: TmNodeId) -> TmResult<()> {
        self.disconnect(EntityRef::Node(node))
    }

    fn connect(&mut self, entity: EntityRef, parent: Parent) -> TmResult<()> {
        let state = self.state(entity)?;
        if state.parent.is_some() {
            return Err(TmError::AlreadyConnected {
                kind: entity_kind(entity),
            });
        }
        let (queued_pkts, queued_bytes) = (state.counters.queued_pkts, state.counters.queued_bytes);
        let child_level = match entity {
            EntityRef::Node(node) => Some(self.node(node).level),
            EntityRef::Queue(_) => None,
        };

        let fanin = match parent {
            Parent::Output(index) => {
                let output = self.outputs.get(index as usize).ok_or(TmError::InvalidHandle {
                    kind: ObjectKind::Output,
                    id: index as u64,
                })?;
                if let Some(level) = child_level.filter(|level| *level != 0) {
                    return Err(TmError::invalid_param(
                        "parent",
                        format!("only level 0 nodes attach to an output, got level {level}"),
                    ));
                }
                output.fanin
            }
            Parent::Node(node) => {
                let parent_node = self.nodes.get(node.into())?;
                if let Some(level) = child_level.filter(|level| *level <= parent_node.level) {
                    return Err(TmError::invalid_param(
                        "parent",
                        format!(
                            "a level {level} node cannot sit under level {}",
                            parent_node.level
                        ),
                    ));
                }
                parent_node.fanin
            }
        };
        if fanin >= self.requirements.max_fanin {
            return Err(TmError::CapacityExceeded {
                kind: ObjectKind::Node,
                max: self.requirements.max_fanin as u64,
            });
        }

        self.state_mut(entity)?.parent = Some(parent);
        *self.fanin_mut(parent) += 1;
        self.adjust_ancestors(Some(parent), queued_pkts, queued_bytes, true);
        self.refresh(entity);
        debug!(?entity, ?parent, "connected");
        Ok(())
    }

    fn disconnect(&mut self, entity: EntityRef) -> TmResult<()> {
        let state = self.state(entity)?;
        let Some(parent) = state.parent else {
            return Err(TmError::NotConnected {
                kind: entity_kind(entity),
            });
        };
        let (queued_pkts, queued_bytes) = (state.counters.queued_pkts, state.counters.queued_bytes);

        if state.in_parent_list {
            let list = self.parent_list(parent);
            self.sorted.delete(list, &entity)?;
        }
        let state = self.state_mut(entity)?;
        state.in_parent_list = false;
        state.parent = None;
        state.last_finish = 0;

        *self.fanin_mut(parent) -= 1;
        self.adjust_ancestors(Some(parent), queued_pkts, queued_bytes, false);
        if let Parent::Node(node) = parent {
            self.refresh(EntityRef::Node(node));
        }
        debug!(?entity, ?parent, "disconnected");
        Ok(())
    }

    /// Destroy a drained queue, disconnecting it first if needed.
    pub fn destroy_queue(&mut self, queue: TmQueueId) -> TmResult<()> {
        let entity = self.queues.get(queue.into())?;
        if entity.state.counters.queued_pkts > 0 {
            return Err(TmError::NotEmpty {
                kind: ObjectKind::Queue,
                pending: entity.state.counters.queued_pkts,
            });
        }
        let (pool, pkt_queue) = (entity.pool, entity.pkt_queue);
        if entity.state.parent.is_some() {
            self.disconnect(EntityRef::Queue(queue))?;
        }

        self.pools[pool].destroy_queue(pkt_queue)?;
        let mut entity = self.queues.remove(queue.into())?;
        entity.state.detach_all(&self.profiles);
        if let Some(name) = &entity.state.name {
            self.names.remove(ObjectKind::Queue, name);
        }
        debug!(%queue, "tm queue destroyed");
        Ok(())
    }

    /// Destroy a node without children, disconnecting it first if needed.
    pub fn destroy_node(&mut self, node: TmNodeId) -> TmResult<()> {
        let entity = self.nodes.get(node.into())?;
        if entity.fanin > 0 {
            return Err(TmError::HasChildren {
                fanin: entity.fanin,
            });
        }
        if entity.state.parent.is_some() {
            self.disconnect(EntityRef::Node(node))?;
        }

        let mut entity = self.nodes.remove(node.into())?;
        self.sorted.clear(entity.ready)?;
        self.free_lists.push(entity.ready);
        entity.state.detach_all(&self.profiles);
        if let Some(name) = &entity.state.name {
            self.names.remove(ObjectKind::Node, name);
        }
        debug!(%node, "tm node destroyed");
        Ok(())
    }

    /// Route an output's packets into `tx`. Until a channel is set, packets
    /// scheduled on the output are counted as egress drops.
    pub fn set_output(&mut self, output: u16, tx: Sender<P>) -> TmResult<()> {
        let slot = self
            .outputs
            .get_mut(output as usize)
            .ok_or(TmError::InvalidHandle {
                kind: ObjectKind::Output,
                id: output as u64,
            })?;
        slot.tx = Some(tx);
        Ok(())
    }

    /// Bind (`Some`) or clear (`None`) the shaper of a queue.
    pub fn set_queue_shaper(&mut self, queue: TmQueueId, shaper: Option<ShaperId>) -> TmResult<()> {
        self.set_shaper(EntityRef::Queue(queue), shaper)
    }

    pub fn set_node_shaper(&mut self, node: TmNodeId, shaper: Option<ShaperId>) -> TmResult<()> {
        self.set_shaper(EntityRef::Node(node), shaper)
    }

    /// Bind or clear the WFQ weights a queue competes with in its parent.
    pub fn set_queue_sched(&mut self, queue: TmQueueId, sched: Option<SchedId>) -> TmResult<()> {
        self.set_profile(EntityRef::Queue(queue), sched, |state| &mut state.sched)
    }

    /// Bind or clear the WFQ weights a node competes with in its parent.
    /// A node's cost is the length of the last packet it forwarded.
    pub fn set_node_sched(&mut self, node: TmNodeId, sched: Option<SchedId>) -> TmResult<()> {
        self.set_profile(EntityRef::Node(node), sched, |state| &mut state.sched)
    }

    /// Bind or clear a queue's WRED profile. It only acts once a threshold
    /// profile gives the queue a fullness to measure.
    pub fn set_queue_wred(&mut self, queue: TmQueueId, wred: Option<WredId>) -> TmResult<()> {
        self.set_profile(EntityRef::Queue(queue), wred, |state| &mut state.wred)
    }

    pub fn set_node_wred(&mut self, node: TmNodeId, wred: Option<WredId>) -> TmResult<()> {
        self.set_profile(EntityRef::Node(node), wred, |state| &mut state.wred)
    }

    /// Bind or clear a queue's hard admission limit.
    pub fn set_queue_threshold(
        &mut self,
        queue: TmQueueId,
        threshold: Option<ThresholdId>,
    ) -> TmResult<()> {
        self.set_profile(EntityRef::Queue(queue), threshold, |state| &mut state.threshold)
    }

    pub fn set_node_threshold(
        &mut self,
        node: TmNodeId,
        threshold: Option<ThresholdId>,
    ) -> TmResult<()> {
        self.set_profile(EntityRef::Node(node), threshold, |state| &mut state.threshold)
    }

    /// Swap one profile binding. The new profile is attached before the old
    /// one is released, so a failed attach leaves the binding unchanged.
    fn set_profile<I: ProfileId>(
        &mut self,
        entity: EntityRef,
        id: Option<I>,
        slot: fn(&mut SchedState) -> &mut Option<Attached<I>>,
    ) -> TmResult<()> {
        self.state(entity)?;
        let profiles = self.profiles.clone();
        let attached = match id {
            Some(id) => Some(Attached {
                id,
                params: profiles.attach(id)?,
            }),
            None => None,
        };
        let state = self.state_mut(entity)?;
        if let Some(previous) = std::mem::replace(slot(state), attached) {
            profiles.detach(previous.id);
        }
        if let EntityRef::Queue(queue) = entity {
            self.update_congestion(queue);
        }
        let kind = I::KIND;
        debug!(?entity, profile = ?id, %kind, "profile bound");
        Ok(())
    }

    /// A new shaper starts with full buckets, so the entity becomes eligible
    /// immediately; any wakeup still pending for it is ignored when it fires.
    fn set_shaper(&mut self, entity: EntityRef, shaper: Option<ShaperId>) -> TmResult<()> {
        self.state(entity)?;
        let profiles = self.profiles.clone();
        let now = self.timers.current_time();
        let slot = match shaper {
            Some(id) => Some(ShaperSlot {
                id,
                state: ShaperState::new(profiles.attach(id)?, now),
            }),
            None => None,
        };
        let state = self.state_mut(entity)?;
        if let Some(previous) = std::mem::replace(&mut state.shaper, slot) {
            profiles.detach(previous.id);
        }
        state.blocked = false;
        self.refresh(entity);
        debug!(?entity, ?shaper, "shaper bound");
        Ok(())
    }

    /// Look up a queue by the name given at creation.
    pub fn find_queue(&self, name: &str) -> Option<TmQueueId> {
        self.names
            .lookup(ObjectKind::Queue, name)
            .map(TmQueueId::from_u64)
    }

    pub fn find_node(&self, name: &str) -> Option<TmNodeId> {
        self.names
            .lookup(ObjectKind::Node, name)
            .map(TmNodeId::from_u64)
    }

    /// Packets waiting in one queue.
    ///
    /// # Returns
    /// The packet count, or `InvalidHandle` for a destroyed or foreign id.
    pub fn queue_len(&self, queue: TmQueueId) -> TmResult<u32> {
        let entity = self.queues.get(queue.into())?;
        self.pools[entity.pool].len(entity.pkt_queue)
    }

    /// Congestion color of a queue, from its WRED green curve and current
    /// fullness. Always green without WRED and threshold profiles.
    pub fn queue_congestion(&self, queue: TmQueueId) -> TmResult<Color> {
        Ok(self.queues.get(queue.into())?.congestion)
    }

    /// Counters and state of one queue.
    pub fn queue_stats(&self, queue: TmQueueId) -> TmResult<QueueStats> {
        let entity = self.queues.get(queue.into())?;
        Ok(queue_stats(queue, entity))
    }

    /// Counters and state of one node; `queued_pkts` covers its subtree.
    pub fn node_stats(&self, node: TmNodeId) -> TmResult<NodeStats> {
        let entity = self.nodes.get(node.into())?;
        Ok(self.build_node_stats(node, entity))
    }

    /// Send and egress-drop counters of one output.
    pub fn output_stats(&self, output: u16) -> TmResult<OutputStats> {
        self.outputs
            .get(output as usize)
            .map(|slot| OutputStats {
                fanin: slot.fanin,
                ..slot.stats
            })
            .ok_or(TmError::InvalidHandle {
                kind: ObjectKind::Output,
                id: output as u64,
            })
    }

    /// System-wide totals plus the state of the sorted lists, the timer
    /// wheel and every packet pool.
    pub fn stats(&self) -> SystemStats {
        SystemStats {
            live_queues: self.queues.len(),
            live_nodes: self.nodes.len(),
            enqueued_pkts: self.totals.enqueued_pkts,
            dequeued_pkts: self.totals.dequeued_pkts,
            threshold_drops: self.totals.threshold_drops,
            wred_drops: self.totals.wred_drops,
            ecn_marks: self.totals.ecn_marks,
            egress_drops: self.totals.egress_drops,
            timer_wakes: self.totals.timer_wakes,
            sorted_lists: self.sorted.stats(),
            timers: self.timers.stats(),
            pkt_pools: self.pools.iter().map(QueuePool::stats).collect(),
        }
    }

    /// Every counter of the system in one serializable value.
    pub fn snapshot(&self) -> TmSnapshot {
        TmSnapshot {
            system: self.name().map(str::to_owned),
            now: self.now(),
            stats: self.stats(),
            outputs: (0..self.outputs.len() as u16)
                .filter_map(|index| self.output_stats(index).ok())
                .collect(),
            queues: self
                .queues
                .iter()
                .map(|(handle, entity)| queue_stats(handle.into(), entity))
                .collect(),
            nodes: self
                .nodes
                .iter()
                .map(|(handle, entity)| self.build_node_stats(handle.into(), entity))
                .collect(),
        }
    }

    fn build_node_stats(&self, id: TmNodeId, entity: &NodeEntity) -> NodeStats {
        NodeStats {
            id,
            name: entity.state.name.clone(),
            level: entity.level,
            priority: entity.state.priority.value(),
            parent: entity.state.parent,
            fanin: entity.fanin,
            ready_children: self.sorted.len(entity.ready).unwrap_or(0),
            shaper_blocked: entity.state.blocked,
            counters: entity.state.counters,
        }
    }

    pub(super) fn state(&self, entity: EntityRef) -> TmResult<&SchedState> {
        match entity {
            EntityRef::Queue(queue) => Ok(&self.queues.get(queue.into())?.state),
            EntityRef::Node(node) => Ok(&self.nodes.get(node.into())?.state),
        }
    }

    pub(super) fn state_mut(&mut self, entity: EntityRef) -> TmResult<&mut SchedState> {
        match entity {
            EntityRef::Queue(queue) => Ok(&mut self.queues.get_mut(queue.into())?.state),
            EntityRef::Node(node) => Ok(&mut self.nodes.get_mut(node.into())?.state),
        }
    }

    pub(super) fn node(&self, node: TmNodeId) -> &NodeEntity {
        self.nodes
            .get(node.into())
            .expect("connected parents and ready entries refer to live nodes")
    }

    pub(super) fn node_mut(&mut self, node: TmNodeId) -> &mut NodeEntity {
        self.nodes
            .get_mut(node.into())
            .expect("connected parents and ready entries refer to live nodes")
    }

    fn parent_list(&self, parent: Parent) -> SortedListId {
        match parent {
            Parent::Output(index) => self.outputs[index as usize].ready,
            Parent::Node(node) => self.node(node).ready,
        }
    }

    fn parent_vtime(&self, parent: Parent, class: Priority) -> u64 {
        match parent {
            Parent::Output(index) => self.outputs[index as usize].vtime[class],
            Parent::Node(node) => self.node(node).vtime[class],
        }
    }

    fn parent_vtime_mut(&mut self, parent: Parent, class: Priority) -> &mut u64 {
        match parent {
            Parent::Output(index) => &mut self.outputs[index as usize].vtime[class],
            Parent::Node(node) => &mut self.node_mut(node).vtime[class],
        }
    }

    /// WFQ start time of `entity` under `parent`.
    fn wfq_start(&self, parent: Parent, entity: EntityRef) -> u64 {
        let state = self.state(entity).expect("entity looked up above");
        self.parent_vtime(parent, state.priority).max(state.last_finish)
    }

    /// Move the virtual clock of one class under `parent` back to zero.
    ///
    /// Every listed finish time in a class is at least the class clock, so
    /// subtracting the clock keeps their order. Idle children saturate at
    /// zero, which is where their next start lands anyway.
    fn rebase_vtime(&mut self, parent: Parent, class: Priority) {
        let offset = std::mem::take(self.parent_vtime_mut(parent, class));
        let rebase = |state: &mut SchedState| {
            if state.parent == Some(parent) && state.priority == class {
                state.last_finish = state.last_finish.saturating_sub(offset);
            }
        };
        for (_, queue) in self.queues.iter_mut() {
            rebase(&mut queue.state);
        }
        for (_, node) in self.nodes.iter_mut() {
            rebase(&mut node.state);
        }

        let list = self.parent_list(parent);
        let mut entries = Vec::new();
        while let Some(entry) = self
            .sorted
            .remove(list)
            .expect("parent ready list was allocated with the parent")
        {
            entries.push(entry);
        }
        // Reinserting in pop order keeps arrival order among equal keys.
        for (key, entity) in entries {
            let key = match split_key(key) {
                (priority, finish) if priority == class => {
                    sort_key(priority, finish.saturating_sub(offset))
                }
                _ => key,
            };
            self.sorted
                .insert(list, key, entity)
                .expect("entries removed from the list fit back in");
        }
        debug!(?parent, %class, offset, "wfq virtual time rebased");
    }

    fn fanin_mut(&mut self, parent: Parent) -> &mut u32 {
        match parent {
            Parent::Output(index) => &mut self.outputs[index as usize].fanin,
            Parent::Node(node) => &mut self.node_mut(node).fanin,
        }
    }

    fn has_work(&self, entity: EntityRef) -> bool {
        match entity {
            EntityRef::Queue(queue) => self
                .queues
                .get(queue.into())
                .map_or(false, |q| q.state.counters.queued_pkts > 0),
            EntityRef::Node(node) => self
                .nodes
                .get(node.into())
                .map_or(false, |n| self.sorted.len(n.ready).unwrap_or(0) > 0),
        }
    }

    /// Bytes charged to WFQ when `entity` is (re)inserted in its parent.
    fn cost_len(&self, entity: EntityRef) -> u32 {
        match entity {
            EntityRef::Queue(queue) => self
                .queues
                .get(queue.into())
                .ok()
                .and_then(|q| self.pools[q.pool].peek(q.pkt_queue).ok().flatten())
                .map_or(0, |pkt| pkt.len()),
            EntityRef::Node(node) => self.node(node).last_len,
        }
    }

    /// Add or remove a backlog from every node above `from`.
    pub(super) fn adjust_ancestors(&mut self, from: Option<Parent>, pkts: u64, bytes: u64, add: bool) {
        let mut parent = from;
        while let Some(Parent::Node(node)) = parent {
            let entity = self.node_mut(node);
            let counters = &mut entity.state.counters;
            if add {
                counters.queued_pkts += pkts;
                counters.queued_bytes += bytes;
            } else {
                counters.queued_pkts = counters.queued_pkts.saturating_sub(pkts);
                counters.queued_bytes = counters.queued_bytes.saturating_sub(bytes);
            }
            parent = entity.state.parent;
        }
    }

    pub(super) fn update_congestion(&mut self, queue: TmQueueId) {
        if let Ok(entity) = self.queues.get_mut(queue.into()) {
            entity.congestion = entity.state.congestion();
        }
    }

    /// Bring `entity`'s presence in its parent's ready list in line with its
    /// state, then do the same for each ancestor whose readiness changed.
    ///
    /// An entity belongs in the list exactly when it is connected, has work
    /// and is not waiting on its shaper.
    pub(super) fn refresh(&mut self, entity: EntityRef) {
        let mut current = entity;
        loop {
            let Ok(state) = self.state(current) else {
                return;
            };
            let Some(parent) = state.parent else {
                return;
            };
            let (blocked, listed) = (state.blocked, state.in_parent_list);
            let wanted = !blocked && self.has_work(current);
            if wanted == listed {
                return;
            }

            let list = self.parent_list(parent);
            if wanted {
                let len = self.cost_len(current);
                let mut start = self.wfq_start(parent, current);
                if start >= WFQ_REBASE_AT {
                    let class = self.state(current).expect("entity looked up above").priority;
                    self.rebase_vtime(parent, class);
                    start = self.wfq_start(parent, current);
                }
                let state = self.state_mut(current).expect("entity looked up above");
                let finish = start + state.wfq_cost(len);
                state.last_finish = finish;
                state.in_parent_list = true;
                let key = sort_key(state.priority, finish);
                self.sorted
                    .insert(list, key, current)
                    .expect("parent ready list was allocated with the parent");
            } else {
                self.sorted
                    .delete(list, &current)
                    .expect("parent ready list was allocated with the parent");
                self.state_mut(current)
                    .expect("entity looked up above")
                    .in_parent_list = false;
            }

            match parent {
                Parent::Node(node) => current = EntityRef::Node(node),
                Parent::Output(_) => return,
            }
        }
    }

    /// Re-read profile parameters when the shared registry has changed.
    pub(super) fn sync_profiles(&mut self) {
        let version = self.profiles.version();
        if version == self.profile_version {
            return;
        }
        self.profile_version = version;
        for (_, queue) in self.queues.iter_mut() {
            queue.state.reload(&self.profiles);
            queue.congestion = queue.state.congestion();
        }
        for (_, node) in self.nodes.iter_mut() {
            node.state.reload(&self.profiles);
        }
        debug!(version, "profile parameters reloaded");
    }
}

/// Dropping a system releases the profile references its queues and nodes
/// still hold; the packets they hold are dropped with it.
impl<P> Drop for TmSystem<P> {
    fn drop(&mut self) {
        for (_, queue) in self.queues.iter_mut() {
            queue.state.detach_all(&self.profiles);
        }
        for (_, node) in self.nodes.iter_mut() {
            node.state.detach_all(&self.profiles);
        }
        debug!(system = ?self.lease.name(), queued_pkts = self.queued_pkts, "tm system dropped");
    }
}

fn entity_kind(entity: EntityRef) -> ObjectKind {
    match entity {
        EntityRef::Queue(_) => ObjectKind::Queue,
        EntityRef::Node(_) => ObjectKind::Node,
    }
}

fn queue_stats(id: TmQueueId, entity: &QueueEntity) -> QueueStats {
    QueueStats {
        id,
        name: entity.state.name.clone(),
        priority: entity.state.priority.value(),
        parent: entity.state.parent,
        enqueued_pkts: entity.enqueued_pkts,
        enqueued_bytes: entity.enqueued_bytes,
        congestion: entity.congestion,
        shaper_blocked: entity.state.blocked,
        counters: entity.state.counters,
    }
}
