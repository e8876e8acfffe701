//! Per-queue and per-node scheduling state.

use super::shaper::ShaperState;
use super::wred;
use crate::config::Percent;
use crate::handle::{PktQueueId, SchedId, ShaperId, ThresholdId, TmNodeId, TmQueueId, WredId};
use crate::metrics::{OutputStats, TrafficCounters};
use crate::packet::Color;
use crate::priority::{Priority, PriorityTable};
use crate::profile::{ProfileId, Profiles, SchedParams, ThresholdParams, WfqMode};
use crate::sorted_list::SortedListId;
use crossbeam_channel::Sender;
use serde::Serialize;

/// Bits of a sort key left for the WFQ finish time; the priority class sits
/// above them so a better class always sorts first.
const FINISH_BITS: u32 = 60;
pub(crate) const FINISH_MASK: u64 = (1 << FINISH_BITS) - 1;

/// Start times at or past this point shift their class clock back to zero,
/// which keeps every finish time below `FINISH_MASK` (one cost is < 2^48).
pub(crate) const WFQ_REBASE_AT: u64 = 1 << (FINISH_BITS - 1);

/// WFQ cost scale: one byte (or frame) at weight 1.
const WFQ_SCALE: u64 = 65_535;

pub(crate) fn sort_key(priority: Priority, finish: u64) -> u64 {
    debug_assert!(finish <= FINISH_MASK, "finish time {finish} overflows the sort key");
    ((priority.value() as u64) << FINISH_BITS) | (finish & FINISH_MASK)
}

/// Inverse of [`sort_key`].
pub(crate) fn split_key(key: u64) -> (Priority, u64) {
    let class = Priority::new((key >> FINISH_BITS) as u8).expect("sort keys carry a valid class");
    (class, key & FINISH_MASK)
}

/// Where a queue or node is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Parent {
    /// Directly under an egress output.
    Output(u16),
    Node(TmNodeId),
}

/// A schedulable child, as stored in ready lists and timer entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityRef {
    Queue(TmQueueId),
    Node(TmNodeId),
}

/// Timer wheel payload: the entity whose shaper is waiting for credit.
pub type WakeTarget = EntityRef;

/// A profile attached to an entity together with the parameters last read
/// from the registry.
#[derive(Debug)]
pub(crate) struct Attached<I: ProfileId> {
    pub id: I,
    pub params: I::Params,
}

impl<I: ProfileId> Attached<I> {
    fn reload(&mut self, profiles: &Profiles) {
        if let Ok(params) = profiles.params(self.id) {
            self.params = params;
        }
    }
}

#[derive(Debug)]
pub(crate) struct ShaperSlot {
    pub id: ShaperId,
    pub state: ShaperState,
}

/// State shared by queues and nodes.
#[derive(Debug)]
pub(crate) struct SchedState {
    pub name: Option<String>,
    pub priority: Priority,
    pub parent: Option<Parent>,
    pub shaper: Option<ShaperSlot>,
    pub sched: Option<Attached<SchedId>>,
    pub wred: Option<Attached<WredId>>,
    pub threshold: Option<Attached<ThresholdId>>,
    /// WFQ finish time of the last ready-list insertion.
    pub last_finish: u64,
    pub in_parent_list: bool,
    /// Out of credit and waiting for a timer wakeup.
    pub blocked: bool,
    pub wake_pending: bool,
    pub counters: TrafficCounters,
}

impl SchedState {
    pub(crate) fn new(name: Option<String>, priority: Priority) -> Self {
        Self {
            name,
            priority,
            parent: None,
            shaper: None,
            sched: None,
            wred: None,
            threshold: None,
            last_finish: 0,
            in_parent_list: false,
            blocked: false,
            wake_pending: false,
            counters: TrafficCounters::default(),
        }
    }

    /// Virtual-time cost of sending `len` bytes from this child.
    pub(crate) fn wfq_cost(&self, len: u32) -> u64 {
        let (mode, weight) = match &self.sched {
            Some(sched) => (
                sched.params.modes[self.priority],
                sched.params.weights[self.priority],
            ),
            None => {
                let defaults = SchedParams::default();
                (defaults.modes[self.priority], defaults.weights[self.priority])
            }
        };
        let cost = match mode {
            WfqMode::Frame => 1,
            WfqMode::Byte => len.max(1) as u64,
        };
        cost * WFQ_SCALE / weight.max(1) as u64
    }

    /// Threshold check for one more packet of `len` bytes.
    pub(crate) fn over_threshold(&self, len: u32) -> bool {
        let Some(threshold) = &self.threshold else {
            return false;
        };
        let ThresholdParams { max_pkts, max_bytes } = threshold.params;
        max_pkts.map_or(false, |max| self.counters.queued_pkts + 1 > max as u64)
            || max_bytes.map_or(false, |max| self.counters.queued_bytes + len as u64 > max)
    }

    /// Current occupancy against the threshold, in the unit the WRED profile
    /// asks for. `None` when there is nothing to measure against.
    pub(crate) fn fullness(&self, use_bytes: bool) -> Option<Percent> {
        let threshold = &self.threshold.as_ref()?.params;
        if use_bytes {
            threshold
                .max_bytes
                .map(|max| Percent::from_ratio(self.counters.queued_bytes, max))
        } else {
            threshold
                .max_pkts
                .map(|max| Percent::from_ratio(self.counters.queued_pkts, max as u64))
        }
    }

    pub(crate) fn congestion(&self) -> Color {
        let Some(wred_profile) = &self.wred else {
            return Color::Green;
        };
        let params = &wred_profile.params;
        match self.fullness(params.use_byte_fullness) {
            Some(fullness) => wred::congestion_color(params.curve(Color::Green), fullness),
            None => Color::Green,
        }
    }

    /// Re-read every attached profile after a registry update.
    pub(crate) fn reload(&mut self, profiles: &Profiles) {
        if let Some(shaper) = &mut self.shaper {
            if let Ok(params) = profiles.params(shaper.id) {
                shaper.state.reconfigure(params);
            }
        }
        if let Some(sched) = &mut self.sched {
            sched.reload(profiles);
        }
        if let Some(wred) = &mut self.wred {
            wred.reload(profiles);
        }
        if let Some(threshold) = &mut self.threshold {
            threshold.reload(profiles);
        }
    }

    /// Release every profile reference.
    pub(crate) fn detach_all(&mut self, profiles: &Profiles) {
        if let Some(shaper) = self.shaper.take() {
            profiles.detach(shaper.id);
        }
        if let Some(sched) = self.sched.take() {
            profiles.detach(sched.id);
        }
        if let Some(wred) = self.wred.take() {
            profiles.detach(wred.id);
        }
        if let Some(threshold) = self.threshold.take() {
            profiles.detach(threshold.id);
        }
    }
}

#[derive(Debug)]
pub(crate) struct QueueEntity {
    pub state: SchedState,
    pub pool: usize,
    pub pkt_queue: PktQueueId,
    pub congestion: Color,
    pub enqueued_pkts: u64,
    pub enqueued_bytes: u64,
}

#[derive(Debug)]
pub(crate) struct NodeEntity {
    pub state: SchedState,
    pub level: u8,
    pub ready: SortedListId,
    pub fanin: u32,
    /// WFQ virtual time per class: finish time of the child served last.
    pub vtime: PriorityTable<u64>,
    /// Length of the last packet that passed through, used as the node's own
    /// WFQ cost in its parent.
    pub last_len: u32,
}

#[derive(Debug)]
pub(crate) struct Output<P> {
    pub ready: SortedListId,
    pub fanin: u32,
    pub vtime: PriorityTable<u64>,
    pub tx: Option<Sender<P>>,
    pub stats: OutputStats,
}
