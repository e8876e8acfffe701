//! Counters and snapshots exported by a TM system.
//!
//! Counters are plain integers updated inline on the scheduling thread; the
//! owner reads them through [`crate::scheduler::TmSystem::stats`] and friends,
//! or takes a [`TmSnapshot`] that serializes the whole system to JSON for the
//! simulator or an external dashboard.

use crate::handle::{TmNodeId, TmQueueId};
use crate::packet::Color;
use crate::pkt_queue::QueuePoolStats;
use crate::scheduler::Parent;
use crate::sorted_list::SortedPoolStats;
use crate::timer_wheel::TimerWheelStats;
use serde::Serialize;

/// Packets sent per shaper conformance color.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ColorCounts {
    pub green: u64,
    pub yellow: u64,
    pub red: u64,
}

impl ColorCounts {
    pub(crate) fn record(&mut self, color: Color) {
        match color {
            Color::Green => self.green += 1,
            Color::Yellow => self.yellow += 1,
            Color::Red => self.red += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.green + self.yellow + self.red
    }
}

/// Counters kept by every queue and node.
///
/// For a node, `queued_*` covers every packet held anywhere below it and the
/// drop counters only count rejections made by the node's own profiles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficCounters {
    pub queued_pkts: u64,
    pub queued_bytes: u64,
    pub dequeued_pkts: u64,
    pub dequeued_bytes: u64,
    pub threshold_drops: u64,
    pub wred_drops: u64,
    pub ecn_marks: u64,
    pub shaper_colors: ColorCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub id: TmQueueId,
    pub name: Option<String>,
    pub priority: u8,
    pub parent: Option<Parent>,
    pub enqueued_pkts: u64,
    pub enqueued_bytes: u64,
    pub congestion: Color,
    pub shaper_blocked: bool,
    #[serde(flatten)]
    pub counters: TrafficCounters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    pub id: TmNodeId,
    pub name: Option<String>,
    pub level: u8,
    pub priority: u8,
    pub parent: Option<Parent>,
    pub fanin: u32,
    /// Children currently eligible for service.
    pub ready_children: u32,
    pub shaper_blocked: bool,
    #[serde(flatten)]
    pub counters: TrafficCounters,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutputStats {
    pub index: u16,
    pub fanin: u32,
    pub sent_pkts: u64,
    pub sent_bytes: u64,
    /// Packets scheduled while the egress channel was full, closed or unset.
    pub egress_drops: u64,
}

/// System-wide totals plus the state of the underlying substrates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemStats {
    pub live_queues: u32,
    pub live_nodes: u32,
    pub enqueued_pkts: u64,
    pub dequeued_pkts: u64,
    pub threshold_drops: u64,
    pub wred_drops: u64,
    pub ecn_marks: u64,
    pub egress_drops: u64,
    pub timer_wakes: u64,
    pub sorted_lists: SortedPoolStats,
    pub timers: TimerWheelStats,
    pub pkt_pools: Vec<QueuePoolStats>,
}

/// Point-in-time view of a whole system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TmSnapshot {
    pub system: Option<String>,
    /// Scheduler time, in cycles, when the snapshot was taken.
    pub now: u64,
    pub stats: SystemStats,
    pub outputs: Vec<OutputStats>,
    pub queues: Vec<QueueStats>,
    pub nodes: Vec<NodeStats>,
}

impl TmSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Packets currently held across all queues.
    pub fn backlog(&self) -> u64 {
        self.queues.iter().map(|q| q.counters.queued_pkts).sum()
    }
}
