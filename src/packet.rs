//! Packet abstraction consumed by the traffic manager.
//!
//! The TM never inspects payloads: it needs a length for shaping and byte
//! fullness, the drop-precedence color chosen upstream, and a way to set the
//! ECN congestion mark. Any packet type implementing [`TmPacket`] can flow
//! through a [`crate::scheduler::TmSystem`].

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Three-level color used for packet drop precedence, shaper conformance and
/// queue congestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    #[default]
    Green,
    Yellow,
    Red,
}

impl Color {
    pub const ALL: [Color; 3] = [Color::Green, Color::Yellow, Color::Red];

    pub const fn index(self) -> usize {
        match self {
            Color::Green => 0,
            Color::Yellow => 1,
            Color::Red => 2,
        }
    }
}

/// What the scheduler needs from a packet.
pub trait TmPacket {
    /// Length in bytes used for shaping and byte-based accounting.
    fn len(&self) -> u32;

    /// Drop precedence assigned by classification.
    fn color(&self) -> Color {
        Color::Green
    }

    /// Apply a congestion-experienced mark. Returns `false` when the packet
    /// is not ECN capable, in which case WRED falls back to dropping it.
    fn mark_ecn(&mut self) -> bool {
        false
    }
}

/// Reference packet type used by the simulator, benches and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub flow_id: u64,
    pub len: u32,
    pub color: Color,
    pub ecn_capable: bool,
    pub ecn_marked: bool,
    /// Creation time, for end-to-end latency at the egress side.
    pub timestamp: Instant,
}

impl Packet {
    pub fn new(flow_id: u64, len: u32) -> Packet {
        Packet {
            flow_id,
            len,
            color: Color::Green,
            ecn_capable: false,
            ecn_marked: false,
            timestamp: Instant::now(),
        }
    }

    pub fn with_color(mut self, color: Color) -> Packet {
        self.color = color;
        self
    }

    pub fn ecn_capable(mut self) -> Packet {
        self.ecn_capable = true;
        self
    }

    /// Time spent since the packet was created.
    pub fn latency(&self) -> Duration {
        self.timestamp.elapsed()
    }
}

impl TmPacket for Packet {
    fn len(&self) -> u32 {
        self.len
    }

    fn color(&self) -> Color {
        self.color
    }

    fn mark_ecn(&mut self) -> bool {
        if self.ecn_capable {
            self.ecn_marked = true;
        }
        self.ecn_capable
    }
}
