//! Hierarchical traffic manager.
//!
//! Packets enter leaf queues, pass threshold and WRED admission, wait in a
//! sparse per-queue packet pool and leave through egress outputs in the order
//! chosen by an 8-level strict-priority / WFQ tree with token-bucket shaping
//! at every level. The three substrates the scheduler is built on are public
//! on their own:
//!
//! * [`sorted_list`]: many rank-ordered lists sharing one entry pool
//! * [`timer_wheel`]: cycle-exact wakeups over a hierarchical wheel
//! * [`pkt_queue`]: FIFO queues allocated only when used
//!
//! A [`context::TmContext`] owns the configuration and the shared profile
//! registry and creates [`scheduler::TmSystem`]s.

pub mod config;
pub mod context;
pub mod error;
pub mod handle;
pub mod metrics;
pub mod name_table;
pub mod packet;
pub mod pkt_queue;
pub mod priority;
pub mod profile;
pub mod scheduler;
pub mod sorted_list;
pub mod threading;
pub mod timer_wheel;

pub use config::{Percent, TmConfig, TmRequirements, WheelConfig};
pub use context::TmContext;
pub use error::{ObjectKind, TmError, TmResult};
pub use handle::{SchedId, ShaperId, ThresholdId, TmNodeId, TmQueueId, WredId};
pub use metrics::TmSnapshot;
pub use packet::{Color, Packet, TmPacket};
pub use priority::Priority;
pub use profile::{SchedParams, ShaperParams, ThresholdParams, WfqMode, WredCurve, WredParams};
pub use scheduler::{Admission, Parent, TmSystem};
