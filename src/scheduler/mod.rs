//! Hierarchical TM scheduler.
//!
//! Every output, and every node, keeps a sorted ready list of the children
//! that currently have work and credit. Ranking is by strict priority class
//! first and WFQ virtual finish time second, so one `remove` per level picks
//! the next packet. Shapers that run dry take their entity out of its parent's
//! list and schedule a timer-wheel wakeup for the cycle credit returns.

mod dispatch;
mod entity;
mod shaper;
mod system;
mod wred;

pub use dispatch::Admission;
pub use entity::{EntityRef, Parent, WakeTarget};
pub use system::TmSystem;
