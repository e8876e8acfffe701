//! Error taxonomy shared by the substrates and the TM hierarchy.
//!
//! Capacity and invalid-handle failures are always recoverable and leave the
//! failing structure untouched. "Nothing to do" outcomes (empty list, empty
//! queue, no expired timer) are reported as `Option::None`, never as errors.

use thiserror::Error;

/// Result alias used across the crate.
pub type TmResult<T> = Result<T, TmError>;

/// Every object family that hands out handles or ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    System,
    Queue,
    Node,
    Output,
    ShaperProfile,
    WredProfile,
    SchedProfile,
    ThresholdProfile,
    SortedList,
    PktQueue,
    Timer,
    QueuedPacket,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ObjectKind::System => "tm system",
            ObjectKind::Queue => "tm queue",
            ObjectKind::Node => "tm node",
            ObjectKind::Output => "egress output",
            ObjectKind::ShaperProfile => "shaper profile",
            ObjectKind::WredProfile => "wred profile",
            ObjectKind::SchedProfile => "scheduler profile",
            ObjectKind::ThresholdProfile => "threshold profile",
            ObjectKind::SortedList => "sorted list",
            ObjectKind::PktQueue => "packet queue",
            ObjectKind::Timer => "timer",
            ObjectKind::QueuedPacket => "queued packet",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TmError {
    /// A creation request would exceed a declared maximum.
    #[error("{kind} capacity exceeded (max {max})")]
    CapacityExceeded { kind: ObjectKind, max: u64 },
    /// The id is outside the allocated range, or refers to a destroyed object.
    #[error("invalid {kind} handle {id:#x}")]
    InvalidHandle { kind: ObjectKind, id: u64 },
    /// A parameter is outside its documented range.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    /// A profile is still attached to a queue or node.
    #[error("{kind} is still attached to {attachments} object(s)")]
    InUse { kind: ObjectKind, attachments: u32 },
    /// A queue still holds packets.
    #[error("{kind} still holds {pending} packet(s)")]
    NotEmpty { kind: ObjectKind, pending: u64 },
    /// A node still has children connected to it.
    #[error("tm node still has {fanin} child(ren) connected")]
    HasChildren { fanin: u32 },
    #[error("{kind} is already connected")]
    AlreadyConnected { kind: ObjectKind },
    #[error("{kind} is not connected")]
    NotConnected { kind: ObjectKind },
    #[error("{kind} name `{name}` is already registered")]
    NameTaken { kind: ObjectKind, name: String },
}

impl TmError {
    pub(crate) fn invalid_param(name: &'static str, reason: impl Into<String>) -> Self {
        TmError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    /// Whether the error reports a capacity bound.
    pub fn is_capacity(&self) -> bool {
        matches!(self, TmError::CapacityExceeded { .. })
    }

    /// Whether the error reports a bad handle or id.
    pub fn is_invalid_handle(&self) -> bool {
        matches!(self, TmError::InvalidHandle { .. })
    }
}
