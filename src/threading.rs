//! CPU placement for the thread that owns a [`crate::scheduler::TmSystem`].
//!
//! A TM system is driven by one thread. Pinning that thread to a core, and
//! optionally giving it a real-time policy, keeps the sorted lists and the
//! timer wheel hot in one cache and the dispatch loop free of migrations.
//! Both helpers are best effort: on platforms without the Linux APIs they
//! report `Unsupported`, and callers are expected to log and carry on.

use serde::{Deserialize, Serialize};
use std::io;

/// Scheduling policy requested for the current thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadClass {
    /// Leave the default time-sharing policy in place.
    #[default]
    Normal,
    /// `SCHED_RR` at a middling real-time priority.
    RoundRobin,
    /// `SCHED_FIFO` at a high real-time priority, for the dispatch loop.
    Fifo,
}

/// Restrict the current thread to `core_id`.
///
/// On Linux this uses `pthread_setaffinity_np`; it fails when the core does
/// not exist or the caller lacks permission.
pub fn pin_current_thread(core_id: usize) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use libc::{cpu_set_t, pthread_self, pthread_setaffinity_np, CPU_SET, CPU_SETSIZE, CPU_ZERO};

        if core_id >= CPU_SETSIZE as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("core {core_id} is beyond CPU_SETSIZE"),
            ));
        }
        // SAFETY: `set` is a plain bitmask owned by this frame and sized for
        // the call; `pthread_self` is always a valid thread handle.
        let rc = unsafe {
            let mut set: cpu_set_t = std::mem::zeroed();
            CPU_ZERO(&mut set);
            CPU_SET(core_id, &mut set);
            pthread_setaffinity_np(pthread_self(), std::mem::size_of::<cpu_set_t>(), &set)
        };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = core_id;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "thread pinning is only implemented on Linux",
        ))
    }
}

/// Apply a scheduling class to the current thread.
///
/// Real-time classes usually need `CAP_SYS_NICE`; the error is returned so
/// the caller can decide whether that matters.
pub fn set_thread_class(class: ThreadClass) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use libc::{pthread_self, pthread_setschedparam, sched_param, SCHED_FIFO, SCHED_OTHER, SCHED_RR};

        let (policy, priority) = match class {
            ThreadClass::Normal => (SCHED_OTHER, 0),
            ThreadClass::RoundRobin => (SCHED_RR, 30),
            ThreadClass::Fifo => (SCHED_FIFO, 80),
        };
        // SAFETY: `param` is fully initialised before the call and only read
        // by it.
        let rc = unsafe {
            let mut param: sched_param = std::mem::zeroed();
            param.sched_priority = priority;
            pthread_setschedparam(pthread_self(), policy, &param)
        };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    {
        match class {
            ThreadClass::Normal => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "real-time thread classes are only implemented on Linux",
            )),
        }
    }
}
