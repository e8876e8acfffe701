//! Owner of everything that outlives a single TM system.
//!
//! A [`TmContext`] holds the configuration, the shared profile registry and
//! the roster of live systems. It is cheap to clone; clones refer to the same
//! registry and roster.

use crate::config::{TmConfig, TmRequirements};
use crate::error::{ObjectKind, TmError, TmResult};
use crate::name_table::NameTable;
use crate::packet::TmPacket;
use crate::profile::Profiles;
use crate::scheduler::TmSystem;
use parking_lot::Mutex;
use std::sync::Arc;

/// Profiles per kind a context can hold.
const MAX_PROFILES_PER_KIND: u32 = 64 * 1024;

#[derive(Debug, Default)]
struct Roster {
    live: u32,
    created: u64,
    names: NameTable,
}

#[derive(Debug, Clone)]
pub struct TmContext {
    config: Arc<TmConfig>,
    profiles: Profiles,
    roster: Arc<Mutex<Roster>>,
}

impl TmContext {
    pub fn new(config: TmConfig) -> TmResult<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            profiles: Profiles::new(MAX_PROFILES_PER_KIND),
            roster: Arc::new(Mutex::new(Roster::default())),
        })
    }

    pub fn config(&self) -> &TmConfig {
        &self.config
    }

    /// Registry shared by every system of this context.
    pub fn profiles(&self) -> &Profiles {
        &self.profiles
    }

    /// Number of systems created and not yet dropped.
    pub fn live_systems(&self) -> u32 {
        self.roster.lock().live
    }

    /// Create a TM system with the given capacity bounds.
    ///
    /// Fails with a capacity error once `max_systems` systems are alive, and
    /// with `NameTaken` when another live system already uses `name`.
    pub fn create_system<P: TmPacket>(
        &self,
        name: Option<&str>,
        requirements: TmRequirements,
    ) -> TmResult<TmSystem<P>> {
        requirements.validate()?;

        let serial = {
            let mut roster = self.roster.lock();
            if roster.live >= self.config.max_systems {
                return Err(TmError::CapacityExceeded {
                    kind: ObjectKind::System,
                    max: self.config.max_systems as u64,
                });
            }
            let created = roster.created;
            if let Some(name) = name {
                roster.names.add(ObjectKind::System, name, created)?;
            }
            roster.live += 1;
            roster.created += 1;
            roster.created
        };

        let lease = SystemLease {
            roster: Arc::clone(&self.roster),
            name: name.map(str::to_owned),
        };
        // On failure the lease is dropped and the slot released.
        let system = TmSystem::new(
            lease,
            requirements,
            &self.config,
            self.profiles.clone(),
            serial,
        )?;
        tracing::debug!(system = ?name, serial, "tm system created");
        Ok(system)
    }
}

impl Default for TmContext {
    fn default() -> Self {
        Self {
            config: Arc::new(TmConfig::default()),
            profiles: Profiles::new(MAX_PROFILES_PER_KIND),
            roster: Arc::new(Mutex::new(Roster::default())),
        }
    }
}

/// Keeps one roster slot occupied for as long as its system lives.
#[derive(Debug)]
pub(crate) struct SystemLease {
    roster: Arc<Mutex<Roster>>,
    name: Option<String>,
}

impl SystemLease {
    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl Drop for SystemLease {
    fn drop(&mut self) {
        let mut roster = self.roster.lock();
        roster.live = roster.live.saturating_sub(1);
        if let Some(name) = &self.name {
            roster.names.remove(ObjectKind::System, name);
        }
    }
}
