//! Capacity constants and configuration objects.
//!
//! The constants are the hard platform bounds; `TmRequirements` is what a
//! caller asks for when creating one TM system and is validated against them.
//! Both config structs are serde-friendly so deployments can keep them in JSON.

use crate::error::{ObjectKind, TmError, TmResult};
use serde::{Deserialize, Serialize};

/// Scheduler time base: cycles per second (1 cycle = 1 ns).
pub const CYCLES_PER_SEC: u64 = 1_000_000_000;

pub const MAX_NUM_SYSTEMS: u32 = 64;
pub const MAX_PRIORITIES: usize = 16;
pub const MAX_LEVELS: u8 = 8;
pub const MAX_TM_QUEUES: u32 = 64 * 1024 * 1024;
pub const MAX_NUM_OUTPUTS: u16 = 256;
pub const MAX_NUM_TM_NODES: u32 = 1024 * 1024;
pub const MAX_TM_NODE_FANIN: u32 = 1024 * 1024;

/// Largest queue count a single packet queue pool can address.
pub const MAX_POOL_QUEUES: u32 = 16 * 1024 * 1024;

/// Shaper rates are expressed in units of 1000 bytes/second.
pub const MIN_SHAPER_BW: u32 = 1;
pub const MAX_SHAPER_BW: u32 = 12_500_000;

pub const MIN_SCHED_WEIGHT: u8 = 1;
pub const MAX_SCHED_WEIGHT: u8 = 255;

/// Longest name accepted by the name tables.
pub const MAX_NAME_LEN: usize = 32;

/// Fixed-point percentage in units of 1/100 %, capped at 500 %.
///
/// Occupancy ratios routinely exceed 100 % (a queue past its WRED threshold),
/// so the representable range stops at 50 000 rather than 10 000.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Percent(u16);

impl Percent {
    pub const ZERO: Percent = Percent(0);
    pub const HUNDRED: Percent = Percent(10_000);
    pub const MAX: Percent = Percent(50_000);

    pub fn new(raw: u16) -> TmResult<Self> {
        if raw > Self::MAX.0 {
            return Err(TmError::invalid_param(
                "percent",
                format!("{raw} exceeds the 50000 (500%) cap"),
            ));
        }
        Ok(Percent(raw))
    }

    /// Whole percent helper, e.g. `Percent::from_whole(80)` is 80 %.
    pub fn from_whole(pct: u16) -> TmResult<Self> {
        Self::new(pct.saturating_mul(100))
    }

    /// `num / den` as a percentage, saturating at 500 %.
    pub fn from_ratio(num: u64, den: u64) -> Self {
        if den == 0 {
            return if num == 0 { Self::ZERO } else { Self::MAX };
        }
        let scaled = (num as u128 * 10_000) / den as u128;
        Percent(scaled.min(Self::MAX.0 as u128) as u16)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for Percent {
    type Error = TmError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Percent::new(value)
    }
}

impl From<Percent> for u16 {
    fn from(value: Percent) -> Self {
        value.0
    }
}

/// Timer wheel geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WheelConfig {
    /// log2 of the cycles covered by one wheel tick.
    pub tick_shift: u32,
    /// Furthest a wakeup may be scheduled past the current time.
    pub horizon_cycles: u64,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            tick_shift: 10,
            horizon_cycles: 100 * CYCLES_PER_SEC,
        }
    }
}

/// Context-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TmConfig {
    /// Maximum number of live TM systems in one context.
    pub max_systems: u32,
    pub wheel: WheelConfig,
    /// Seed for the WRED random source; each system derives its own stream.
    pub wred_seed: u64,
}

impl Default for TmConfig {
    fn default() -> Self {
        Self {
            max_systems: MAX_NUM_SYSTEMS,
            wheel: WheelConfig::default(),
            wred_seed: 0x5eed_7a11,
        }
    }
}

impl TmConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(raw: &str) -> TmResult<Self> {
        let config: TmConfig = serde_json::from_str(raw)
            .map_err(|e| TmError::invalid_param("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TmResult<()> {
        if self.max_systems == 0 || self.max_systems > MAX_NUM_SYSTEMS {
            return Err(TmError::invalid_param(
                "max_systems",
                format!("must be in 1..={MAX_NUM_SYSTEMS}"),
            ));
        }
        if self.wheel.tick_shift > 20 {
            return Err(TmError::invalid_param("wheel.tick_shift", "must be <= 20"));
        }
        if self.wheel.horizon_cycles == 0 {
            return Err(TmError::invalid_param("wheel.horizon_cycles", "must be > 0"));
        }
        Ok(())
    }
}

/// Capacity bounds requested for one TM system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TmRequirements {
    pub max_tm_queues: u32,
    pub max_tm_nodes: u32,
    pub max_levels: u8,
    pub max_priorities: u8,
    pub max_fanin: u32,
    pub num_outputs: u16,
    /// Packets held across all queues of the system at once.
    pub max_queued_pkts: u32,
    /// Outstanding shaper wakeups; defaults to one per queue and node.
    pub max_timers: u32,
}

impl Default for TmRequirements {
    fn default() -> Self {
        Self {
            max_tm_queues: 1024,
            max_tm_nodes: 256,
            max_levels: MAX_LEVELS,
            max_priorities: MAX_PRIORITIES as u8,
            max_fanin: 1024,
            num_outputs: 1,
            max_queued_pkts: 64 * 1024,
            max_timers: 1024 + 256,
        }
    }
}

impl TmRequirements {
    /// Check every field against the platform bounds.
    pub fn validate(&self) -> TmResult<()> {
        fn bound(kind: ObjectKind, value: u64, max: u64) -> TmResult<()> {
            if value > max {
                return Err(TmError::CapacityExceeded { kind, max });
            }
            Ok(())
        }

        bound(ObjectKind::Queue, self.max_tm_queues as u64, MAX_TM_QUEUES as u64)?;
        bound(ObjectKind::Node, self.max_tm_nodes as u64, MAX_NUM_TM_NODES as u64)?;
        bound(ObjectKind::Output, self.num_outputs as u64, MAX_NUM_OUTPUTS as u64)?;
        bound(ObjectKind::Node, self.max_fanin as u64, MAX_TM_NODE_FANIN as u64)?;
        if self.max_levels == 0 || self.max_levels > MAX_LEVELS {
            return Err(TmError::invalid_param(
                "max_levels",
                format!("must be in 1..={MAX_LEVELS}"),
            ));
        }
        if self.max_priorities == 0 || self.max_priorities as usize > MAX_PRIORITIES {
            return Err(TmError::invalid_param(
                "max_priorities",
                format!("must be in 1..={MAX_PRIORITIES}"),
            ));
        }
        if self.num_outputs == 0 {
            return Err(TmError::invalid_param("num_outputs", "at least one output is required"));
        }
        if self.max_fanin == 0 {
            return Err(TmError::invalid_param("max_fanin", "must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_capped_at_five_hundred() {
        assert!(Percent::new(50_000).is_ok());
        assert!(Percent::new(50_001).is_err());
        assert_eq!(Percent::from_ratio(3, 4).raw(), 7_500);
        assert_eq!(Percent::from_ratio(100, 1), Percent::MAX);
        assert_eq!(Percent::from_ratio(0, 0), Percent::ZERO);
        assert_eq!(Percent::from_whole(80).unwrap().raw(), 8_000);
    }

    #[test]
    fn requirements_reject_out_of_range_bounds() {
        let mut req = TmRequirements::default();
        assert!(req.validate().is_ok());

        req.num_outputs = 257;
        assert!(req.validate().unwrap_err().is_capacity());

        let req = TmRequirements {
            max_levels: 9,
            ..TmRequirements::default()
        };
        assert!(matches!(
            req.validate(),
            Err(TmError::InvalidParameter { name: "max_levels", .. })
        ));
    }

    #[test]
    fn config_loads_from_partial_json() {
        let config = TmConfig::from_json(r#"{ "wred_seed": 7, "wheel": { "tick_shift": 4 } }"#)
            .unwrap();
        assert_eq!(config.wred_seed, 7);
        assert_eq!(config.wheel.tick_shift, 4);
        assert_eq!(config.wheel.horizon_cycles, 100 * CYCLES_PER_SEC);
        assert_eq!(config.max_systems, MAX_NUM_SYSTEMS);

        assert!(TmConfig::from_json(r#"{ "max_systems": 0 }"#).is_err());
    }

    #[test]
    fn percent_deserialization_validates() {
        let ok: Percent = serde_json::from_str("2500").unwrap();
        assert_eq!(ok.raw(), 2_500);
        assert!(serde_json::from_str::<Percent>("60000").is_err());
    }
}
