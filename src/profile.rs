//! Shaper, WRED, scheduler and threshold profiles.
//!
//! Profiles are created independently of any TM system, in a registry shared
//! by every system of a [`crate::context::TmContext`]. Queues and nodes attach
//! to profiles by id; a profile cannot be destroyed while anything is
//! attached to it. Systems keep a copy of the parameters they attached and
//! refresh those copies whenever the registry version moves, so the packet
//! path never takes the registry lock.

use crate::config::{
    Percent, MAX_PRIORITIES, MAX_SCHED_WEIGHT, MAX_SHAPER_BW, MIN_SCHED_WEIGHT, MIN_SHAPER_BW,
};
use crate::error::{ObjectKind, TmError, TmResult};
use crate::handle::{Handle, SchedId, ShaperId, Slab, ThresholdId, WredId};
use crate::name_table::NameTable;
use crate::packet::Color;
use crate::priority::PriorityTable;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Token-bucket shaper parameters. Rates are in units of 1000 bytes/second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaperParams {
    pub commit_rate: u32,
    /// Commit bucket depth in bytes.
    pub commit_burst: u32,
    pub peak_rate: u32,
    pub peak_burst: u32,
    /// When false only the commit bucket is used.
    pub dual_rate: bool,
    /// Per-packet length correction (framing overhead), may be negative.
    pub len_adjust: i8,
}

impl ShaperParams {
    pub fn single_rate(commit_rate: u32, commit_burst: u32) -> Self {
        Self {
            commit_rate,
            commit_burst,
            peak_rate: commit_rate,
            peak_burst: commit_burst,
            dual_rate: false,
            len_adjust: 0,
        }
    }

    pub fn dual_rate(commit_rate: u32, commit_burst: u32, peak_rate: u32, peak_burst: u32) -> Self {
        Self {
            commit_rate,
            commit_burst,
            peak_rate,
            peak_burst,
            dual_rate: true,
            len_adjust: 0,
        }
    }
}

/// WFQ accounting mode for one priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WfqMode {
    /// Every packet costs one unit regardless of size.
    Frame,
    /// Packets cost their length in bytes.
    #[default]
    Byte,
}

/// Scheduler parameters applied to the child they are attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedParams {
    pub modes: PriorityTable<WfqMode>,
    pub weights: PriorityTable<u8>,
}

impl SchedParams {
    pub fn uniform(weight: u8) -> Self {
        Self {
            modes: PriorityTable::splat(WfqMode::Byte),
            weights: PriorityTable::splat(weight),
        }
    }

    pub fn frame_based(weight: u8) -> Self {
        Self {
            modes: PriorityTable::splat(WfqMode::Frame),
            weights: PriorityTable::splat(weight),
        }
    }
}

impl Default for SchedParams {
    fn default() -> Self {
        Self::uniform(MIN_SCHED_WEIGHT)
    }
}

/// One WRED drop curve.
///
/// Below `min_threshold` nothing is dropped; between `min_threshold` and
/// `med_threshold` the probability rises linearly to `med_drop_prob`; from
/// `med_threshold` to 100 % fullness it rises to `max_drop_prob`, and stays
/// there beyond 100 %.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WredCurve {
    pub enabled: bool,
    pub min_threshold: Percent,
    pub med_threshold: Percent,
    pub med_drop_prob: Percent,
    pub max_drop_prob: Percent,
}

impl WredCurve {
    pub const DISABLED: WredCurve = WredCurve {
        enabled: false,
        min_threshold: Percent::ZERO,
        med_threshold: Percent::ZERO,
        med_drop_prob: Percent::ZERO,
        max_drop_prob: Percent::ZERO,
    };
}

/// WRED parameters, one curve per packet drop-precedence color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WredParams {
    pub curves: [WredCurve; 3],
    /// Mark ECN-capable packets instead of dropping them.
    pub mark_ecn: bool,
    /// Compute fullness from bytes rather than packets.
    pub use_byte_fullness: bool,
}

impl WredParams {
    /// The same curve for every color.
    pub fn uniform(curve: WredCurve) -> Self {
        Self {
            curves: [curve; 3],
            mark_ecn: false,
            use_byte_fullness: false,
        }
    }

    pub fn curve(&self, color: Color) -> &WredCurve {
        &self.curves[color.index()]
    }
}

/// Hard admission ceiling; `None` leaves that dimension unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ThresholdParams {
    pub max_pkts: Option<u32>,
    pub max_bytes: Option<u64>,
}

/// Parameters stored in the registry.
pub trait ProfileParams: Clone + std::fmt::Debug + Send + Sync + 'static {
    type Id: ProfileId<Params = Self>;

    fn validate(&self) -> TmResult<()>;

    #[doc(hidden)]
    fn table(registry: &ProfileRegistry) -> &ProfileTable<Self>;

    #[doc(hidden)]
    fn table_mut(registry: &mut ProfileRegistry) -> &mut ProfileTable<Self>;
}

/// Typed profile handle, mapping back to its parameter type.
pub trait ProfileId: Copy + Into<Handle> + From<Handle> + std::fmt::Debug {
    type Params: ProfileParams<Id = Self>;
    const KIND: ObjectKind;
}

fn check_rate(name: &'static str, rate: u32) -> TmResult<()> {
    if !(MIN_SHAPER_BW..=MAX_SHAPER_BW).contains(&rate) {
        return Err(TmError::invalid_param(
            name,
            format!("{rate} is outside [{MIN_SHAPER_BW}, {MAX_SHAPER_BW}]"),
        ));
    }
    Ok(())
}

impl ProfileParams for ShaperParams {
    type Id = ShaperId;

    fn validate(&self) -> TmResult<()> {
        check_rate("commit_rate", self.commit_rate)?;
        if self.commit_burst == 0 {
            return Err(TmError::invalid_param("commit_burst", "must be > 0"));
        }
        if self.dual_rate {
            check_rate("peak_rate", self.peak_rate)?;
            if self.peak_rate < self.commit_rate {
                return Err(TmError::invalid_param("peak_rate", "must be >= commit_rate"));
            }
            if self.peak_burst == 0 {
                return Err(TmError::invalid_param("peak_burst", "must be > 0"));
            }
        }
        Ok(())
    }

    fn table(registry: &ProfileRegistry) -> &ProfileTable<Self> {
        &registry.shapers
    }

    fn table_mut(registry: &mut ProfileRegistry) -> &mut ProfileTable<Self> {
        &mut registry.shapers
    }
}

impl ProfileParams for WredParams {
    type Id = WredId;

    fn validate(&self) -> TmResult<()> {
        for curve in self.curves.iter().filter(|curve| curve.enabled) {
            if curve.min_threshold > curve.med_threshold {
                return Err(TmError::invalid_param(
                    "min_threshold",
                    "must not exceed med_threshold",
                ));
            }
            if curve.med_threshold > Percent::HUNDRED {
                return Err(TmError::invalid_param("med_threshold", "must be <= 100%"));
            }
            if curve.med_drop_prob > curve.max_drop_prob || curve.max_drop_prob > Percent::HUNDRED {
                return Err(TmError::invalid_param(
                    "max_drop_prob",
                    "drop probabilities must satisfy med <= max <= 100%",
                ));
            }
        }
        Ok(())
    }

    fn table(registry: &ProfileRegistry) -> &ProfileTable<Self> {
        &registry.wreds
    }

    fn table_mut(registry: &mut ProfileRegistry) -> &mut ProfileTable<Self> {
        &mut registry.wreds
    }
}

impl ProfileParams for SchedParams {
    type Id = SchedId;

    fn validate(&self) -> TmResult<()> {
        if self.weights.len() != MAX_PRIORITIES || self.modes.len() != MAX_PRIORITIES {
            return Err(TmError::invalid_param(
                "weights",
                format!("one weight and one mode per class ({MAX_PRIORITIES}) are required"),
            ));
        }
        for (priority, weight) in self.weights.iter() {
            if !(MIN_SCHED_WEIGHT..=MAX_SCHED_WEIGHT).contains(weight) {
                return Err(TmError::invalid_param(
                    "weights",
                    format!("weight {weight} for {priority} is outside [{MIN_SCHED_WEIGHT}, {MAX_SCHED_WEIGHT}]"),
                ));
            }
        }
        Ok(())
    }

    fn table(registry: &ProfileRegistry) -> &ProfileTable<Self> {
        &registry.scheds
    }

    fn table_mut(registry: &mut ProfileRegistry) -> &mut ProfileTable<Self> {
        &mut registry.scheds
    }
}

impl ProfileParams for ThresholdParams {
    type Id = ThresholdId;

    fn validate(&self) -> TmResult<()> {
        if self.max_pkts.is_none() && self.max_bytes.is_none() {
            return Err(TmError::invalid_param(
                "threshold",
                "at least one of max_pkts / max_bytes must be set",
            ));
        }
        if self.max_pkts == Some(0) || self.max_bytes == Some(0) {
            return Err(TmError::invalid_param("threshold", "limits must be > 0"));
        }
        Ok(())
    }

    fn table(registry: &ProfileRegistry) -> &ProfileTable<Self> {
        &registry.thresholds
    }

    fn table_mut(registry: &mut ProfileRegistry) -> &mut ProfileTable<Self> {
        &mut registry.thresholds
    }
}

macro_rules! profile_id {
    ($id:ty => $params:ty) => {
        impl ProfileId for $id {
            type Params = $params;
            const KIND: ObjectKind = <$id>::KIND;
        }
    };
}

profile_id!(ShaperId => ShaperParams);
profile_id!(WredId => WredParams);
profile_id!(SchedId => SchedParams);
profile_id!(ThresholdId => ThresholdParams);

#[derive(Debug)]
struct ProfileEntry<P> {
    name: Option<String>,
    params: P,
    attachments: u32,
}

/// One arena of profiles of a single kind.
#[derive(Debug)]
pub struct ProfileTable<P> {
    entries: Slab<ProfileEntry<P>>,
}

impl<P> ProfileTable<P> {
    fn new(kind: ObjectKind, max: u32) -> Self {
        Self {
            entries: Slab::new(kind, max),
        }
    }
}

/// Every profile known to one context.
#[derive(Debug)]
pub struct ProfileRegistry {
    shapers: ProfileTable<ShaperParams>,
    wreds: ProfileTable<WredParams>,
    scheds: ProfileTable<SchedParams>,
    thresholds: ProfileTable<ThresholdParams>,
    names: NameTable,
}

impl ProfileRegistry {
    fn new(max_per_kind: u32) -> Self {
        Self {
            shapers: ProfileTable::new(ObjectKind::ShaperProfile, max_per_kind),
            wreds: ProfileTable::new(ObjectKind::WredProfile, max_per_kind),
            scheds: ProfileTable::new(ObjectKind::SchedProfile, max_per_kind),
            thresholds: ProfileTable::new(ObjectKind::ThresholdProfile, max_per_kind),
            names: NameTable::new(),
        }
    }
}

/// Cloneable handle to a shared [`ProfileRegistry`].
#[derive(Debug, Clone)]
pub struct Profiles {
    inner: Arc<RwLock<ProfileRegistry>>,
    version: Arc<AtomicU64>,
}

impl Profiles {
    pub fn new(max_per_kind: u32) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ProfileRegistry::new(max_per_kind))),
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bumped on every parameter update; systems compare it without locking.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn create<P: ProfileParams>(&self, name: Option<&str>, params: P) -> TmResult<P::Id> {
        params.validate()?;
        let mut registry = self.inner.write();
        if let Some(name) = name {
            registry.names.check(P::Id::KIND, name)?;
        }
        let handle = P::table_mut(&mut registry).entries.insert(ProfileEntry {
            name: name.map(str::to_owned),
            params,
            attachments: 0,
        })?;
        if let Some(name) = name {
            registry.names.add(P::Id::KIND, name, handle.to_u64())?;
        }
        let kind = P::Id::KIND;
        tracing::debug!(%kind, ?handle, "profile created");
        Ok(P::Id::from(handle))
    }

    /// Replace a profile's parameters; attached systems pick up the change on
    /// their next scheduling pass.
    pub fn update<P: ProfileParams>(&self, id: P::Id, params: P) -> TmResult<()> {
        params.validate()?;
        let mut registry = self.inner.write();
        P::table_mut(&mut registry).entries.get_mut(id.into())?.params = params;
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn destroy<I: ProfileId>(&self, id: I) -> TmResult<()> {
        let mut registry = self.inner.write();
        let table = I::Params::table_mut(&mut registry);
        let entry = table.entries.get(id.into())?;
        if entry.attachments > 0 {
            return Err(TmError::InUse {
                kind: I::KIND,
                attachments: entry.attachments,
            });
        }
        let entry = table.entries.remove(id.into())?;
        if let Some(name) = entry.name {
            registry.names.remove(I::KIND, &name);
        }
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn params<I: ProfileId>(&self, id: I) -> TmResult<I::Params> {
        let registry = self.inner.read();
        Ok(I::Params::table(&registry).entries.get(id.into())?.params.clone())
    }

    pub fn lookup<I: ProfileId>(&self, name: &str) -> Option<I> {
        self.inner
            .read()
            .names
            .lookup(I::KIND, name)
            .map(|raw| I::from(Handle::from_u64(raw)))
    }

    /// Number of queues/nodes currently attached to a profile.
    pub fn attachments<I: ProfileId>(&self, id: I) -> TmResult<u32> {
        let registry = self.inner.read();
        Ok(I::Params::table(&registry).entries.get(id.into())?.attachments)
    }

    pub(crate) fn attach<I: ProfileId>(&self, id: I) -> TmResult<I::Params> {
        let mut registry = self.inner.write();
        let entry = I::Params::table_mut(&mut registry).entries.get_mut(id.into())?;
        entry.attachments += 1;
        Ok(entry.params.clone())
    }

    pub(crate) fn detach<I: ProfileId>(&self, id: I) {
        let mut registry = self.inner.write();
        if let Ok(entry) = I::Params::table_mut(&mut registry).entries.get_mut(id.into()) {
            entry.attachments = entry.attachments.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve(min: u16, med: u16, med_prob: u16, max_prob: u16) -> WredCurve {
        WredCurve {
            enabled: true,
            min_threshold: Percent::from_whole(min).unwrap(),
            med_threshold: Percent::from_whole(med).unwrap(),
            med_drop_prob: Percent::from_whole(med_prob).unwrap(),
            max_drop_prob: Percent::from_whole(max_prob).unwrap(),
        }
    }

    #[test]
    fn shaper_rates_are_range_checked() {
        let profiles = Profiles::new(8);
        assert!(profiles.create(None, ShaperParams::single_rate(0, 1500)).is_err());
        assert!(profiles
            .create(None, ShaperParams::single_rate(MAX_SHAPER_BW + 1, 1500))
            .is_err());
        assert!(profiles
            .create(None, ShaperParams::dual_rate(100, 1500, 50, 1500))
            .is_err());
        assert!(profiles.create(None, ShaperParams::single_rate(100, 1500)).is_ok());
    }

    #[test]
    fn sched_weights_must_be_nonzero() {
        let profiles = Profiles::new(8);
        assert!(profiles.create(None, SchedParams::uniform(0)).is_err());
        assert!(profiles.create(None, SchedParams::uniform(255)).is_ok());
    }

    #[test]
    fn short_sched_tables_are_rejected() {
        let profiles = Profiles::new(8);
        let params: SchedParams = serde_json::from_str(
            r#"{ "modes": { "values": ["byte"] }, "weights": { "values": [1] } }"#,
        )
        .unwrap();
        assert!(profiles.create(None, params).is_err());
    }

    #[test]
    fn wred_curves_are_validated() {
        let profiles = Profiles::new(8);
        assert!(profiles.create(None, WredParams::uniform(curve(80, 40, 10, 50))).is_err());
        assert!(profiles.create(None, WredParams::uniform(curve(40, 80, 60, 50))).is_err());
        assert!(profiles.create(None, WredParams::uniform(curve(40, 80, 10, 50))).is_ok());
    }

    #[test]
    fn attached_profiles_cannot_be_destroyed() {
        let profiles = Profiles::new(8);
        let id = profiles
            .create(Some("gold"), ThresholdParams { max_pkts: Some(10), max_bytes: None })
            .unwrap();
        assert_eq!(profiles.lookup::<ThresholdId>("gold"), Some(id));

        profiles.attach(id).unwrap();
        assert!(matches!(
            profiles.destroy(id),
            Err(TmError::InUse { attachments: 1, .. })
        ));
        profiles.detach(id);
        profiles.destroy(id).unwrap();
        assert_eq!(profiles.lookup::<ThresholdId>("gold"), None);
        assert!(profiles.params(id).unwrap_err().is_invalid_handle());
    }

    #[test]
    fn updates_bump_the_version() {
        let profiles = Profiles::new(8);
        let id = profiles.create(None, SchedParams::uniform(4)).unwrap();
        let before = profiles.version();
        profiles.update(id, SchedParams::uniform(8)).unwrap();
        assert!(profiles.version() > before);
        assert_eq!(profiles.params(id).unwrap().weights, PriorityTable::splat(8));
    }

    #[test]
    fn duplicate_names_are_rejected_without_leaking_slots() {
        let profiles = Profiles::new(8);
        profiles.create(Some("edge"), ShaperParams::single_rate(10, 100)).unwrap();
        assert!(profiles
            .create(Some("edge"), ShaperParams::single_rate(10, 100))
            .is_err());
        assert_eq!(profiles.inner.read().shapers.entries.len(), 1);
    }
}
