//! Volume binding algebra.
//!
//! A volume binding is the wire form `src:dst[:flags[:size[:rIOPS:wIOPS:rBW:wBW]]]`
//! with exactly 2, 3, 4 or 8 colon-separated fields. A source equal to
//! (or ending in) `AUTO` marks the binding as *soft*: the volume plugin
//! must pick a concrete device for it. Everything else is *hard*.
//!
//! Flags are single-letter tokens kept canonically sorted. The `m` flag
//! ("monopoly") is a scheduler hint, not a runtime attribute, and is
//! stripped when emitting in normalized form.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::de::{Deserializer, Error as DeError};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

const AUTO: &str = "AUTO";

/// A single volume binding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeBinding {
    pub source: String,
    pub destination: String,
    /// Single-letter flags, sorted ascending.
    pub flags: String,
    pub size_in_bytes: i64,
    pub read_iops: i64,
    pub write_iops: i64,
    pub read_bytes: i64,
    pub write_bytes: i64,
}

fn parse_i64(field: &str, raw: &str) -> Result<i64, CoreError> {
    field
        .parse::<i64>()
        .map_err(|_| CoreError::InvalidVolumeSpec(raw.to_string()))
}

fn sort_flags(flags: &str) -> String {
    let mut chars: Vec<char> = flags.chars().collect();
    chars.sort_unstable();
    chars.into_iter().collect()
}

impl VolumeBinding {
    /// Parse a raw volume string.
    ///
    /// Arities 2, 3, 4 and 8 are the only legal ones; numeric fields must
    /// parse as signed 64-bit integers. Flags are sorted before validation.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let parts: Vec<&str> = raw.split(':').collect();
        let mut vb = VolumeBinding::default();

        if !matches!(parts.len(), 2 | 3 | 4 | 8) {
            return Err(CoreError::InvalidVolumeSpec(raw.to_string()));
        }
        if parts.len() == 8 {
            vb.read_iops = parse_i64(parts[4], raw)?;
            vb.write_iops = parse_i64(parts[5], raw)?;
            vb.read_bytes = parse_i64(parts[6], raw)?;
            vb.write_bytes = parse_i64(parts[7], raw)?;
        }
        if parts.len() >= 4 {
            vb.size_in_bytes = parse_i64(parts[3], raw)?;
        }
        if parts.len() >= 3 {
            vb.flags = parts[2].to_string();
        }
        vb.source = parts[0].to_string();
        vb.destination = parts[1].to_string();

        vb.flags = sort_flags(&vb.flags);
        vb.validate()?;
        Ok(vb)
    }

    /// Validate the binding invariants.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.destination.is_empty() {
            return Err(CoreError::InvalidVolumeSpec(format!(
                "dest must be provided: {self:?}"
            )));
        }
        if self.requires_monopoly() && (self.requires_unlimited_quota() || self.has_io_quota()) {
            return Err(CoreError::InvalidVolumeSpec(format!(
                "monopoly volume must not be limited: {self:?}"
            )));
        }
        if !self.valid_io_parameters() {
            return Err(CoreError::InvalidVolumeSpec(format!(
                "io parameters must not be negative: {self:?}"
            )));
        }
        Ok(())
    }

    /// True if the source is to be chosen by the volume plugin.
    pub fn requires_schedule(&self) -> bool {
        self.source.ends_with(AUTO)
    }

    /// True for a soft binding with no size limit.
    pub fn requires_unlimited_quota(&self) -> bool {
        self.requires_schedule() && self.size_in_bytes == 0
    }

    /// True for a soft binding that demands its device exclusively.
    pub fn requires_monopoly(&self) -> bool {
        self.requires_schedule() && self.flags.contains('m')
    }

    fn has_io_quota(&self) -> bool {
        self.read_iops != 0 || self.write_iops != 0 || self.read_bytes != 0 || self.write_bytes != 0
    }

    fn valid_io_parameters(&self) -> bool {
        self.read_iops >= 0 && self.write_iops >= 0 && self.read_bytes >= 0 && self.write_bytes >= 0
    }

    /// Emit the wire form.
    ///
    /// With `normalize`, `m` is stripped and an `o` flag ("exclusive
    /// direction") expands `r`→`ro`, `w`→`wo`; the expanded letters are
    /// re-sorted into a flat string. Without `normalize` the stored flags
    /// are emitted untouched, so `parse(emit(vb))` round-trips.
    ///
    /// The shortest legal arity is chosen: 8 fields whenever an IO quota
    /// is set, 2 fields when flags are empty and size is zero, 4 otherwise.
    pub fn to_volume_string(&self, normalize: bool) -> String {
        let mut flags = self.flags.clone();
        if normalize {
            flags.retain(|c| c != 'm');
            if flags.contains('o') {
                flags = flags
                    .replace('o', "")
                    .replace('r', "ro")
                    .replace('w', "wo");
                flags = sort_flags(&flags);
            }
        }

        if self.has_io_quota() {
            format!(
                "{}:{}:{}:{}:{}:{}:{}:{}",
                self.source,
                self.destination,
                flags,
                self.size_in_bytes,
                self.read_iops,
                self.write_iops,
                self.read_bytes,
                self.write_bytes
            )
        } else if self.flags.is_empty() && self.size_in_bytes == 0 {
            format!("{}:{}", self.source, self.destination)
        } else {
            format!(
                "{}:{}:{}:{}",
                self.source, self.destination, flags, self.size_in_bytes
            )
        }
    }
}

impl fmt::Display for VolumeBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_volume_string(false))
    }
}

/// A concrete device assignment for one soft binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMap {
    /// Host device path chosen by the plugin.
    pub device: String,
    /// Bytes accounted against the device.
    pub size: i64,
}

/// Mapping from soft bindings to their chosen devices.
///
/// Keyed by the binding's non-normalized wire form, which is unique per
/// (source, destination, flags) group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumePlan(pub HashMap<String, VolumeMap>);

impl VolumePlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, vb: &VolumeBinding, vmap: VolumeMap) {
        self.0.insert(vb.to_volume_string(false), vmap);
    }

    pub fn get_volume_map(&self, vb: &VolumeBinding) -> Option<&VolumeMap> {
        self.0.get(&vb.to_volume_string(false))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &VolumeMap)> {
        self.0.iter()
    }
}

/// An ordered collection of volume bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeBindings(pub Vec<VolumeBinding>);

impl VolumeBindings {
    /// Parse a list of raw volume strings.
    pub fn parse<S: AsRef<str>>(volumes: &[S]) -> Result<Self, CoreError> {
        let mut bindings = Vec::with_capacity(volumes.len());
        for raw in volumes {
            bindings.push(VolumeBinding::parse(raw.as_ref())?);
        }
        Ok(Self(bindings))
    }

    /// Emit all bindings, optionally sorted lexicographically by their
    /// non-normalized form.
    pub fn to_string_slice(&self, sorted: bool, normalize: bool) -> Vec<String> {
        let mut refs: Vec<&VolumeBinding> = self.0.iter().collect();
        if sorted {
            refs.sort_by_key(|vb| vb.to_volume_string(false));
        }
        refs.iter()
            .map(|vb| vb.to_volume_string(normalize))
            .collect()
    }

    /// Partition into (soft, hard) by the auto-source test.
    pub fn divide(&self) -> (VolumeBindings, VolumeBindings) {
        let mut soft = Vec::new();
        let mut hard = Vec::new();
        for vb in &self.0 {
            if vb.requires_schedule() {
                soft.push(vb.clone());
            } else {
                hard.push(vb.clone());
            }
        }
        (VolumeBindings(soft), VolumeBindings(hard))
    }

    /// Replace soft sources with the devices the plan assigned.
    ///
    /// Bindings the plan does not cover are kept unchanged. Returns a new
    /// sequence; `self` is untouched.
    pub fn apply_plan(&self, plan: &VolumePlan) -> VolumeBindings {
        let mut res = Vec::with_capacity(self.0.len());
        for vb in &self.0 {
            let mut new_vb = vb.clone();
            if let Some(vmap) = plan.get_volume_map(vb) {
                new_vb.source = vmap.device.clone();
            }
            res.push(new_vb);
        }
        VolumeBindings(res)
    }

    /// Merge collections by (source, destination, flags) group, summing
    /// all five numeric fields within a group.
    ///
    /// A group whose summed size goes negative encodes a release and is
    /// dropped. Groups that sum to exactly zero are kept, whatever their
    /// IO quotas. Output order is deterministic (sorted by group key).
    pub fn merge(&self, others: &[&VolumeBindings]) -> VolumeBindings {
        let mut groups: BTreeMap<(String, String, String), [i64; 5]> = BTreeMap::new();
        for vbs in std::iter::once(self).chain(others.iter().copied()) {
            for vb in &vbs.0 {
                let key = (vb.source.clone(), vb.destination.clone(), vb.flags.clone());
                let entry = groups.entry(key).or_insert([0; 5]);
                entry[0] += vb.size_in_bytes;
                entry[1] += vb.read_iops;
                entry[2] += vb.write_iops;
                entry[3] += vb.read_bytes;
                entry[4] += vb.write_bytes;
            }
        }

        let mut res = Vec::new();
        for ((source, destination, flags), sums) in groups {
            if sums[0] < 0 {
                continue;
            }
            res.push(VolumeBinding {
                source,
                destination,
                flags,
                size_in_bytes: sums[0],
                read_iops: sums[1],
                write_iops: sums[2],
                read_bytes: sums[3],
                write_bytes: sums[4],
            });
        }
        VolumeBindings(res)
    }

    /// Sum of `size_in_bytes` over all bindings.
    pub fn total_size(&self) -> i64 {
        self.0.iter().map(|vb| vb.size_in_bytes).sum()
    }

    /// Equality of sorted, non-normalized string forms.
    pub fn is_equal(&self, other: &VolumeBindings) -> bool {
        self.to_string_slice(true, false) == other.to_string_slice(true, false)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VolumeBinding> {
        self.0.iter()
    }
}

impl Serialize for VolumeBindings {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for vb in &self.0 {
            seq.serialize_element(&vb.to_volume_string(false))?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for VolumeBindings {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let volumes = Vec::<String>::deserialize(deserializer)?;
        VolumeBindings::parse(&volumes).map_err(D::Error::custom)
    }
}
