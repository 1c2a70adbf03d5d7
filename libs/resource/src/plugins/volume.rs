//! The volume resource plugin.
//!
//! Tracks a set of host devices per node, each with a byte capacity.
//! Soft bindings (auto source) are scheduled onto devices here; the
//! chosen devices are recorded as a [`VolumePlan`] in the workload's
//! resource args and applied to the bindings when engine args are built.
//!
//! Scheduling rules per replica:
//! - monopoly bindings take an untouched device exclusively (smallest
//!   sufficient device wins);
//! - sized bindings best-fit onto the device with the least sufficient
//!   free space;
//! - unlimited-quota bindings land on the device with the most free
//!   space and consume nothing;
//! - hard bindings naming a tracked device are accounted against it,
//!   other hard bindings pass through untouched.
//!
//! All ties break on device name, so plans are deterministic.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use eru_store::{get_json, put_json, Store};
use eru_types::{NodeResourceInfo, VolumeBinding, VolumeBindings, VolumeMap, VolumePlan, Workload};

use crate::error::ResourceError;
use crate::{AllocResponse, NodeCapacityInfo, Plugin, ReallocResponse, ResourceResult, RollbackToken};

const NAME: &str = "volume";
const MAX_SIMULATED_CAPACITY: i64 = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Record {
    /// device → total bytes
    capacity: BTreeMap<String, i64>,
    /// device → used bytes
    usage: BTreeMap<String, i64>,
    /// devices held exclusively by a monopoly binding
    monopoly: BTreeSet<String>,
}

impl Record {
    fn free(&self, device: &str) -> i64 {
        self.capacity.get(device).copied().unwrap_or(0)
            - self.usage.get(device).copied().unwrap_or(0)
    }

    fn used(&self, device: &str) -> i64 {
        self.usage.get(device).copied().unwrap_or(0)
    }

    fn add_usage(&mut self, device: &str, size: i64) {
        let next = (self.used(device) + size).max(0);
        if next == 0 {
            self.usage.remove(device);
        } else {
            self.usage.insert(device.to_string(), next);
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Request {
    #[serde(default)]
    volumes: Vec<String>,
}

/// Shape of this plugin's per-workload resource args.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WorkloadArgs {
    #[serde(default)]
    volumes: Vec<String>,
    #[serde(default)]
    volume_plan: VolumePlan,
}

fn parse_bindings(value: &Value) -> ResourceResult<VolumeBindings> {
    if value.is_null() {
        return Ok(VolumeBindings::default());
    }
    let request: Request = serde_json::from_value(value.clone())
        .map_err(|e| ResourceError::InvalidRequest(format!("volume request: {e}")))?;
    Ok(VolumeBindings::parse(&request.volumes)?)
}

fn parse_workload_args(value: &Value) -> ResourceResult<(WorkloadArgs, VolumeBindings)> {
    if value.is_null() {
        return Ok((WorkloadArgs::default(), VolumeBindings::default()));
    }
    let args: WorkloadArgs = serde_json::from_value(value.clone())
        .map_err(|e| ResourceError::InvalidRequest(format!("volume args: {e}")))?;
    let bindings = VolumeBindings::parse(&args.volumes)?;
    Ok((args, bindings))
}

/// Volume dimension plugin.
pub struct VolumePlugin {
    store: Arc<dyn Store>,
}

impl VolumePlugin {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn key(&self, nodename: &str) -> String {
        format!("/resource/{NAME}/{nodename}")
    }

    async fn load(&self, nodename: &str) -> ResourceResult<Record> {
        match get_json::<Record>(self.store.as_ref(), &self.key(nodename)).await? {
            Some((record, _)) => Ok(record),
            None => Err(ResourceError::NodeNotFound(nodename.to_string())),
        }
    }

    async fn save(&self, nodename: &str, record: &Record) -> ResourceResult<()> {
        put_json(self.store.as_ref(), &self.key(nodename), record, None).await?;
        Ok(())
    }

    /// Place one replica's bindings onto the record, mutating usage.
    fn alloc_one(
        nodename: &str,
        record: &mut Record,
        bindings: &VolumeBindings,
    ) -> ResourceResult<VolumePlan> {
        let (soft, hard) = bindings.divide();

        let mut ordered: Vec<&VolumeBinding> = soft.0.iter().collect();
        // monopoly first, then by size descending, name as the final tie
        ordered.sort_by(|a, b| {
            b.requires_monopoly()
                .cmp(&a.requires_monopoly())
                .then(b.size_in_bytes.cmp(&a.size_in_bytes))
                .then(a.destination.cmp(&b.destination))
        });

        let mut plan = VolumePlan::new();
        for vb in ordered {
            let device = if vb.requires_monopoly() {
                // an untouched device, smallest sufficient one
                record
                    .capacity
                    .iter()
                    .filter(|(device, total)| {
                        record.used(device) == 0
                            && !record.monopoly.contains(*device)
                            && **total >= vb.size_in_bytes
                    })
                    .min_by_key(|(device, total)| (**total, (*device).clone()))
                    .map(|(device, _)| device.clone())
            } else if vb.size_in_bytes > 0 {
                // best fit: least sufficient free space
                record
                    .capacity
                    .keys()
                    .filter(|device| {
                        !record.monopoly.contains(*device) && record.free(device) >= vb.size_in_bytes
                    })
                    .min_by_key(|device| (record.free(device), (*device).clone()))
                    .cloned()
            } else {
                // unlimited quota: most free space
                record
                    .capacity
                    .keys()
                    .filter(|device| !record.monopoly.contains(*device))
                    .max_by(|a, b| record.free(a).cmp(&record.free(b)).then(b.cmp(a)))
                    .cloned()
            };

            let Some(device) = device else {
                return Err(ResourceError::Insufficient {
                    nodename: nodename.to_string(),
                    detail: format!("no device can hold {vb}"),
                });
            };
            record.add_usage(&device, vb.size_in_bytes);
            if vb.requires_monopoly() {
                record.monopoly.insert(device.clone());
            }
            plan.insert(
                vb,
                VolumeMap {
                    device,
                    size: vb.size_in_bytes,
                },
            );
        }

        for vb in hard.iter() {
            if record.capacity.contains_key(&vb.source) {
                if record.free(&vb.source) < vb.size_in_bytes {
                    return Err(ResourceError::Insufficient {
                        nodename: nodename.to_string(),
                        detail: format!("device {} cannot hold {vb}", vb.source),
                    });
                }
                record.add_usage(&vb.source, vb.size_in_bytes);
            }
        }
        Ok(plan)
    }

    /// True if one replica of `bindings` consumes anything on this record.
    fn consumes(record: &Record, bindings: &VolumeBindings) -> bool {
        bindings.iter().any(|vb| {
            vb.requires_monopoly()
                || (vb.requires_schedule() && vb.size_in_bytes > 0)
                || (!vb.requires_schedule()
                    && vb.size_in_bytes > 0
                    && record.capacity.contains_key(&vb.source))
        })
    }

    fn usage_rate_of(record: &Record) -> f64 {
        let total: i64 = record.capacity.values().sum();
        if total <= 0 {
            return 0.0;
        }
        let used: i64 = record.usage.values().sum();
        used as f64 / total as f64
    }

    /// Release (or with `apply`, re-apply) a workload's accounted bytes.
    fn shift_args(record: &mut Record, args: &Value, apply: bool) -> ResourceResult<()> {
        let (workload_args, bindings) = parse_workload_args(args)?;
        let sign = if apply { 1 } else { -1 };
        for vb in bindings.iter() {
            if let Some(vmap) = workload_args.volume_plan.get_volume_map(vb) {
                record.add_usage(&vmap.device, sign * vmap.size);
                if vb.flags.contains('m') {
                    if apply {
                        record.monopoly.insert(vmap.device.clone());
                    } else {
                        record.monopoly.remove(&vmap.device);
                    }
                }
            } else if !vb.requires_schedule() && record.capacity.contains_key(&vb.source) {
                record.add_usage(&vb.source, sign * vb.size_in_bytes);
            }
        }
        Ok(())
    }

    fn engine_args_of(bindings: &VolumeBindings, plan: &VolumePlan) -> Value {
        json!({ "volumes": bindings.apply_plan(plan).to_string_slice(false, true) })
    }

    fn resource_args_of(bindings: &VolumeBindings, plan: &VolumePlan) -> ResourceResult<Value> {
        Ok(serde_json::to_value(WorkloadArgs {
            volumes: bindings.to_string_slice(false, false),
            volume_plan: plan.clone(),
        })?)
    }

    fn info_of(record: &Record) -> ResourceResult<NodeResourceInfo> {
        Ok(NodeResourceInfo {
            capacity: json!({ "volumes": record.capacity }),
            usage: json!({ "volumes": record.usage, "monopoly": record.monopoly }),
        })
    }
}

#[async_trait]
impl Plugin for VolumePlugin {
    fn name(&self) -> &str {
        NAME
    }

    async fn get_nodes_deploy_capacity(
        &self,
        nodenames: &[String],
        request: &Value,
    ) -> ResourceResult<HashMap<String, NodeCapacityInfo>> {
        let bindings = parse_bindings(request)?;
        let mut result = HashMap::new();
        for nodename in nodenames {
            let Ok(record) = self.load(nodename).await else {
                continue;
            };
            let capacity = if bindings.is_empty() || !Self::consumes(&record, &bindings) {
                // nothing is consumed, so only hard devices can refuse
                let mut scratch = record.clone();
                match Self::alloc_one(nodename, &mut scratch, &bindings) {
                    Ok(_) => i64::MAX,
                    Err(_) => 0,
                }
            } else {
                let mut scratch = record.clone();
                let mut count = 0;
                while count < MAX_SIMULATED_CAPACITY
                    && Self::alloc_one(nodename, &mut scratch, &bindings).is_ok()
                {
                    count += 1;
                }
                count
            };
            result.insert(
                nodename.clone(),
                NodeCapacityInfo {
                    nodename: nodename.clone(),
                    capacity,
                    usage_rate: Self::usage_rate_of(&record),
                },
            );
        }
        Ok(result)
    }

    async fn alloc(
        &self,
        nodename: &str,
        count: usize,
        request: &Value,
    ) -> ResourceResult<(AllocResponse, RollbackToken)> {
        let bindings = parse_bindings(request)?;
        let mut record = self.load(nodename).await?;

        let mut engine_args = Vec::with_capacity(count);
        let mut resource_args = Vec::with_capacity(count);
        for _ in 0..count {
            let plan = Self::alloc_one(nodename, &mut record, &bindings)?;
            engine_args.push(Self::engine_args_of(&bindings, &plan));
            resource_args.push(Self::resource_args_of(&bindings, &plan)?);
        }
        self.save(nodename, &record).await?;
        debug!(nodename, count, "volume alloc");

        let token = RollbackToken {
            plugin: NAME.to_string(),
            nodename: nodename.to_string(),
            release: resource_args.clone(),
            reapply: Vec::new(),
        };
        Ok((AllocResponse { engine_args, resource_args }, token))
    }

    async fn realloc(
        &self,
        nodename: &str,
        origin: &Value,
        delta: &Value,
    ) -> ResourceResult<(ReallocResponse, RollbackToken)> {
        let (_, origin_bindings) = parse_workload_args(origin)?;
        let delta_bindings = parse_bindings(delta)?;
        let merged = origin_bindings.merge(&[&delta_bindings]);

        let mut record = self.load(nodename).await?;
        Self::shift_args(&mut record, origin, false)?;
        let plan = Self::alloc_one(nodename, &mut record, &merged)?;
        self.save(nodename, &record).await?;

        let new_args = Self::resource_args_of(&merged, &plan)?;
        let response = ReallocResponse {
            engine_args: Self::engine_args_of(&merged, &plan),
            resource_args: new_args.clone(),
        };
        let token = RollbackToken {
            plugin: NAME.to_string(),
            nodename: nodename.to_string(),
            release: vec![new_args],
            reapply: if origin.is_null() { Vec::new() } else { vec![origin.clone()] },
        };
        Ok((response, token))
    }

    async fn free(&self, token: &RollbackToken) -> ResourceResult<()> {
        let mut record = self.load(&token.nodename).await?;
        for args in &token.release {
            Self::shift_args(&mut record, args, false)?;
        }
        for args in &token.reapply {
            Self::shift_args(&mut record, args, true)?;
        }
        self.save(&token.nodename, &record).await
    }

    async fn get_node_resource_info(
        &self,
        nodename: &str,
        workloads: &[Workload],
        fix: bool,
    ) -> ResourceResult<(NodeResourceInfo, Vec<String>)> {
        let mut record = self.load(nodename).await?;

        let mut expected = Record {
            capacity: record.capacity.clone(),
            ..Default::default()
        };
        for workload in workloads {
            Self::shift_args(&mut expected, &workload.resource_args_for(NAME), true)?;
        }

        let mut diffs = Vec::new();
        let devices: BTreeSet<&String> =
            record.usage.keys().chain(expected.usage.keys()).collect();
        for device in devices {
            let recorded = record.used(device);
            let actual = expected.used(device);
            if recorded != actual {
                diffs.push(format!(
                    "node {nodename} device {device} usage inconsistent: recorded {recorded}, in use {actual}"
                ));
            }
        }
        if record.monopoly != expected.monopoly {
            diffs.push(format!(
                "node {nodename} monopoly devices inconsistent: recorded {:?}, in use {:?}",
                record.monopoly, expected.monopoly
            ));
        }

        if fix && !diffs.is_empty() {
            record.usage = expected.usage.clone();
            record.monopoly = expected.monopoly.clone();
            self.save(nodename, &record).await?;
        }
        Ok((Self::info_of(&record)?, diffs))
    }

    async fn get_remap_args(
        &self,
        _nodename: &str,
        workloads: &[Workload],
    ) -> ResourceResult<HashMap<String, Value>> {
        let mut args = HashMap::new();
        for workload in workloads {
            let recorded = workload.resource_args_for(NAME);
            if recorded.is_null() {
                continue;
            }
            let (workload_args, bindings) = parse_workload_args(&recorded)?;
            args.insert(
                workload.id.clone(),
                Self::engine_args_of(&bindings, &workload_args.volume_plan),
            );
        }
        Ok(args)
    }

    async fn set_node_resource_capacity(
        &self,
        nodename: &str,
        capacity: &Value,
        delta: bool,
    ) -> ResourceResult<NodeResourceInfo> {
        #[derive(Deserialize)]
        struct CapacityValue {
            #[serde(default)]
            volumes: BTreeMap<String, i64>,
        }
        let value: CapacityValue = serde_json::from_value(capacity.clone())
            .map_err(|e| ResourceError::InvalidRequest(format!("volume capacity: {e}")))?;

        let mut record = self.load(nodename).await?;
        if delta {
            for (device, size) in value.volumes {
                let entry = record.capacity.entry(device.clone()).or_insert(0);
                *entry += size;
                if *entry <= 0 {
                    record.capacity.remove(&device);
                }
            }
        } else {
            record.capacity = value.volumes;
        }
        self.save(nodename, &record).await?;
        Self::info_of(&record)
    }

    async fn set_node_resource_usage(
        &self,
        nodename: &str,
        usage: &Value,
        delta: bool,
    ) -> ResourceResult<NodeResourceInfo> {
        #[derive(Deserialize)]
        struct UsageValue {
            #[serde(default)]
            volumes: BTreeMap<String, i64>,
            #[serde(default)]
            monopoly: BTreeSet<String>,
        }
        let value: UsageValue = serde_json::from_value(usage.clone())
            .map_err(|e| ResourceError::InvalidRequest(format!("volume usage: {e}")))?;

        let mut record = self.load(nodename).await?;
        if delta {
            for (device, size) in value.volumes {
                record.add_usage(&device, size);
            }
            record.monopoly.extend(value.monopoly);
        } else {
            record.usage = value.volumes;
            record.monopoly = value.monopoly;
        }
        self.save(nodename, &record).await?;
        Self::info_of(&record)
    }

    async fn add_node(&self, nodename: &str, request: &Value) -> ResourceResult<NodeResourceInfo> {
        #[derive(Deserialize, Default)]
        struct AddValue {
            #[serde(default)]
            volumes: BTreeMap<String, i64>,
        }
        let value: AddValue = if request.is_null() {
            AddValue::default()
        } else {
            serde_json::from_value(request.clone())
                .map_err(|e| ResourceError::InvalidRequest(format!("volume capacity: {e}")))?
        };
        let record = Record {
            capacity: value.volumes,
            ..Default::default()
        };
        let bytes = serde_json::to_vec(&record)?;
        match self.store.put(&self.key(nodename), bytes, Some(0)).await {
            Ok(_) => Self::info_of(&record),
            Err(eru_store::StoreError::AlreadyExists(_)) => {
                Err(ResourceError::NodeExists(nodename.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_node(&self, nodename: &str) -> ResourceResult<()> {
        self.store.delete(&self.key(nodename)).await?;
        Ok(())
    }
}
