//! The cpu-mem resource plugin.
//!
//! Tracks two scalar dimensions per node: cpu cores (fractional, with
//! share granularity) and memory bytes. Requests are quantized to
//! `1/sharebase` of a core; when `maxshare` is non-negative, a fractional
//! remainder larger than `maxshare` pieces is rounded up to a whole core.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use eru_store::{get_json, put_json, Store};
use eru_types::{NodeResourceInfo, Workload};

use crate::error::ResourceError;
use crate::{AllocResponse, NodeCapacityInfo, Plugin, ReallocResponse, ResourceResult, RollbackToken};

const NAME: &str = "cpumem";
const CPU_PERIOD: i64 = 100_000;
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
struct CpuMem {
    #[serde(default)]
    cpu: f64,
    #[serde(default)]
    memory: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Record {
    capacity: CpuMem,
    usage: CpuMem,
}

/// Request and per-replica resource args share one shape.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct Request {
    #[serde(default)]
    cpu_request: f64,
    #[serde(default)]
    memory_request: i64,
}

fn parse_request(value: &Value) -> ResourceResult<Request> {
    if value.is_null() {
        return Ok(Request::default());
    }
    serde_json::from_value(value.clone())
        .map_err(|e| ResourceError::InvalidRequest(format!("cpumem request: {e}")))
}

/// Cpu-mem dimension plugin.
pub struct CpuMemPlugin {
    store: Arc<dyn Store>,
    maxshare: i64,
    sharebase: i64,
}

impl CpuMemPlugin {
    pub fn new(store: Arc<dyn Store>, maxshare: i64, sharebase: i64) -> Self {
        Self {
            store,
            maxshare,
            sharebase: sharebase.max(1),
        }
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

    /// Round a cpu request up to the share granularity.
    fn quantize(&self, cpu: f64) -> f64 {
        if cpu <= 0.0 {
            return 0.0;
        }
        let mut pieces = (cpu * self.sharebase as f64 - EPSILON).ceil() as i64;
        if self.maxshare >= 0 {
            let frac = pieces % self.sharebase;
            if frac > self.maxshare {
                pieces = (pieces / self.sharebase + 1) * self.sharebase;
            }
        }
        pieces as f64 / self.sharebase as f64
    }

    fn quantized_request(&self, value: &Value) -> ResourceResult<Request> {
        let mut request = parse_request(value)?;
        if request.cpu_request < 0.0 || request.memory_request < 0 {
            return Err(ResourceError::InvalidRequest(format!(
                "cpumem request must not be negative: {value}"
            )));
        }
        request.cpu_request = self.quantize(request.cpu_request);
        Ok(request)
    }

    fn capacity_of(record: &Record, request: &Request) -> i64 {
        if request.cpu_request <= 0.0 && request.memory_request <= 0 {
            return i64::MAX;
        }
        let mut count = i64::MAX;
        if request.cpu_request > 0.0 {
            let left = record.capacity.cpu - record.usage.cpu;
            count = count.min(((left + EPSILON) / request.cpu_request).floor() as i64);
        }
        if request.memory_request > 0 {
            let left = record.capacity.memory - record.usage.memory;
            count = count.min(left / request.memory_request);
        }
        count.max(0)
    }

    fn usage_rate_of(record: &Record) -> f64 {
        let mut rate: f64 = 0.0;
        if record.capacity.cpu > 0.0 {
            rate = rate.max(record.usage.cpu / record.capacity.cpu);
        }
        if record.capacity.memory > 0 {
            rate = rate.max(record.usage.memory as f64 / record.capacity.memory as f64);
        }
        rate
    }

    fn engine_args_of(request: &Request) -> Value {
        json!({
            "cpu": request.cpu_request,
            "cpu_quota": (request.cpu_request * CPU_PERIOD as f64) as i64,
            "cpu_period": CPU_PERIOD,
            "memory": request.memory_request,
        })
    }

    fn resource_args_of(request: &Request) -> Value {
        json!({
            "cpu_request": request.cpu_request,
            "memory_request": request.memory_request,
        })
    }

    /// Sum of the workloads' recorded cpumem args.
    fn workloads_usage(workloads: &[Workload]) -> ResourceResult<CpuMem> {
        let mut total = CpuMem::default();
        for workload in workloads {
            let request = parse_request(&workload.resource_args_for(NAME))?;
            total.cpu += request.cpu_request;
            total.memory += request.memory_request;
        }
        Ok(total)
    }
}

#[async_trait]
impl Plugin for CpuMemPlugin {
    fn name(&self) -> &str {
        NAME
    }

    async fn get_nodes_deploy_capacity(
        &self,
        nodenames: &[String],
        request: &Value,
    ) -> ResourceResult<HashMap<String, NodeCapacityInfo>> {
        let request = self.quantized_request(request)?;
        let mut result = HashMap::new();
        for nodename in nodenames {
            // a node this plugin has never seen cannot hold anything
            let Ok(record) = self.load(nodename).await else {
                continue;
            };
            result.insert(
                nodename.clone(),
                NodeCapacityInfo {
                    nodename: nodename.clone(),
                    capacity: Self::capacity_of(&record, &request),
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
        let request = self.quantized_request(request)?;
        let mut record = self.load(nodename).await?;

        let cpu_need = request.cpu_request * count as f64;
        let memory_need = request.memory_request * count as i64;
        if record.usage.cpu + cpu_need > record.capacity.cpu + EPSILON
            || record.usage.memory + memory_need > record.capacity.memory
        {
            return Err(ResourceError::Insufficient {
                nodename: nodename.to_string(),
                detail: format!(
                    "cpumem: need ({cpu_need}, {memory_need}), free ({}, {})",
                    record.capacity.cpu - record.usage.cpu,
                    record.capacity.memory - record.usage.memory
                ),
            });
        }

        record.usage.cpu += cpu_need;
        record.usage.memory += memory_need;
        self.save(nodename, &record).await?;
        debug!(nodename, count, cpu = cpu_need, memory = memory_need, "cpumem alloc");

        let response = AllocResponse {
            engine_args: (0..count).map(|_| Self::engine_args_of(&request)).collect(),
            resource_args: (0..count).map(|_| Self::resource_args_of(&request)).collect(),
        };
        let token = RollbackToken {
            plugin: NAME.to_string(),
            nodename: nodename.to_string(),
            release: response.resource_args.clone(),
            reapply: Vec::new(),
        };
        Ok((response, token))
    }

    async fn realloc(
        &self,
        nodename: &str,
        origin: &Value,
        delta: &Value,
    ) -> ResourceResult<(ReallocResponse, RollbackToken)> {
        let origin = parse_request(origin)?;
        let delta = parse_request(delta)?;
        let raw_cpu = origin.cpu_request + delta.cpu_request;
        let raw_memory = origin.memory_request + delta.memory_request;
        if raw_cpu < -EPSILON || raw_memory < 0 {
            return Err(ResourceError::InvalidRequest(format!(
                "realloc would drive the reservation negative: ({raw_cpu}, {raw_memory})"
            )));
        }
        let new = Request {
            cpu_request: self.quantize(raw_cpu),
            memory_request: raw_memory,
        };

        let diff = CpuMem {
            cpu: new.cpu_request - origin.cpu_request,
            memory: new.memory_request - origin.memory_request,
        };
        let mut record = self.load(nodename).await?;
        if record.usage.cpu + diff.cpu > record.capacity.cpu + EPSILON
            || record.usage.memory + diff.memory > record.capacity.memory
        {
            return Err(ResourceError::Insufficient {
                nodename: nodename.to_string(),
                detail: format!("cpumem realloc: delta ({}, {})", diff.cpu, diff.memory),
            });
        }
        record.usage.cpu = (record.usage.cpu + diff.cpu).max(0.0);
        record.usage.memory = (record.usage.memory + diff.memory).max(0);
        self.save(nodename, &record).await?;

        let response = ReallocResponse {
            engine_args: Self::engine_args_of(&new),
            resource_args: Self::resource_args_of(&new),
        };
        // releasing the new args and re-applying the origin undoes the shift
        let token = RollbackToken {
            plugin: NAME.to_string(),
            nodename: nodename.to_string(),
            release: vec![Self::resource_args_of(&new)],
            reapply: vec![Self::resource_args_of(&origin)],
        };
        Ok((response, token))
    }

    async fn free(&self, token: &RollbackToken) -> ResourceResult<()> {
        let mut record = self.load(&token.nodename).await?;
        for args in &token.release {
            let request = parse_request(args)?;
            record.usage.cpu -= request.cpu_request;
            record.usage.memory -= request.memory_request;
        }
        for args in &token.reapply {
            let request = parse_request(args)?;
            record.usage.cpu += request.cpu_request;
            record.usage.memory += request.memory_request;
        }
        record.usage.cpu = record.usage.cpu.max(0.0);
        record.usage.memory = record.usage.memory.max(0);
        self.save(&token.nodename, &record).await
    }

    async fn get_node_resource_info(
        &self,
        nodename: &str,
        workloads: &[Workload],
        fix: bool,
    ) -> ResourceResult<(NodeResourceInfo, Vec<String>)> {
        let mut record = self.load(nodename).await?;
        let actual = Self::workloads_usage(workloads)?;

        let mut diffs = Vec::new();
        if (record.usage.cpu - actual.cpu).abs() > EPSILON {
            diffs.push(format!(
                "node {nodename} cpu usage inconsistent: recorded {}, in use {}",
                record.usage.cpu, actual.cpu
            ));
        }
        if record.usage.memory != actual.memory {
            diffs.push(format!(
                "node {nodename} memory usage inconsistent: recorded {}, in use {}",
                record.usage.memory, actual.memory
            ));
        }
        if fix && !diffs.is_empty() {
            record.usage = actual;
            self.save(nodename, &record).await?;
        }

        let info = NodeResourceInfo {
            capacity: serde_json::to_value(record.capacity)?,
            usage: serde_json::to_value(record.usage)?,
        };
        Ok((info, diffs))
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
            let request = parse_request(&recorded)?;
            args.insert(workload.id.clone(), Self::engine_args_of(&request));
        }
        Ok(args)
    }

    async fn set_node_resource_capacity(
        &self,
        nodename: &str,
        capacity: &Value,
        delta: bool,
    ) -> ResourceResult<NodeResourceInfo> {
        let value: CpuMem = serde_json::from_value(capacity.clone())
            .map_err(|e| ResourceError::InvalidRequest(format!("cpumem capacity: {e}")))?;
        let mut record = self.load(nodename).await?;
        if delta {
            record.capacity.cpu += value.cpu;
            record.capacity.memory += value.memory;
        } else {
            record.capacity = value;
        }
        self.save(nodename, &record).await?;
        Ok(NodeResourceInfo {
            capacity: serde_json::to_value(record.capacity)?,
            usage: serde_json::to_value(record.usage)?,
        })
    }

    async fn set_node_resource_usage(
        &self,
        nodename: &str,
        usage: &Value,
        delta: bool,
    ) -> ResourceResult<NodeResourceInfo> {
        let value: CpuMem = serde_json::from_value(usage.clone())
            .map_err(|e| ResourceError::InvalidRequest(format!("cpumem usage: {e}")))?;
        let mut record = self.load(nodename).await?;
        if delta {
            record.usage.cpu = (record.usage.cpu + value.cpu).max(0.0);
            record.usage.memory = (record.usage.memory + value.memory).max(0);
        } else {
            record.usage = value;
        }
        self.save(nodename, &record).await?;
        Ok(NodeResourceInfo {
            capacity: serde_json::to_value(record.capacity)?,
            usage: serde_json::to_value(record.usage)?,
        })
    }

    async fn add_node(&self, nodename: &str, request: &Value) -> ResourceResult<NodeResourceInfo> {
        let capacity: CpuMem = if request.is_null() {
            CpuMem::default()
        } else {
            serde_json::from_value(request.clone())
                .map_err(|e| ResourceError::InvalidRequest(format!("cpumem capacity: {e}")))?
        };
        let record = Record {
            capacity,
            usage: CpuMem::default(),
        };
        let bytes = serde_json::to_vec(&record)?;
        match self.store.put(&self.key(nodename), bytes, Some(0)).await {
            Ok(_) => Ok(NodeResourceInfo {
                capacity: serde_json::to_value(record.capacity)?,
                usage: serde_json::to_value(record.usage)?,
            }),
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
