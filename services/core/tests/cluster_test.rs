//! End-to-end cluster tests over the in-memory store and mock engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_stream::StreamExt;

use eru_core::cluster::{AddNodeOptions, Calcium, CreateWorkloadMessage, DeployOptions, NodeFilter};
use eru_core::strategy::Strategy;
use eru_engine::{MockEngine, MockEngineFactory};
use eru_resource::plugins::{CpuMemPlugin, VolumePlugin};
use eru_resource::{Aggregator, Plugin};
use eru_store::{DistributedLock, KvPair, MemStore, Store, StoreError};
use eru_types::{Config, CoreError};

struct Harness {
    calcium: Calcium,
    store: Arc<dyn Store>,
    engine: MockEngine,
}

fn build_calcium(store: Arc<dyn Store>, engine: MockEngine, config: Config) -> Calcium {
    let factory = Arc::new(MockEngineFactory::with_engine(engine));
    let aggregator = Aggregator::new(vec![
        Arc::new(CpuMemPlugin::new(
            store.clone(),
            config.scheduler.maxshare,
            config.scheduler.sharebase,
        )) as Arc<dyn Plugin>,
        Arc::new(VolumePlugin::new(store.clone())),
    ]);
    Calcium::new(config, store, factory, aggregator)
}

async fn harness() -> Harness {
    let store: Arc<dyn Store> = Arc::new(MemStore::with_lock_wait(Duration::from_secs(1)));
    let engine = MockEngine::new();
    let calcium = build_calcium(store.clone(), engine.clone(), Config::default());
    Harness {
        calcium,
        store,
        engine,
    }
}

async fn register_node(h: &Harness, name: &str, cpu: f64, memory: i64, volumes: Value) {
    let mut resources = HashMap::new();
    resources.insert("cpumem".to_string(), json!({"cpu": cpu, "memory": memory}));
    resources.insert("volume".to_string(), json!({"volumes": volumes}));
    h.calcium
        .add_node(AddNodeOptions {
            name: name.to_string(),
            podname: "testpod".to_string(),
            endpoint: format!("mock://{name}"),
            resources,
            ..Default::default()
        })
        .await
        .unwrap();
}

fn deploy_opts(count: i64, cpu: f64, memory: i64) -> DeployOptions {
    let mut resource_requests = HashMap::new();
    resource_requests.insert(
        "cpumem".to_string(),
        json!({"cpu_request": cpu, "memory_request": memory}),
    );
    DeployOptions {
        name: "app".to_string(),
        podname: "testpod".to_string(),
        image: "app:1".to_string(),
        count,
        strategy: Strategy::Auto,
        each_limit: 0,
        resource_requests,
        node_filter: NodeFilter::default(),
        labels: HashMap::new(),
    }
}

async fn collect_create(
    mut stream: tokio_stream::wrappers::ReceiverStream<CreateWorkloadMessage>,
) -> Vec<CreateWorkloadMessage> {
    let mut messages = Vec::new();
    while let Some(message) = stream.next().await {
        messages.push(message);
    }
    messages
}

async fn cpumem_usage(store: &dyn Store, nodename: &str) -> (f64, i64) {
    let kv = store
        .get(&format!("/resource/cpumem/{nodename}"))
        .await
        .unwrap()
        .unwrap();
    let record: Value = serde_json::from_slice(&kv.value).unwrap();
    (
        record["usage"]["cpu"].as_f64().unwrap(),
        record["usage"]["memory"].as_i64().unwrap(),
    )
}

#[tokio::test]
async fn deploy_fills_biggest_node_and_streams_ids() {
    let h = harness().await;
    register_node(&h, "node-a", 5.0, 8192, json!({})).await;
    register_node(&h, "node-b", 2.0, 8192, json!({})).await;

    let stream = h
        .calcium
        .create_workloads(deploy_opts(3, 1.0, 1024))
        .await
        .unwrap();
    let messages = collect_create(stream).await;

    assert_eq!(messages.len(), 3);
    for message in &messages {
        assert_eq!(message.nodename, "node-a");
        assert!(message.error.is_none());
        assert!(message.workload_id.is_some());
    }

    let workloads = h.calcium.list_node_workloads("node-a").await.unwrap();
    assert_eq!(workloads.len(), 3);
    assert!(h.calcium.list_node_workloads("node-b").await.unwrap().is_empty());

    let (cpu, memory) = cpumem_usage(h.store.as_ref(), "node-a").await;
    assert_eq!(cpu, 3.0);
    assert_eq!(memory, 3 * 1024);
    assert_eq!(h.engine.unit_count(), 3);
}

#[tokio::test]
async fn deploy_fails_fast_on_insufficient_capacity() {
    let h = harness().await;
    register_node(&h, "node-a", 2.0, 8192, json!({})).await;

    let err = h
        .calcium
        .create_workloads(deploy_opts(5, 1.0, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InsufficientResource { need: 5, .. }));
    // nothing was reserved or created
    let (cpu, _) = cpumem_usage(h.store.as_ref(), "node-a").await;
    assert_eq!(cpu, 0.0);
    assert_eq!(h.engine.unit_count(), 0);
}

#[tokio::test]
async fn deploy_rejects_non_positive_count() {
    let h = harness().await;
    let err = h
        .calcium
        .create_workloads(deploy_opts(0, 1.0, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidCount(0)));
}

#[tokio::test]
async fn concurrent_deploys_never_overcommit() {
    let h = harness().await;
    register_node(&h, "node-a", 4.0, 1 << 30, json!({})).await;

    let mut handles = Vec::new();
    for _ in 0..6 {
        let calcium = h.calcium.clone();
        handles.push(tokio::spawn(async move {
            let stream = calcium.create_workloads(deploy_opts(1, 1.0, 0)).await?;
            Ok::<_, CoreError>(collect_create(stream).await)
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(messages) => {
                succeeded += messages.iter().filter(|m| m.error.is_none()).count();
            }
            Err(_) => {}
        }
    }

    // the lock serializes the node: at most 4 replicas ever fit
    assert!(succeeded <= 4);
    let (cpu, _) = cpumem_usage(h.store.as_ref(), "node-a").await;
    assert!(cpu <= 4.0);
    assert_eq!(
        h.calcium.list_node_workloads("node-a").await.unwrap().len(),
        succeeded
    );
}

#[tokio::test]
async fn deploy_with_volumes_applies_device_plan() {
    let h = harness().await;
    register_node(&h, "node-a", 4.0, 8192, json!({"/dev/vdb": 1000})).await;

    let mut opts = deploy_opts(1, 1.0, 0);
    opts.resource_requests.insert(
        "volume".to_string(),
        json!({"volumes": ["AUTO:/data:rw:100"]}),
    );
    let stream = h.calcium.create_workloads(opts).await.unwrap();
    let messages = collect_create(stream).await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].error.is_none());

    let workload = h
        .calcium
        .get_workload(messages[0].workload_id.as_ref().unwrap())
        .await
        .unwrap();
    assert_eq!(
        workload.engine_args["volume"]["volumes"],
        json!(["/dev/vdb:/data:rw:100"])
    );
}

#[tokio::test]
async fn remove_restores_resources() {
    let h = harness().await;
    register_node(&h, "node-a", 4.0, 8192, json!({"/dev/vdb": 1000})).await;

    let mut opts = deploy_opts(2, 1.0, 1024);
    opts.resource_requests.insert(
        "volume".to_string(),
        json!({"volumes": ["AUTO:/data:rw:100"]}),
    );
    let stream = h.calcium.create_workloads(opts).await.unwrap();
    let ids: Vec<String> = collect_create(stream)
        .await
        .into_iter()
        .map(|m| m.workload_id.unwrap())
        .collect();

    let mut stream = h.calcium.remove_workloads(ids.clone()).await.unwrap();
    let mut removed = 0;
    while let Some(message) = stream.next().await {
        assert!(message.error.is_none(), "{:?}", message.error);
        removed += 1;
    }
    assert_eq!(removed, 2);

    let (cpu, memory) = cpumem_usage(h.store.as_ref(), "node-a").await;
    assert_eq!(cpu, 0.0);
    assert_eq!(memory, 0);
    assert!(h.calcium.list_node_workloads("node-a").await.unwrap().is_empty());
    assert_eq!(h.engine.unit_count(), 0);

    // unknown ids surface per-workload errors, not call failures
    let mut stream = h.calcium.remove_workloads(ids).await.unwrap();
    while let Some(message) = stream.next().await {
        assert!(message.error.as_deref().unwrap_or("").contains("not found"));
    }
}

#[tokio::test]
async fn realloc_shifts_reservation_and_record() {
    let h = harness().await;
    register_node(&h, "node-a", 4.0, 8192, json!({})).await;

    let stream = h
        .calcium
        .create_workloads(deploy_opts(1, 1.0, 1024))
        .await
        .unwrap();
    let messages = collect_create(stream).await;
    let workload_id = messages[0].workload_id.clone().unwrap();

    let mut deltas = HashMap::new();
    deltas.insert(
        "cpumem".to_string(),
        json!({"cpu_request": 0.5, "memory_request": -512}),
    );
    h.calcium
        .realloc_workload(&workload_id, deltas)
        .await
        .unwrap();

    let workload = h.calcium.get_workload(&workload_id).await.unwrap();
    assert_eq!(workload.resource_args["cpumem"]["cpu_request"], json!(1.5));
    assert_eq!(workload.resource_args["cpumem"]["memory_request"], json!(512));

    let (cpu, memory) = cpumem_usage(h.store.as_ref(), "node-a").await;
    assert_eq!(cpu, 1.5);
    assert_eq!(memory, 512);
}

#[tokio::test]
async fn node_resource_reports_inspect_failures_without_erroring() {
    let h = harness().await;
    register_node(&h, "node-a", 4.0, 8192, json!({})).await;

    let stream = h
        .calcium
        .create_workloads(deploy_opts(1, 1.0, 0))
        .await
        .unwrap();
    let messages = collect_create(stream).await;
    let workload_id = messages[0].workload_id.clone().unwrap();
    h.engine.fail_inspect(&workload_id);

    let result = h.calcium.node_resource("node-a", false).await.unwrap();
    assert_eq!(result.name, "node-a");
    assert!(result
        .diffs
        .iter()
        .any(|diff| diff.contains("inspect failed")));

    // the pod stream carries the same diffs
    let mut stream = h.calcium.pod_resource("testpod").await.unwrap();
    let item = stream.next().await.unwrap();
    assert!(item.diffs.iter().any(|diff| diff.contains("inspect failed")));
}

#[tokio::test]
async fn node_resource_without_fix_is_idempotent() {
    let h = harness().await;
    register_node(&h, "node-a", 4.0, 8192, json!({"/dev/vdb": 1000})).await;

    let stream = h
        .calcium
        .create_workloads(deploy_opts(2, 1.0, 256))
        .await
        .unwrap();
    collect_create(stream).await;

    let first = h.calcium.node_resource("node-a", false).await.unwrap();
    let second = h.calcium.node_resource("node-a", false).await.unwrap();
    assert_eq!(first.resource_info, second.resource_info);
    assert_eq!(first.diffs, second.diffs);
    assert!(first.diffs.is_empty());
}

#[tokio::test]
async fn node_resource_requires_a_name() {
    let h = harness().await;
    let err = h.calcium.node_resource("", false).await.unwrap_err();
    assert!(matches!(err, CoreError::EmptyNodeName));
}

#[tokio::test]
async fn remove_node_refuses_while_occupied() {
    let h = harness().await;
    register_node(&h, "node-a", 4.0, 8192, json!({})).await;

    let stream = h
        .calcium
        .create_workloads(deploy_opts(1, 1.0, 0))
        .await
        .unwrap();
    let messages = collect_create(stream).await;

    let err = h.calcium.remove_node("node-a").await.unwrap_err();
    assert!(matches!(err, CoreError::NodeOccupied(_)));

    let ids = vec![messages[0].workload_id.clone().unwrap()];
    let mut stream = h.calcium.remove_workloads(ids).await.unwrap();
    while stream.next().await.is_some() {}

    h.calcium.remove_node("node-a").await.unwrap();
    assert!(matches!(
        h.calcium.get_node("node-a").await.unwrap_err(),
        CoreError::NodeNotFound(_)
    ));
}

#[tokio::test]
async fn unavailable_nodes_are_not_scheduled() {
    let h = harness().await;
    register_node(&h, "node-a", 5.0, 8192, json!({})).await;
    register_node(&h, "node-b", 5.0, 8192, json!({})).await;
    h.calcium.set_node_status("node-a", false).await.unwrap();

    let stream = h
        .calcium
        .create_workloads(deploy_opts(2, 1.0, 0))
        .await
        .unwrap();
    let messages = collect_create(stream).await;
    assert!(messages.iter().all(|m| m.nodename == "node-b"));
}

#[tokio::test]
async fn alloc_plan_is_deterministic_and_read_only() {
    let h = harness().await;
    register_node(&h, "node-a", 5.0, 8192, json!({})).await;
    register_node(&h, "node-b", 3.0, 8192, json!({})).await;

    let opts = deploy_opts(4, 1.0, 0);
    let first = h.calcium.alloc_plan(&opts).await.unwrap();
    let second = h.calcium.alloc_plan(&opts).await.unwrap();
    assert_eq!(format!("{first:?}"), format!("{second:?}"));

    // planning reserves nothing
    let (cpu, _) = cpumem_usage(h.store.as_ref(), "node-a").await;
    assert_eq!(cpu, 0.0);
}

#[tokio::test]
async fn contended_lock_surfaces_lock_failure() {
    let store: Arc<dyn Store> = Arc::new(MemStore::with_lock_wait(Duration::from_millis(50)));
    let engine = MockEngine::new();
    let calcium = build_calcium(store.clone(), engine.clone(), Config::default());
    let h = Harness {
        calcium,
        store: store.clone(),
        engine,
    };
    register_node(&h, "node-a", 4.0, 8192, json!({})).await;

    // hold the node's lock from outside the driver
    let key = Config::default().node_lock_key("node-a");
    let lock = store.create_lock(&key, Duration::from_secs(30));
    let _guard = lock.lock().await.unwrap();

    let stream = h
        .calcium
        .create_workloads(deploy_opts(1, 1.0, 0))
        .await
        .unwrap();
    let messages = collect_create(stream).await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0]
        .error
        .as_deref()
        .unwrap_or("")
        .contains("failed to acquire lock"));
}

/// Store that rejects the first CAS put against each node record, as an
/// external writer racing the commit would.
struct CasHiccupStore {
    inner: MemStore,
    hiccuped: std::sync::Mutex<std::collections::HashSet<String>>,
}

#[async_trait]
impl Store for CasHiccupStore {
    async fn get(&self, key: &str) -> Result<Option<KvPair>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: Option<u64>,
    ) -> Result<u64, StoreError> {
        if key.starts_with("/nodes/") && matches!(expected, Some(rev) if rev > 0) {
            let mut hiccuped = self.hiccuped.lock().unwrap();
            if hiccuped.insert(key.to_string()) {
                return Err(StoreError::RevisionMismatch {
                    key: key.to_string(),
                    expected: expected.unwrap_or(0),
                    current: 0,
                });
            }
        }
        self.inner.put(key, value, expected).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>, StoreError> {
        self.inner.list(prefix).await
    }

    fn create_lock(&self, key: &str, ttl: Duration) -> Box<dyn DistributedLock> {
        self.inner.create_lock(key, ttl)
    }
}

#[tokio::test]
async fn deploy_survives_one_cas_conflict() {
    let store: Arc<dyn Store> = Arc::new(CasHiccupStore {
        inner: MemStore::new(),
        hiccuped: std::sync::Mutex::new(std::collections::HashSet::new()),
    });
    let engine = MockEngine::new();
    let calcium = build_calcium(store.clone(), engine.clone(), Config::default());
    let h = Harness {
        calcium,
        store,
        engine,
    };
    register_node(&h, "node-a", 5.0, 8192, json!({})).await;

    let stream = h
        .calcium
        .create_workloads(deploy_opts(3, 1.0, 1024))
        .await
        .unwrap();
    let messages = collect_create(stream).await;

    // the first CAS lost the race, the retry committed
    assert_eq!(messages.len(), 3);
    assert!(messages.iter().all(|m| m.error.is_none()));
    assert_eq!(h.calcium.list_node_workloads("node-a").await.unwrap().len(), 3);
}

/// Store whose prefix listing always fails, for the no-stream error path.
struct ListFailsStore {
    inner: MemStore,
}

#[async_trait]
impl Store for ListFailsStore {
    async fn get(&self, key: &str) -> Result<Option<KvPair>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: Option<u64>,
    ) -> Result<u64, StoreError> {
        self.inner.put(key, value, expected).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }

    async fn list(&self, _prefix: &str) -> Result<Vec<KvPair>, StoreError> {
        Err(StoreError::Unavailable("scripted list failure".to_string()))
    }

    fn create_lock(&self, key: &str, ttl: Duration) -> Box<dyn DistributedLock> {
        self.inner.create_lock(key, ttl)
    }
}

#[tokio::test]
async fn pod_resource_fails_before_any_stream_on_store_error() {
    let store: Arc<dyn Store> = Arc::new(ListFailsStore {
        inner: MemStore::new(),
    });
    let calcium = build_calcium(store, MockEngine::new(), Config::default());

    let err = calcium.pod_resource("testpod").await.unwrap_err();
    assert!(matches!(err, CoreError::NoStore));
}
