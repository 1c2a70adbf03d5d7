//! Mock engine for testing and development.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::EngineError;
use crate::{
    Engine, EngineFactory, RemapMessage, VirtualizationCreated, VirtualizationInfo,
    VirtualizationParams,
};

#[derive(Default)]
struct MockState {
    units: HashMap<String, VirtualizationInfo>,
    fail_inspect: HashSet<String>,
    fail_remap: HashSet<String>,
    fail_creates: bool,
}

/// Mock engine.
///
/// Units live in memory; failures can be scripted per unit id to exercise
/// the error paths of reconcile and remap.
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine that rejects all creates.
    pub fn failing_creates() -> Self {
        let engine = Self::new();
        engine.state.lock().unwrap_or_else(|e| e.into_inner()).fail_creates = true;
        engine
    }

    /// Make inspection of `id` fail from now on.
    pub fn fail_inspect(&self, id: &str) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fail_inspect
            .insert(id.to_string());
    }

    /// Make remap of `id` report a per-unit error.
    pub fn fail_remap(&self, id: &str) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fail_remap
            .insert(id.to_string());
    }

    /// Register a unit directly, as if created earlier.
    pub fn seed_unit(&self, id: &str, image: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.units.insert(
            id.to_string(),
            VirtualizationInfo {
                id: id.to_string(),
                image: image.to_string(),
                running: true,
                labels: HashMap::new(),
            },
        );
    }

    pub fn unit_count(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).units.len()
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn resource_validate(
        &self,
        _engine_args: &HashMap<String, Value>,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    async fn virtualization_create(
        &self,
        params: VirtualizationParams,
    ) -> Result<VirtualizationCreated, EngineError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.fail_creates {
            return Err(EngineError::Transport("mock engine rejects creates".to_string()));
        }
        // the requested name is the unit's identity, like a named container
        let id = if params.name.is_empty() {
            Uuid::new_v4().simple().to_string()
        } else {
            params.name.clone()
        };
        info!(unit_id = %id, image = %params.image, "[MOCK] unit created");
        state.units.insert(
            id.clone(),
            VirtualizationInfo {
                id: id.clone(),
                image: params.image,
                running: false,
                labels: params.labels,
            },
        );
        Ok(VirtualizationCreated { id })
    }

    async fn virtualization_start(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.units.get_mut(id) {
            Some(unit) => {
                unit.running = true;
                Ok(())
            }
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    async fn virtualization_stop(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.units.get_mut(id) {
            Some(unit) => {
                unit.running = false;
                Ok(())
            }
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    async fn virtualization_remove(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.units.remove(id) {
            Some(_) => Ok(()),
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    async fn virtualization_inspect(
        &self,
        id: &str,
    ) -> Result<VirtualizationInfo, EngineError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.fail_inspect.contains(id) {
            return Err(EngineError::Transport(format!("inspect of {id} scripted to fail")));
        }
        state
            .units
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    async fn virtualization_resource_remap(
        &self,
        args: HashMap<String, HashMap<String, Value>>,
    ) -> Result<mpsc::Receiver<RemapMessage>, EngineError> {
        let (tx, rx) = mpsc::channel(args.len().max(1));
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for workload_id in args.keys() {
            let error = if state.fail_remap.contains(workload_id) {
                Some(format!("remap of {workload_id} scripted to fail"))
            } else {
                None
            };
            debug!(workload_id = %workload_id, failed = error.is_some(), "[MOCK] remap");
            // channel is sized for all messages, try_send cannot fail here
            let _ = tx.try_send(RemapMessage {
                workload_id: workload_id.clone(),
                error,
            });
        }
        Ok(rx)
    }
}

/// Factory handing out one shared mock engine for every endpoint.
#[derive(Clone, Default)]
pub struct MockEngineFactory {
    engine: MockEngine,
}

impl MockEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_engine(engine: MockEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> MockEngine {
        self.engine.clone()
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn make(&self, _endpoint: &str) -> Result<Arc<dyn Engine>, EngineError> {
        Ok(Arc::new(self.engine.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_start_inspect_remove() {
        let engine = MockEngine::new();
        let created = engine
            .virtualization_create(VirtualizationParams {
                name: "w".to_string(),
                image: "app:1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        engine.virtualization_start(&created.id).await.unwrap();
        let info = engine.virtualization_inspect(&created.id).await.unwrap();
        assert!(info.running);
        assert_eq!(info.image, "app:1");

        engine.virtualization_remove(&created.id).await.unwrap();
        let err = engine.virtualization_inspect(&created.id).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn scripted_inspect_failure() {
        let engine = MockEngine::new();
        engine.seed_unit("w1", "app:1");
        engine.fail_inspect("w1");
        assert!(engine.virtualization_inspect("w1").await.is_err());
    }

    #[tokio::test]
    async fn remap_streams_per_unit_outcomes() {
        let engine = MockEngine::new();
        engine.seed_unit("w1", "app:1");
        engine.seed_unit("w2", "app:1");
        engine.fail_remap("w2");

        let mut args = HashMap::new();
        args.insert("w1".to_string(), HashMap::new());
        args.insert("w2".to_string(), HashMap::new());

        let mut rx = engine.virtualization_resource_remap(args).await.unwrap();
        let mut outcomes = HashMap::new();
        while let Some(msg) = rx.recv().await {
            outcomes.insert(msg.workload_id.clone(), msg.error);
        }
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes["w1"].is_none());
        assert!(outcomes["w2"].is_some());
    }
}
