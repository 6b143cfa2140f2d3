//! Scriptable in-memory container engine for tests.
//!
//! Each created container takes the next queued [`Script`]; on start the
//! script's files are written into the container's working directory, which
//! is how a real grading command leaves its log and results behind.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Semaphore;

use crate::engine::sandbox::{ContainerEngine, ContainerError, ContainerSpec};

#[derive(Debug, Clone, Default)]
pub struct Script {
    pub exit_code: i64,
    pub files: Vec<(String, String)>,
    /// Never exits on its own.
    pub hang: bool,
    /// Exits once [`FakeEngine::release`] hands out a permit.
    pub held: bool,
    pub fail_create: Option<String>,
    pub fail_start: Option<String>,
}

impl Script {
    pub fn exit(code: i64) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    pub fn held(code: i64) -> Self {
        Self {
            exit_code: code,
            held: true,
            ..Self::default()
        }
    }

    pub fn failing_create(message: &str) -> Self {
        Self {
            fail_create: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn failing_start(message: &str) -> Self {
        Self {
            fail_start: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn with_file(mut self, name: &str, content: &str) -> Self {
        self.files.push((name.to_string(), content.to_string()));
        self
    }
}

struct FakeContainer {
    spec: ContainerSpec,
    script: Script,
    running: bool,
    removed: bool,
}

pub struct FakeEngine {
    scripts: Mutex<VecDeque<Script>>,
    containers: DashMap<String, FakeContainer>,
    next_id: AtomicU64,
    gate: Semaphore,
    unreachable: AtomicBool,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            containers: DashMap::new(),
            next_id: AtomicU64::new(1),
            gate: Semaphore::new(0),
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn push(&self, script: Script) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.push_back(script);
        }
    }

    /// Lets `count` held containers exit.
    pub fn release(&self, count: usize) {
        self.gate.add_permits(count);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.containers.len()
    }

    /// Containers not yet removed.
    pub fn live(&self) -> usize {
        self.containers.iter().filter(|c| !c.removed).count()
    }

    pub fn specs(&self) -> Vec<ContainerSpec> {
        self.containers.iter().map(|c| c.spec.clone()).collect()
    }

    fn script_for(&self, id: &str) -> Result<Script, ContainerError> {
        self.containers
            .get(id)
            .map(|c| c.script.clone())
            .ok_or_else(|| ContainerError::operation("lookup", id, "no such container"))
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        let script = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut scripts| scripts.pop_front())
            .unwrap_or_default();
        if let Some(message) = &script.fail_create {
            return Err(ContainerError::operation("create", &spec.image, message));
        }
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                script,
                running: false,
                removed: false,
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), ContainerError> {
        let script = self.script_for(id)?;
        if let Some(message) = &script.fail_start {
            return Err(ContainerError::operation("start", id, message));
        }
        let dir = self
            .containers
            .get(id)
            .map(|c| c.spec.working_dir.clone())
            .ok_or_else(|| ContainerError::operation("start", id, "no such container"))?;
        for (name, content) in &script.files {
            std::fs::write(dir.join(name), content)
                .map_err(|err| ContainerError::operation("start", id, err))?;
        }
        if let Some(mut container) = self.containers.get_mut(id) {
            container.running = true;
        }
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64, ContainerError> {
        let script = self.script_for(id)?;
        if script.hang {
            std::future::pending::<()>().await;
        }
        if script.held {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|err| ContainerError::operation("wait", id, err))?;
            permit.forget();
        }
        if let Some(mut container) = self.containers.get_mut(id) {
            container.running = false;
        }
        Ok(script.exit_code)
    }

    async fn kill(&self, id: &str) -> Result<(), ContainerError> {
        if let Some(mut container) = self.containers.get_mut(id) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), ContainerError> {
        if let Some(mut container) = self.containers.get_mut(id) {
            container.running = false;
            container.removed = true;
        }
        Ok(())
    }

    async fn count_running(
        &self,
        label_key: &str,
        label_value: &str,
    ) -> Result<usize, ContainerError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ContainerError::Connect("fake engine is unreachable".to_string()));
        }
        let matching = |labels: &HashMap<String, String>| {
            labels.get(label_key).map(String::as_str) == Some(label_value)
        };
        Ok(self
            .containers
            .iter()
            .filter(|c| c.running && matching(&c.spec.labels))
            .count())
    }
}
