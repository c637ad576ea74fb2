/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod local;
pub mod remote;

pub use local::LocalWorker;
pub use remote::RemoteWorker;

use anyhow::anyhow;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

/// Workload used when an experiment is started with an empty workload string.
pub const DEFAULT_WORKLOAD: &str = "dummy";

pub type Operation = Arc<dyn Fn(Context) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Values threaded through every step of an iteration. The worker index identifies which
/// concurrent consumer is running the iteration so steps can vary their behaviour per worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub worker_index: usize,
    pub values: BTreeMap<String, String>,
}
impl Context {
    pub fn new(worker_index: usize) -> Self {
        Context {
            worker_index,
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.as_str())
    }
}

#[derive(Clone)]
pub struct WorkloadStep {
    pub name: String,
    pub operation: Operation,
    pub description: String,
}
impl WorkloadStep {
    pub fn new<F, Fut>(name: &str, description: &str, operation: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        WorkloadStep {
            name: name.to_string(),
            description: description.to_string(),
            operation: Arc::new(move |ctx| Box::pin(operation(ctx))),
        }
    }
}
impl fmt::Debug for WorkloadStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadStep")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub command: String,
    pub duration: Duration,
}

/// Why an iteration did not complete. Only the message survives serialization, the original
/// error type is not preserved across the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "lowercase")]
pub enum IterationError {
    Step(String),
    Timeout(Duration),
    Transport(String),
}
impl fmt::Display for IterationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IterationError::Step(msg) => write!(f, "{}", msg),
            IterationError::Timeout(after) => {
                write!(f, "timed out waiting for a reply after {:?}", after)
            }
            IterationError::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}
impl std::error::Error for IterationError {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    pub duration: Duration,
    pub steps: Vec<StepResult>,
    pub error: Option<IterationError>,
}
impl IterationResult {
    pub fn failed(error: IterationError) -> Self {
        IterationResult {
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }

    /// Steps that ran to completion. When the iteration failed the last recorded step is the one
    /// that failed and is excluded.
    pub fn completed_steps(&self) -> &[StepResult] {
        match (&self.error, self.steps.split_last()) {
            (Some(_), Some((_, completed))) => completed,
            _ => &self.steps,
        }
    }
}

/// Registered workload steps, keyed by name. Iteration order is the name order so visiting is
/// stable for a given set of steps.
#[derive(Debug, Clone, Default)]
pub struct Steps {
    steps: BTreeMap<String, WorkloadStep>,
}
impl Steps {
    pub fn add(&mut self, step: WorkloadStep) {
        self.steps.insert(step.name.clone(), step);
    }

    pub fn get(&self, name: &str) -> Option<&WorkloadStep> {
        self.steps.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkloadStep> {
        self.steps.values()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Splits a comma separated workload into step names, ignoring surrounding whitespace.
pub fn workload_names(workload: &str) -> impl Iterator<Item = &str> {
    workload.split(',').map(str::trim)
}

/// Something that can time named workloads. Step registration, visiting and validation are
/// shared by every worker; only `time` differs between running in-process and running remotely.
#[async_trait]
pub trait Worker: Send + Sync {
    fn steps(&self) -> &Steps;
    fn steps_mut(&mut self) -> &mut Steps;

    /// Times one iteration of `workload` (a comma separated list of step names).
    async fn time(&self, workload: &str, ctx: Context) -> IterationResult;

    fn add_workload_step(&mut self, step: WorkloadStep) {
        self.steps_mut().add(step);
    }

    fn visit(&self, f: &mut dyn FnMut(&WorkloadStep)) {
        for step in self.steps().iter() {
            f(step);
        }
    }

    fn validate(&self, workload: &str) -> anyhow::Result<()> {
        for name in workload_names(workload) {
            if self.steps().get(name).is_none() {
                return Err(anyhow!("Unable to find workload step with name {}", name));
            }
        }
        Ok(())
    }
}
