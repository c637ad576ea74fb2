/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{workload_names, Context, IterationError, IterationResult, StepResult, Steps, Worker};
use crate::concurrency;
use anyhow::anyhow;
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::trace;

/// Runs workload steps in-process.
#[derive(Debug, Clone, Default)]
pub struct LocalWorker {
    steps: Steps,
}
impl LocalWorker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Worker for LocalWorker {
    fn steps(&self) -> &Steps {
        &self.steps
    }

    fn steps_mut(&mut self) -> &mut Steps {
        &mut self.steps
    }

    async fn time(&self, workload: &str, ctx: Context) -> IterationResult {
        let start = Instant::now();
        let mut result = IterationResult::default();

        for name in workload_names(workload) {
            let (duration, outcome) = concurrency::time(|| async {
                match self.steps.get(name) {
                    Some(step) => (step.operation)(ctx.clone()).await,
                    None => Err(anyhow!("Unable to find workload step with name {}", name)),
                }
            })
            .await;

            trace!(step = name, ?duration, worker = ctx.worker_index, "step finished");
            result.steps.push(StepResult {
                command: name.to_string(),
                duration,
            });

            // stop at the first failing step, later steps are not attempted
            if let Err(err) = outcome {
                result.error = Some(IterationError::Step(format!("{:#}", err)));
                break;
            }
        }

        result.duration = start.elapsed();
        result
    }
}
