/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{Context, IterationError, IterationResult, Steps, Worker};
use crate::queue::Queue;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::warn;

/// The shared list slaves take work from.
pub const TASKS_QUEUE: &str = "tasks";

/// A request to time one iteration, as pushed onto the tasks list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub reply_to: String,
    pub workload: String,
    pub context: Context,
}

/// Times workloads on whichever slave picks the request up. Steps are registered locally only so
/// workloads can be validated before any request is sent; slaves run their own copies.
pub struct RemoteWorker {
    steps: Steps,
    queue: Arc<dyn Queue>,
    timeout: Duration,
}
impl RemoteWorker {
    pub fn new(queue: Arc<dyn Queue>, timeout: Duration) -> Self {
        RemoteWorker {
            steps: Steps::default(),
            queue,
            timeout,
        }
    }

    async fn request(&self, workload: &str, ctx: Context) -> Result<IterationResult, IterationError> {
        let request = TaskRequest {
            reply_to: format!("reply-{}", nanoid::nanoid!()),
            workload: workload.to_string(),
            context: ctx,
        };
        let body = serde_json::to_string(&request)
            .map_err(|err| IterationError::Transport(err.to_string()))?;

        self.queue
            .push(TASKS_QUEUE, &body)
            .await
            .map_err(|err| IterationError::Transport(format!("{:#}", err)))?;

        let reply = self
            .queue
            .blocking_pop(&[request.reply_to.as_str()], self.timeout)
            .await
            .map_err(|err| IterationError::Transport(format!("{:#}", err)))?;

        match reply {
            Some((_, body)) => serde_json::from_str(&body)
                .map_err(|err| IterationError::Transport(format!("Malformed reply: {}", err))),
            None => {
                warn!(reply_to = %request.reply_to, timeout = ?self.timeout, "no reply from any slave");
                Err(IterationError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl Worker for RemoteWorker {
    fn steps(&self) -> &Steps {
        &self.steps
    }

    fn steps_mut(&mut self) -> &mut Steps {
        &mut self.steps
    }

    async fn time(&self, workload: &str, ctx: Context) -> IterationResult {
        self.request(workload, ctx)
            .await
            .unwrap_or_else(IterationResult::failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{queue::MemoryQueue, worker::StepResult};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn no_slave_times_out() {
        let queue = Arc::new(MemoryQueue::new());
        let worker = RemoteWorker::new(queue.clone(), Duration::from_secs(1));

        let start = Instant::now();
        let result = worker.time("foo", Context::new(0)).await;

        assert!(start.elapsed() <= Duration::from_secs(2));
        assert_eq!(
            result,
            IterationResult::failed(IterationError::Timeout(Duration::from_secs(1)))
        );
        // the request is still waiting for a slave
        assert_eq!(queue.len(TASKS_QUEUE), 1);
    }

    #[tokio::test]
    async fn reply_is_returned_verbatim() -> anyhow::Result<()> {
        let queue = Arc::new(MemoryQueue::new());
        let worker = RemoteWorker::new(queue.clone(), Duration::from_secs(5));

        let responder = tokio::spawn({
            let queue = queue.clone();
            async move {
                let (_, body) = queue
                    .blocking_pop(&[TASKS_QUEUE], Duration::from_secs(5))
                    .await?
                    .expect("a request");
                let request: TaskRequest = serde_json::from_str(&body)?;
                assert_eq!(request.workload, "foo");
                assert_eq!(request.context.worker_index, 2);

                let reply = IterationResult {
                    duration: Duration::from_millis(3),
                    steps: vec![StepResult {
                        command: "foo".to_string(),
                        duration: Duration::from_millis(3),
                    }],
                    error: None,
                };
                queue
                    .push(&request.reply_to, &serde_json::to_string(&reply)?)
                    .await?;
                anyhow::Ok(reply)
            }
        });

        let result = worker.time("foo", Context::new(2)).await;
        assert_eq!(result, responder.await??);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_reply_is_a_transport_error() -> anyhow::Result<()> {
        let queue = Arc::new(MemoryQueue::new());
        let worker = RemoteWorker::new(queue.clone(), Duration::from_secs(5));

        tokio::spawn({
            let queue = queue.clone();
            async move {
                let (_, body) = queue
                    .blocking_pop(&[TASKS_QUEUE], Duration::from_secs(5))
                    .await?
                    .expect("a request");
                let request: TaskRequest = serde_json::from_str(&body)?;
                queue.push(&request.reply_to, "not json").await
            }
        });

        let result = worker.time("foo", Context::new(0)).await;
        assert!(matches!(result.error, Some(IterationError::Transport(_))));
        Ok(())
    }

    #[tokio::test]
    async fn every_call_gets_its_own_reply_list() -> anyhow::Result<()> {
        let queue = Arc::new(MemoryQueue::new());
        let worker = RemoteWorker::new(queue.clone(), Duration::from_millis(10));

        worker.time("foo", Context::new(0)).await;
        worker.time("foo", Context::new(0)).await;

        let first: TaskRequest = serde_json::from_str(
            &queue.blocking_pop(&[TASKS_QUEUE], Duration::ZERO).await?.expect("first").1,
        )?;
        let second: TaskRequest = serde_json::from_str(
            &queue.blocking_pop(&[TASKS_QUEUE], Duration::ZERO).await?.expect("second").1,
        )?;
        assert_ne!(first.reply_to, second.reply_to);
        Ok(())
    }
}
