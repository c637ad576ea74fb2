/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    queue::Queue,
    worker::{remote::TaskRequest, remote::TASKS_QUEUE, Worker},
};
use anyhow::{anyhow, Context};
use std::{sync::Arc, time::Duration};
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{debug, error, info, warn};

/// How long `close` waits for the slave to acknowledge a stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bound on tasks a slave runs at once.
pub fn default_max_in_flight() -> usize {
    num_cpus::get() * 4
}

fn stop_list(handle: &str) -> String {
    format!("stop-{}", handle)
}

fn stopped_list(handle: &str) -> String {
    format!("stopped-{}", handle)
}

/// Serves timing requests from the shared tasks list with a local worker until stopped.
pub struct Slave {
    handle: String,
    queue: Arc<dyn Queue>,
    serving: JoinHandle<anyhow::Result<()>>,
}
impl Slave {
    /// Starts serving in the background. `poll` bounds each wait on the queue so the loop never
    /// blocks on a single pop indefinitely.
    pub fn start(
        queue: Arc<dyn Queue>,
        worker: Arc<dyn Worker>,
        max_in_flight: usize,
        poll: Duration,
    ) -> Self {
        let handle = nanoid::nanoid!();
        info!(handle = %handle, max_in_flight, "slave starting");
        let serving = tokio::spawn(serve(
            handle.clone(),
            queue.clone(),
            worker,
            max_in_flight.max(1),
            poll,
        ));

        Slave {
            handle,
            queue,
            serving,
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// True once the serving loop has exited, either after a stop or on a fatal queue error.
    pub fn is_finished(&self) -> bool {
        self.serving.is_finished()
    }

    /// Asks the slave to stop and waits until it confirms that every in-flight task has replied.
    pub async fn close(self) -> anyhow::Result<()> {
        self.queue.push(&stop_list(&self.handle), "stop").await?;

        let ack = self
            .queue
            .blocking_pop(&[stopped_list(&self.handle).as_str()], STOP_TIMEOUT)
            .await?;
        if ack.is_none() {
            self.serving.abort();
            return Err(anyhow!(
                "Slave {} did not acknowledge stop within {:?}",
                self.handle,
                STOP_TIMEOUT
            ));
        }

        self.serving
            .await
            .context("Slave loop stopped unexpectedly")??;
        info!(handle = %self.handle, "slave stopped");
        Ok(())
    }

    /// Waits for the serving loop to exit on its own, which only happens on a fatal error.
    pub async fn wait(self) -> anyhow::Result<()> {
        self.serving
            .await
            .context("Slave loop stopped unexpectedly")?
    }
}

async fn serve(
    handle: String,
    queue: Arc<dyn Queue>,
    worker: Arc<dyn Worker>,
    max_in_flight: usize,
    poll: Duration,
) -> anyhow::Result<()> {
    let stop = stop_list(&handle);
    let in_flight = Arc::new(Semaphore::new(max_in_flight));

    loop {
        let popped = queue
            .blocking_pop(&[stop.as_str(), TASKS_QUEUE], poll)
            .await
            .context("Slave lost its queue connection")?;

        let Some((list, body)) = popped else {
            continue;
        };

        if list == stop {
            debug!(handle = %handle, "stop requested, waiting for in-flight tasks");
            let permits = u32::try_from(max_in_flight).unwrap_or(u32::MAX);
            let _all = in_flight.acquire_many(permits).await?;
            queue.push(&stopped_list(&handle), "stopped").await?;
            return Ok(());
        }

        let request: TaskRequest = serde_json::from_str(&body)
            .context(format!("Malformed task request on {}: {}", list, body))?;

        let permit = in_flight.clone().acquire_owned().await?;
        let worker = worker.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            let result = worker.time(&request.workload, request.context).await;
            if let Some(err) = &result.error {
                debug!(workload = %request.workload, "task failed: {}", err);
            }

            match serde_json::to_string(&result) {
                Ok(reply) => {
                    if let Err(err) = queue.push(&request.reply_to, &reply).await {
                        error!("Unable to reply on {}: {:#}", request.reply_to, err);
                    }
                }
                Err(err) => warn!("Unable to encode reply for {}: {}", request.reply_to, err),
            }
            drop(permit);
        });
    }
}
