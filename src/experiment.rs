/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    concurrency::{self, Task, TaskPool},
    sample::Sample,
    sampler::{self, SamplerOutputs},
    worker::{Context, Worker, DEFAULT_WORKLOAD},
};
use anyhow::{anyhow, Context as _};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const RESULT_BUFFER: usize = 256;

/// Size of the worker pool: either fixed, or ramping from `start` to `end` one worker at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concurrency {
    pub start: usize,
    pub end: Option<usize>,
}
impl Concurrency {
    pub fn fixed(size: usize) -> Self {
        Concurrency {
            start: size,
            end: None,
        }
    }

    pub fn ramp(start: usize, end: usize) -> Self {
        Concurrency {
            start,
            end: Some(end),
        }
    }

    pub fn target(&self) -> usize {
        self.end.unwrap_or(self.start).max(self.start)
    }
}
impl FromStr for Concurrency {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |level: &str| {
            level
                .trim()
                .parse::<usize>()
                .context(format!("Invalid concurrency level '{}'", level))
        };

        match s.split("..").collect::<Vec<_>>()[..] {
            [size] => Ok(Concurrency::fixed(parse(size)?)),
            [start, end] => {
                let (start, end) = (parse(start)?, parse(end)?);
                if end < start {
                    return Err(anyhow!(
                        "Concurrency ramp must not shrink, got '{}'",
                        s
                    ));
                }
                Ok(Concurrency::ramp(start, end))
            }
            _ => Err(anyhow!(
                "Concurrency must be a single level or 'start..end', got '{}'",
                s
            )),
        }
    }
}
impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}..{}", self.start, end),
            None => write!(f, "{}", self.start),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfiguration {
    pub iterations: usize,
    pub concurrency: Concurrency,
    pub concurrency_step_time: Duration,
    pub interval: Duration,
    pub stop: Duration,
    pub workload: String,
    pub note: String,
    /// Values handed to every step through its `Context`.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}
impl Default for ExperimentConfiguration {
    fn default() -> Self {
        ExperimentConfiguration {
            iterations: 1,
            concurrency: Concurrency::fixed(1),
            concurrency_step_time: Duration::from_secs(60),
            interval: Duration::ZERO,
            stop: Duration::ZERO,
            workload: DEFAULT_WORKLOAD.to_string(),
            note: String::new(),
            context: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Executing,
    Draining,
    Closed,
}

/// Anything the laboratory can run: it yields a stream of samples that closes when it is done.
pub trait Runnable: Send {
    fn config(&self) -> &ExperimentConfiguration;
    fn run(self: Box<Self>, cancel: CancellationToken) -> mpsc::Receiver<Sample>;
}

pub struct Experiment {
    config: ExperimentConfiguration,
    worker: Arc<dyn Worker>,
    state_tx: watch::Sender<RunState>,
    state_rx: watch::Receiver<RunState>,
}
impl Experiment {
    /// Validates the workload against the worker; nothing runs if a step is unknown.
    pub fn new(mut config: ExperimentConfiguration, worker: Arc<dyn Worker>) -> anyhow::Result<Self> {
        if config.workload.trim().is_empty() {
            config.workload = DEFAULT_WORKLOAD.to_string();
        }
        worker
            .validate(&config.workload)
            .context(format!("Invalid workload '{}'", config.workload))?;

        let (state_tx, state_rx) = watch::channel(RunState::Idle);
        Ok(Experiment {
            config,
            worker,
            state_tx,
            state_rx,
        })
    }

    pub fn state(&self) -> watch::Receiver<RunState> {
        self.state_rx.clone()
    }

    fn set_state(&self, state: RunState) {
        debug!(?state, workload = %self.config.workload, "experiment state changed");
        self.state_tx.send_replace(state);
    }

    /// One iteration: time the workload and route the outcome to the sampler.
    fn iteration_task(&self, outputs: SamplerOutputs) -> Task {
        let worker = self.worker.clone();
        let workload = self.config.workload.clone();
        let values = self.config.context.clone();

        concurrency::task(move |worker_index| {
            let worker = worker.clone();
            let workload = workload.clone();
            let outputs = outputs.clone();
            let ctx = Context {
                worker_index,
                values: values.clone(),
            };

            async move {
                let result = worker.time(&workload, ctx).await;
                // send errors only mean the sampler has gone away
                for step in result.completed_steps() {
                    let _ = outputs.benchmarks.send(step.clone()).await;
                }
                match result.error {
                    Some(err) => {
                        let _ = outputs.errors.send(err).await;
                    }
                    None => {
                        let _ = outputs.iterations.send(result).await;
                    }
                }
            }
        })
    }

    async fn execute(self, outputs: SamplerOutputs, sampling: JoinHandle<()>, cancel: CancellationToken) {
        self.set_state(RunState::Executing);
        info!(
            workload = %self.config.workload,
            iterations = self.config.iterations,
            concurrency = %self.config.concurrency,
            "starting experiment"
        );

        let degenerate = self.config.iterations == 0 || self.config.concurrency.target() == 0;
        if degenerate {
            self.set_state(RunState::Draining);
        } else {
            let iteration = self.iteration_task(outputs.clone());
            let counted = concurrency::counted(outputs.workers.clone(), iteration);

            let (task_tx, task_rx) = mpsc::channel(1);
            let mut feeder = tokio::spawn(feed(
                task_tx,
                counted,
                self.config.iterations,
                self.config.interval,
                self.config.stop,
                cancel.clone(),
            ));

            let consumers = ramp(
                TaskPool::new(task_rx),
                self.config.concurrency,
                self.config.concurrency_step_time,
                cancel,
            );
            tokio::pin!(consumers);

            // the feeder finishes once the last task is queued or the run is cancelled, while
            // iterations may still be in flight
            tokio::select! {
                res = &mut feeder => {
                    if let Err(err) = res {
                        error!("Batch feeder stopped unexpectedly: {}", err);
                    }
                    self.set_state(RunState::Draining);
                    consumers.await;
                }
                _ = &mut consumers => {
                    self.set_state(RunState::Draining);
                    if let Err(err) = feeder.await {
                        error!("Batch feeder stopped unexpectedly: {}", err);
                    }
                }
            }
        }

        // the sampler closes once the last sender is gone
        drop(outputs);
        if let Err(err) = sampling.await {
            error!("Sampler stopped unexpectedly: {}", err);
        }
        self.set_state(RunState::Closed);
        info!(workload = %self.config.workload, "experiment finished");
    }
}
impl Runnable for Experiment {
    fn config(&self) -> &ExperimentConfiguration {
        &self.config
    }

    fn run(self: Box<Self>, cancel: CancellationToken) -> mpsc::Receiver<Sample> {
        let started = Instant::now();
        let (outputs, inputs) = sampler::channels(RESULT_BUFFER);
        let (samples, sampling) = sampler::spawn(inputs, started);
        tokio::spawn(self.execute(outputs, sampling, cancel));
        samples
    }
}

/// Interval controller: pushes a batch of `iterations` tasks into the pool's stream at every
/// interval boundary until `stop` has elapsed, or exactly once when the interval is zero.
async fn feed(
    tasks: mpsc::Sender<Task>,
    iteration: Task,
    iterations: usize,
    interval: Duration,
    stop: Duration,
    cancel: CancellationToken,
) {
    let batch = {
        let tasks = tasks.clone();
        let cancel = cancel.clone();
        concurrency::task(move |_| {
            let mut repetitions = concurrency::repeat(iterations, iteration.clone());
            let tasks = tasks.clone();
            let cancel = cancel.clone();
            async move {
                while let Some(task) = repetitions.recv().await {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        res = tasks.send(task) => {
                            if res.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        })
    };

    let batches = concurrency::repeat_every_until(interval, stop, batch, cancel);
    tokio::select! {
        _ = tasks.closed() => debug!("task pool closed, no more batches"),
        _ = concurrency::execute(batches) => debug!("all batches issued"),
    }
}

/// Ramp controller: starts `concurrency.start` consumers and adds one every `step_time` until the
/// target is reached, the stream is exhausted or the run is cancelled. Returns once every
/// consumer has finished.
async fn ramp(
    mut pool: TaskPool,
    concurrency: Concurrency,
    step_time: Duration,
    cancel: CancellationToken,
) {
    let target = concurrency.target();
    let initial = if step_time.is_zero() {
        target
    } else {
        concurrency.start
    };
    for _ in 0..initial {
        pool.add_consumer();
    }

    let mut ticker = tokio::time::interval_at(
        concurrency::deadline(step_time),
        step_time.max(Duration::from_millis(1)),
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let ramping = pool.size() < target && !pool.is_exhausted() && !cancel.is_cancelled();
        let running = pool.running();
        if !ramping && running == 0 {
            break;
        }

        tokio::select! {
            _ = ticker.tick(), if ramping => {
                pool.add_consumer();
                debug!(workers = pool.size(), target, "added worker");
            }
            _ = cancel.cancelled(), if ramping => {}
            _ = pool.join_next(), if running > 0 => {}
        }
    }
}
