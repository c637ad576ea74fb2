/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    sample::{Aggregator, Sample},
    worker::{IterationError, IterationResult, StepResult},
};
use std::time::Duration;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::debug;

pub const SAMPLE_BUFFER: usize = 64;
const TICK: Duration = Duration::from_secs(1);

/// The raw event channels a run feeds into its sampler.
pub struct SamplerInputs {
    pub iterations: mpsc::Receiver<IterationResult>,
    pub benchmarks: mpsc::Receiver<StepResult>,
    pub errors: mpsc::Receiver<IterationError>,
    pub workers: mpsc::Receiver<i64>,
}

/// Senders matching `SamplerInputs`.
#[derive(Clone)]
pub struct SamplerOutputs {
    pub iterations: mpsc::Sender<IterationResult>,
    pub benchmarks: mpsc::Sender<StepResult>,
    pub errors: mpsc::Sender<IterationError>,
    pub workers: mpsc::Sender<i64>,
}

pub fn channels(buffer: usize) -> (SamplerOutputs, SamplerInputs) {
    let (iterations_tx, iterations) = mpsc::channel(buffer);
    let (benchmarks_tx, benchmarks) = mpsc::channel(buffer);
    let (errors_tx, errors) = mpsc::channel(buffer);
    let (workers_tx, workers) = mpsc::channel(buffer);

    (
        SamplerOutputs {
            iterations: iterations_tx,
            benchmarks: benchmarks_tx,
            errors: errors_tx,
            workers: workers_tx,
        },
        SamplerInputs {
            iterations,
            benchmarks,
            errors,
            workers,
        },
    )
}

/// Starts the sampling loop. The returned stream yields one sample per observed event and
/// closes after the final sample, once the iteration channel has closed. The handle completes
/// when the loop has handed over its last sample.
pub fn spawn(inputs: SamplerInputs, started: Instant) -> (mpsc::Receiver<Sample>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(SAMPLE_BUFFER);
    let sampling = tokio::spawn(sample(inputs, started, tx));
    (rx, sampling)
}

async fn sample(mut inputs: SamplerInputs, started: Instant, tx: mpsc::Sender<Sample>) {
    let mut agg = Aggregator::new();
    let mut ticker = tokio::time::interval_at(started + TICK, TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let sample = tokio::select! {
            res = inputs.iterations.recv() => match res {
                Some(res) => agg.on_iteration(res.duration, started.elapsed()),
                None => break,
            },
            Some(step) = inputs.benchmarks.recv() => agg.on_step(&step, started.elapsed()),
            Some(err) = inputs.errors.recv() => agg.on_error(err.to_string(), started.elapsed()),
            Some(delta) = inputs.workers.recv() => agg.on_workers(delta, started.elapsed()),
            _ = ticker.tick() => agg.on_tick(started.elapsed()),
        };

        if tx.send(sample).await.is_err() {
            debug!("sample stream dropped, sampler stopping");
            return;
        }
    }

    // everything still buffered was sent before the iteration channel closed
    let mut pending = vec![];
    while let Ok(step) = inputs.benchmarks.try_recv() {
        pending.push(agg.on_step(&step, started.elapsed()));
    }
    while let Ok(err) = inputs.errors.try_recv() {
        pending.push(agg.on_error(err.to_string(), started.elapsed()));
    }
    while let Ok(delta) = inputs.workers.try_recv() {
        pending.push(agg.on_workers(delta, started.elapsed()));
    }
    pending.push(agg.snapshot(started.elapsed()));

    for sample in pending {
        if tx.send(sample).await.is_err() {
            return;
        }
    }
    debug!("sampler finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SampleType;

    async fn collect(mut rx: mpsc::Receiver<Sample>) -> Vec<Sample> {
        let mut samples = vec![];
        while let Some(sample) = rx.recv().await {
            samples.push(sample);
        }
        samples
    }

    fn result(secs: u64) -> IterationResult {
        IterationResult {
            duration: Duration::from_secs(secs),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn closing_without_events_flushes_one_sample() {
        let (outputs, inputs) = channels(8);
        let (rx, _) = spawn(inputs, Instant::now());
        drop(outputs);

        let samples = collect(rx).await;
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].total, 0);
    }

    #[tokio::test]
    async fn handle_finishes_after_the_last_sample() -> anyhow::Result<()> {
        let (outputs, inputs) = channels(8);
        let (mut rx, sampling) = spawn(inputs, Instant::now());
        outputs.iterations.send(result(1)).await?;
        drop(outputs);

        sampling.await?;
        let mut seen = 0;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 2);
        Ok(())
    }

    #[tokio::test]
    async fn one_sample_per_event() -> anyhow::Result<()> {
        let (outputs, inputs) = channels(8);
        let (rx, _) = spawn(inputs, Instant::now());

        outputs.iterations.send(result(2)).await?;
        outputs.iterations.send(result(4)).await?;
        outputs.iterations.send(result(6)).await?;
        drop(outputs);

        let samples = collect(rx).await;
        let results: Vec<_> = samples
            .iter()
            .filter(|s| s.kind == SampleType::ResultSample)
            .map(|s| s.average.as_secs())
            .collect();
        assert_eq!(results, vec![2, 3, 4]);
        assert_eq!(samples.last().map(|s| s.total), Some(3));
        Ok(())
    }

    #[tokio::test]
    async fn buffered_events_land_before_the_final_sample() -> anyhow::Result<()> {
        let (outputs, inputs) = channels(8);

        // queue everything before the sampler starts so the iteration channel may be seen
        // closed before the others are read
        outputs
            .benchmarks
            .send(StepResult {
                command: "push".to_string(),
                duration: Duration::from_secs(1),
            })
            .await?;
        outputs
            .errors
            .send(IterationError::Step("bad".to_string()))
            .await?;
        outputs.workers.send(1).await?;
        outputs.workers.send(-1).await?;
        drop(outputs);

        let (rx, _) = spawn(inputs, Instant::now());
        let samples = collect(rx).await;
        let last = samples.last().expect("final sample");
        assert_eq!(last.commands["push"].count, 1);
        assert_eq!(last.total_errors, 1);
        assert_eq!(last.total_workers, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_emit_throughput_samples() -> anyhow::Result<()> {
        let (outputs, inputs) = channels(8);
        let (mut rx, _) = spawn(inputs, Instant::now());

        outputs
            .benchmarks
            .send(StepResult {
                command: "push".to_string(),
                duration: Duration::from_millis(10),
            })
            .await?;
        assert_eq!(rx.recv().await.map(|s| s.kind), Some(SampleType::OtherSample));

        let tick = rx.recv().await.expect("tick sample");
        assert_eq!(tick.kind, SampleType::ThroughputSample);
        assert_eq!(tick.wall_time, Duration::from_secs(1));
        assert_eq!(tick.commands["push"].throughput, 1.0);

        drop(outputs);
        Ok(())
    }
}
