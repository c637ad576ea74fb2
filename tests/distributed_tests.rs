use anyhow::{self, Context};
use loadlab::{
    experiment::{Concurrency, Experiment, ExperimentConfiguration, Runnable},
    queue::{MemoryQueue, Queue},
    sample::Sample,
    slave::Slave,
    worker::{Context as StepContext, IterationError, LocalWorker, RemoteWorker, Worker},
    workloads,
};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const POLL: Duration = Duration::from_millis(50);

fn remote_worker(queue: Arc<dyn Queue>, timeout: Duration) -> Arc<dyn Worker> {
    let mut worker = RemoteWorker::new(queue, timeout);
    workloads::register_builtin(&mut worker);
    Arc::new(worker)
}

fn start_slave(queue: Arc<dyn Queue>) -> Slave {
    let mut worker = LocalWorker::new();
    workloads::register_builtin(&mut worker);
    Slave::start(queue, Arc::new(worker), 8, POLL)
}

async fn run_to_end(runnable: Box<dyn Runnable>) -> Vec<Sample> {
    let mut samples = runnable.run(CancellationToken::new());
    let mut collected = vec![];
    while let Some(sample) = samples.recv().await {
        collected.push(sample);
    }
    collected
}

#[tokio::test]
async fn experiment_runs_through_slaves() -> anyhow::Result<()> {
    let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new());
    let slaves = vec![start_slave(queue.clone()), start_slave(queue.clone())];

    let config = ExperimentConfiguration {
        iterations: 20,
        concurrency: Concurrency::fixed(4),
        workload: "dummy,dummy".to_string(),
        ..Default::default()
    };
    let experiment = Experiment::new(config, remote_worker(queue.clone(), Duration::from_secs(5)))?;

    let samples = run_to_end(Box::new(experiment)).await;
    let last = samples.last().context("no samples")?;
    assert_eq!(last.total, 20);
    assert_eq!(last.total_errors, 0);
    assert_eq!(last.commands.get("dummy").map(|c| c.count), Some(40));

    for slave in slaves {
        slave.close().await?;
    }
    Ok(())
}

#[tokio::test]
async fn step_failures_on_a_slave_are_iteration_errors() -> anyhow::Result<()> {
    let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new());
    let slave = start_slave(queue.clone());

    let config = ExperimentConfiguration {
        iterations: 6,
        concurrency: Concurrency::fixed(1),
        workload: "dummy-with-errors".to_string(),
        ..Default::default()
    };
    let experiment = Experiment::new(config, remote_worker(queue.clone(), Duration::from_secs(5)))?;

    let samples = run_to_end(Box::new(experiment)).await;
    let last = samples.last().context("no samples")?;
    assert_eq!(last.total, 3);
    assert_eq!(last.total_errors, 3);
    assert!(last
        .last_error
        .as_deref()
        .is_some_and(|err| err.contains("Dummy failure")));

    slave.close().await
}

#[tokio::test(start_paused = true)]
async fn remote_calls_without_a_slave_time_out() -> anyhow::Result<()> {
    let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new());
    let worker = remote_worker(queue, Duration::from_secs(1));

    let start = Instant::now();
    let result = worker.time("dummy", StepContext::new(0)).await;

    assert!(start.elapsed() <= Duration::from_secs(2));
    assert_eq!(result.error, Some(IterationError::Timeout(Duration::from_secs(1))));
    assert!(result.steps.is_empty());
    Ok(())
}

#[tokio::test]
async fn slaves_started_late_pick_up_waiting_requests() -> anyhow::Result<()> {
    let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new());
    let worker = remote_worker(queue.clone(), Duration::from_secs(5));

    let call = tokio::spawn(async move { worker.time("dummy", StepContext::new(2)).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    let slave = start_slave(queue.clone());

    let result = call.await?;
    assert!(result.error.is_none());
    assert_eq!(result.steps.len(), 1);

    slave.close().await
}
