use anyhow::{self, Context};
use loadlab::{
    db_connect, db_migrate,
    experiment::{Concurrency, Experiment, ExperimentConfiguration},
    handlers::{BufferHandler, SampleBuffer},
    laboratory::Laboratory,
    sample::SampleType,
    store::{DbStore, Store},
    worker::{LocalWorker, Worker},
    workloads,
};
use std::{sync::Arc, time::Duration};

async fn setup_store() -> anyhow::Result<Arc<dyn Store>> {
    let db = db_connect("sqlite::memory:").await?;
    db_migrate(&db).await?;
    Ok(Arc::new(DbStore::new(db)))
}

fn dummy_experiment(iterations: usize, workload: &str) -> anyhow::Result<Experiment> {
    let mut worker = LocalWorker::new();
    workloads::register_builtin(&mut worker);

    let config = ExperimentConfiguration {
        iterations,
        concurrency: Concurrency::fixed(3),
        workload: workload.to_string(),
        note: "integration".to_string(),
        ..Default::default()
    };
    Experiment::new(config, Arc::new(worker))
}

#[tokio::test]
async fn stored_samples_match_the_live_stream() -> anyhow::Result<()> {
    let store = setup_store().await?;
    let lab = Laboratory::new(store.clone()).await?;

    let seen = SampleBuffer::new();
    let guid = lab.run(
        Box::new(dummy_experiment(12, "dummy")?),
        vec![Box::new(BufferHandler::new(seen.clone()))],
    );
    lab.wait(&guid).await?;

    let stored = store.fetch(&guid).await?;
    assert_eq!(stored, seen.snapshot());

    let last = stored.last().context("no samples stored")?;
    assert_eq!(last.total, 12);
    assert_eq!(last.total_errors, 0);
    assert_eq!(
        stored
            .iter()
            .filter(|s| s.kind == SampleType::ResultSample)
            .count(),
        12
    );
    Ok(())
}

#[tokio::test]
async fn a_new_laboratory_sees_finished_runs() -> anyhow::Result<()> {
    let store = setup_store().await?;

    let first = Laboratory::new(store.clone()).await?;
    let guid = first.run(Box::new(dummy_experiment(4, "dummy-with-errors")?), vec![]);
    first.wait(&guid).await?;
    let expected = first.get_data(&guid).await?;

    let lab = Laboratory::new(store).await?;
    let mut records = vec![];
    lab.visit(&mut |record| records.push(record.clone()));

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].guid, guid);
    assert!(!records[0].running);
    assert_eq!(records[0].config.note, "integration");
    assert_eq!(records[0].config.concurrency, Concurrency::fixed(3));

    let samples = lab.get_data(&guid).await?;
    assert_eq!(samples, expected);
    let last = samples.last().context("no samples stored")?;
    assert_eq!(last.total + last.total_errors, 4);
    assert_eq!(last.total_errors, 2);
    Ok(())
}

#[tokio::test]
async fn unknown_workloads_never_start() -> anyhow::Result<()> {
    let err = dummy_experiment(1, "dummy,missing").err().context("should not validate")?;
    assert!(format!("{:#}", err).contains("missing"));
    Ok(())
}

#[tokio::test]
async fn cancelling_the_laboratory_stops_every_run() -> anyhow::Result<()> {
    let lab = Laboratory::new(setup_store().await?).await?;

    let guids: Vec<_> = (0..2)
        .map(|_| Ok(lab.run(Box::new(dummy_experiment(100_000, "dummy")?), vec![])))
        .collect::<anyhow::Result<_>>()?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    lab.cancellation_token().cancel();

    for guid in guids.iter() {
        tokio::time::timeout(Duration::from_secs(10), lab.wait(guid)).await??;
        let samples = lab.get_data(guid).await?;
        let last = samples.last().context("no samples stored")?;
        assert!(last.total < 100_000);
    }
    Ok(())
}

#[test]
fn builtin_workloads_are_registered() {
    let mut worker = LocalWorker::new();
    workloads::register_builtin(&mut worker);
    assert!(worker.validate("dummy,dummy-with-errors").is_ok());
}
