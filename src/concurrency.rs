/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Building blocks for driving load: timing, counting in-flight invocations, producing streams of
//! tasks and consuming them with a pool of concurrent executors.
//!
//! A task stream is a bounded channel of tasks, so producers only run ahead of consumers by a
//! single task and dropping the receiver stops the producer.

use futures_util::future::BoxFuture;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinSet,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// A unit of work. The argument is the index of the executor running it.
pub type Task = Arc<dyn Fn(usize) -> BoxFuture<'static, ()> + Send + Sync>;
pub type TaskStream = mpsc::Receiver<Task>;

pub fn task<F, Fut>(f: F) -> Task
where
    F: Fn(usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |index| Box::pin(f(index)))
}

/// Wall-clock duration of a single invocation. The function's result is returned untouched.
pub async fn time<F, Fut, T>(f: F) -> (Duration, anyhow::Result<T>)
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let start = Instant::now();
    let res = f().await;
    (start.elapsed(), res)
}

/// Wraps `task` so that `+1` is sent on `counter` just before it runs and `-1` just after.
pub fn counted(counter: mpsc::Sender<i64>, task: Task) -> Task {
    Arc::new(move |index| {
        let counter = counter.clone();
        let task = task.clone();
        Box::pin(async move {
            // a closed counter only means nobody is watching
            let _ = counter.send(1).await;
            task(index).await;
            let _ = counter.send(-1).await;
        })
    })
}

/// Lazily produces exactly `n` copies of `task`.
pub fn repeat(n: usize, task: Task) -> TaskStream {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        for _ in 0..n {
            if tx.send(task.clone()).await.is_err() {
                break;
            }
        }
    });
    rx
}

pub fn once(task: Task) -> TaskStream {
    repeat(1, task)
}

/// Runs every task in the stream, one after the other, on the calling task.
pub async fn execute(mut tasks: TaskStream) {
    while let Some(task) = tasks.recv().await {
        task(0).await;
    }
}

/// Runs the stream with `pool_size` concurrent consumers and waits for all of them to finish.
pub async fn execute_concurrently(pool_size: usize, tasks: TaskStream) {
    let mut pool = TaskPool::new(tasks);
    for _ in 0..pool_size {
        pool.add_consumer();
    }
    pool.wait().await;
}

/// About thirty years, far enough to stand in for "never".
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// The instant `after` from now, saturating at a far-future instant instead of overflowing.
pub fn deadline(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after.min(FAR_FUTURE))
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Produces `task` once immediately and then once every `interval` until `stop_after` has elapsed
/// or `cancel` fires. A zero interval produces the task exactly once.
pub fn repeat_every_until(
    interval: Duration,
    stop_after: Duration,
    task: Task,
    cancel: CancellationToken,
) -> TaskStream {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let deadline = deadline(stop_after);
        if tx.send(task.clone()).await.is_err() || interval.is_zero() {
            return;
        }

        let mut ticker = tokio::time::interval_at(self::deadline(interval), interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => break,
                _ = ticker.tick() => {
                    if tx.send(task.clone()).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("stopped repeating");
    });
    rx
}

/// A growable set of consumers pulling from one task stream. Each task is taken by exactly one
/// consumer; consumers exit once the stream is exhausted.
pub struct TaskPool {
    tasks: Arc<Mutex<TaskStream>>,
    exhausted: Arc<AtomicBool>,
    consumers: JoinSet<()>,
    size: usize,
}
impl TaskPool {
    pub fn new(tasks: TaskStream) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(tasks)),
            exhausted: Arc::new(AtomicBool::new(false)),
            consumers: JoinSet::new(),
            size: 0,
        }
    }

    /// Starts one more consumer. Tasks already running are not affected.
    pub fn add_consumer(&mut self) {
        let index = self.size;
        self.size += 1;

        let tasks = self.tasks.clone();
        let exhausted = self.exhausted.clone();
        self.consumers.spawn(async move {
            loop {
                // the lock is released before the task runs
                let next = tasks.lock().await.recv().await;
                match next {
                    Some(task) => task(index).await,
                    None => {
                        exhausted.store(true, Ordering::Release);
                        break;
                    }
                }
            }
        });
    }

    /// Number of consumers started so far.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    /// Number of consumers still running.
    pub fn running(&self) -> usize {
        self.consumers.len()
    }

    /// Waits for the next consumer to finish. Returns `None` when no consumers are running.
    pub async fn join_next(&mut self) -> Option<()> {
        let res = self.consumers.join_next().await?;
        if let Err(err) = res {
            error!("Task consumer stopped unexpectedly: {}", err);
        }
        Some(())
    }

    pub async fn wait(mut self) {
        while self.join_next().await.is_some() {}
    }
}
