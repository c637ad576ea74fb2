/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::Queue;
use crate::concurrency;
use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Lists {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    pushed: Notify,
}

/// An in-process queue. Clones share the same lists.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Lists>,
}
impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, list: &str) -> usize {
        let lists = self.inner.lists.lock().expect("queue lock poisoned");
        lists.get(list).map(VecDeque::len).unwrap_or(0)
    }

    fn try_pop(&self, names: &[&str]) -> Option<(String, String)> {
        let mut lists = self.inner.lists.lock().expect("queue lock poisoned");
        names.iter().find_map(|name| {
            lists
                .get_mut(*name)
                .and_then(VecDeque::pop_front)
                .map(|value| (name.to_string(), value))
        })
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn push(&self, list: &str, value: &str) -> anyhow::Result<()> {
        self.inner
            .lists
            .lock()
            .expect("queue lock poisoned")
            .entry(list.to_string())
            .or_default()
            .push_back(value.to_string());
        self.inner.pushed.notify_waiters();
        Ok(())
    }

    async fn blocking_pop(
        &self,
        lists: &[&str],
        timeout: Duration,
    ) -> anyhow::Result<Option<(String, String)>> {
        let deadline = concurrency::deadline(timeout);
        loop {
            // register interest before looking so a push in between is not missed
            let pushed = self.inner.pushed.notified();
            tokio::pin!(pushed);
            pushed.as_mut().enable();

            if let Some(popped) = self.try_pop(lists) {
                return Ok(Some(popped));
            }
            if tokio::time::timeout_at(deadline, pushed).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test]
    async fn pops_in_fifo_order() -> anyhow::Result<()> {
        let queue = MemoryQueue::new();
        queue.push("tasks", "a").await?;
        queue.push("tasks", "b").await?;

        let timeout = Duration::from_millis(10);
        assert_eq!(
            queue.blocking_pop(&["tasks"], timeout).await?,
            Some(("tasks".to_string(), "a".to_string()))
        );
        assert_eq!(
            queue.blocking_pop(&["tasks"], timeout).await?,
            Some(("tasks".to_string(), "b".to_string()))
        );
        assert_eq!(queue.len("tasks"), 0);
        Ok(())
    }

    #[tokio::test]
    async fn earlier_lists_win() -> anyhow::Result<()> {
        let queue = MemoryQueue::new();
        queue.push("tasks", "work").await?;
        queue.push("stop", "now").await?;

        let popped = queue
            .blocking_pop(&["stop", "tasks"], Duration::from_millis(10))
            .await?;
        assert_eq!(popped, Some(("stop".to_string(), "now".to_string())));
        assert_eq!(queue.len("tasks"), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_empty() -> anyhow::Result<()> {
        let queue = MemoryQueue::new();
        let start = Instant::now();
        let popped = queue.blocking_pop(&["tasks"], Duration::from_secs(1)).await?;
        assert_eq!(popped, None);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        Ok(())
    }

    #[tokio::test]
    async fn unbounded_timeout_still_pops() -> anyhow::Result<()> {
        let queue = MemoryQueue::new();
        queue.push("tasks", "a").await?;
        let popped = queue.blocking_pop(&["tasks"], Duration::MAX).await?;
        assert_eq!(popped, Some(("tasks".to_string(), "a".to_string())));
        Ok(())
    }

    #[tokio::test]
    async fn wakes_on_push() -> anyhow::Result<()> {
        let queue = MemoryQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.blocking_pop(&["reply"], Duration::from_secs(30)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push("reply", "done").await?;

        assert_eq!(
            waiter.await??,
            Some(("reply".to_string(), "done".to_string()))
        );
        Ok(())
    }
}
