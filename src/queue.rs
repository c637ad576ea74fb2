/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod memory;
pub mod redis;

pub use self::redis::RedisQueue;
pub use memory::MemoryQueue;

use async_trait::async_trait;
use std::time::Duration;

/// Named lists of strings shared between a master and its slaves.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Appends `value` to the tail of `list`.
    async fn push(&self, list: &str, value: &str) -> anyhow::Result<()>;

    /// Pops the head of the first non-empty list in `lists`, waiting up to `timeout` for one to
    /// become non-empty. Returns the list the value came from, or `None` on timeout.
    async fn blocking_pop(
        &self,
        lists: &[&str],
        timeout: Duration,
    ) -> anyhow::Result<Option<(String, String)>>;
}
