/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Queue backed by a Redis compatible server, using its lists.

use super::Queue;
use ::redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use std::{sync::Mutex, time::Duration};
use tracing::{debug, trace};

const MAX_IDLE: usize = 8;

/// Extra time allowed past a blocking pop's own timeout before the connection is given up on.
const REPLY_SLACK: Duration = Duration::from_secs(5);

/// Accepts either a full `redis://` url or a bare `host:port`.
pub fn redis_url(address: &str) -> String {
    let address = address.trim();
    match address.contains("://") {
        true => address.to_string(),
        false => format!("redis://{}", address),
    }
}

/// Pushes share one multiplexed connection. A blocking pop holds its connection until the server
/// replies, so each one checks out a connection of its own.
pub struct RedisQueue {
    url: String,
    client: Client,
    shared: MultiplexedConnection,
    idle: Mutex<Vec<MultiplexedConnection>>,
}
impl RedisQueue {
    pub async fn connect(address: &str) -> anyhow::Result<Self> {
        let url = redis_url(address);
        let client =
            Client::open(url.as_str()).context(format!("Invalid queue address {}", address))?;
        let shared = client
            .get_multiplexed_async_connection()
            .await
            .context(format!("Unable to connect to queue at {}", url))?;

        Ok(RedisQueue {
            url,
            client,
            shared,
            idle: Mutex::new(vec![]),
        })
    }

    async fn checkout(&self) -> anyhow::Result<MultiplexedConnection> {
        let idle = self.idle.lock().expect("connection pool lock poisoned").pop();
        match idle {
            Some(conn) => Ok(conn),
            None => {
                debug!(url = %self.url, "opening queue connection");
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .context(format!("Unable to connect to queue at {}", self.url))
            }
        }
    }

    fn checkin(&self, conn: MultiplexedConnection) {
        let mut idle = self.idle.lock().expect("connection pool lock poisoned");
        if idle.len() < MAX_IDLE {
            idle.push(conn);
        }
    }
}

#[async_trait]
impl Queue for RedisQueue {
    async fn push(&self, list: &str, value: &str) -> anyhow::Result<()> {
        trace!(list, "queue push");
        let mut conn = self.shared.clone();
        let _: i64 = conn
            .rpush(list, value)
            .await
            .context(format!("Unable to push to {} on {}", list, self.url))?;
        Ok(())
    }

    async fn blocking_pop(
        &self,
        lists: &[&str],
        timeout: Duration,
    ) -> anyhow::Result<Option<(String, String)>> {
        // whole seconds for older servers, and 0 would block forever
        let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
        let secs = secs.max(1);

        let mut conn = self.checkout().await?;
        trace!(?lists, secs, "queue blocking pop");
        let popped: Option<(String, String)> = tokio::time::timeout(
            Duration::from_secs(secs).saturating_add(REPLY_SLACK),
            conn.blpop(lists, secs as f64),
        )
        .await
        .map_err(|_| anyhow!("No reply from queue at {} to BLPOP", self.url))?
        .context(format!("Unable to pop from {:?} on {}", lists, self.url))?;

        // only a connection that completed its exchange goes back to the pool
        self.checkin(conn);
        Ok(popped)
    }
}
