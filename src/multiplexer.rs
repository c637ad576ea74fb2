/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::sample::Sample;
use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinSet};
use tracing::{error, warn};

/// A consumer of a run's sample stream. A handler owns its receiver and is done once the stream
/// closes.
#[async_trait]
pub trait Handler: Send {
    fn name(&self) -> &str;

    async fn handle(self: Box<Self>, samples: mpsc::Receiver<Sample>) -> anyhow::Result<()>;
}

/// Fans every sample from `input` out to each handler, in the order received. Each handler has a
/// buffer of one, so a slow handler paces the whole stream. A handler that stops reading early is
/// dropped from the fan-out without affecting the others. Returns once every handler has
/// finished.
pub async fn multiplex(mut input: mpsc::Receiver<Sample>, handlers: Vec<Box<dyn Handler>>) {
    let mut outputs = vec![];
    let mut running = JoinSet::new();

    for handler in handlers {
        let (tx, rx) = mpsc::channel(1);
        let name = handler.name().to_string();
        outputs.push((name.clone(), tx));
        running.spawn(async move {
            let res = handler.handle(rx).await;
            (name, res)
        });
    }

    while let Some(sample) = input.recv().await {
        let mut closed = vec![];
        for (i, (name, tx)) in outputs.iter().enumerate() {
            if tx.send(sample.clone()).await.is_err() {
                warn!("Handler '{}' stopped reading samples", name);
                closed.push(i);
            }
        }
        for i in closed.into_iter().rev() {
            outputs.remove(i);
        }
    }

    // closing the outputs lets every handler finish
    drop(outputs);

    while let Some(res) = running.join_next().await {
        match res {
            Ok((_, Ok(()))) => {}
            Ok((name, Err(err))) => error!("Handler '{}' failed: {:#}", name, err),
            Err(err) => error!("Handler stopped unexpectedly: {}", err),
        }
    }
}
