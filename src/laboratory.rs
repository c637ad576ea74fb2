/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    experiment::{ExperimentConfiguration, Runnable},
    handlers::{BufferHandler, SampleBuffer},
    multiplexer::{multiplex, Handler},
    sample::Sample,
    store::Store,
};
use anyhow::{anyhow, Context};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What `visit` reports for each known experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentRecord {
    pub guid: String,
    pub config: ExperimentConfiguration,
    pub running: bool,
}

struct LiveExperiment {
    guid: String,
    config: ExperimentConfiguration,
    buffer: SampleBuffer,
    done: watch::Receiver<bool>,
    cancel: CancellationToken,
}
impl LiveExperiment {
    fn is_running(&self) -> bool {
        !*self.done.borrow()
    }
}

#[derive(Default)]
struct Registry {
    // loaded from the store at start up, in write order
    loaded: Vec<ExperimentRecord>,
    // started by this laboratory, in start order
    live: Vec<LiveExperiment>,
}
impl Registry {
    fn contains(&self, guid: &str) -> bool {
        self.loaded.iter().any(|e| e.guid == guid) || self.live.iter().any(|e| e.guid == guid)
    }

    fn live(&self, guid: &str) -> Option<&LiveExperiment> {
        self.live.iter().find(|e| e.guid == guid)
    }
}

/// Registry of every experiment this process knows about: those loaded from the store and those
/// it started itself.
pub struct Laboratory {
    store: Arc<dyn Store>,
    registry: Arc<Mutex<Registry>>,
    cancel: CancellationToken,
}
impl Laboratory {
    pub async fn new(store: Arc<dyn Store>) -> anyhow::Result<Self> {
        let loaded = store
            .load_all()
            .await
            .context("Unable to load stored experiments")?
            .into_iter()
            .map(|e| ExperimentRecord {
                guid: e.guid,
                config: e.config,
                running: false,
            })
            .collect::<Vec<_>>();
        info!(experiments = loaded.len(), "laboratory loaded");

        Ok(Laboratory {
            store,
            registry: Arc::new(Mutex::new(Registry {
                loaded,
                live: vec![],
            })),
            cancel: CancellationToken::new(),
        })
    }

    /// Starts `runnable` and returns its guid straight away. Its samples go to the store, to an
    /// in-memory buffer and to every handler in `extra`.
    pub fn run(&self, runnable: Box<dyn Runnable>, extra: Vec<Box<dyn Handler>>) -> String {
        let config = runnable.config().clone();
        let buffer = SampleBuffer::new();
        let cancel = self.cancel.child_token();
        let (done_tx, done) = watch::channel(false);

        let guid = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            let mut guid = nanoid::nanoid!();
            while registry.contains(&guid) {
                guid = nanoid::nanoid!();
            }
            registry.live.push(LiveExperiment {
                guid: guid.clone(),
                config: config.clone(),
                buffer: buffer.clone(),
                done,
                cancel: cancel.clone(),
            });
            guid
        };

        let mut handlers: Vec<Box<dyn Handler>> = vec![
            self.store.writer(&guid, &config),
            Box::new(BufferHandler::new(buffer)),
        ];
        handlers.extend(extra);

        info!(guid = %guid, workload = %config.workload, "experiment started");
        let samples = runnable.run(cancel);
        let finished = guid.clone();
        tokio::spawn(async move {
            multiplex(samples, handlers).await;
            done_tx.send_replace(true);
            info!(guid = %finished, "experiment complete");
        });

        guid
    }

    /// Calls `f` for every known experiment, loaded ones first.
    pub fn visit(&self, f: &mut dyn FnMut(&ExperimentRecord)) {
        let records: Vec<_> = {
            let registry = self.registry.lock().expect("registry lock poisoned");
            registry
                .loaded
                .iter()
                .cloned()
                .chain(registry.live.iter().map(|e| ExperimentRecord {
                    guid: e.guid.clone(),
                    config: e.config.clone(),
                    running: e.is_running(),
                }))
                .collect()
        };

        for record in records.iter() {
            f(record);
        }
    }

    /// Samples of a running experiment come from its buffer, everything else from the store. A
    /// finished run started here still has its buffer if the store cannot produce it.
    pub async fn get_data(&self, guid: &str) -> anyhow::Result<Vec<Sample>> {
        let live = {
            let registry = self.registry.lock().expect("registry lock poisoned");
            if !registry.contains(guid) {
                return Err(anyhow!("Unable to find experiment with guid {}", guid));
            }
            registry
                .live(guid)
                .map(|e| (e.is_running(), e.buffer.clone()))
        };

        match live {
            Some((true, buffer)) => Ok(buffer.snapshot()),
            Some((false, buffer)) => match self.store.fetch(guid).await {
                Ok(samples) => Ok(samples),
                Err(err) => {
                    warn!(%guid, "Unable to read samples from the store, using the buffer: {:#}", err);
                    Ok(buffer.snapshot())
                }
            },
            None => self.store.fetch(guid).await,
        }
    }

    /// Waits until every handler of the experiment has finished.
    pub async fn wait(&self, guid: &str) -> anyhow::Result<()> {
        let done = {
            let registry = self.registry.lock().expect("registry lock poisoned");
            if !registry.contains(guid) {
                return Err(anyhow!("Unable to find experiment with guid {}", guid));
            }
            registry.live(guid).map(|e| e.done.clone())
        };

        if let Some(mut done) = done {
            done.wait_for(|finished| *finished)
                .await
                .context(format!("Experiment {} was abandoned", guid))?;
        }
        Ok(())
    }

    /// Stops issuing new iterations to a running experiment. In-flight iterations still finish.
    pub fn cancel(&self, guid: &str) -> anyhow::Result<()> {
        let registry = self.registry.lock().expect("registry lock poisoned");
        let live = registry
            .live(guid)
            .context(format!("No experiment with guid {} was started here", guid))?;
        live.cancel.cancel();
        Ok(())
    }

    /// Cancelling this token cancels every experiment started by the laboratory.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
