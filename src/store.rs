/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    entities::{experiment, sample},
    experiment::ExperimentConfiguration,
    multiplexer::Handler,
    sample::Sample,
};
use anyhow::{self, Context};
use async_trait::async_trait;
use chrono::Utc;
use sea_orm::*;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// A run as it was persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredExperiment {
    pub guid: String,
    pub workload: String,
    pub note: String,
    pub config: ExperimentConfiguration,
    pub start_time: i64,
    pub stop_time: Option<i64>,
}
impl TryFrom<experiment::Model> for StoredExperiment {
    type Error = anyhow::Error;

    fn try_from(model: experiment::Model) -> Result<Self, Self::Error> {
        let config = serde_json::from_str(&model.config).context(format!(
            "Unable to parse stored configuration of experiment {}",
            model.guid
        ))?;

        Ok(StoredExperiment {
            guid: model.guid,
            workload: model.workload,
            note: model.note,
            config,
            start_time: model.start_time,
            stop_time: model.stop_time,
        })
    }
}

/// Long term storage for runs and their samples.
#[async_trait]
pub trait Store: Send + Sync {
    /// A handler that persists every sample it receives under `guid`.
    fn writer(&self, guid: &str, config: &ExperimentConfiguration) -> Box<dyn Handler>;

    /// Every stored run, in the order they were written.
    async fn load_all(&self) -> anyhow::Result<Vec<StoredExperiment>>;

    /// The samples of a stored run, in the order they were written.
    async fn fetch(&self, guid: &str) -> anyhow::Result<Vec<Sample>>;
}

#[derive(Clone)]
pub struct DbStore {
    db: DatabaseConnection,
}
impl DbStore {
    pub fn new(db: DatabaseConnection) -> Self {
        DbStore { db }
    }
}

#[async_trait]
impl Store for DbStore {
    fn writer(&self, guid: &str, config: &ExperimentConfiguration) -> Box<dyn Handler> {
        Box::new(DbWriter {
            db: self.db.clone(),
            guid: guid.to_string(),
            config: config.clone(),
        })
    }

    async fn load_all(&self) -> anyhow::Result<Vec<StoredExperiment>> {
        experiment::Entity::find()
            .order_by_asc(experiment::Column::Id)
            .all(&self.db)
            .await
            .context("Error fetching experiments")?
            .into_iter()
            .map(StoredExperiment::try_from)
            .collect()
    }

    async fn fetch(&self, guid: &str) -> anyhow::Result<Vec<Sample>> {
        experiment::Entity::find()
            .filter(experiment::Column::Guid.eq(guid))
            .one(&self.db)
            .await?
            .context(format!("Error fetching experiment with guid {}", guid))?;

        sample::Entity::find()
            .filter(sample::Column::ExperimentGuid.eq(guid))
            .order_by_asc(sample::Column::Seq)
            .all(&self.db)
            .await
            .context(format!("Error fetching samples of experiment {}", guid))?
            .iter()
            .map(|row| {
                serde_json::from_str(&row.body)
                    .context(format!("Unable to parse sample {} of {}", row.seq, guid))
            })
            .collect()
    }
}

struct DbWriter {
    db: DatabaseConnection,
    guid: String,
    config: ExperimentConfiguration,
}

#[async_trait]
impl Handler for DbWriter {
    fn name(&self) -> &str {
        "store"
    }

    async fn handle(self: Box<Self>, mut samples: mpsc::Receiver<Sample>) -> anyhow::Result<()> {
        let config = serde_json::to_string(&self.config)?;
        let run = experiment::ActiveModel {
            id: ActiveValue::NotSet,
            guid: ActiveValue::Set(self.guid.clone()),
            workload: ActiveValue::Set(self.config.workload.clone()),
            note: ActiveValue::Set(self.config.note.clone()),
            config: ActiveValue::Set(config),
            start_time: ActiveValue::Set(Utc::now().timestamp_millis()),
            stop_time: ActiveValue::Set(None),
        }
        .insert(&self.db)
        .await
        .context(format!("Error inserting experiment {}", self.guid))?;

        let mut seq = 0;
        while let Some(s) = samples.recv().await {
            sample::ActiveModel {
                id: ActiveValue::NotSet,
                experiment_guid: ActiveValue::Set(self.guid.clone()),
                seq: ActiveValue::Set(seq),
                body: ActiveValue::Set(serde_json::to_string(&s)?),
            }
            .insert(&self.db)
            .await
            .context(format!("Error inserting sample {} of {}", seq, self.guid))?;
            seq += 1;
        }

        let mut run = run.into_active_model();
        run.stop_time = ActiveValue::Set(Some(Utc::now().timestamp_millis()));
        run.update(&self.db)
            .await
            .context(format!("Error stamping stop time of {}", self.guid))?;

        debug!(guid = %self.guid, samples = seq, "experiment stored");
        Ok(())
    }
}
