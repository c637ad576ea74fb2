/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod clap_args;
pub mod concurrency;
pub mod config;
pub mod entities;
pub mod experiment;
pub mod handlers;
pub mod laboratory;
pub mod migrations;
pub mod multiplexer;
pub mod queue;
pub mod sample;
pub mod sampler;
pub mod slave;
pub mod store;
pub mod worker;
pub mod workloads;

use anyhow::{anyhow, Context};
use migrations::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::{fs, path};
use tracing::{subscriber::set_global_default, Subscriber};
use tracing_subscriber::EnvFilter;

/// Connects to the database behind `conn_str`, creating the file first for on-disk sqlite.
pub async fn db_connect(conn_str: &str) -> anyhow::Result<DatabaseConnection> {
    let conn_str = conn_str.trim();

    // break string into database type and database uri
    let (db_type, db_uri) = conn_str.split_once(':').ok_or(anyhow!(
        "Unable to split connection string into database type and uri. Is the connection string formated correctly?"
    ))?;

    let in_memory = db_type == "sqlite" && db_uri.starts_with(":memory:");
    if db_type == "sqlite" && !in_memory {
        // strip '//' and any query string from database path
        let db_path = db_uri.replacen("//", "", 1);
        let db_path = db_path.split('?').next().unwrap_or_default();

        // if the path doesn't exist then attempt to create it
        if !db_path.is_empty() && !path::Path::new(db_path).exists() {
            fs::File::create(db_path).context("unable to create sqlite database file.")?;
        }
    }

    let mut opts = ConnectOptions::new(conn_str);
    opts.sqlx_logging(false);

    // every connection to sqlite::memory: opens a separate database
    if in_memory {
        opts.max_connections(1).min_connections(1);
    } else {
        opts.max_connections(4);
    }

    Database::connect(opts)
        .await
        .context(format!("Unable to connect to {}", conn_str))
}

pub async fn db_migrate(db: &DatabaseConnection) -> anyhow::Result<()> {
    Migrator::up(db, None)
        .await
        .context("Error migrating database.")
}

pub fn get_subscriber(env_filter: &str) -> impl Subscriber + Sync + Send {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish()
}

pub fn init_subscriber(subscriber: impl Subscriber + Sync + Send) -> anyhow::Result<()> {
    set_global_default(subscriber).context("Failed to set subscriber")
}
