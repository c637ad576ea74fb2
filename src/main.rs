/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use colored::Colorize;
use loadlab::{
    clap_args::{self, Commands},
    config::Config,
    db_connect, db_migrate,
    experiment::Experiment,
    get_subscriber,
    handlers::{export, CsvHandler, DisplayHandler},
    init_subscriber,
    laboratory::Laboratory,
    multiplexer::Handler,
    queue::{Queue, RedisQueue},
    slave::Slave,
    store::{DbStore, Store},
    worker::{LocalWorker, RemoteWorker, Worker},
    workloads,
};
use std::{sync::Arc, time::Duration};
use term_table::{row, row::Row, rows, table_cell::*, Table, TableStyle};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// How long a slave waits on the queue before checking for Ctrl-C again.
const SLAVE_POLL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = clap_args::parse();
    let config = Config::load(&args.config)?;

    let log_level = match args.verbose {
        true => "debug",
        false => config.log_level.as_str(),
    };
    init_subscriber(get_subscriber(log_level))?;

    match &args.command {
        Commands::Run { remote, csv, .. } => {
            let experiment = args
                .command
                .merge_run_flags(&config.experiment)
                .to_configuration()?;

            let worker: Arc<dyn Worker> = match *remote {
                true => {
                    let queue_config = config.queue()?;
                    let queue = Arc::new(RedisQueue::connect(&queue_config.address).await?);
                    let mut worker = RemoteWorker::new(queue, queue_config.timeout());
                    register_steps(&mut worker, &config)?;
                    Arc::new(worker)
                }
                false => {
                    let mut worker = LocalWorker::new();
                    register_steps(&mut worker, &config)?;
                    Arc::new(worker)
                }
            };
            let experiment = Experiment::new(experiment, worker)?;

            let lab = Laboratory::new(open_store(&config).await?).await?;
            let mut extra: Vec<Box<dyn Handler>> = vec![Box::new(DisplayHandler::stdout())];
            if let Some(path) = csv {
                extra.push(Box::new(CsvHandler::create(path)?));
            }

            let token = lab.cancellation_token();
            ctrlc::set_handler(move || token.cancel())
                .context("Unable to install Ctrl-C handler")?;

            let guid = lab.run(Box::new(experiment), extra);
            lab.wait(&guid).await?;
            println!("\n{} {}", "Experiment".green(), guid.bold());
        }

        Commands::Slave { max_in_flight } => {
            let queue_config = config.queue()?;
            let queue: Arc<dyn Queue> = Arc::new(RedisQueue::connect(&queue_config.address).await?);

            let mut worker = LocalWorker::new();
            register_steps(&mut worker, &config)?;

            let max_in_flight = (*max_in_flight).unwrap_or_else(|| queue_config.max_in_flight());
            let slave = Slave::start(queue, Arc::new(worker), max_in_flight, SLAVE_POLL);
            info!(handle = %slave.handle(), address = %queue_config.address, "serving tasks");

            let token = CancellationToken::new();
            let ctrl_c = token.clone();
            ctrlc::set_handler(move || ctrl_c.cancel())
                .context("Unable to install Ctrl-C handler")?;

            // the loop only exits by itself on a fatal queue error
            while !token.is_cancelled() && !slave.is_finished() {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(SLAVE_POLL) => {}
                }
            }
            match slave.is_finished() {
                true => slave.wait().await?,
                false => slave.close().await?,
            }
        }

        Commands::List => {
            let lab = Laboratory::new(open_store(&config).await?).await?;

            let mut rows = rows![row![
                TableCell::builder("Guid".bold()).build(),
                TableCell::builder("Workload".bold()).build(),
                TableCell::builder("Iterations".bold()).build(),
                TableCell::builder("Concurrency".bold()).build(),
                TableCell::builder("Note".bold()).build()
            ]];
            lab.visit(&mut |record| {
                rows.push(row![
                    TableCell::new(&record.guid),
                    TableCell::new(&record.config.workload),
                    TableCell::new(record.config.iterations),
                    TableCell::new(&record.config.concurrency),
                    TableCell::new(&record.config.note)
                ])
            });

            let table = Table::builder()
                .rows(rows)
                .style(TableStyle::rounded())
                .build();
            println!("{}", table.render());
        }

        Commands::Show { guid } => {
            let lab = Laboratory::new(open_store(&config).await?).await?;
            let samples = lab.get_data(guid).await?;
            export::write_samples(std::io::stdout().lock(), &samples)?;
        }
    }

    Ok(())
}

fn register_steps(worker: &mut dyn Worker, config: &Config) -> anyhow::Result<()> {
    workloads::register_builtin(worker);
    workloads::register_shell_steps(worker, &config.steps)
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn Store>> {
    let db = db_connect(&config.database_url).await?;
    db_migrate(&db).await?;
    Ok(Arc::new(DbStore::new(db)))
}
