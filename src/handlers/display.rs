/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    multiplexer::Handler,
    sample::{Sample, SampleType},
};
use anyhow::Context;
use async_trait::async_trait;
use colored::*;
use std::{
    io::{self, Write},
    time::Duration,
};
use term_table::{row, row::Row, rows, table_cell::*, Table, TableStyle};
use tokio::sync::mpsc;

fn ms(d: Duration) -> String {
    format!("{:.2}ms", d.as_secs_f64() * 1000.0)
}

/// One line of live progress.
pub fn progress_line(sample: &Sample) -> String {
    let errors = match sample.total_errors {
        0 => "0 errors".normal(),
        n => format!("{} errors", n).red(),
    };

    format!(
        "[{:>7.1}s] {} iterations, {}, {} workers, avg {}, p95 {}, {}",
        sample.wall_time.as_secs_f64(),
        sample.total.to_string().green(),
        errors,
        sample.total_workers,
        ms(sample.average),
        ms(sample.ninety_fifth_percentile),
        format!("{:.2}/s", sample.throughput.total).bold()
    )
}

/// Summary of a finished run, one row per workload step.
pub fn summary_table(sample: &Sample) -> String {
    let mut rows = rows![row![
        TableCell::builder("Step".bold()).build(),
        TableCell::builder("Count".bold()).build(),
        TableCell::builder("Average".bold()).build(),
        TableCell::builder("Worst".bold()).build(),
        TableCell::builder("Throughput".bold()).build()
    ]];

    for (name, command) in sample.commands.iter() {
        rows.push(row![
            TableCell::new(name),
            TableCell::new(command.count),
            TableCell::new(ms(command.average)),
            TableCell::new(ms(command.worst_time)),
            TableCell::new(format!("{:.2}/s", command.throughput))
        ]);
    }

    rows.push(row![
        TableCell::new("iteration".green()),
        TableCell::new(sample.total),
        TableCell::new(ms(sample.average)),
        TableCell::new(ms(sample.worst_result)),
        TableCell::new(format!("{:.2}/s", sample.throughput.total))
    ]);

    let table = Table::builder()
        .rows(rows)
        .style(TableStyle::rounded())
        .build();

    let mut out = table.render();
    out.push_str(&format!(
        "\np95 {}, {} errors",
        ms(sample.ninety_fifth_percentile),
        sample.total_errors
    ));
    if let Some(err) = &sample.last_error {
        out.push_str(&format!("\nlast error: {}", err.red()));
    }
    out
}

/// Prints progress on every throughput tick and a summary once the run ends.
pub struct DisplayHandler<W: Write> {
    out: W,
}
impl DisplayHandler<io::Stdout> {
    pub fn stdout() -> Self {
        DisplayHandler { out: io::stdout() }
    }
}
impl<W: Write> DisplayHandler<W> {
    pub fn new(out: W) -> Self {
        DisplayHandler { out }
    }
}

#[async_trait]
impl<W: Write + Send + 'static> Handler for DisplayHandler<W> {
    fn name(&self) -> &str {
        "display"
    }

    async fn handle(self: Box<Self>, mut samples: mpsc::Receiver<Sample>) -> anyhow::Result<()> {
        let mut out = self.out;
        // terminal writes block when the reader falls behind
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut last = None;
            while let Some(sample) = samples.blocking_recv() {
                if sample.kind == SampleType::ThroughputSample {
                    writeln!(out, "{}", progress_line(&sample))?;
                }
                last = Some(sample);
            }

            if let Some(last) = last {
                writeln!(out, "\n{}", " Summary ".reversed().green())?;
                writeln!(out, "{}", summary_table(&last))?;
            }
            out.flush()?;
            Ok(())
        })
        .await
        .context("Display stopped unexpectedly")?
    }
}
