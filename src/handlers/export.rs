/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{multiplexer::Handler, sample::Sample};
use anyhow::Context;
use async_trait::async_trait;
use csv::Writer;
use itertools::Itertools;
use std::{fs::File, io::Write, path::Path, time::Duration};
use tokio::sync::mpsc;

const HEADER: [&str; 12] = [
    "wall_time_ms",
    "type",
    "total",
    "total_errors",
    "total_workers",
    "average_ms",
    "last_result_ms",
    "worst_result_ms",
    "p95_ms",
    "throughput",
    "commands",
    "last_error",
];

fn millis(d: Duration) -> String {
    format!("{:.3}", d.as_secs_f64() * 1000.0)
}

fn record(sample: &Sample) -> Vec<String> {
    let commands = sample
        .commands
        .iter()
        .map(|(name, command)| format!("{}={}", name, command.count))
        .join(";");

    vec![
        sample.wall_time.as_millis().to_string(),
        format!("{:?}", sample.kind),
        sample.total.to_string(),
        sample.total_errors.to_string(),
        sample.total_workers.to_string(),
        millis(sample.average),
        millis(sample.last_result),
        millis(sample.worst_result),
        millis(sample.ninety_fifth_percentile),
        format!("{:.3}", sample.throughput.total),
        commands,
        sample.last_error.clone().unwrap_or_default(),
    ]
}

/// Writes every sample as one CSV row, after a single header row.
pub fn write_samples<W: Write>(out: W, samples: &[Sample]) -> anyhow::Result<()> {
    let mut wtr = Writer::from_writer(out);
    wtr.write_record(HEADER)?;
    for sample in samples {
        wtr.write_record(record(sample))?;
    }
    wtr.flush()?;
    Ok(())
}

/// Streams samples to a CSV file as they arrive.
pub struct CsvHandler<W: Write> {
    wtr: Writer<W>,
}
impl CsvHandler<File> {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let file = File::create(path)
            .context(format!("Unable to create CSV file {}", path.display()))?;
        Ok(CsvHandler::new(file))
    }
}
impl<W: Write> CsvHandler<W> {
    pub fn new(out: W) -> Self {
        CsvHandler {
            wtr: Writer::from_writer(out),
        }
    }
}

#[async_trait]
impl<W: Write + Send + 'static> Handler for CsvHandler<W> {
    fn name(&self) -> &str {
        "csv"
    }

    async fn handle(self: Box<Self>, mut samples: mpsc::Receiver<Sample>) -> anyhow::Result<()> {
        let mut wtr = self.wtr;
        // file writes block, so they run on the blocking pool
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            wtr.write_record(HEADER)?;
            while let Some(sample) = samples.blocking_recv() {
                wtr.write_record(record(&sample))?;
                wtr.flush()?;
            }
            wtr.flush()?;
            Ok(())
        })
        .await
        .context("CSV writer stopped unexpectedly")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        multiplexer::multiplex,
        sample::{Command, SampleType},
    };
    use std::{
        io,
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc as std_mpsc, Arc,
        },
    };

    /// Blocks every write until the gate opens, noting whether it gave up waiting.
    struct Gated {
        gate: std_mpsc::Receiver<()>,
        starved: Arc<AtomicBool>,
    }
    impl Write for Gated {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Err(std_mpsc::RecvTimeoutError::Timeout) =
                self.gate.recv_timeout(Duration::from_secs(5))
            {
                self.starved.store(true, Ordering::SeqCst);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn sample(total: u64) -> Sample {
        let mut sample = Sample {
            total,
            wall_time: Duration::from_millis(1500),
            average: Duration::from_micros(2500),
            kind: SampleType::ResultSample,
            last_error: Some("boom, again".to_string()),
            ..Default::default()
        };
        sample.commands.insert(
            "push".to_string(),
            Command {
                count: total,
                ..Default::default()
            },
        );
        sample
    }

    #[test]
    fn header_then_one_row_per_sample() -> anyhow::Result<()> {
        let mut out = vec![];
        write_samples(&mut out, &[sample(1), sample(2)])?;

        let text = String::from_utf8(out)?;
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("wall_time_ms,type,total"));
        assert_eq!(
            lines[1],
            "1500,ResultSample,1,0,0,2.500,0.000,0.000,0.000,0.000,push=1,\"boom, again\""
        );
        Ok(())
    }

    #[tokio::test]
    async fn handler_streams_to_a_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("samples.csv");

        let (tx, rx) = mpsc::channel(4);
        tx.send(sample(1)).await?;
        tx.send(sample(2)).await?;
        drop(tx);
        let handlers: Vec<Box<dyn Handler>> = vec![Box::new(CsvHandler::create(&path)?)];
        multiplex(rx, handlers).await;

        let mut reader = csv::Reader::from_path(&path)?;
        let totals = reader
            .records()
            .map(|r| Ok(r?[2].to_string()))
            .collect::<anyhow::Result<Vec<_>>>()?;
        assert_eq!(totals, vec!["1", "2"]);
        Ok(())
    }

    #[tokio::test]
    async fn slow_writes_do_not_stall_the_runtime() -> anyhow::Result<()> {
        let (open, gate) = std_mpsc::channel();
        let starved = Arc::new(AtomicBool::new(false));
        let handler = CsvHandler::new(Gated {
            gate,
            starved: starved.clone(),
        });

        let (tx, rx) = mpsc::channel(4);
        tx.send(sample(1)).await?;
        drop(tx);
        let handlers: Vec<Box<dyn Handler>> = vec![Box::new(handler)];
        let fan_out = tokio::spawn(multiplex(rx, handlers));

        // on a single threaded runtime this only runs if the writer is off the runtime thread
        tokio::time::sleep(Duration::from_millis(50)).await;
        open.send(())?;
        drop(open);
        fan_out.await?;

        assert!(!starved.load(Ordering::SeqCst));
        Ok(())
    }
}
