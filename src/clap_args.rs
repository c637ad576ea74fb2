use crate::config::{ExperimentDefaults, DEFAULT_CONFIG_FILE};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author = "Oliver Winks (@ohuu), William Kimbell (@seal)", version, about, long_about = None)]
pub struct Args {
    /// Verbose mode (-v, --verbose)
    #[arg(short, long)]
    pub verbose: bool,

    /// Path to the configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run an experiment
    Run {
        /// Send every iteration through the queue to a slave
        #[arg(long)]
        remote: bool,

        /// Comma separated list of steps run as one iteration
        #[arg(short, long)]
        workload: Option<String>,

        #[arg(short, long)]
        iterations: Option<usize>,

        /// Worker count, either "N" or a ramp "start..end"
        #[arg(short = 'n', long)]
        concurrency: Option<String>,

        /// Seconds between adding workers while ramping
        #[arg(long)]
        step_time: Option<u64>,

        /// Seconds between batches of iterations, 0 runs a single batch
        #[arg(long)]
        interval: Option<u64>,

        /// Seconds after which no more batches start
        #[arg(long)]
        stop: Option<u64>,

        #[arg(long)]
        note: Option<String>,

        /// Also write every sample to this CSV file
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Serve iterations for remote runs until Ctrl-C
    Slave {
        /// Upper bound on iterations run at once
        #[arg(long)]
        max_in_flight: Option<usize>,
    },

    /// List stored experiments
    List,

    /// Print the samples of an experiment as CSV
    Show { guid: String },
}
impl Commands {
    /// Applies the flags of a `run` on top of the configured experiment defaults.
    pub fn merge_run_flags(&self, defaults: &ExperimentDefaults) -> ExperimentDefaults {
        let mut merged = defaults.clone();
        if let Commands::Run {
            workload,
            iterations,
            concurrency,
            step_time,
            interval,
            stop,
            note,
            ..
        } = self
        {
            if let Some(workload) = workload {
                merged.workload = workload.clone();
            }
            if let Some(iterations) = iterations {
                merged.iterations = *iterations;
            }
            if let Some(concurrency) = concurrency {
                merged.concurrency = concurrency.clone();
            }
            if let Some(step_time) = step_time {
                merged.concurrency_step_time_secs = *step_time;
            }
            if let Some(interval) = interval {
                merged.interval_secs = *interval;
            }
            if let Some(stop) = stop {
                merged.stop_secs = *stop;
            }
            if let Some(note) = note {
                merged.note = note.clone();
            }
        }
        merged
    }
}

pub fn parse() -> Args {
    Args::parse()
}
