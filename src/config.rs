use crate::{
    experiment::{Concurrency, ExperimentConfiguration},
    slave,
    worker::DEFAULT_WORKLOAD,
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io::Read,
    path::Path,
    time::Duration,
};

pub const DEFAULT_CONFIG_FILE: &str = "loadlab.toml";
const DEFAULT_DATABASE_URL: &str = "sqlite://loadlab.db";

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub queue: Option<QueueConfig>,
    #[serde(default)]
    pub experiment: ExperimentDefaults,
    #[serde(default, rename(serialize = "step", deserialize = "step"))]
    pub steps: Vec<ShellStep>,
}
impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: default_database_url(),
            log_level: default_log_level(),
            queue: None,
            experiment: ExperimentDefaults::default(),
            steps: vec![],
        }
    }
}
impl Config {
    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let mut config_str = String::new();
        fs::File::open(path)
            .context(format!("Unable to open config file {}", path.display()))?
            .read_to_string(&mut config_str)?;
        Config::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Config> {
        let config = toml::from_str::<Config>(conf_str)
            .map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))?;

        // surface a bad concurrency string when the file is read rather than when a run starts
        config.experiment.concurrency()?;
        Ok(config)
    }

    /// Reads `path` if it exists, otherwise starts from the defaults. `DATABASE_URL` in the
    /// environment wins over the file.
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let mut config = match path.exists() {
            true => Config::try_from_path(path)?,
            false => Config::default(),
        };

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        Ok(config)
    }

    pub fn find_step(&self, step_name: &str) -> anyhow::Result<&ShellStep> {
        self.steps
            .iter()
            .find(|step| step.name == step_name)
            .context(format!("Unable to find step with name {}", step_name))
    }

    pub fn queue(&self) -> anyhow::Result<&QueueConfig> {
        self.queue
            .as_ref()
            .context("No [queue] section in the configuration")
    }
}

fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct QueueConfig {
    pub address: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    pub max_in_flight: Option<usize>,
}
impl QueueConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
            .unwrap_or_else(slave::default_max_in_flight)
    }
}

fn default_timeout_secs() -> u64 {
    30
}

/// Settings for runs started from the command line. Flags override these.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExperimentDefaults {
    pub iterations: usize,
    pub concurrency: String,
    pub concurrency_step_time_secs: u64,
    pub interval_secs: u64,
    pub stop_secs: u64,
    pub workload: String,
    pub note: String,
    pub context: BTreeMap<String, String>,
}
impl Default for ExperimentDefaults {
    fn default() -> Self {
        ExperimentDefaults {
            iterations: 1,
            concurrency: "1".to_string(),
            concurrency_step_time_secs: 60,
            interval_secs: 0,
            stop_secs: 0,
            workload: DEFAULT_WORKLOAD.to_string(),
            note: String::new(),
            context: BTreeMap::new(),
        }
    }
}
impl ExperimentDefaults {
    pub fn concurrency(&self) -> anyhow::Result<Concurrency> {
        self.concurrency.parse()
    }

    pub fn to_configuration(&self) -> anyhow::Result<ExperimentConfiguration> {
        Ok(ExperimentConfiguration {
            iterations: self.iterations,
            concurrency: self.concurrency()?,
            concurrency_step_time: Duration::from_secs(self.concurrency_step_time_secs),
            interval: Duration::from_secs(self.interval_secs),
            stop: Duration::from_secs(self.stop_secs),
            workload: self.workload.clone(),
            note: self.note.clone(),
            context: self.context.clone(),
        })
    }
}

/// A workload step that runs an external command.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ShellStep {
    pub name: String,
    pub command: String,
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_load_config_file() -> anyhow::Result<()> {
        let cfg = Config::try_from_path(Path::new("./fixtures/loadlab.success.toml"))?;
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.steps.len(), 2);

        let queue = cfg.queue()?;
        assert_eq!(queue.timeout(), Duration::from_secs(5));
        assert_eq!(queue.max_in_flight(), 16);
        Ok(())
    }

    #[test]
    fn experiment_section_becomes_a_configuration() -> anyhow::Result<()> {
        let cfg = Config::try_from_path(Path::new("./fixtures/loadlab.success.toml"))?;
        let experiment = cfg.experiment.to_configuration()?;

        assert_eq!(experiment.iterations, 100);
        assert_eq!(experiment.concurrency, Concurrency::ramp(2, 8));
        assert_eq!(experiment.concurrency_step_time, Duration::from_secs(10));
        assert_eq!(experiment.interval, Duration::from_secs(30));
        assert_eq!(experiment.stop, Duration::from_secs(300));
        assert_eq!(experiment.workload, "login,list-apps");
        assert_eq!(experiment.context.get("space").map(String::as_str), Some("dev"));
        Ok(())
    }

    #[test]
    fn missing_sections_use_defaults() -> anyhow::Result<()> {
        let cfg = Config::try_from_path(Path::new("./fixtures/loadlab.minimal.toml"))?;
        assert_eq!(cfg.database_url, DEFAULT_DATABASE_URL);
        assert!(cfg.queue.is_none());
        assert!(cfg.queue().is_err());
        assert_eq!(cfg.experiment.to_configuration()?.concurrency, Concurrency::fixed(1));
        Ok(())
    }

    #[test]
    fn bad_concurrency_is_rejected_on_load() {
        let res = Config::try_from_path(Path::new("./fixtures/loadlab.bad_concurrency.toml"));
        assert!(res.is_err());
    }

    #[test]
    fn can_find_step_by_name() -> anyhow::Result<()> {
        let cfg = Config::try_from_path(Path::new("./fixtures/loadlab.success.toml"))?;
        let step = cfg.find_step("login")?;
        assert_eq!(step.description.as_deref(), Some("Logs in to the platform"));
        assert!(cfg.find_step("nope").is_err());
        Ok(())
    }

    #[test]
    fn missing_file_falls_back_to_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = Config::load(&dir.path().join(DEFAULT_CONFIG_FILE))?;
        assert_eq!(cfg.experiment, ExperimentDefaults::default());
        Ok(())
    }
}
