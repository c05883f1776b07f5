//! Configuration for Hypersweep.
//!
//! Holds the clap structs for command line arguments and flags, plus the
//! YAML experiment file that declares the objective, the cluster shape, and
//! the trials to run.

use std::collections::HashMap;
use std::fs::File;

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use serde_json::Value;

use crate::error::SweepError;
use crate::launch::LauncherKind;
use crate::resources::{profile_for, ClusterOverride, ClusterSpec, ResourceProfile};

#[derive(Parser)]
#[command(version, author)]
pub struct Config {
    /// Local (l) or Cluster (c) launcher
    #[arg(value_enum)]
    pub mode: Mode,

    /// Experiment file to use. Defaults to `experiment.yaml`
    #[arg(long, default_value = "experiment.yaml")]
    pub experiment_file: String,

    /// Directory that holds per-run workspaces and study state
    #[arg(long, default_value = "work")]
    pub work_dir: String,

    /// Data directory injected into every run config
    #[arg(long, default_value = "data")]
    pub data_dir: String,

    /// Training entry point handed to the launch script
    #[arg(long)]
    pub train_file: String,

    /// Resolve host-specific resource overrides under this name
    #[arg(long)]
    pub host: Option<String>,

    /// Seconds between process polls
    #[arg(long, default_value = "1")]
    pub poll_interval: u64,
}

#[derive(PartialEq, Eq, Clone, Copy, ValueEnum)]
pub enum Mode {
    #[value(name = "l")]
    Local,
    #[value(name = "c")]
    Cluster,
}

impl From<Mode> for LauncherKind {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Local => LauncherKind::Local,
            Mode::Cluster => LauncherKind::Cluster,
        }
    }
}

/// The experiment file.
#[derive(Debug, Deserialize)]
pub struct Experiment {
    pub project: String,
    #[serde(default)]
    pub experiment: String,
    /// Key the trial executable must report in its result artifact.
    pub objective: String,
    /// Interpreter that runs the training entry point.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Optional environment-setup file sourced by every launch script.
    #[serde(default)]
    pub env_setup: Option<String>,
    #[serde(default)]
    pub cluster: ClusterSpec,
    /// Per-host resource overrides, keyed by host name.
    #[serde(default)]
    pub hosts: HashMap<String, ClusterOverride>,
    /// Trials to run, in order. Each entry is one parameter mapping.
    #[serde(default)]
    pub trials: Vec<HashMap<String, Value>>,
}

fn default_interpreter() -> String {
    "python".to_string()
}

impl Experiment {
    pub fn load(path: &str) -> Result<Self, SweepError> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// Derive the resource profile, honoring a named host's overrides.
    /// Malformed descriptors are rejected here, before any trial runs.
    pub fn resources_for(&self, host: Option<&str>) -> Result<ResourceProfile, SweepError> {
        profile_for(&self.cluster, &self.hosts, host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPERIMENT: &str = r#"
project: sentiment
experiment: bert-sweep
objective: accuracy
cluster:
  nodes: 1
  tasks_per_node: 2
  cpus_per_task: 8
  gres: gpu:4
hosts:
  meluxina:
    tasks_per_node: 4
trials:
  - lr: 0.1
    layers: 2
  - lr: 0.01
    layers: 4
"#;

    #[test]
    fn test_experiment_parses() {
        let experiment: Experiment = serde_yaml::from_str(EXPERIMENT).unwrap();
        assert_eq!(experiment.project, "sentiment");
        assert_eq!(experiment.objective, "accuracy");
        assert_eq!(experiment.interpreter, "python");
        assert_eq!(experiment.trials.len(), 2);
        assert_eq!(experiment.trials[0]["lr"], Value::from(0.1));
        assert_eq!(experiment.trials[1]["layers"], Value::from(4));
    }

    #[test]
    fn test_resources_with_and_without_host() {
        let experiment: Experiment = serde_yaml::from_str(EXPERIMENT).unwrap();
        assert_eq!(experiment.resources_for(None).unwrap().ntasks, 2);
        assert_eq!(experiment.resources_for(Some("meluxina")).unwrap().ntasks, 4);
    }

    #[test]
    fn test_minimal_experiment_defaults() {
        let experiment: Experiment =
            serde_yaml::from_str("{project: p, objective: loss}").unwrap();
        assert_eq!(experiment.experiment, "");
        assert!(experiment.trials.is_empty());
        let resources = experiment.resources_for(None).unwrap();
        assert_eq!(resources.ntasks, 1);
        assert_eq!(resources.accelerators_per_task, 1);
    }
}
