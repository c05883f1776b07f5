//! Launch script and command construction.
//!
//! For every admitted trial, a launch unit is built: the wrapper script that
//! activates the project environment and invokes the training entry point,
//! plus the command line that starts it. Both are persisted into the run's
//! workspace before anything is spawned, so what was executed is always
//! auditable after the fact.

use std::path::{Path, PathBuf};

use handlebars::Handlebars;

use crate::config::Experiment;
use crate::error::SweepError;
use crate::resources::ResourceProfile;
use crate::workspace::{run_dir, CONFIG_FILE};

/// Wrapper script handed to the process launcher.
pub const SCRIPT_FILE: &str = "single_run.sh";
/// The spawned command line, one token per word.
pub const COMMAND_FILE: &str = "run_command.sh";

/// First coordination port. Each run offsets by its id so concurrently
/// running trials never share a port. Ids reused across scheduler restarts
/// can still collide; nothing guards against that.
pub const BASE_PORT: u64 = 27100;

pub fn run_port(run_id: u64) -> u64 {
    BASE_PORT + run_id
}

const LOCAL_TEMPLATE: &str = "\
#!/bin/bash

# environment setup
PROJ_NAME={{project}}
{{#if env_setup}}source {{env_setup}}
{{/if}}
MAIN_FILE={{train_file}}
FLAG_FILE={{flag_file}}

{{executable}} $MAIN_FILE --flagfile=$FLAG_FILE
";

const CLUSTER_TEMPLATE: &str = "\
#!/bin/bash

# environment setup
PROJ_NAME={{project}}
{{#if env_setup}}source {{env_setup}}
{{/if}}
# sent to the entry point for distributed coordination
export HOSTNAMES=`scontrol show hostnames \"$SLURM_JOB_NODELIST\"`
export MASTER_ADDR=$(scontrol show hostnames \"$SLURM_JOB_NODELIST\" | head -n 1)
export COUNT_NODE=`scontrol show hostnames \"$SLURM_JOB_NODELIST\" | wc -l`

echo MASTER_ADDR=$MASTER_ADDR
echo COUNT_NODE=$COUNT_NODE
echo RUN_PORT=$RUN_PORT

MAIN_FILE={{train_file}}
FLAG_FILE={{flag_file}}

{{executable}} $MAIN_FILE --flagfile=$FLAG_FILE
";

/// Where and how a trial's process is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherKind {
    /// Run the script directly on this machine.
    Local,
    /// Submit the script as one resource-constrained cluster task.
    Cluster,
}

/// One trial's concrete launch unit.
#[derive(Debug, Clone)]
pub struct LaunchUnit {
    /// Wrapper script text, persisted as `single_run.sh`.
    pub script: String,
    /// Command line that starts the run, one token per element.
    pub command: Vec<String>,
}

pub struct LaunchBuilder {
    kind: LauncherKind,
    resources: ResourceProfile,
    project: String,
    interpreter: String,
    env_setup: Option<String>,
    train_file: String,
    work_dir: PathBuf,
    registry: Handlebars<'static>,
}

impl LaunchBuilder {
    pub fn new(
        kind: LauncherKind,
        resources: ResourceProfile,
        experiment: &Experiment,
        train_file: String,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        let mut registry = Handlebars::new();
        // Script text is shell, not HTML.
        registry.register_escape_fn(handlebars::no_escape);
        registry
            .register_template_string("local", LOCAL_TEMPLATE)
            .expect("Failed to register template string.");
        registry
            .register_template_string("cluster", CLUSTER_TEMPLATE)
            .expect("Failed to register template string.");
        Self {
            kind,
            resources,
            project: experiment.project.clone(),
            interpreter: experiment.interpreter.clone(),
            env_setup: experiment.env_setup.clone(),
            train_file,
            work_dir: work_dir.into(),
            registry,
        }
    }

    /// A single accelerator share runs the interpreter directly; more than
    /// one goes through the multi-process coordinated launcher.
    fn executable(&self) -> String {
        match self.kind {
            LauncherKind::Local => self.interpreter.clone(),
            LauncherKind::Cluster => {
                if self.resources.accelerators_per_task <= 1 {
                    self.interpreter.clone()
                } else {
                    "accelerate launch --main_process_port $RUN_PORT".to_string()
                }
            }
        }
    }

    pub fn build(&self, run_id: u64) -> Result<LaunchUnit, SweepError> {
        let dir = run_dir(&self.work_dir, run_id);
        let script_path = dir.join(SCRIPT_FILE);
        let params = serde_json::json!({
            "project": self.project,
            "env_setup": self.env_setup,
            "train_file": self.train_file,
            "flag_file": dir.join(CONFIG_FILE),
            "executable": self.executable(),
        });
        let template = match self.kind {
            LauncherKind::Local => "local",
            LauncherKind::Cluster => "cluster",
        };
        let script = self.registry.render(template, &params)?;

        let command = match self.kind {
            LauncherKind::Local => vec![
                "sh".to_string(),
                script_path.display().to_string(),
            ],
            LauncherKind::Cluster => vec![
                "srun".to_string(),
                format!("--export=ALL,RUN_PORT={}", run_port(run_id)),
                "--nodes=1".to_string(),
                "--ntasks=1".to_string(),
                format!(
                    "--gres={}:{}",
                    self.resources.accelerator_name, self.resources.accelerators_per_task
                ),
                format!("--cpus-per-task={}", self.resources.cpus_per_task),
                script_path.display().to_string(),
            ],
        };

        Ok(LaunchUnit { script, command })
    }

    /// Write the script and command line into the run workspace and make
    /// them executable. The workspace must already be allocated.
    pub fn persist(&self, run_id: u64, unit: &LaunchUnit) -> Result<PathBuf, SweepError> {
        let dir = run_dir(&self.work_dir, run_id);
        let script_path = dir.join(SCRIPT_FILE);
        std::fs::write(&script_path, &unit.script)?;
        make_executable(&script_path)?;
        let command_path = dir.join(COMMAND_FILE);
        std::fs::write(&command_path, unit.command.join(" "))?;
        make_executable(&command_path)?;
        Ok(script_path)
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
