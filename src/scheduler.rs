//! Trial lifecycle scheduling.
//!
//! A single control thread drives admission, submission, and polling. Each
//! admitted trial maps to exactly one externally-spawned process; the only
//! shared state between the control thread and a child is the filesystem
//! artifacts the child is contracted to produce. Admission is deliberate
//! back-pressure, not a queue: no more work is ever in flight than the
//! resource ceiling allows, and headroom is always recomputed from live
//! process state.

use std::collections::HashMap;
use std::fs::File;
use std::time::{Duration, Instant};

use colored::{ColoredString, Colorize};
use colourado::{ColorPalette, PaletteType};
use serde_json::Value;

use crate::error::SweepError;
use crate::launch::LaunchBuilder;
use crate::process::{Spawner, TrialProcess};
use crate::study::{Study, Trial};
use crate::workspace::Workspace;

/// Where a managed run is in its life.
///
/// `Running` is the only state in which the process handle may still be
/// alive. `StoppedRunning` marks "exit observed, result not yet harvested";
/// it never persists across poll cycles in steady operation, but a harvest
/// aborted midway leaves the run there for a later sweep to retry without
/// double-counting. `Finished` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    StoppedRunning,
    Finished,
}

/// Per-run output capture, held open until harvest closes it.
struct OutputSink {
    _stdout: File,
    _stderr: File,
}

/// Scheduler-owned record of one in-flight or just-finished run.
struct ManagedProcess {
    process: Box<dyn TrialProcess>,
    sink: Option<OutputSink>,
    started: Instant,
    trial: Trial,
    state: LifecycleState,
    exit_code: Option<i32>,
}

pub struct TrialScheduler<S: Study> {
    study: S,
    workspace: Workspace,
    builder: LaunchBuilder,
    spawner: Box<dyn Spawner>,
    processes: HashMap<u64, ManagedProcess>,
    max_tasks: usize,
    poll_interval: Duration,
    colors: Vec<colourado::Color>,
}

impl<S: Study> TrialScheduler<S> {
    pub fn new(
        study: S,
        workspace: Workspace,
        builder: LaunchBuilder,
        spawner: Box<dyn Spawner>,
        max_tasks: usize,
        poll_interval: Duration,
    ) -> Self {
        // One palette entry per slot; runs cycle through the palette by id.
        let colors = ColorPalette::new(max_tasks.max(1) as u32, PaletteType::Pastel, false).colors;
        Self {
            study,
            workspace,
            builder,
            spawner,
            processes: HashMap::new(),
            max_tasks,
            poll_interval,
            colors,
        }
    }

    fn prettify(&self, trial: &Trial) -> ColoredString {
        let color = &self.colors[trial.id as usize % self.colors.len()];
        let r = (color.red * 256.0) as u8;
        let g = (color.green * 256.0) as u8;
        let b = (color.blue * 256.0) as u8;
        format!("{}", trial).truecolor(r, g, b)
    }

    pub fn study(&self) -> &S {
        &self.study
    }

    /// Pull the next trial from the collaborator.
    pub fn next_trial(&mut self) -> Option<Trial> {
        self.study.next_trial()
    }

    pub fn num_running(&self) -> usize {
        self.processes
            .values()
            .filter(|p| p.state == LifecycleState::Running)
            .count()
    }

    pub fn num_finished(&self) -> usize {
        self.processes
            .values()
            .filter(|p| p.state == LifecycleState::Finished)
            .count()
    }

    pub fn all_finished(&self) -> bool {
        self.processes
            .values()
            .all(|p| p.state == LifecycleState::Finished)
    }

    pub fn lifecycle(&self, run_id: u64) -> Option<LifecycleState> {
        self.processes.get(&run_id).map(|p| p.state)
    }

    /// Block (poll-and-sleep) until a slot is free. Every iteration polls
    /// the in-flight runs first, so slots vacated by finishing trials are
    /// observed within one interval.
    pub async fn admit(&mut self) -> Result<(), SweepError> {
        while self.num_running() >= self.max_tasks {
            self.poll()?;
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(())
    }

    /// Materialize the trial's workspace and launch unit, start its process,
    /// and record it as `Running`. Must only be called once `admit` has
    /// confirmed headroom.
    pub async fn submit(&mut self, trial: Trial) -> Result<(), SweepError> {
        let run_id = trial.id;
        self.workspace.allocate(run_id)?;
        self.workspace.write_config(run_id, &trial.parameters)?;
        let unit = self.builder.build(run_id)?;
        self.builder.persist(run_id, &unit)?;

        let stdout = File::create(self.workspace.stdout_path(run_id))?;
        let stderr = File::create(self.workspace.stderr_path(run_id))?;
        let process = self
            .spawner
            .spawn(&unit.command, stdout.try_clone()?, stderr.try_clone()?)
            .await?;
        eprintln!("{} Started.", self.prettify(&trial));

        self.processes.insert(
            run_id,
            ManagedProcess {
                process,
                sink: Some(OutputSink {
                    _stdout: stdout,
                    _stderr: stderr,
                }),
                started: Instant::now(),
                trial,
                state: LifecycleState::Running,
                exit_code: None,
            },
        );
        Ok(())
    }

    /// Non-blocking exit check over every `Running` process. The first
    /// observed exit moves the run to `StoppedRunning` and harvests it
    /// immediately.
    pub fn poll(&mut self) -> Result<(), SweepError> {
        let running: Vec<u64> = self
            .processes
            .iter()
            .filter(|(_, p)| p.state == LifecycleState::Running)
            .map(|(id, _)| *id)
            .collect();
        for run_id in running {
            let managed = match self.processes.get_mut(&run_id) {
                Some(managed) => managed,
                None => continue,
            };
            if let Some(code) = managed.process.try_wait()? {
                managed.exit_code = Some(code);
                managed.state = LifecycleState::StoppedRunning;
                self.harvest(run_id)?;
            }
        }
        Ok(())
    }

    /// Close the run's output sink, record its stats, read back the result
    /// artifact, and report the observation. A successful run that wrote a
    /// result without the objective key is a contract violation and aborts;
    /// a run with no result at all, or a non-zero exit, is merely degenerate
    /// and reports a zero-valued observation.
    pub fn harvest(&mut self, run_id: u64) -> Result<(), SweepError> {
        let (trial, exit_code, elapsed) = match self.processes.get_mut(&run_id) {
            Some(managed) if managed.state == LifecycleState::StoppedRunning => {
                drop(managed.sink.take());
                (
                    managed.trial.clone(),
                    managed.exit_code.unwrap_or(-1),
                    managed.started.elapsed().as_secs_f64(),
                )
            }
            _ => return Ok(()),
        };

        self.workspace.write_process_stats(run_id, elapsed, exit_code)?;

        let objective_key = self.workspace.objective().to_string();
        let (objective, context) = if exit_code == 0 {
            match self.workspace.read_result(run_id)? {
                Some(metrics) => {
                    let value = metrics
                        .get(&objective_key)
                        .and_then(Value::as_f64)
                        .ok_or_else(|| SweepError::ContractViolation {
                            run_id,
                            objective: objective_key.clone(),
                        })?;
                    (value, Value::Object(metrics))
                }
                None => (0.0, serde_json::json!({ "help": "No metrics provided" })),
            }
        } else {
            (0.0, serde_json::json!({ "error": exit_code }))
        };

        self.study.add_observation(&trial, 1, objective, context);
        self.study.finalize(&trial);
        self.study.save()?;
        eprintln!(
            "{} Finalized ({}: {}).",
            self.prettify(&trial),
            objective_key,
            objective
        );

        if let Some(managed) = self.processes.get_mut(&run_id) {
            managed.state = LifecycleState::Finished;
        }
        Ok(())
    }

    /// Sweep for `StoppedRunning` stragglers left by an aborted harvest.
    pub fn harvest_stopped(&mut self) -> Result<(), SweepError> {
        let stopped: Vec<u64> = self
            .processes
            .iter()
            .filter(|(_, p)| p.state == LifecycleState::StoppedRunning)
            .map(|(id, _)| *id)
            .collect();
        for run_id in stopped {
            self.harvest(run_id)?;
        }
        Ok(())
    }

    /// Top-level control loop: pull trials until the collaborator is
    /// exhausted, then block until every remaining run is `Finished`.
    pub async fn drain_loop(&mut self) -> Result<(), SweepError> {
        while let Some(trial) = self.study.next_trial() {
            self.admit().await?;
            self.harvest_stopped()?;
            self.submit(trial).await?;
        }
        eprintln!("[Hypersweep] Trial source exhausted; waiting for in-flight runs.");
        while !self.all_finished() {
            self.poll()?;
            self.harvest_stopped()?;
            tokio::time::sleep(self.poll_interval).await;
        }
        eprintln!("[Hypersweep] All runs finished.");
        Ok(())
    }
}
