//! Process spawning wrapper.
//!
//! The scheduler's only interface to the execution environment: start a
//! process with a command line and output sinks, then poll it for an exit
//! code. Anything that satisfies [`Spawner`] can stand in for the operating
//! system, which is how the e2e tests drive the scheduler without real
//! training runs.

use std::fs::File;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::error::SweepError;

/// A live trial process.
pub trait TrialProcess: Send {
    /// Non-blocking exit check. `Ok(Some(code))` once the process has
    /// exited; termination by signal reports as `-1`.
    fn try_wait(&mut self) -> std::io::Result<Option<i32>>;
}

/// Starts trial processes.
#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(
        &self,
        command: &[String],
        stdout: File,
        stderr: File,
    ) -> Result<Box<dyn TrialProcess>, SweepError>;
}

/// The real thing: `tokio::process` children with redirected output.
pub struct OsSpawner;

#[async_trait]
impl Spawner for OsSpawner {
    async fn spawn(
        &self,
        command: &[String],
        stdout: File,
        stderr: File,
    ) -> Result<Box<dyn TrialProcess>, SweepError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| SweepError::Configuration("empty launch command".to_string()))?;
        let child = Command::new(program)
            .args(args)
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()?;
        Ok(Box::new(child))
    }
}

impl TrialProcess for Child {
    fn try_wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(Child::try_wait(self)?.map(|status| status.code().unwrap_or(-1)))
    }
}
