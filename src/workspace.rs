//! Per-run workspace management.
//!
//! Every trial gets an isolated directory under the experiment's work
//! directory, holding its config files, output capture, and result
//! artifacts. Directory naming is a pure function of the run id, so a run's
//! workspace path can always be re-derived without scheduler state.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::SweepError;

/// Line-oriented `--key=value ` flag file consumed by the trial entry point.
pub const CONFIG_FILE: &str = "config.cfg";
/// The same config as a JSON object.
pub const CONFIG_JSON: &str = "config.json";
/// Result artifact the trial executable is contracted to produce.
pub const RESULT_FILE: &str = "test_metrics.json";
/// Wall time and exit code, written at harvest.
pub const STATS_FILE: &str = "process_stats.json";
pub const STDOUT_FILE: &str = "stdout.out";
pub const STDERR_FILE: &str = "stderr.out";

/// The workspace directory of one run.
pub fn run_dir(work_dir: &Path, run_id: u64) -> PathBuf {
    work_dir.join(format!("run_{}", run_id))
}

/// Root of all per-run workspaces, plus the values injected into every run
/// config.
#[derive(Debug, Clone)]
pub struct Workspace {
    work_dir: PathBuf,
    data_dir: PathBuf,
    objective: String,
}

impl Workspace {
    pub fn new(work_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>, objective: String) -> Self {
        Self {
            work_dir: work_dir.into(),
            data_dir: data_dir.into(),
            objective,
        }
    }

    pub fn objective(&self) -> &str {
        &self.objective
    }

    pub fn run_dir(&self, run_id: u64) -> PathBuf {
        run_dir(&self.work_dir, run_id)
    }

    pub fn stdout_path(&self, run_id: u64) -> PathBuf {
        self.run_dir(run_id).join(STDOUT_FILE)
    }

    pub fn stderr_path(&self, run_id: u64) -> PathBuf {
        self.run_dir(run_id).join(STDERR_FILE)
    }

    /// Create the run directory. Safe to call any number of times.
    pub fn allocate(&self, run_id: u64) -> Result<PathBuf, SweepError> {
        let dir = self.run_dir(run_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Write the run's flag file and JSON config and return the flag-file
    /// path. The trial's parameters are augmented with `data_dir`,
    /// `work_dir`, `log_dir`, `objective`, and a zero `verbosity`.
    pub fn write_config(
        &self,
        run_id: u64,
        parameters: &HashMap<String, Value>,
    ) -> Result<PathBuf, SweepError> {
        let dir = self.run_dir(run_id);

        let mut config = Map::new();
        for (key, value) in parameters {
            config.insert(key.clone(), value.clone());
        }
        config.insert(
            "data_dir".to_string(),
            Value::String(self.data_dir.display().to_string()),
        );
        config.insert(
            "work_dir".to_string(),
            Value::String(dir.display().to_string()),
        );
        config.insert(
            "log_dir".to_string(),
            Value::String(dir.display().to_string()),
        );
        config.insert(
            "objective".to_string(),
            Value::String(self.objective.clone()),
        );
        config.insert("verbosity".to_string(), Value::from(0));

        let config_file = dir.join(CONFIG_FILE);
        let mut flags = File::create(&config_file)?;
        for (key, value) in &config {
            // The trailing space before the newline is load-bearing: flag-file
            // parsers downstream expect `--key=value \n` lines.
            writeln!(flags, "--{}={} ", key, flag_value(value))?;
        }

        let json = File::create(dir.join(CONFIG_JSON))?;
        serde_json::to_writer(json, &config)?;

        Ok(config_file)
    }

    /// Read back the run's result artifact. A missing file is an expected
    /// outcome (the trial died before producing it), not an error.
    pub fn read_result(&self, run_id: u64) -> Result<Option<Map<String, Value>>, SweepError> {
        let path = self.run_dir(run_id).join(RESULT_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let file = File::open(path)?;
        Ok(Some(serde_json::from_reader(file)?))
    }

    pub fn write_process_stats(
        &self,
        run_id: u64,
        time_in_secs: f64,
        returncode: i32,
    ) -> Result<(), SweepError> {
        let stats = serde_json::json!({
            "time_in_secs": time_in_secs,
            "returncode": returncode,
        });
        let file = File::create(self.run_dir(run_id).join(STATS_FILE))?;
        serde_json::to_writer(file, &stats)?;
        Ok(())
    }
}

/// Flag-file rendering of one scalar. Strings go in bare, everything else
/// uses its JSON form.
fn flag_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace(dir: &Path) -> Workspace {
        Workspace::new(dir, "/data/imdb", "accuracy".to_string())
    }

    fn params() -> HashMap<String, Value> {
        let mut params = HashMap::new();
        params.insert("lr".to_string(), Value::from(0.1));
        params.insert("layers".to_string(), Value::from(2));
        params.insert("optimizer".to_string(), Value::from("adam"));
        params
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let first = ws.allocate(3).unwrap();
        let second = ws.allocate(3).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, dir.path().join("run_3"));
        assert!(first.is_dir());
    }

    #[test]
    fn test_run_dir_is_pure() {
        assert_eq!(
            run_dir(Path::new("/work"), 42),
            PathBuf::from("/work/run_42")
        );
    }

    #[test]
    fn test_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        ws.allocate(1).unwrap();
        ws.write_config(1, &params()).unwrap();

        let file = File::open(dir.path().join("run_1").join(CONFIG_JSON)).unwrap();
        let written: Map<String, Value> = serde_json::from_reader(file).unwrap();

        // Original parameters survive unchanged.
        assert_eq!(written["lr"], Value::from(0.1));
        assert_eq!(written["layers"], Value::from(2));
        assert_eq!(written["optimizer"], Value::from("adam"));
        // Plus the injected keys, nothing else.
        assert_eq!(written["data_dir"], Value::from("/data/imdb"));
        assert_eq!(
            written["work_dir"],
            Value::from(dir.path().join("run_1").display().to_string())
        );
        assert_eq!(written["log_dir"], written["work_dir"]);
        assert_eq!(written["objective"], Value::from("accuracy"));
        assert_eq!(written["verbosity"], Value::from(0));
        assert_eq!(written.len(), 8);
    }

    #[test]
    fn test_flag_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        ws.allocate(1).unwrap();
        let config_file = ws.write_config(1, &params()).unwrap();

        let text = std::fs::read_to_string(config_file).unwrap();
        for line in text.lines() {
            assert!(line.starts_with("--"), "bad flag line: {line:?}");
            assert!(line.ends_with(' '), "missing trailing space: {line:?}");
        }
        assert!(text.contains("--lr=0.1 \n"));
        assert!(text.contains("--optimizer=adam \n"));
        assert!(text.contains("--verbosity=0 \n"));
    }

    #[test]
    fn test_read_result_absent_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        ws.allocate(1).unwrap();
        assert!(ws.read_result(1).unwrap().is_none());
    }

    #[test]
    fn test_read_result_present() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let run = ws.allocate(1).unwrap();
        std::fs::write(run.join(RESULT_FILE), r#"{"accuracy": 0.92, "loss": 0.3}"#).unwrap();

        let metrics = ws.read_result(1).unwrap().unwrap();
        assert_eq!(metrics["accuracy"], Value::from(0.92));
    }

    #[test]
    fn test_process_stats_written() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let run = ws.allocate(1).unwrap();
        ws.write_process_stats(1, 12.5, 0).unwrap();

        let file = File::open(run.join(STATS_FILE)).unwrap();
        let stats: Value = serde_json::from_reader(file).unwrap();
        assert_eq!(stats["time_in_secs"], Value::from(12.5));
        assert_eq!(stats["returncode"], Value::from(0));
    }
}
