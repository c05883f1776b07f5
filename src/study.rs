//! Search-algorithm collaborator contract.
//!
//! The scheduler pulls trials from a [`Study`] and reports observations back
//! to it; the search algorithm itself lives behind the trait. [`QueueStudy`]
//! is the built-in pull source: it replays the trial list declared in the
//! experiment file and records whatever the scheduler observes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use serde::Serialize;
use serde_json::Value;

use crate::error::SweepError;
use crate::workspace::run_dir;

/// Study state directory under the experiment work dir.
pub const STUDY_DIR: &str = "study";
/// Recorded observations, rewritten on every `save`.
pub const RESULTS_FILE: &str = "results.json";

/// One proposed hyperparameter assignment. Owned by the collaborator; the
/// scheduler reads it and attaches an observation, never mutates it.
#[derive(Debug, Clone, Serialize)]
pub struct Trial {
    pub id: u64,
    pub parameters: HashMap<String, Value>,
}

impl fmt::Display for Trial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.parameters.is_empty() {
            write!(f, "[trial {}]", self.id)?;
        } else {
            write!(f, "[trial {} (", self.id)?;
            let sorted = self.parameters.iter().sorted_by(|a, b| a.0.cmp(b.0));
            for (i, (key, value)) in sorted.enumerate() {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if i == 0 {
                    write!(f, "{}={}", key, value)?;
                } else {
                    write!(f, ",{}={}", key, value)?;
                }
            }
            write!(f, ")]")?;
        }
        Ok(())
    }
}

/// The (objective, context) tuple reported back for one finished run.
#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    pub trial_id: u64,
    pub iteration: u32,
    pub objective: f64,
    pub context: Value,
    pub parameters: HashMap<String, Value>,
}

/// Best trial seen so far, with its workspace re-derived from the run id.
#[derive(Debug, Clone)]
pub struct BestResult {
    pub trial_id: u64,
    pub objective: f64,
    pub work_dir: PathBuf,
}

/// What the scheduler needs from a search algorithm. Observations may arrive
/// out of submission order; implementations must tolerate that.
pub trait Study {
    /// Propose the next trial, or signal exhaustion with `None`.
    fn next_trial(&mut self) -> Option<Trial>;

    fn add_observation(&mut self, trial: &Trial, iteration: u32, objective: f64, context: Value);

    fn finalize(&mut self, trial: &Trial);

    /// Persist algorithm state. Called after every observation.
    fn save(&mut self) -> Result<(), SweepError>;

    fn best_result(&self) -> Option<BestResult>;
}

/// FIFO replay of a pre-declared trial list. Ids are assigned 1..N in
/// declaration order. Higher objective is better.
pub struct QueueStudy {
    pending: VecDeque<Trial>,
    observations: Vec<Observation>,
    finalized: HashSet<u64>,
    work_dir: PathBuf,
    study_dir: PathBuf,
}

impl QueueStudy {
    pub fn new(
        param_sets: Vec<HashMap<String, Value>>,
        work_dir: &Path,
    ) -> Result<Self, SweepError> {
        let study_dir = work_dir.join(STUDY_DIR);
        std::fs::create_dir_all(&study_dir)?;
        let pending = param_sets
            .into_iter()
            .enumerate()
            .map(|(i, parameters)| Trial {
                id: i as u64 + 1,
                parameters,
            })
            .collect();
        Ok(Self {
            pending,
            observations: Vec::new(),
            finalized: HashSet::new(),
            work_dir: work_dir.to_path_buf(),
            study_dir,
        })
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn num_finalized(&self) -> usize {
        self.finalized.len()
    }
}

impl Study for QueueStudy {
    fn next_trial(&mut self) -> Option<Trial> {
        self.pending.pop_front()
    }

    fn add_observation(&mut self, trial: &Trial, iteration: u32, objective: f64, context: Value) {
        self.observations.push(Observation {
            trial_id: trial.id,
            iteration,
            objective,
            context,
            parameters: trial.parameters.clone(),
        });
    }

    fn finalize(&mut self, trial: &Trial) {
        self.finalized.insert(trial.id);
    }

    fn save(&mut self) -> Result<(), SweepError> {
        let file = File::create(self.study_dir.join(RESULTS_FILE))?;
        serde_json::to_writer_pretty(file, &self.observations)?;
        Ok(())
    }

    fn best_result(&self) -> Option<BestResult> {
        self.observations
            .iter()
            .max_by(|a, b| {
                a.objective
                    .partial_cmp(&b.objective)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|best| BestResult {
                trial_id: best.trial_id,
                objective: best.objective,
                work_dir: run_dir(&self.work_dir, best.trial_id),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param_sets() -> Vec<HashMap<String, Value>> {
        [0.1, 0.01, 0.001]
            .iter()
            .map(|lr| {
                let mut params = HashMap::new();
                params.insert("lr".to_string(), Value::from(*lr));
                params
            })
            .collect()
    }

    #[test]
    fn test_trials_yield_in_declaration_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut study = QueueStudy::new(param_sets(), dir.path()).unwrap();
        let ids: Vec<u64> = std::iter::from_fn(|| study.next_trial()).map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(study.next_trial().is_none());
    }

    #[test]
    fn test_best_result_maximizes_objective() {
        let dir = tempfile::tempdir().unwrap();
        let mut study = QueueStudy::new(param_sets(), dir.path()).unwrap();
        let first = study.next_trial().unwrap();
        let second = study.next_trial().unwrap();

        study.add_observation(&first, 1, 0.8, Value::Null);
        study.finalize(&first);
        // Out of submission order on purpose.
        study.add_observation(&second, 1, 0.9, Value::Null);
        study.finalize(&second);

        let best = study.best_result().unwrap();
        assert_eq!(best.trial_id, second.id);
        assert_eq!(best.objective, 0.9);
        assert_eq!(best.work_dir, dir.path().join("run_2"));
    }

    #[test]
    fn test_save_persists_observations() {
        let dir = tempfile::tempdir().unwrap();
        let mut study = QueueStudy::new(param_sets(), dir.path()).unwrap();
        let trial = study.next_trial().unwrap();
        study.add_observation(&trial, 1, 0.5, serde_json::json!({"loss": 0.7}));
        study.save().unwrap();

        let file = File::open(dir.path().join(STUDY_DIR).join(RESULTS_FILE)).unwrap();
        let saved: Value = serde_json::from_reader(file).unwrap();
        assert_eq!(saved[0]["trial_id"], Value::from(1));
        assert_eq!(saved[0]["objective"], Value::from(0.5));
        assert_eq!(saved[0]["context"]["loss"], Value::from(0.7));
    }

    #[test]
    fn test_trial_display_sorts_parameters() {
        let mut parameters = HashMap::new();
        parameters.insert("lr".to_string(), Value::from(0.1));
        parameters.insert("batch_size".to_string(), Value::from(32));
        parameters.insert("optimizer".to_string(), Value::from("adam"));
        let trial = Trial { id: 7, parameters };
        assert_eq!(
            trial.to_string(),
            "[trial 7 (batch_size=32,lr=0.1,optimizer=adam)]"
        );
    }

    #[test]
    fn test_empty_study_has_no_best() {
        let dir = tempfile::tempdir().unwrap();
        let study = QueueStudy::new(vec![], dir.path()).unwrap();
        assert!(study.best_result().is_none());
    }
}
