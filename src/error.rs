use thiserror::Error;

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Invalid resource configuration: {0}")]
    Configuration(String),
    #[error("Run {run_id} wrote a result file without the objective key '{objective}'")]
    ContractViolation { run_id: u64, objective: String },
    #[error("Failed to read or write a run artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize or parse a JSON artifact: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to parse the experiment file: {0}")]
    Experiment(#[from] serde_yaml::Error),
    #[error("Failed to render a launch script: {0}")]
    Template(#[from] handlebars::RenderError),
}
