use std::collections::BTreeSet;
use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use hypersweep::{
    Config, Experiment, LaunchBuilder, LauncherKind, OsSpawner, QueueStudy, Study, SweepError,
    TrialScheduler, Workspace,
};

#[tokio::main]
async fn main() -> Result<(), SweepError> {
    let cli = Config::parse();

    let experiment = Experiment::load(&cli.experiment_file)?;
    // Fails fast on a malformed cluster descriptor, before any trial runs.
    let resources = experiment.resources_for(cli.host.as_deref())?;
    let kind = LauncherKind::from(cli.mode);

    match kind {
        LauncherKind::Local => eprintln!("[Hypersweep] Running with the local launcher!"),
        LauncherKind::Cluster => eprintln!("[Hypersweep] Running with the cluster launcher!"),
    }
    eprintln!(
        "[Hypersweep] {}/{}: scheduling {} trials over {} slots.",
        experiment.project,
        experiment.experiment,
        experiment.trials.len(),
        resources.ntasks
    );

    let work_dir = PathBuf::from(&cli.work_dir);
    std::fs::create_dir_all(&work_dir)?;

    // Record the searched parameter names next to the study state.
    let parameter_names: BTreeSet<&str> = experiment
        .trials
        .iter()
        .flat_map(|trial| trial.keys().map(String::as_str))
        .collect();
    serde_json::to_writer(
        File::create(work_dir.join("parameters.json"))?,
        &parameter_names,
    )?;

    let study = QueueStudy::new(experiment.trials.clone(), &work_dir)?;
    let workspace = Workspace::new(&work_dir, &cli.data_dir, experiment.objective.clone());
    let builder = LaunchBuilder::new(
        kind,
        resources.clone(),
        &experiment,
        cli.train_file.clone(),
        &work_dir,
    );
    let mut scheduler = TrialScheduler::new(
        study,
        workspace,
        builder,
        Box::new(OsSpawner),
        resources.ntasks,
        Duration::from_secs(cli.poll_interval),
    );

    scheduler.drain_loop().await?;

    match scheduler.study().best_result() {
        Some(best) => {
            eprintln!(
                "[Hypersweep] Best trial run - ID: {}, {}: {}",
                best.trial_id, experiment.objective, best.objective
            );
            eprintln!(
                "[Hypersweep] Find all related data at {}",
                best.work_dir.display()
            );
        }
        None => eprintln!("[Hypersweep] No observations were recorded."),
    }

    Ok(())
}
