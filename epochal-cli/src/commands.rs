//! CLI subcommand handlers.

use crate::Commands;
use crate::RunArgs;
use crate::model::LinearRegression;
use epochal_core::checkpoint::load_state_file;
use epochal_core::{
    Checkpoint, CheckpointManager, Evaluator, Experiment, ExperimentConfig, ExperimentState,
    SharedEngine, SharedModel, Trainer,
};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{info, warn};

/// Handle a CLI subcommand.
pub fn handle_command(
    command: Commands,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => {
            let outcome = handle_run(args, workspace, config_file)?;
            println!(
                "Trained {} epoch(s); checkpoint written to {}",
                outcome.epochs,
                outcome.checkpoint.path.display()
            );
            Ok(())
        }
        Commands::ShowConfig => handle_show_config(workspace, config_file),
    }
}

fn resolve_config(
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<ExperimentConfig> {
    epochal_core::load_config(Some(workspace), config_file)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

fn handle_show_config(workspace: &Path, config_file: Option<&Path>) -> anyhow::Result<()> {
    let config = resolve_config(workspace, config_file)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{}", toml_str);
    Ok(())
}

/// Result of a finished `run`.
#[derive(Debug)]
pub(crate) struct RunOutcome {
    pub epochs: usize,
    pub checkpoint: Checkpoint,
}

pub(crate) fn handle_run(
    args: RunArgs,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<RunOutcome> {
    let mut config = resolve_config(workspace, config_file)?;
    if let Some(epochs) = args.epochs {
        config.trainer.max_epochs = epochs;
    }
    if args.no_valid {
        config.trainer.valid_batches = 0;
    }
    if let Some(dir) = args.checkpoint_dir {
        config.checkpoint.dir = dir;
    }

    let manager = CheckpointManager::new(
        resolve_dir(workspace, &config.checkpoint.dir),
        config.checkpoint.keep_last,
    );

    let regression = Rc::new(RefCell::new(LinearRegression::new(&config.trainer)));
    let model: SharedModel = regression.clone();
    let trainer = Trainer::new(model.clone(), config.trainer.batches_per_epoch)
        .with_max_epochs(config.trainer.max_epochs);

    let mut builder = Experiment::builder(trainer).config(&config);
    if config.trainer.valid_batches > 0 {
        let evaluator: SharedEngine = Rc::new(RefCell::new(
            Evaluator::new(model, config.trainer.valid_batches).with_name("validation"),
        ));
        builder = builder.valid_engine(evaluator);
    }
    let mut experiment = builder.build()?;

    let resumed = if let Some(path) = &args.resume_from {
        info!(path = %path.display(), "Resuming from checkpoint file");
        Some(load_state_file(path)?)
    } else if args.resume {
        match manager.load_latest()? {
            Some((checkpoint, state)) => {
                info!(epoch = checkpoint.epoch, "Resuming from latest checkpoint");
                Some(state)
            }
            None => {
                warn!(
                    dir = %manager.dir().display(),
                    "No checkpoint to resume from, starting fresh"
                );
                None
            }
        }
    } else {
        None
    };
    experiment.load_state_dict(resumed.as_ref())?;

    experiment.run()?;
    {
        let regression = regression.borrow();
        info!(
            weight = regression.weight(),
            bias = regression.bias(),
            "Model parameters"
        );
    }

    let state = experiment.state_dict()?;
    let epochs = completed_epochs(&state);
    let checkpoint = manager.save(epochs, &state)?;

    Ok(RunOutcome { epochs, checkpoint })
}

fn resolve_dir(workspace: &Path, dir: &Path) -> PathBuf {
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        workspace.join(dir)
    }
}

fn completed_epochs(state: &ExperimentState) -> usize {
    state
        .tr_engine
        .as_ref()
        .and_then(|engine| engine.get("epochs"))
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn small_config(workspace: &Path, body: &str) -> PathBuf {
        let path = workspace.join("run.toml");
        let base = "[trainer]\nmax_epochs = 2\nbatches_per_epoch = 4\nvalid_batches = 2\n";
        std::fs::write(&path, format!("{base}{body}")).unwrap();
        path
    }

    #[test]
    fn test_run_writes_checkpoint() {
        let dir = TempDir::new().unwrap();
        let config = small_config(dir.path(), "");

        let outcome = handle_run(RunArgs::default(), dir.path(), Some(&config)).unwrap();
        assert_eq!(outcome.epochs, 2);
        assert_eq!(outcome.checkpoint.epoch, 2);
        assert!(outcome.checkpoint.path.starts_with(dir.path().join(".epochal/checkpoints")));
        let state = load_state_file(&outcome.checkpoint.path).unwrap();
        assert!(state.va_loss.is_some());
    }

    #[test]
    fn test_run_without_validation() {
        let dir = TempDir::new().unwrap();
        let config = small_config(dir.path(), "");
        let args = RunArgs {
            no_valid: true,
            ..Default::default()
        };

        let outcome = handle_run(args, dir.path(), Some(&config)).unwrap();
        let state = load_state_file(&outcome.checkpoint.path).unwrap();
        assert!(state.va_loss.is_none());
        assert!(state.tr_loss.is_some());
    }

    #[test]
    fn test_resume_continues_to_max_epochs() {
        let dir = TempDir::new().unwrap();
        let config = small_config(dir.path(), "");
        handle_run(RunArgs::default(), dir.path(), Some(&config)).unwrap();

        let args = RunArgs {
            epochs: Some(5),
            resume: true,
            ..Default::default()
        };
        let outcome = handle_run(args, dir.path(), Some(&config)).unwrap();
        assert_eq!(outcome.epochs, 5);

        let state = load_state_file(&outcome.checkpoint.path).unwrap();
        let tr_engine = state.tr_engine.unwrap();
        assert_eq!(tr_engine["iterations"], serde_json::json!(5 * 4));

        let manager = CheckpointManager::new(dir.path().join(".epochal/checkpoints"), 3);
        let epochs: Vec<usize> = manager.list().unwrap().iter().map(|c| c.epoch).collect();
        assert_eq!(epochs, vec![2, 5]);
    }

    #[test]
    fn test_resume_from_file() {
        let dir = TempDir::new().unwrap();
        let config = small_config(dir.path(), "");
        let first = handle_run(RunArgs::default(), dir.path(), Some(&config)).unwrap();

        let args = RunArgs {
            epochs: Some(3),
            resume_from: Some(first.checkpoint.path.clone()),
            checkpoint_dir: Some(dir.path().join("other")),
            ..Default::default()
        };
        let outcome = handle_run(args, dir.path(), Some(&config)).unwrap();
        assert_eq!(outcome.epochs, 3);
        assert!(outcome.checkpoint.path.starts_with(dir.path().join("other")));
    }

    #[test]
    fn test_resume_without_checkpoint_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let config = small_config(dir.path(), "");
        let args = RunArgs {
            resume: true,
            ..Default::default()
        };
        let outcome = handle_run(args, dir.path(), Some(&config)).unwrap();
        assert_eq!(outcome.epochs, 2);
    }

    #[test]
    fn test_run_zero_batches_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.toml");
        std::fs::write(&path, "[trainer]\nbatches_per_epoch = 0\nvalid_batches = 0\n").unwrap();
        assert!(handle_run(RunArgs::default(), dir.path(), Some(&path)).is_err());
    }

    #[test]
    fn test_missing_config_file_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.toml");
        let err = handle_run(RunArgs::default(), dir.path(), Some(&missing)).unwrap_err();
        assert!(err.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_show_config_defaults() {
        let dir = TempDir::new().unwrap();
        let result = handle_command(Commands::ShowConfig, dir.path(), None);
        assert!(result.is_ok());
    }

    #[test]
    fn test_config_renders_as_toml() {
        let toml_str = toml::to_string_pretty(&ExperimentConfig::default()).unwrap();
        let parsed: ExperimentConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, ExperimentConfig::default());
    }
}
