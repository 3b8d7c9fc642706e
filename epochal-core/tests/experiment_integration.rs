//! End-to-end experiment runs, checked through the log lines they emit.

use epochal_core::{
    CheckpointManager, EngineEvent, Evaluator, Experiment, ExperimentError, ManualClock, Model,
    Result, SharedEngine, SharedModel, StateDict, Stateful, Trainer,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

// --- Log capture ---

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn lines(&self) -> Vec<String> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| line.trim().to_string())
            .collect()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Captured {
    type Writer = Captured;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Run `f` with a subscriber that records plain messages at `level` and above.
fn capture<T>(level: Level, f: impl FnOnce() -> T) -> (T, Vec<String>) {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(captured.clone())
        .with_max_level(level)
        .with_ansi(false)
        .without_time()
        .with_level(false)
        .with_target(false)
        .finish();
    let out = tracing::subscriber::with_default(subscriber, f);
    (out, captured.lines())
}

fn summary_lines(lines: &[String]) -> Vec<&str> {
    lines
        .iter()
        .map(String::as_str)
        .filter(|line| line.starts_with("Epoch = "))
        .collect()
}

/// Strip the trailing `Memory = ...` segment, which depends on the process.
fn without_memory(line: &str) -> &str {
    match line.find(", Memory = ") {
        Some(pos) => &line[..pos],
        None => line,
    }
}

// --- Test model ---

/// Replays fixed losses; a train batch takes one second, an eval batch half.
struct ScriptedModel {
    clock: Rc<ManualClock>,
    train_losses: Vec<f64>,
    eval_loss: f64,
    fail_at_epoch: Option<usize>,
    steps: u64,
}

impl Stateful for ScriptedModel {
    fn state_dict(&self) -> Result<StateDict> {
        Ok(json!({ "steps": self.steps }))
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        self.steps = state["steps"]
            .as_u64()
            .ok_or_else(|| ExperimentError::state("model", "missing steps"))?;
        Ok(())
    }
}

impl Model for ScriptedModel {
    fn train_batch(&mut self, epoch: usize, batch: usize) -> Result<f64> {
        if self.fail_at_epoch == Some(epoch) {
            return Err(ExperimentError::model(format!("diverged at epoch {epoch}")));
        }
        self.clock.advance(Duration::from_secs(1));
        self.steps += 1;
        Ok(self.train_losses[batch % self.train_losses.len()])
    }

    fn eval_batch(&mut self, _batch: usize) -> Result<f64> {
        self.clock.advance(Duration::from_millis(500));
        Ok(self.eval_loss)
    }
}

struct Fixture {
    clock: Rc<ManualClock>,
    model: SharedModel,
}

impl Fixture {
    fn new() -> Self {
        Self::failing_at(None)
    }

    fn failing_at(fail_at_epoch: Option<usize>) -> Self {
        let clock = Rc::new(ManualClock::new());
        let model: SharedModel = Rc::new(RefCell::new(ScriptedModel {
            clock: clock.clone(),
            train_losses: vec![0.5, 0.3],
            eval_loss: 0.25,
            fail_at_epoch,
            steps: 0,
        }));
        Self { clock, model }
    }

    fn trainer(&self, max_epochs: usize) -> Trainer {
        Trainer::new(self.model.clone(), 2).with_max_epochs(max_epochs)
    }

    fn evaluator(&self) -> Rc<RefCell<Evaluator>> {
        Rc::new(RefCell::new(Evaluator::new(self.model.clone(), 1)))
    }
}

// --- Scenarios ---

#[test]
fn two_epochs_with_validation_log_one_line_each() {
    let fx = Fixture::new();
    let mut exp = Experiment::builder(fx.trainer(2))
        .valid_engine(fx.evaluator())
        .clock(fx.clock.clone())
        .build()
        .unwrap();

    let (result, lines) = capture(Level::INFO, || exp.run().map(|_| ()));
    result.unwrap();

    let summaries = summary_lines(&lines);
    assert_eq!(summaries.len(), 2);
    for (i, line) in summaries.iter().enumerate() {
        assert_eq!(
            without_memory(line),
            format!(
                "Epoch = {}, TR Loss = 4.000e-01, VA Loss = 2.500e-01, TR Time = 2.50s, VA Time = 0.50s",
                i + 1
            )
        );
        assert!(line.contains(", Memory = "));
    }
}

#[test]
fn training_only_summary_has_no_validation_columns() {
    let fx = Fixture::new();
    let mut exp = Experiment::builder(fx.trainer(1))
        .summary_order(["Epoch", "TR Loss", "TR Time", "Memory"])
        .clock(fx.clock.clone())
        .build()
        .unwrap();

    let (result, lines) = capture(Level::INFO, || exp.run().map(|_| ()));
    result.unwrap();

    let summaries = summary_lines(&lines);
    assert_eq!(summaries.len(), 1);
    assert_eq!(
        without_memory(summaries[0]),
        "Epoch = 1, TR Loss = 4.000e-01, TR Time = 2.00s"
    );
    assert!(!summaries[0].contains("VA "));
}

#[test]
fn unsortable_order_falls_back_and_says_why() {
    let fx = Fixture::new();
    let mut exp = Experiment::builder(fx.trainer(1))
        .valid_engine(fx.evaluator())
        .summary_order(["Epoch", "TR Loss"])
        .clock(fx.clock.clone())
        .build()
        .unwrap();

    let (result, lines) = capture(Level::DEBUG, || exp.run().map(|_| ()));
    result.unwrap();

    assert!(
        lines
            .iter()
            .any(|line| line.contains("Could not sort the summary. Reason:")),
        "missing fallback reason in {lines:#?}"
    );
    let summaries = summary_lines(&lines);
    assert_eq!(summaries.len(), 1);
    let line = summaries[0];
    let tr_time = line.find("TR Time").unwrap();
    let memory = line.find("Memory").unwrap();
    let va_loss = line.find("VA Loss").unwrap();
    assert!(tr_time < memory && memory < va_loss, "not in construction order: {line}");
}

#[test]
fn curriculum_mode_validates_every_iteration() {
    let fx = Fixture::new();
    let valid = fx.evaluator();
    let mut exp = Experiment::builder(fx.trainer(2))
        .valid_engine(valid.clone())
        .check_valid_hook_when(EngineEvent::EpochEnd)
        .use_cl(true)
        .clock(fx.clock.clone())
        .build()
        .unwrap();

    let (result, lines) = capture(Level::INFO, || exp.run().map(|_| ()));
    result.unwrap();

    assert_eq!(valid.borrow().passes(), 4);
    // Validation ran after each batch, so the train timer includes it.
    let summaries = summary_lines(&lines);
    assert_eq!(
        without_memory(summaries[1]),
        "Epoch = 2, TR Loss = 4.000e-01, VA Loss = 2.500e-01, TR Time = 3.00s, VA Time = 0.50s"
    );
}

#[test]
fn model_failure_stops_the_run() {
    let fx = Fixture::failing_at(Some(2));
    let mut exp = Experiment::builder(fx.trainer(3))
        .clock(fx.clock.clone())
        .build()
        .unwrap();

    let (result, lines) = capture(Level::INFO, || exp.run().map(|_| ()));
    let err = result.unwrap_err();
    assert!(matches!(err, ExperimentError::Model(_)));
    assert_eq!(summary_lines(&lines).len(), 1);
}

#[test]
fn checkpoint_resume_continues_numbering() {
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(dir.path(), 3);

    let fx = Fixture::new();
    let mut first = Experiment::builder(fx.trainer(1))
        .valid_engine(fx.evaluator())
        .clock(fx.clock.clone())
        .build()
        .unwrap();
    first.run().unwrap();
    manager.save(1, &first.state_dict().unwrap()).unwrap();

    let fx = Fixture::new();
    let valid: SharedEngine = fx.evaluator();
    let mut resumed = Experiment::builder(fx.trainer(3))
        .valid_engine(valid)
        .clock(fx.clock.clone())
        .build()
        .unwrap();
    let (_, state) = manager.load_latest().unwrap().unwrap();
    resumed.load_state_dict(Some(&state)).unwrap();

    let (result, lines) = capture(Level::INFO, || resumed.run().map(|_| ()));
    result.unwrap();

    let epochs: Vec<&str> = summary_lines(&lines)
        .iter()
        .map(|line| line.split(',').next().unwrap())
        .collect();
    assert_eq!(epochs, vec!["Epoch = 2", "Epoch = 3"]);

    let model_state = Experiment::model_state::<Trainer>(&resumed.state_dict().unwrap());
    assert_eq!(model_state, Some(json!({ "steps": 6 })));
}
