//! Experiment: wires a training engine, an optional validation engine, their
//! meters and the per-epoch summary together through engine hooks.
//!
//! All wiring happens in [`ExperimentBuilder::build`]. After that the
//! experiment only reacts to events fired by the training engine:
//!
//! - `epoch_start`: meters of the firing engine are reset.
//! - `iteration_end`: the batch loss is added to the engine's loss meter, and
//!   the validation engine may run (when attached to this event).
//! - `epoch_end`: the validation engine may run, then the training engine logs
//!   one summary line. Timers are never stopped, so TR Time spans the whole
//!   epoch up to the summary, validation passes included.

use crate::config::ExperimentConfig;
use crate::engine::{Engine, SharedEngine};
use crate::error::{ExperimentError, Result};
use crate::hooks::{Condition, EngineEvent, Hook, HookContext};
use crate::meters::{
    MemoryMeter, Meter, RunningAverageMeter, SharedClock, SharedMeter, SystemClock, TimeMeter,
};
use crate::state::{ExperimentState, StateDict, Stateful};
use crate::summary::{
    self, DEFAULT_SUMMARY_ORDER, RowSource, Summary, SummaryRow, sort_rows,
};
use std::cell::{Ref, RefCell};
use std::rc::Rc;
use tracing::{debug, info};

const LOSS_FORMAT: &str = "{[0]:.3e}";
const TIME_FORMAT: &str = "{:.2f}s";
const EPOCH_FORMAT: &str = "{:d}";
const MEMORY_FORMAT: &str = "{}";

/// Timer and loss meter of one engine.
#[derive(Debug, Clone)]
struct EngineMeters {
    timer: Rc<RefCell<TimeMeter>>,
    loss: Rc<RefCell<RunningAverageMeter>>,
}

impl EngineMeters {
    fn new(clock: SharedClock) -> Self {
        Self {
            timer: Rc::new(RefCell::new(TimeMeter::new(clock))),
            loss: Rc::new(RefCell::new(RunningAverageMeter::new())),
        }
    }

    fn reset(&self) {
        self.timer.borrow_mut().reset();
        self.loss.borrow_mut().reset();
    }

    /// Register reset and accumulate hooks on `engine`.
    fn attach(&self, engine: &mut dyn Engine, prefix: &str) {
        let meters = self.clone();
        engine.add_hook(
            EngineEvent::EpochStart,
            Hook::new(format!("{prefix}_reset_meters"), move |_| {
                meters.reset();
                Ok(())
            }),
        );

        let loss = self.loss.clone();
        engine.add_hook(
            EngineEvent::IterationEnd,
            Hook::new(format!("{prefix}_accumulate_loss"), move |ctx| {
                if let Some(value) = ctx.loss {
                    loss.borrow_mut().add(value);
                }
                Ok(())
            }),
        );
    }
}

/// Builder for [`Experiment`]. Registers every hook in [`build`](Self::build).
pub struct ExperimentBuilder {
    train_engine: Box<dyn Engine>,
    valid_engine: Option<SharedEngine>,
    check_valid_hook_when: EngineEvent,
    valid_hook_condition: Option<Condition>,
    summary_order: Option<Vec<String>>,
    use_cl: bool,
    use_transfer: bool,
    use_baseline: bool,
    clock: Option<SharedClock>,
}

impl ExperimentBuilder {
    fn new(train_engine: Box<dyn Engine>) -> Self {
        Self {
            train_engine,
            valid_engine: None,
            check_valid_hook_when: EngineEvent::EpochEnd,
            valid_hook_condition: None,
            summary_order: Some(DEFAULT_SUMMARY_ORDER.iter().map(|s| s.to_string()).collect()),
            use_cl: false,
            use_transfer: false,
            use_baseline: false,
            clock: None,
        }
    }

    pub fn valid_engine(mut self, engine: SharedEngine) -> Self {
        self.valid_engine = Some(engine);
        self
    }

    /// Event on the training engine that triggers validation.
    pub fn check_valid_hook_when(mut self, event: EngineEvent) -> Self {
        self.check_valid_hook_when = event;
        self
    }

    /// Only validate when `condition` holds for the triggering event.
    pub fn valid_hook_condition(
        mut self,
        condition: impl FnMut(&HookContext) -> bool + 'static,
    ) -> Self {
        self.valid_hook_condition = Some(Box::new(condition));
        self
    }

    pub fn summary_order<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.summary_order = Some(order.into_iter().map(Into::into).collect());
        self
    }

    /// Keep summary rows in construction order.
    pub fn without_summary_order(mut self) -> Self {
        self.summary_order = None;
        self
    }

    pub fn use_cl(mut self, enabled: bool) -> Self {
        self.use_cl = enabled;
        self
    }

    pub fn use_transfer(mut self, enabled: bool) -> Self {
        self.use_transfer = enabled;
        self
    }

    pub fn use_baseline(mut self, enabled: bool) -> Self {
        self.use_baseline = enabled;
        self
    }

    /// Clock shared by the training and validation timers.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Apply the experiment section of a loaded configuration.
    pub fn config(mut self, config: &ExperimentConfig) -> Self {
        self.check_valid_hook_when = config.check_valid_hook_when;
        self.summary_order = config.summary_order.clone();
        self.use_cl = config.use_cl;
        self.use_transfer = config.use_transfer;
        self.use_baseline = config.use_baseline;
        self
    }

    /// Wire meters, validation and the summary hook into the engines.
    pub fn build(self) -> Result<Experiment> {
        let mut valid_trigger = self.check_valid_hook_when;
        if self.use_cl || self.use_baseline {
            if valid_trigger != EngineEvent::IterationEnd {
                debug!(
                    requested = %valid_trigger,
                    use_cl = self.use_cl,
                    use_baseline = self.use_baseline,
                    "Checking validation every iteration"
                );
            }
            valid_trigger = EngineEvent::IterationEnd;
        }

        let clock = self
            .clock
            .unwrap_or_else(|| Rc::new(SystemClock::new()) as SharedClock);

        let mut train_engine = self.train_engine;
        let train = EngineMeters::new(clock.clone());
        train.attach(train_engine.as_mut(), "train");

        let valid = match self.valid_engine {
            Some(engine) => {
                let meters = EngineMeters::new(clock);
                {
                    let mut guard = engine.try_borrow_mut().map_err(|_| {
                        ExperimentError::engine("validation engine is borrowed during wiring")
                    })?;
                    meters.attach(&mut *guard, "valid");
                }
                train_engine.add_evaluator(
                    engine.clone(),
                    valid_trigger,
                    self.valid_hook_condition,
                );
                Some(ValidSide { engine, meters })
            }
            None => None,
        };

        let summary: Rc<RefCell<Option<Summary>>> = Rc::new(RefCell::new(None));
        let shared = summary.clone();
        train_engine.add_hook(
            EngineEvent::EpochEnd,
            Hook::new("log_epoch_summary", move |ctx| {
                log_epoch_summary(&shared, ctx.epoch)
            }),
        );

        debug!(
            train_engine = train_engine.name(),
            train_hooks = train_engine.hooks().count(),
            validation = valid.is_some(),
            valid_trigger = %valid_trigger,
            "Experiment wired"
        );

        Ok(Experiment {
            train_engine,
            train,
            valid,
            valid_trigger,
            summary_order: self.summary_order,
            summary,
            use_cl: self.use_cl,
            use_transfer: self.use_transfer,
            use_baseline: self.use_baseline,
        })
    }
}

/// Validation engine together with its meters; never partially present.
struct ValidSide {
    engine: SharedEngine,
    meters: EngineMeters,
}

/// Coordinates a training engine, an optional validation engine and their meters.
pub struct Experiment {
    train_engine: Box<dyn Engine>,
    train: EngineMeters,
    valid: Option<ValidSide>,
    valid_trigger: EngineEvent,
    summary_order: Option<Vec<String>>,
    summary: Rc<RefCell<Option<Summary>>>,
    use_cl: bool,
    use_transfer: bool,
    use_baseline: bool,
}

impl Experiment {
    pub fn builder(train_engine: impl Engine + 'static) -> ExperimentBuilder {
        ExperimentBuilder::new(Box::new(train_engine))
    }

    /// Experiment with default settings.
    pub fn new(
        train_engine: impl Engine + 'static,
        valid_engine: Option<SharedEngine>,
    ) -> Result<Self> {
        let builder = Self::builder(train_engine);
        match valid_engine {
            Some(engine) => builder.valid_engine(engine).build(),
            None => builder.build(),
        }
    }

    pub fn train_engine(&self) -> &dyn Engine {
        self.train_engine.as_ref()
    }

    pub fn train_engine_mut(&mut self) -> &mut dyn Engine {
        self.train_engine.as_mut()
    }

    pub fn valid_engine(&self) -> Option<&SharedEngine> {
        self.valid.as_ref().map(|v| &v.engine)
    }

    pub fn train_timer(&self) -> &Rc<RefCell<TimeMeter>> {
        &self.train.timer
    }

    pub fn train_loss(&self) -> &Rc<RefCell<RunningAverageMeter>> {
        &self.train.loss
    }

    pub fn valid_timer(&self) -> Option<&Rc<RefCell<TimeMeter>>> {
        self.valid.as_ref().map(|v| &v.meters.timer)
    }

    pub fn valid_loss(&self) -> Option<&Rc<RefCell<RunningAverageMeter>>> {
        self.valid.as_ref().map(|v| &v.meters.loss)
    }

    /// Event on the training engine that triggers validation, after mode overrides.
    pub fn valid_trigger(&self) -> EngineEvent {
        self.valid_trigger
    }

    pub fn summary_order(&self) -> Option<&[String]> {
        self.summary_order.as_deref()
    }

    pub fn use_cl(&self) -> bool {
        self.use_cl
    }

    pub fn use_transfer(&self) -> bool {
        self.use_transfer
    }

    pub fn use_baseline(&self) -> bool {
        self.use_baseline
    }

    /// The summary built by the last [`run`](Self::run), if any.
    pub fn summary(&self) -> Ref<'_, Option<Summary>> {
        self.summary.borrow()
    }

    /// Build the summary and drive the training engine to completion.
    pub fn run(&mut self) -> Result<&mut Self> {
        let rows = self.epoch_summary(self.summary_order.as_deref());
        *self.summary.borrow_mut() = Some(Summary::new(rows));
        self.train_engine.run()?;
        Ok(self)
    }

    pub fn train_reset_meters(&self) {
        self.train.reset();
    }

    pub fn valid_reset_meters(&self) {
        if let Some(valid) = &self.valid {
            valid.meters.reset();
        }
    }

    /// Summary rows in `summary_order`, or in construction order when they
    /// cannot all be placed.
    pub fn epoch_summary<S: AsRef<str>>(&self, summary_order: Option<&[S]>) -> Vec<SummaryRow> {
        let mut rows = vec![
            SummaryRow::new(summary::EPOCH, EPOCH_FORMAT, RowSource::Epoch(None)),
            SummaryRow::meter(summary::TR_LOSS, LOSS_FORMAT, self.train.loss.clone()),
            SummaryRow::meter(summary::TR_TIME, TIME_FORMAT, self.train.timer.clone()),
            SummaryRow::meter(
                summary::MEMORY,
                MEMORY_FORMAT,
                Rc::new(RefCell::new(MemoryMeter::new())) as SharedMeter,
            ),
        ];

        if let Some(valid) = &self.valid {
            rows.push(SummaryRow::meter(
                summary::VA_LOSS,
                LOSS_FORMAT,
                valid.meters.loss.clone(),
            ));
            rows.push(SummaryRow::meter(
                summary::VA_TIME,
                TIME_FORMAT,
                valid.meters.timer.clone(),
            ));
        }

        sort_rows(rows, summary_order)
    }

    /// Render and log the summary line for `epoch`.
    pub fn log_epoch_summary(&self, epoch: usize) -> Result<()> {
        log_epoch_summary(&self.summary, epoch)
    }

    pub fn state_dict(&self) -> Result<ExperimentState> {
        let tr_engine = self
            .train_engine
            .stateful()
            .map(|engine| engine.state_dict())
            .transpose()?;
        let tr_loss = Some(self.train.loss.borrow().state_dict()?);
        let va_loss = match &self.valid {
            Some(valid) => Some(valid.meters.loss.borrow().state_dict()?),
            None => None,
        };
        Ok(ExperimentState {
            tr_engine,
            tr_loss,
            va_loss,
        })
    }

    /// Restore from `state`. `None` leaves everything untouched.
    pub fn load_state_dict(&mut self, state: Option<&ExperimentState>) -> Result<()> {
        let Some(state) = state else {
            return Ok(());
        };

        if let (Some(engine), Some(sub)) =
            (self.train_engine.stateful_mut(), state.tr_engine.as_ref())
        {
            engine
                .load_state_dict(sub)
                .map_err(|e| rekey("tr_engine", e))?;
        }
        if let Some(sub) = &state.tr_loss {
            self.train
                .loss
                .borrow_mut()
                .load_state_dict(sub)
                .map_err(|e| rekey("tr_loss", e))?;
        }
        if let (Some(valid), Some(sub)) = (&self.valid, &state.va_loss) {
            valid
                .meters
                .loss
                .borrow_mut()
                .load_state_dict(sub)
                .map_err(|e| rekey("va_loss", e))?;
        }
        debug!("Experiment state restored");
        Ok(())
    }

    /// Model state inside an experiment state, as laid out by engine type `E`.
    pub fn model_state<E: Engine>(state: &ExperimentState) -> Option<StateDict> {
        state.tr_engine.as_ref().and_then(E::model_state)
    }
}

fn rekey(key: &str, err: ExperimentError) -> ExperimentError {
    match err {
        ExperimentError::State { reason, .. } => ExperimentError::state(key, reason),
        other => other,
    }
}

fn log_epoch_summary(summary: &RefCell<Option<Summary>>, epoch: usize) -> Result<()> {
    let mut guard = summary
        .try_borrow_mut()
        .map_err(|_| ExperimentError::engine("epoch summary is already borrowed"))?;
    let Some(summary) = guard.as_mut() else {
        debug!(epoch, "No summary built yet, skipping epoch summary");
        return Ok(());
    };
    summary.set_epoch(epoch);
    let line = summary.render()?;
    info!("{line}");
    Ok(())
}
