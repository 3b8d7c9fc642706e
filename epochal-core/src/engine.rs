//! Engines: the iteration loops that fire lifecycle events.
//!
//! [`Engine`] is the capability set the experiment depends on. [`Trainer`]
//! and [`Evaluator`] are reference implementations that drive a shared
//! [`Model`] over a fixed number of batches per epoch.

use crate::error::{ExperimentError, Result};
use crate::hooks::{Condition, EngineEvent, Hook, HookContext, HookRegistry};
use crate::state::{StateDict, Stateful};
use serde::{Deserialize, Serialize};
use std::cell::{RefCell, RefMut};
use std::rc::Rc;
use tracing::{debug, info};

/// An engine shared between its owner and the hooks that run it.
pub type SharedEngine = Rc<RefCell<dyn Engine>>;

/// A model shared between a trainer and its evaluators.
pub type SharedModel = Rc<RefCell<dyn Model>>;

/// Per-batch work delegated by the reference engines.
pub trait Model: Stateful {
    /// Run one training batch and return its loss.
    fn train_batch(&mut self, epoch: usize, batch: usize) -> Result<f64>;

    /// Evaluate one batch and return its loss.
    fn eval_batch(&mut self, batch: usize) -> Result<f64>;
}

/// Capability set of an engine.
pub trait Engine {
    fn name(&self) -> &str;

    fn hooks(&self) -> &HookRegistry;

    fn hooks_mut(&mut self) -> &mut HookRegistry;

    /// Register `hook` to run when `event` fires, after previously registered hooks.
    fn add_hook(&mut self, event: EngineEvent, hook: Hook) {
        self.hooks_mut().register(event, hook);
    }

    /// Run `evaluator`'s full pass whenever `when` fires and `condition` holds.
    fn add_evaluator(
        &mut self,
        evaluator: SharedEngine,
        when: EngineEvent,
        condition: Option<Condition>,
    ) {
        self.add_hook(when, Hook::evaluator(evaluator, condition));
    }

    /// Drive the loop to completion, firing events as it goes.
    fn run(&mut self) -> Result<()>;

    /// Save/restore capability, if the engine has one.
    fn stateful(&self) -> Option<&dyn Stateful> {
        None
    }

    fn stateful_mut(&mut self) -> Option<&mut dyn Stateful> {
        None
    }

    /// Extract the model's state from a state produced by this engine type.
    fn model_state(_state: &StateDict) -> Option<StateDict>
    where
        Self: Sized,
    {
        None
    }
}

fn borrow_model_mut(model: &SharedModel) -> Result<RefMut<'_, dyn Model + 'static>> {
    model
        .try_borrow_mut()
        .map_err(|_| ExperimentError::model("model is already borrowed"))
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

/// Multi-epoch training loop.
///
/// Each epoch fires `EpochStart`, then `IterationEnd` after every batch (with
/// the batch loss), then `EpochEnd`. Epoch numbers are 1-based and continue
/// from restored state, so a resumed trainer only runs the remaining epochs.
pub struct Trainer {
    name: String,
    model: SharedModel,
    batches_per_epoch: usize,
    max_epochs: usize,
    hooks: HookRegistry,
    epochs: usize,
    iterations: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct TrainerState {
    epochs: usize,
    iterations: usize,
    model: StateDict,
}

impl Trainer {
    pub fn new(model: SharedModel, batches_per_epoch: usize) -> Self {
        Self {
            name: "trainer".into(),
            model,
            batches_per_epoch,
            max_epochs: 1,
            hooks: HookRegistry::new(),
            epochs: 0,
            iterations: 0,
        }
    }

    pub fn with_max_epochs(mut self, max_epochs: usize) -> Self {
        self.max_epochs = max_epochs;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Epochs completed so far.
    pub fn epochs(&self) -> usize {
        self.epochs
    }

    /// Batches processed so far, across epochs.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn max_epochs(&self) -> usize {
        self.max_epochs
    }

    pub fn model(&self) -> &SharedModel {
        &self.model
    }

    fn context(&self, event: EngineEvent, epoch: usize, loss: Option<f64>) -> HookContext {
        HookContext {
            event,
            engine: self.name.clone(),
            epoch,
            iteration: self.iterations,
            loss,
        }
    }
}

impl Engine for Trainer {
    fn name(&self) -> &str {
        &self.name
    }

    fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    fn run(&mut self) -> Result<()> {
        if self.batches_per_epoch == 0 {
            return Err(ExperimentError::engine(format!(
                "{} has no batches to iterate",
                self.name
            )));
        }

        while self.epochs < self.max_epochs {
            let epoch = self.epochs + 1;
            debug!(engine = self.name.as_str(), epoch, "Epoch started");
            let ctx = self.context(EngineEvent::EpochStart, epoch, None);
            self.hooks.fire(&ctx)?;

            for batch in 0..self.batches_per_epoch {
                let loss = borrow_model_mut(&self.model)?.train_batch(epoch, batch)?;
                self.iterations += 1;
                let ctx = self.context(EngineEvent::IterationEnd, epoch, Some(loss));
                self.hooks.fire(&ctx)?;
            }

            self.epochs = epoch;
            let ctx = self.context(EngineEvent::EpochEnd, epoch, None);
            self.hooks.fire(&ctx)?;
            debug!(engine = self.name.as_str(), epoch, "Epoch finished");
        }

        info!(
            engine = self.name.as_str(),
            epochs = self.epochs,
            iterations = self.iterations,
            "Training finished"
        );
        Ok(())
    }

    fn stateful(&self) -> Option<&dyn Stateful> {
        Some(self)
    }

    fn stateful_mut(&mut self) -> Option<&mut dyn Stateful> {
        Some(self)
    }

    fn model_state(state: &StateDict) -> Option<StateDict> {
        state.get("model").filter(|m| !m.is_null()).cloned()
    }
}

impl Stateful for Trainer {
    fn state_dict(&self) -> Result<StateDict> {
        let model = self
            .model
            .try_borrow()
            .map_err(|_| ExperimentError::model("model is already borrowed"))?
            .state_dict()?;
        Ok(serde_json::to_value(TrainerState {
            epochs: self.epochs,
            iterations: self.iterations,
            model,
        })?)
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let state: TrainerState = serde_json::from_value(state.clone())
            .map_err(|e| ExperimentError::state(self.name.as_str(), e.to_string()))?;
        borrow_model_mut(&self.model)?.load_state_dict(&state.model)?;
        self.epochs = state.epochs;
        self.iterations = state.iterations;
        debug!(
            engine = self.name.as_str(),
            epochs = self.epochs,
            "Restored trainer state"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Single-pass evaluation loop.
///
/// Every `run()` is one pass over the batches, framed by `EpochStart` and
/// `EpochEnd`; the pass number is reported as the epoch.
pub struct Evaluator {
    name: String,
    model: SharedModel,
    batches: usize,
    hooks: HookRegistry,
    passes: usize,
    iterations: usize,
}

impl Evaluator {
    pub fn new(model: SharedModel, batches: usize) -> Self {
        Self {
            name: "evaluator".into(),
            model,
            batches,
            hooks: HookRegistry::new(),
            passes: 0,
            iterations: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Completed passes.
    pub fn passes(&self) -> usize {
        self.passes
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    fn context(&self, event: EngineEvent, loss: Option<f64>) -> HookContext {
        HookContext {
            event,
            engine: self.name.clone(),
            epoch: self.passes + 1,
            iteration: self.iterations,
            loss,
        }
    }
}

impl Engine for Evaluator {
    fn name(&self) -> &str {
        &self.name
    }

    fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    fn run(&mut self) -> Result<()> {
        let ctx = self.context(EngineEvent::EpochStart, None);
        self.hooks.fire(&ctx)?;

        for batch in 0..self.batches {
            let loss = borrow_model_mut(&self.model)?.eval_batch(batch)?;
            self.iterations += 1;
            let ctx = self.context(EngineEvent::IterationEnd, Some(loss));
            self.hooks.fire(&ctx)?;
        }

        let ctx = self.context(EngineEvent::EpochEnd, None);
        self.hooks.fire(&ctx)?;
        self.passes += 1;
        debug!(
            engine = self.name.as_str(),
            pass = self.passes,
            "Evaluation pass finished"
        );
        Ok(())
    }
}
