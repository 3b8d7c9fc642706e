//! # Epochal Core
//!
//! Experiment coordination for supervised training loops.
//! Engines fire lifecycle events, the [`Experiment`] subscribes meters and a
//! per-epoch summary to them, attaches validation as a conditional hook and
//! saves or restores the state of everything it owns.

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod experiment;
pub mod format;
pub mod hooks;
pub mod meters;
pub mod state;
pub mod summary;

// Re-export commonly used types at the crate root.
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use config::{CheckpointConfig, ExperimentConfig, TrainerConfig, load_config};
pub use engine::{Engine, Evaluator, Model, SharedEngine, SharedModel, Trainer};
pub use error::{ExperimentError, Result};
pub use experiment::{Experiment, ExperimentBuilder};
pub use format::Reading;
pub use hooks::{Condition, EngineEvent, Hook, HookContext, HookKind, HookRegistry};
pub use meters::{
    Clock, ManualClock, MemoryMeter, Meter, RunningAverageMeter, SharedClock, SharedMeter,
    SystemClock, TimeMeter,
};
pub use state::{ExperimentState, StateDict, Stateful};
pub use summary::{RowSource, Summary, SummaryRow, sort_rows};
