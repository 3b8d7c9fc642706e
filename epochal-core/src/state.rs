//! Optional save/restore capability and the experiment's persisted state.

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Opaque serialized state of a component.
pub type StateDict = serde_json::Value;

/// Components that can save and restore their own state.
pub trait Stateful {
    fn state_dict(&self) -> Result<StateDict>;

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;
}

/// Persisted state of an experiment.
///
/// Each field is `None` when the owning child has no state capability (or
/// does not exist). `None` serializes as an explicit `null`; keys are never
/// omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentState {
    pub tr_engine: Option<StateDict>,
    pub tr_loss: Option<StateDict>,
    pub va_loss: Option<StateDict>,
}
