//! Event-driven hooks for engine lifecycle extensibility.
//!
//! Engines fire [`EngineEvent`]s while they run. Callbacks registered for an
//! event execute synchronously, in registration order. A hook may carry a
//! guard predicate that is evaluated right before it would run; attached
//! evaluators are ordinary hooks built with [`Hook::evaluator`].

use crate::engine::SharedEngine;
use crate::error::{ExperimentError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Lifecycle events fired by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineEvent {
    EpochStart,
    EpochEnd,
    IterationEnd,
}

impl EngineEvent {
    pub const ALL: [EngineEvent; 3] = [
        EngineEvent::EpochStart,
        EngineEvent::EpochEnd,
        EngineEvent::IterationEnd,
    ];

    /// Return the event name used in configuration and logs.
    pub fn event_name(&self) -> &'static str {
        match self {
            EngineEvent::EpochStart => "epoch_start",
            EngineEvent::EpochEnd => "epoch_end",
            EngineEvent::IterationEnd => "iteration_end",
        }
    }
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

impl FromStr for EngineEvent {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        EngineEvent::ALL
            .into_iter()
            .find(|e| e.event_name() == normalized)
            .ok_or_else(|| ExperimentError::engine(format!("unknown engine event '{s}'")))
    }
}

/// What an engine knows at the moment it fires an event.
#[derive(Debug, Clone, PartialEq)]
pub struct HookContext {
    pub event: EngineEvent,
    /// Name of the engine firing the event.
    pub engine: String,
    /// Current epoch, 1-based.
    pub epoch: usize,
    /// Iterations completed by the firing engine so far.
    pub iteration: usize,
    /// Batch loss, set for iteration-end events.
    pub loss: Option<f64>,
}

/// Hook callback. Errors abort the engine's run.
pub type HookFn = Box<dyn FnMut(&HookContext) -> Result<()>>;

/// Guard predicate deciding whether a hook runs for a given firing.
pub type Condition = Box<dyn FnMut(&HookContext) -> bool>;

/// Distinguishes plain callbacks from attached evaluator runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Callback,
    Evaluator,
}

/// A registered hook.
pub struct Hook {
    name: String,
    kind: HookKind,
    callback: HookFn,
    condition: Option<Condition>,
}

impl Hook {
    pub fn new(
        name: impl Into<String>,
        callback: impl FnMut(&HookContext) -> Result<()> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind: HookKind::Callback,
            callback: Box::new(callback),
            condition: None,
        }
    }

    /// A hook that runs `engine`'s full pass when it fires.
    pub fn evaluator(engine: SharedEngine, condition: Option<Condition>) -> Self {
        let name = match engine.try_borrow() {
            Ok(e) => format!("evaluator:{}", e.name()),
            Err(_) => "evaluator".to_string(),
        };
        let callback = move |ctx: &HookContext| {
            let mut engine = engine.try_borrow_mut().map_err(|_| {
                ExperimentError::engine("attached evaluator is already running")
            })?;
            debug!(
                trigger = %ctx.event,
                epoch = ctx.epoch,
                evaluator = engine.name(),
                "Running attached evaluator"
            );
            engine.run()
        };
        Self {
            name,
            kind: HookKind::Evaluator,
            callback: Box::new(callback),
            condition,
        }
    }

    /// Only run this hook when `condition` holds.
    pub fn with_condition(
        mut self,
        condition: impl FnMut(&HookContext) -> bool + 'static,
    ) -> Self {
        self.condition = Some(Box::new(condition));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> HookKind {
        self.kind
    }

    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("conditional", &self.is_conditional())
            .finish()
    }
}

/// Registry of hooks, keyed by event.
#[derive(Debug, Default)]
pub struct HookRegistry {
    hooks: HashMap<EngineEvent, Vec<Hook>>,
}

impl HookRegistry {
    /// Create an empty hook registry.
    pub fn new() -> Self {
        Self {
            hooks: HashMap::new(),
        }
    }

    /// Append a hook to the event's list.
    pub fn register(&mut self, event: EngineEvent, hook: Hook) {
        debug!(event = %event, hook = hook.name(), "Registering hook");
        self.hooks.entry(event).or_default().push(hook);
    }

    /// Hooks registered for `event`, in dispatch order.
    pub fn list(&self, event: EngineEvent) -> &[Hook] {
        self.hooks.get(&event).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Names of the hooks registered for `event`, in dispatch order.
    pub fn names(&self, event: EngineEvent) -> Vec<&str> {
        self.list(event).iter().map(Hook::name).collect()
    }

    /// Get the number of registered hooks.
    pub fn count(&self) -> usize {
        self.hooks.values().map(|v| v.len()).sum()
    }

    /// Check if an evaluator is attached to `event`.
    pub fn has_evaluator(&self, event: EngineEvent) -> bool {
        self.list(event)
            .iter()
            .any(|h| h.kind == HookKind::Evaluator)
    }

    /// Fire every hook registered for `ctx.event`.
    ///
    /// Guarded hooks whose condition fails are skipped. The first hook error
    /// stops dispatch and is returned.
    pub fn fire(&mut self, ctx: &HookContext) -> Result<()> {
        let hooks = match self.hooks.get_mut(&ctx.event) {
            Some(hooks) => hooks,
            None => return Ok(()),
        };

        for hook in hooks.iter_mut() {
            if let Some(condition) = hook.condition.as_mut()
                && !condition(ctx)
            {
                debug!(event = %ctx.event, hook = hook.name.as_str(), "Hook condition not met");
                continue;
            }
            (hook.callback)(ctx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn ctx(event: EngineEvent, epoch: usize) -> HookContext {
        HookContext {
            event,
            engine: "test".into(),
            epoch,
            iteration: 0,
            loss: None,
        }
    }

    #[test]
    fn test_event_names() {
        assert_eq!(EngineEvent::EpochStart.event_name(), "epoch_start");
        assert_eq!(EngineEvent::EpochEnd.event_name(), "epoch_end");
        assert_eq!(EngineEvent::IterationEnd.to_string(), "iteration_end");
    }

    #[test]
    fn test_event_from_str() {
        assert_eq!(
            "epoch-end".parse::<EngineEvent>().unwrap(),
            EngineEvent::EpochEnd
        );
        assert_eq!(
            "ITERATION_END".parse::<EngineEvent>().unwrap(),
            EngineEvent::IterationEnd
        );
        assert!("batch_end".parse::<EngineEvent>().is_err());
    }

    #[test]
    fn test_event_serde_names() {
        let json = serde_json::to_string(&EngineEvent::IterationEnd).unwrap();
        assert_eq!(json, "\"iteration_end\"");
        let restored: EngineEvent = serde_json::from_str("\"epoch_start\"").unwrap();
        assert_eq!(restored, EngineEvent::EpochStart);
    }

    #[test]
    fn test_fire_runs_in_registration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut registry = HookRegistry::new();
        for name in ["first", "second", "third"] {
            let log = log.clone();
            registry.register(
                EngineEvent::EpochEnd,
                Hook::new(name, move |_| {
                    log.borrow_mut().push(name);
                    Ok(())
                }),
            );
        }

        registry.fire(&ctx(EngineEvent::EpochEnd, 1)).unwrap();
        assert_eq!(*log.borrow(), vec!["first", "second", "third"]);
        assert_eq!(registry.names(EngineEvent::EpochEnd), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_fire_other_event_is_noop() {
        let hits = Rc::new(RefCell::new(0));
        let mut registry = HookRegistry::new();
        let h = hits.clone();
        registry.register(
            EngineEvent::EpochStart,
            Hook::new("count", move |_| {
                *h.borrow_mut() += 1;
                Ok(())
            }),
        );
        registry.fire(&ctx(EngineEvent::EpochEnd, 1)).unwrap();
        assert_eq!(*hits.borrow(), 0);
    }

    #[test]
    fn test_condition_gates_hook() {
        let hits = Rc::new(RefCell::new(Vec::new()));
        let mut registry = HookRegistry::new();
        let h = hits.clone();
        registry.register(
            EngineEvent::EpochEnd,
            Hook::new("even", move |c| {
                h.borrow_mut().push(c.epoch);
                Ok(())
            })
            .with_condition(|c| c.epoch % 2 == 0),
        );

        for epoch in 1..=4 {
            registry.fire(&ctx(EngineEvent::EpochEnd, epoch)).unwrap();
        }
        assert_eq!(*hits.borrow(), vec![2, 4]);
        assert!(registry.list(EngineEvent::EpochEnd)[0].is_conditional());
    }

    #[test]
    fn test_error_stops_dispatch() {
        let reached = Rc::new(RefCell::new(false));
        let mut registry = HookRegistry::new();
        registry.register(
            EngineEvent::EpochEnd,
            Hook::new("fails", |_| Err(ExperimentError::engine("boom"))),
        );
        let r = reached.clone();
        registry.register(
            EngineEvent::EpochEnd,
            Hook::new("after", move |_| {
                *r.borrow_mut() = true;
                Ok(())
            }),
        );

        let err = registry.fire(&ctx(EngineEvent::EpochEnd, 1)).unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(!*reached.borrow());
    }

    #[test]
    fn test_registry_counts_and_lists() {
        let mut registry = HookRegistry::new();
        assert_eq!(registry.count(), 0);
        registry.register(EngineEvent::EpochStart, Hook::new("a", |_| Ok(())));
        registry.register(EngineEvent::EpochEnd, Hook::new("b", |_| Ok(())));
        registry.register(EngineEvent::EpochEnd, Hook::new("c", |_| Ok(())));
        assert_eq!(registry.count(), 3);
        assert_eq!(registry.names(EngineEvent::EpochEnd), vec!["b", "c"]);
        assert!(!registry.has_evaluator(EngineEvent::EpochEnd));
        assert!(registry.list(EngineEvent::IterationEnd).is_empty());
    }
}
