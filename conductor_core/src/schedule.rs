//! The scenario runner: action registry and per-peer schedule.
//!
//! The runner owns the parsed timeline and a registry mapping action names
//! to callables. It is synchronous by design; the async half (sleeping
//! until each event's deadline) lives with the sync client, which calls
//! [`ScenarioRunner::fire`] when a deadline arrives. Keeping dispatch on
//! one task is what guarantees same-instant events run in file order.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info};

use crate::metadata::PeerId;
use crate::scenario::ScenarioEvent;

/// A registered action target. Invoked with the event that triggered it;
/// must not block — long-running work spawns its own task.
pub type ActionFn = Arc<dyn Fn(&ScenarioEvent) + Send + Sync>;

/// Registry of action callables plus the events to dispatch to them.
///
/// Registering the same name more than once fans out: every target runs,
/// in registration order. Firing an action nobody registered is logged
/// and ignored, never an error.
#[derive(Default)]
pub struct ScenarioRunner {
    actions: IndexMap<String, Vec<ActionFn>>,
    events: Vec<ScenarioEvent>,
    stop: Arc<AtomicBool>,
}

impl ScenarioRunner {
    /// Creates an empty runner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callable under an action name. May be called multiple
    /// times per name; all targets are invoked on fire.
    pub fn register<F>(&mut self, name: impl Into<String>, target: F)
    where
        F: Fn(&ScenarioEvent) + Send + Sync + 'static,
    {
        self.actions
            .entry(name.into())
            .or_default()
            .push(Arc::new(target));
    }

    /// Handle to the runner's stop flag. An action that wants to end the
    /// run early (a `stop` builtin, a fatal-condition handler) stores a
    /// clone and sets it; the driver checks the flag between events and
    /// returns once it is raised, letting destructors run normally.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Whether an action has requested that no further events fire.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(AtomicOrdering::SeqCst)
    }

    /// Appends parsed events to the timeline, preserving file order.
    pub fn add_events(&mut self, events: impl IntoIterator<Item = ScenarioEvent>) {
        self.events.extend(events);
    }

    /// All events currently on the timeline, in file order.
    pub fn events(&self) -> &[ScenarioEvent] {
        &self.events
    }

    /// Returns the events that apply to `peer`, stably sorted by offset.
    ///
    /// The sort is stable, so events sharing an offset keep their file
    /// order; the driver dispatches them back-to-back in that order.
    pub fn schedule(&self, peer: PeerId) -> Vec<ScenarioEvent> {
        let mut matching: Vec<ScenarioEvent> = self
            .events
            .iter()
            .filter(|e| e.filter.matches(peer))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.offset.partial_cmp(&b.offset).unwrap_or(Ordering::Equal));
        debug!(
            peer,
            total = self.events.len(),
            matching = matching.len(),
            "Built peer schedule"
        );
        matching
    }

    /// Invokes every target registered under the event's action name, in
    /// registration order. An unregistered action is a logged no-op.
    pub fn fire(&self, event: &ScenarioEvent) {
        match self.actions.get(&event.action) {
            Some(targets) => {
                for target in targets {
                    target(event);
                }
            }
            None => {
                info!(
                    "{}:{}: no callable registered for action '{}'",
                    event.file, event.line, event.action
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::ScenarioParser;
    use std::sync::Mutex;

    fn parse(text: &str) -> Vec<ScenarioEvent> {
        ScenarioParser::new().parse_str(text, "test")
    }

    #[test]
    fn test_fan_out_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut runner = ScenarioRunner::new();

        let sink = Arc::clone(&calls);
        runner.register("ping", move |_e| sink.lock().unwrap().push("first"));
        let sink = Arc::clone(&calls);
        runner.register("ping", move |_e| sink.lock().unwrap().push("second"));

        let events = parse("0:01 ping");
        runner.fire(&events[0]);

        assert_eq!(*calls.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_unregistered_action_is_noop() {
        let runner = ScenarioRunner::new();
        let events = parse("0:01 nobody_home");
        // Must not panic or error.
        runner.fire(&events[0]);
    }

    #[test]
    fn test_schedule_filters_by_peer() {
        let mut runner = ScenarioRunner::new();
        runner.add_events(parse("0:05 foo a b named=c {1,2}"));

        assert!(runner.schedule(3).is_empty());

        let for_peer_1 = runner.schedule(1);
        assert_eq!(for_peer_1.len(), 1);
        assert_eq!(for_peer_1[0].args, vec!["a", "b"]);
        assert_eq!(for_peer_1[0].kwargs["named"], "c");
        assert_eq!(for_peer_1[0].offset, 5.0);
        assert_eq!(runner.schedule(2).len(), 1);
    }

    #[test]
    fn test_stop_flag_visible_through_handle() {
        let mut runner = ScenarioRunner::new();
        assert!(!runner.stop_requested());

        let flag = runner.stop_flag();
        runner.register("halt", move |_e| {
            flag.store(true, std::sync::atomic::Ordering::SeqCst)
        });

        let events = parse("0:01 halt");
        runner.fire(&events[0]);
        assert!(runner.stop_requested());
    }

    #[test]
    fn test_schedule_stable_on_equal_offsets() {
        let mut runner = ScenarioRunner::new();
        runner.add_events(parse("0:10 late\n0:05 a\n0:05 b\n0:05 c\n0:01 early\n"));

        let order: Vec<_> = runner
            .schedule(1)
            .iter()
            .map(|e| e.action.clone())
            .collect();
        assert_eq!(order, vec!["early", "a", "b", "c", "late"]);
    }
}
