//! Dependency-ordered component loader.
//!
//! Adapter modules (node launchers, trackers, log collectors) register
//! themselves as named components with partial-order constraints ("not
//! before X"). [`ComponentLoader::load`] computes a valid activation
//! order with Kahn's algorithm and reports the actual cycle when no such
//! order exists.
//!
//! Ordering policy:
//! - an unregistered predecessor never blocks;
//! - a predecessor whose activation predicate is false against the current
//!   [`LoadContext`] never blocks (it is marked activated-without-running);
//! - everything else must activate first.

use std::collections::{BTreeMap, HashMap, VecDeque};

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::error::CoreError;

/// Run-time configuration handed to activation predicates and hooks.
#[derive(Debug, Clone, Default)]
pub struct LoadContext {
    values: BTreeMap<String, String>,
}

impl LoadContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a configuration value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Looks up a configuration value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// True if `key` is set to a truthy value (`1`, `true`, `yes`).
    pub fn is_enabled(&self, key: &str) -> bool {
        matches!(self.get(key), Some("1" | "true" | "yes"))
    }
}

/// Activation or finalization hook of a component.
pub type HookFn = Box<dyn FnMut(&mut LoadContext) -> Result<(), CoreError>>;

/// A named, conditionally-activatable component with ordering constraints.
pub struct ComponentDescriptor {
    name: String,
    after: Vec<String>,
    enabled: Box<dyn Fn(&LoadContext) -> bool>,
    on_activate: Option<HookFn>,
    on_finalize: Option<HookFn>,
}

impl ComponentDescriptor {
    /// Creates a descriptor that is always enabled and has no constraints.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            after: Vec::new(),
            enabled: Box::new(|_| true),
            on_activate: None,
            on_finalize: None,
        }
    }

    /// Adds a predecessor this component must not activate before.
    pub fn after(mut self, name: impl Into<String>) -> Self {
        self.after.push(name.into());
        self
    }

    /// Sets the activation predicate, evaluated against the context at
    /// load time. A false predicate skips the hooks but still satisfies
    /// dependents.
    pub fn enabled_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&LoadContext) -> bool + 'static,
    {
        self.enabled = Box::new(predicate);
        self
    }

    /// Sets the activation hook, run when the component's turn comes.
    pub fn on_activate<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&mut LoadContext) -> Result<(), CoreError> + 'static,
    {
        self.on_activate = Some(Box::new(hook));
        self
    }

    /// Sets the finalization hook, run immediately after activation.
    pub fn on_finalize<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&mut LoadContext) -> Result<(), CoreError> + 'static,
    {
        self.on_finalize = Some(Box::new(hook));
        self
    }

    /// The component's name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

struct Slot {
    descriptor: ComponentDescriptor,
    activated: bool,
}

/// Registry and activation engine for components.
#[derive(Default)]
pub struct ComponentLoader {
    components: IndexMap<String, Slot>,
}

impl ComponentLoader {
    /// Creates an empty loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a component by name.
    ///
    /// Replacing a component that already activated is rejected: the call
    /// is logged and returns false.
    pub fn set_component(&mut self, descriptor: ComponentDescriptor) -> bool {
        let name = descriptor.name.clone();
        if let Some(slot) = self.components.get(&name) {
            if slot.activated {
                warn!("Refusing to replace already-activated component '{name}'");
                return false;
            }
        }
        self.components.insert(
            name,
            Slot {
                descriptor,
                activated: false,
            },
        );
        true
    }

    /// True if the named component has been activated (with or without
    /// running its hooks).
    pub fn is_activated(&self, name: &str) -> bool {
        self.components.get(name).is_some_and(|s| s.activated)
    }

    /// Activates every pending component in a dependency-respecting order.
    ///
    /// Returns the names whose hooks actually ran, in activation order.
    /// Components whose predicate is false are marked activated without
    /// running, so dependents are released. A dependency cycle aborts the
    /// whole load with [`CoreError::Cycle`] naming the cycle members.
    pub fn load(&mut self, ctx: &mut LoadContext) -> Result<Vec<String>, CoreError> {
        // Evaluate predicates once, up front; disabled components satisfy
        // their dependents immediately.
        let mut enabled: Vec<String> = Vec::new();
        for (name, slot) in &mut self.components {
            if slot.activated {
                continue;
            }
            if (slot.descriptor.enabled)(ctx) {
                enabled.push(name.clone());
            } else {
                debug!("Component '{name}' disabled by predicate, activating without running");
                slot.activated = true;
            }
        }

        // Kahn's algorithm over the enabled pending components. Only a
        // predecessor that is itself enabled and pending blocks; anything
        // unregistered, already activated, or disabled contributes no edge.
        let mut indegree: HashMap<&str, usize> =
            enabled.iter().map(|n| (n.as_str(), 0)).collect();
        let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
        for name in &enabled {
            for pred in &self.components[name.as_str()].descriptor.after {
                if indegree.contains_key(pred.as_str()) {
                    successors
                        .entry(pred.as_str())
                        .or_default()
                        .push(name.as_str());
                    *indegree.get_mut(name.as_str()).unwrap() += 1;
                }
            }
        }

        // Ready queue seeded in registration order keeps runs with equal
        // constraints deterministic.
        let mut queue: VecDeque<&str> = enabled
            .iter()
            .map(String::as_str)
            .filter(|n| indegree[n] == 0)
            .collect();
        let mut order: Vec<String> = Vec::new();
        while let Some(name) = queue.pop_front() {
            order.push(name.to_string());
            for &succ in successors.get(name).into_iter().flatten() {
                let deg = indegree.get_mut(succ).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(succ);
                }
            }
        }

        if order.len() != enabled.len() {
            let cycle = self.cycle_members(&enabled, &order);
            return Err(CoreError::Cycle { names: cycle });
        }

        for name in &order {
            let slot = self.components.get_mut(name.as_str()).unwrap();
            debug!("Activating component '{name}'");
            if let Some(hook) = slot.descriptor.on_activate.as_mut() {
                hook(ctx).map_err(|e| CoreError::hook(name.clone(), "activate", e.to_string()))?;
            }
            let slot = self.components.get_mut(name.as_str()).unwrap();
            if let Some(hook) = slot.descriptor.on_finalize.as_mut() {
                hook(ctx).map_err(|e| CoreError::hook(name.clone(), "finalize", e.to_string()))?;
            }
            self.components.get_mut(name.as_str()).unwrap().activated = true;
        }

        Ok(order)
    }

    /// Narrows the leftover of a failed topological sort to the components
    /// actually on a cycle, trimming dependents that are merely downstream
    /// of one.
    fn cycle_members(&self, enabled: &[String], ordered: &[String]) -> Vec<String> {
        let mut remaining: Vec<&str> = enabled
            .iter()
            .map(String::as_str)
            .filter(|n| !ordered.iter().any(|o| o == n))
            .collect();

        loop {
            let before = remaining.len();
            // A remaining component with no remaining dependents is not
            // part of a cycle, only stuck behind one.
            let trimmed: Vec<&str> = remaining
                .iter()
                .copied()
                .filter(|name| {
                    remaining.iter().any(|other| {
                        *other != *name
                            && self.components[*other]
                                .descriptor
                                .after
                                .iter()
                                .any(|p| p.as_str() == *name)
                    })
                })
                .collect();
            remaining = trimmed;
            if remaining.len() == before {
                break;
            }
        }

        remaining.iter().map(|n| n.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn tracked(name: &str, log: Arc<std::sync::Mutex<Vec<String>>>) -> ComponentDescriptor {
        let tag = name.to_string();
        ComponentDescriptor::new(name).on_activate(move |_ctx| {
            log.lock().unwrap().push(tag.clone());
            Ok(())
        })
    }

    #[test]
    fn test_registration_order_does_not_matter() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut loader = ComponentLoader::new();
        // Registered C, B, A; dependency chain A <- B <- C.
        loader.set_component(tracked("C", Arc::clone(&log)).after("B"));
        loader.set_component(tracked("B", Arc::clone(&log)).after("A"));
        loader.set_component(tracked("A", Arc::clone(&log)));

        let order = loader.load(&mut LoadContext::new()).unwrap();
        assert_eq!(order, vec!["A", "B", "C"]);
        assert_eq!(*log.lock().unwrap(), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_mutual_dependency_is_a_cycle() {
        let mut loader = ComponentLoader::new();
        loader.set_component(ComponentDescriptor::new("A").after("B"));
        loader.set_component(ComponentDescriptor::new("B").after("A"));
        loader.set_component(ComponentDescriptor::new("C").after("A"));

        match loader.load(&mut LoadContext::new()) {
            Err(CoreError::Cycle { names }) => {
                // C is stuck behind the cycle but not part of it.
                assert_eq!(names, vec!["A", "B"]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_unregistered_dependency_never_blocks() {
        let mut loader = ComponentLoader::new();
        loader.set_component(ComponentDescriptor::new("A").after("ghost"));

        let order = loader.load(&mut LoadContext::new()).unwrap();
        assert_eq!(order, vec!["A"]);
    }

    #[test]
    fn test_disabled_dependency_never_blocks() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);

        let mut loader = ComponentLoader::new();
        loader.set_component(
            ComponentDescriptor::new("tracker")
                .enabled_if(|ctx| ctx.is_enabled("with_tracker"))
                .on_activate(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
        );
        loader.set_component(ComponentDescriptor::new("seeder").after("tracker"));

        // with_tracker unset: tracker's hooks must not run, seeder loads.
        let order = loader.load(&mut LoadContext::new()).unwrap();
        assert_eq!(order, vec!["seeder"]);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(loader.is_activated("tracker"));
    }

    #[test]
    fn test_activate_then_finalize() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let a = Arc::clone(&log);
        let f = Arc::clone(&log);

        let mut loader = ComponentLoader::new();
        loader.set_component(
            ComponentDescriptor::new("node")
                .on_activate(move |_| {
                    a.lock().unwrap().push("activate");
                    Ok(())
                })
                .on_finalize(move |_| {
                    f.lock().unwrap().push("finalize");
                    Ok(())
                }),
        );

        loader.load(&mut LoadContext::new()).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["activate", "finalize"]);
    }

    #[test]
    fn test_replacing_activated_component_rejected() {
        let mut loader = ComponentLoader::new();
        loader.set_component(ComponentDescriptor::new("A"));
        loader.load(&mut LoadContext::new()).unwrap();

        assert!(!loader.set_component(ComponentDescriptor::new("A")));
        // Replacing a pending component is fine.
        loader.set_component(ComponentDescriptor::new("B"));
        assert!(loader.set_component(ComponentDescriptor::new("B")));
    }

    #[test]
    fn test_hook_failure_aborts_load() {
        let mut loader = ComponentLoader::new();
        loader.set_component(
            ComponentDescriptor::new("broken")
                .on_activate(|_| Err(CoreError::metadata("boom"))),
        );
        loader.set_component(ComponentDescriptor::new("next").after("broken"));

        assert!(matches!(
            loader.load(&mut LoadContext::new()),
            Err(CoreError::Hook { phase: "activate", .. })
        ));
    }

    #[test]
    fn test_load_is_incremental() {
        let mut loader = ComponentLoader::new();
        loader.set_component(ComponentDescriptor::new("A"));
        assert_eq!(loader.load(&mut LoadContext::new()).unwrap(), vec!["A"]);

        loader.set_component(ComponentDescriptor::new("B").after("A"));
        assert_eq!(loader.load(&mut LoadContext::new()).unwrap(), vec!["B"]);
    }
}
