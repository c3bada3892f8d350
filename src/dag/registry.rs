//! The phase registry and its dependency-ordered view.
//!
//! Phases may name dependencies that are registered later; the graph is only
//! validated when an execution order is requested, before any phase runs.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use super::PhaseDefinition;
use crate::errors::RegistryError;
use crate::operation::Operation;

/// Index into the registration list.
type PhaseIndex = usize;

#[derive(Debug, Default, Clone)]
pub struct PhaseRegistry {
    /// Phases in registration order
    phases: Vec<PhaseDefinition>,
    index_map: HashMap<String, PhaseIndex>,
}

impl PhaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a phase with its dependencies and operation.
    pub fn register<I, S>(
        &mut self,
        name: impl Into<String>,
        depends_on: I,
        operation: Arc<dyn Operation>,
    ) -> Result<(), RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add(PhaseDefinition::new(name, depends_on, operation))
    }

    /// Register a fully configured phase definition.
    pub fn add(&mut self, phase: PhaseDefinition) -> Result<(), RegistryError> {
        if self.index_map.contains_key(&phase.name) {
            return Err(RegistryError::DuplicatePhase(phase.name));
        }
        self.index_map.insert(phase.name.clone(), self.phases.len());
        self.phases.push(phase);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&PhaseDefinition> {
        self.index_map.get(name).and_then(|&i| self.phases.get(i))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_map.contains_key(name)
    }

    /// Phases in registration order.
    pub fn phases(&self) -> &[PhaseDefinition] {
        &self.phases
    }

    /// Dependency edges as indices: `reverse[i]` lists what phase `i` depends on.
    fn reverse_edges(&self) -> Result<Vec<Vec<PhaseIndex>>, RegistryError> {
        self.phases
            .iter()
            .map(|phase| {
                phase
                    .depends_on
                    .iter()
                    .map(|dep| {
                        self.index_map.get(dep).copied().ok_or_else(|| {
                            RegistryError::UnknownDependency {
                                phase: phase.name.clone(),
                                dependency: dep.clone(),
                            }
                        })
                    })
                    .collect()
            })
            .collect()
    }

    /// Topological order of all phases.
    ///
    /// Uses Kahn's algorithm, always taking the earliest-registered ready phase,
    /// so phases with no dependency relationship run in registration order.
    /// Fails on unknown dependencies and cycles.
    pub fn execution_order(&self) -> Result<Vec<&PhaseDefinition>, RegistryError> {
        let reverse = self.reverse_edges()?;

        let mut forward: Vec<Vec<PhaseIndex>> = vec![Vec::new(); self.phases.len()];
        for (to, deps) in reverse.iter().enumerate() {
            for &from in deps {
                forward[from].push(to);
            }
        }

        let mut in_degree: Vec<usize> = reverse.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<PhaseIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.phases.len());
        while let Some(node) = ready.pop_first() {
            order.push(&self.phases[node]);
            for &dependent in &forward[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != self.phases.len() {
            let cycle_phases = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| self.phases[i].name.clone())
                .collect();
            return Err(RegistryError::Cycle(cycle_phases));
        }

        Ok(order)
    }

    /// `target` plus everything it transitively depends on.
    pub fn dependency_closure(&self, target: &str) -> Result<HashSet<String>, RegistryError> {
        if !self.contains(target) {
            return Err(RegistryError::UnknownPhase(target.to_string()));
        }
        let mut closure = HashSet::new();
        let mut stack = vec![target.to_string()];
        while let Some(name) = stack.pop() {
            if !closure.insert(name.clone()) {
                continue;
            }
            let phase = self
                .get(&name)
                .ok_or_else(|| RegistryError::UnknownPhase(name.clone()))?;
            for dep in &phase.depends_on {
                if !self.contains(dep) {
                    return Err(RegistryError::UnknownDependency {
                        phase: name.clone(),
                        dependency: dep.clone(),
                    });
                }
                stack.push(dep.clone());
            }
        }
        Ok(closure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::NoopOperation;

    fn noop() -> Arc<dyn Operation> {
        Arc::new(NoopOperation)
    }

    fn registry(phases: &[(&str, &[&str])]) -> PhaseRegistry {
        let mut registry = PhaseRegistry::new();
        for (name, deps) in phases {
            registry.register(*name, deps.iter().copied(), noop()).unwrap();
        }
        registry
    }

    fn names(order: Vec<&PhaseDefinition>) -> Vec<&str> {
        order.into_iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = PhaseRegistry::new();
        registry.register("init", Vec::<String>::new(), noop()).unwrap();
        let err = registry.register("init", Vec::<String>::new(), noop()).unwrap_err();
        assert_eq!(err, RegistryError::DuplicatePhase("init".into()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_linear_order() {
        let registry = registry(&[
            ("init", &[]),
            ("infra", &["init"]),
            ("services", &["infra"]),
            ("validate", &["services"]),
        ]);
        assert_eq!(
            names(registry.execution_order().unwrap()),
            vec!["init", "infra", "services", "validate"]
        );
    }

    #[test]
    fn test_forward_references_allowed() {
        let registry = registry(&[("services", &["infra"]), ("infra", &[])]);
        assert_eq!(
            names(registry.execution_order().unwrap()),
            vec!["infra", "services"]
        );
    }

    #[test]
    fn test_independent_phases_keep_registration_order() {
        let registry = registry(&[
            ("c", &[]),
            ("a", &[]),
            ("b", &["c"]),
            ("d", &["a"]),
        ]);
        // c, a ready at start; b becomes ready after c but a was registered first
        assert_eq!(
            names(registry.execution_order().unwrap()),
            vec!["c", "a", "b", "d"]
        );
    }

    #[test]
    fn test_diamond() {
        let registry = registry(&[
            ("root", &[]),
            ("left", &["root"]),
            ("right", &["root"]),
            ("join", &["left", "right"]),
        ]);
        assert_eq!(
            names(registry.execution_order().unwrap()),
            vec!["root", "left", "right", "join"]
        );
    }

    #[test]
    fn test_mutual_dependency_is_cycle() {
        let registry = registry(&[("a", &["b"]), ("b", &["a"])]);
        match registry.execution_order() {
            Err(RegistryError::Cycle(phases)) => assert_eq!(phases, vec!["a", "b"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let registry = registry(&[("a", &["a"])]);
        assert!(matches!(
            registry.execution_order(),
            Err(RegistryError::Cycle(_))
        ));
    }

    #[test]
    fn test_cycle_reports_only_cycle_members() {
        let registry = registry(&[
            ("ok", &[]),
            ("x", &["ok", "z"]),
            ("y", &["x"]),
            ("z", &["y"]),
        ]);
        match registry.execution_order() {
            Err(RegistryError::Cycle(phases)) => assert_eq!(phases, vec!["x", "y", "z"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_dependency() {
        let registry = registry(&[("a", &["nonexistent"])]);
        let err = registry.execution_order().unwrap_err();
        assert!(err.to_string().contains("nonexistent"));
    }

    #[test]
    fn test_empty_registry() {
        let registry = PhaseRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.execution_order().unwrap().is_empty());
    }

    #[test]
    fn test_dependency_closure() {
        let registry = registry(&[
            ("init", &[]),
            ("network", &["init"]),
            ("iam", &["init"]),
            ("services", &["network"]),
        ]);
        let closure = registry.dependency_closure("services").unwrap();
        let mut closure: Vec<_> = closure.into_iter().collect();
        closure.sort();
        assert_eq!(closure, vec!["init", "network", "services"]);
    }

    #[test]
    fn test_dependency_closure_unknown_target() {
        let registry = registry(&[("init", &[])]);
        assert_eq!(
            registry.dependency_closure("nope").unwrap_err(),
            RegistryError::UnknownPhase("nope".into())
        );
    }
}
