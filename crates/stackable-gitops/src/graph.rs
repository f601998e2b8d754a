//! The desired-state dependency graph.
//!
//! Nodes are [`Component`]s held by id, edges are id references. Holding
//! edges by id instead of by pointer keeps ownership single and makes cycles
//! a validation problem instead of a memory problem.

use std::collections::BTreeMap;

use snafu::Snafu;

use crate::component::Component;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("component id {id:?} is declared more than once"))]
    DuplicateId { id: String },

    #[snafu(display("component {id:?} depends on unknown component {dependency:?}"))]
    UnresolvedDependency { id: String, dependency: String },

    #[snafu(display("dependency cycle through component {id:?}"))]
    CycleDetected { id: String },
}

/// All components of one reconcile tick, keyed by component id.
#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, Component>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a component. Ids must be unique within the graph.
    pub fn insert(&mut self, component: Component) -> Result<()> {
        let id = component.id();
        if self.nodes.contains_key(&id) {
            return DuplicateIdSnafu { id }.fail();
        }
        self.nodes.insert(id, component);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Component> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Checks that the graph is closed (every referenced dependency exists)
    /// and acyclic. Must pass before execution starts.
    pub fn validate(&self) -> Result<()> {
        for (id, component) in &self.nodes {
            for dependency in component.dependencies() {
                if !self.nodes.contains_key(dependency) {
                    return UnresolvedDependencySnafu {
                        id: id.clone(),
                        dependency: dependency.clone(),
                    }
                    .fail();
                }
            }
        }

        // Iterative depth-first walk with three colors: unvisited, on the
        // current path, finished.
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            OnPath,
            Done,
        }

        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();

        for root in self.nodes.keys() {
            if marks.contains_key(root.as_str()) {
                continue;
            }

            // (id, finished) pairs; the second visit of an id closes it.
            let mut stack: Vec<(&str, bool)> = vec![(root.as_str(), false)];
            while let Some((id, finished)) = stack.pop() {
                if finished {
                    marks.insert(id, Mark::Done);
                    continue;
                }
                match marks.get(id) {
                    Some(Mark::OnPath) => return CycleDetectedSnafu { id }.fail(),
                    Some(Mark::Done) => continue,
                    None => {}
                }
                marks.insert(id, Mark::OnPath);
                stack.push((id, true));

                let component = &self.nodes[id];
                for dependency in component.dependencies() {
                    match marks.get(dependency.as_str()) {
                        Some(Mark::Done) => {}
                        Some(Mark::OnPath) => {
                            return CycleDetectedSnafu { id: dependency }.fail();
                        }
                        None => stack.push((dependency.as_str(), false)),
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use kube::core::DynamicObject;

    use super::*;
    use crate::{component::ManifestComponent, manifest::Manifest};

    fn config_map(name: &str, dependencies: &[&str]) -> Component {
        let object: DynamicObject = serde_yaml::from_str(&format!(
            "
            apiVersion: v1
            kind: ConfigMap
            metadata:
              name: {name}
              namespace: default
            "
        ))
        .unwrap();

        Component::Manifest(
            ManifestComponent::new(
                Manifest::new(object),
                dependencies
                    .iter()
                    .map(|dependency| format!("{dependency}_default_ConfigMap__v1"))
                    .collect(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut graph = DependencyGraph::new();
        graph.insert(config_map("a", &[])).unwrap();
        assert!(matches!(
            graph.insert(config_map("a", &[])),
            Err(Error::DuplicateId { .. })
        ));
    }

    #[test]
    fn unresolved_dependency_fails_validation() {
        let mut graph = DependencyGraph::new();
        graph.insert(config_map("a", &["missing"])).unwrap();
        assert!(matches!(
            graph.validate(),
            Err(Error::UnresolvedDependency { .. })
        ));
    }

    #[test]
    fn cycle_fails_validation() {
        let mut graph = DependencyGraph::new();
        graph.insert(config_map("a", &["b"])).unwrap();
        graph.insert(config_map("b", &["c"])).unwrap();
        graph.insert(config_map("c", &["a"])).unwrap();
        assert!(matches!(graph.validate(), Err(Error::CycleDetected { .. })));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let mut graph = DependencyGraph::new();
        graph.insert(config_map("a", &["a"])).unwrap();
        assert!(matches!(graph.validate(), Err(Error::CycleDetected { .. })));
    }

    #[test]
    fn chain_validates() {
        let mut graph = DependencyGraph::new();
        graph.insert(config_map("a", &[])).unwrap();
        graph.insert(config_map("b", &["a"])).unwrap();
        graph.insert(config_map("c", &["a", "b"])).unwrap();
        graph.validate().unwrap();
        assert_eq!(graph.len(), 3);
        assert!(graph.contains("a_default_ConfigMap__v1"));
    }
}
