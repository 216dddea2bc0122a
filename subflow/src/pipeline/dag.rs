//! Dependency graph and topological ordering.
//!
//! Uses Kahn's algorithm. Among stages that become ready at the same time the
//! one registered first runs first, so the order is deterministic.

use super::StageDefinition;
use crate::errors::ConfigurationError;
use std::collections::{BTreeSet, HashMap};

/// A validated stage dependency graph.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Execution order (topologically sorted).
    order: Vec<String>,
    /// Direct dependencies per stage.
    dependencies: HashMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Builds the graph from definitions in registration order.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty pipeline, duplicate names, unknown or self
    /// dependencies, and cycles.
    pub fn build(definitions: &[StageDefinition]) -> Result<Self, ConfigurationError> {
        if definitions.is_empty() {
            return Err(ConfigurationError::EmptyPipeline);
        }

        let mut index: HashMap<&str, usize> = HashMap::with_capacity(definitions.len());
        for (i, def) in definitions.iter().enumerate() {
            def.validate()?;
            if index.insert(def.name.as_str(), i).is_some() {
                return Err(ConfigurationError::DuplicateStage(def.name.clone()));
            }
        }

        for def in definitions {
            if let Some(dep) = def.dependencies.iter().find(|d| !index.contains_key(d.as_str())) {
                return Err(ConfigurationError::UnknownDependency {
                    stage: def.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        let dependencies: HashMap<String, BTreeSet<String>> = definitions
            .iter()
            .map(|d| (d.name.clone(), d.dependencies.clone()))
            .collect();
        let order = topological_sort(definitions, &index)?;

        Ok(Self {
            order,
            dependencies,
        })
    }

    /// Returns the execution order.
    #[must_use]
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Returns the direct dependencies of a stage.
    #[must_use]
    pub fn dependencies_of(&self, stage: &str) -> Option<&BTreeSet<String>> {
        self.dependencies.get(stage)
    }
}

fn topological_sort(
    definitions: &[StageDefinition],
    index: &HashMap<&str, usize>,
) -> Result<Vec<String>, ConfigurationError> {
    let n = definitions.len();
    let mut in_degree: Vec<usize> = definitions.iter().map(|d| d.dependencies.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, def) in definitions.iter().enumerate() {
        for dep in &def.dependencies {
            dependents[index[dep.as_str()]].push(i);
        }
    }

    // Ordered by registration index.
    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(i) = ready.pop_first() {
        order.push(definitions[i].name.clone());
        for &j in &dependents[i] {
            in_degree[j] -= 1;
            if in_degree[j] == 0 {
                ready.insert(j);
            }
        }
    }

    if order.len() < n {
        let stages = (0..n)
            .filter(|&i| in_degree[i] > 0)
            .map(|i| definitions[i].name.clone())
            .collect();
        return Err(ConfigurationError::CycleDetected { stages });
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::NoOpStage;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn def(name: &str, deps: &[&str]) -> StageDefinition {
        StageDefinition::new(name, Arc::new(NoOpStage::new(name)))
            .with_dependencies(deps.iter().copied())
    }

    #[test]
    fn test_linear_order() {
        let graph = DependencyGraph::build(&[
            def("imaging", &["calibration_apply"]),
            def("conversion", &[]),
            def("calibration_apply", &["calibration_solve"]),
            def("calibration_solve", &["conversion"]),
        ])
        .unwrap();

        assert_eq!(
            graph.order(),
            &["conversion", "calibration_solve", "calibration_apply", "imaging"]
        );
    }

    #[test]
    fn test_ties_follow_registration_order() {
        let graph = DependencyGraph::build(&[
            def("root", &[]),
            def("b", &["root"]),
            def("a", &["root"]),
            def("c", &["a", "b"]),
        ])
        .unwrap();
        assert_eq!(graph.order(), &["root", "b", "a", "c"]);
    }

    #[test]
    fn test_cycle_detected() {
        let err = DependencyGraph::build(&[
            def("start", &[]),
            def("a", &["c", "start"]),
            def("b", &["a"]),
            def("c", &["b"]),
        ])
        .unwrap_err();

        assert_eq!(
            err,
            ConfigurationError::CycleDetected {
                stages: vec!["a".into(), "b".into(), "c".into()]
            }
        );
    }

    #[test]
    fn test_unknown_dependency() {
        let err = DependencyGraph::build(&[def("imaging", &["conversion"])]).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::UnknownDependency {
                stage: "imaging".into(),
                dependency: "conversion".into()
            }
        );
    }

    #[test]
    fn test_duplicate_and_empty() {
        assert_eq!(
            DependencyGraph::build(&[def("a", &[]), def("a", &[])]).unwrap_err(),
            ConfigurationError::DuplicateStage("a".into())
        );
        assert_eq!(
            DependencyGraph::build(&[]).unwrap_err(),
            ConfigurationError::EmptyPipeline
        );
    }

    #[test]
    fn test_direct_dependencies() {
        let graph = DependencyGraph::build(&[
            def("a", &[]),
            def("b", &["a"]),
            def("c", &["b"]),
        ])
        .unwrap();

        let direct: Vec<_> = graph.dependencies_of("c").unwrap().iter().cloned().collect();
        assert_eq!(direct, vec!["b".to_string()]);
        assert!(graph.dependencies_of("a").unwrap().is_empty());
        assert!(graph.dependencies_of("missing").is_none());
    }
}
