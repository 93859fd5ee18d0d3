//! DAG validation and ordering (pure functions, no store).

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use crate::definition::StepDefinition;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DagError {
    #[error("sequence has no steps")]
    Empty,
    #[error("duplicate step name: {0}")]
    DuplicateStep(String),
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },
    #[error("step '{0}' depends on itself")]
    SelfDependency(String),
    #[error("dependency cycle involving steps: {0:?}")]
    Cycle(Vec<String>),
}

/// Validate that `steps` form a DAG: unique names, known dependencies, no
/// self-edges, acyclic.
pub fn validate_dag(steps: &[StepDefinition]) -> Result<(), DagError> {
    if steps.is_empty() {
        return Err(DagError::Empty);
    }

    let mut names = HashSet::new();
    for step in steps {
        if !names.insert(step.name.as_str()) {
            return Err(DagError::DuplicateStep(step.name.clone()));
        }
    }

    for step in steps {
        for dep in &step.depends_on {
            if dep == &step.name {
                return Err(DagError::SelfDependency(step.name.clone()));
            }
            if !names.contains(dep.as_str()) {
                return Err(DagError::UnknownDependency {
                    step: step.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // Kahn's algorithm; whatever cannot be drained is part of a cycle.
    let order = kahn_order(steps);
    if order.len() < steps.len() {
        let ordered: HashSet<&str> = order.iter().map(String::as_str).collect();
        let mut cyclic: Vec<String> = steps
            .iter()
            .filter(|s| !ordered.contains(s.name.as_str()))
            .map(|s| s.name.clone())
            .collect();
        cyclic.sort();
        return Err(DagError::Cycle(cyclic));
    }

    Ok(())
}

/// A valid topological order of step names. Call only on validated steps;
/// on a cyclic input the cyclic tail is silently missing.
pub fn topo_order(steps: &[StepDefinition]) -> Vec<String> {
    kahn_order(steps)
}

/// Group steps into execution layers: layer N contains steps whose
/// dependencies all live in layers < N. Steps within one layer share no
/// dependency edge and may run concurrently.
pub fn execution_layers(steps: &[StepDefinition]) -> Vec<Vec<String>> {
    let mut placed: HashMap<&str, usize> = HashMap::new();
    let by_name: HashMap<&str, &StepDefinition> =
        steps.iter().map(|s| (s.name.as_str(), s)).collect();

    for name in kahn_order(steps) {
        let step = by_name[name.as_str()];
        let layer = step
            .depends_on
            .iter()
            .filter_map(|d| placed.get(d.as_str()))
            .max()
            .map_or(0, |m| m + 1);
        placed.insert(step.name.as_str(), layer);
    }

    let depth = placed.values().max().map_or(0, |m| m + 1);
    let mut layers = vec![Vec::new(); depth];
    // Preserve definition order within a layer.
    for step in steps {
        if let Some(&layer) = placed.get(step.name.as_str()) {
            layers[layer].push(step.name.clone());
        }
    }
    layers
}

fn kahn_order(steps: &[StepDefinition]) -> Vec<String> {
    let mut in_degree: HashMap<&str, usize> = steps
        .iter()
        .map(|s| (s.name.as_str(), s.depends_on.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps {
        for dep in &step.depends_on {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(step.name.as_str());
        }
    }

    let mut ready: VecDeque<&str> = steps
        .iter()
        .filter(|s| s.depends_on.is_empty())
        .map(|s| s.name.as_str())
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(name) = ready.pop_front() {
        order.push(name.to_string());
        if let Some(deps) = dependents.get(name) {
            for &dependent in deps {
                if let Some(remaining) = in_degree.get_mut(dependent) {
                    *remaining -= 1;
                    if *remaining == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StepDefinition;

    fn step(name: &str, deps: &[&str]) -> StepDefinition {
        StepDefinition::new(name, format!("skill.{name}")).depends_on(deps)
    }

    #[test]
    fn accepts_a_diamond() {
        let steps = vec![
            step("fetch", &[]),
            step("summarize", &["fetch"]),
            step("classify", &["fetch"]),
            step("notify", &["summarize", "classify"]),
        ];
        assert_eq!(validate_dag(&steps), Ok(()));

        let layers = execution_layers(&steps);
        assert_eq!(layers[0], vec!["fetch"]);
        assert_eq!(layers[1], vec!["summarize", "classify"]);
        assert_eq!(layers[2], vec!["notify"]);
    }

    #[test]
    fn rejects_cycles() {
        let steps = vec![step("a", &["b"]), step("b", &["a"])];
        assert_eq!(
            validate_dag(&steps),
            Err(DagError::Cycle(vec!["a".to_string(), "b".to_string()]))
        );
    }

    #[test]
    fn rejects_unknown_and_self_dependencies() {
        assert!(matches!(
            validate_dag(&[step("a", &["ghost"])]),
            Err(DagError::UnknownDependency { .. })
        ));
        assert_eq!(
            validate_dag(&[step("a", &["a"])]),
            Err(DagError::SelfDependency("a".to_string()))
        );
    }

    #[test]
    fn rejects_duplicates_and_empty() {
        assert_eq!(
            validate_dag(&[step("a", &[]), step("a", &[])]),
            Err(DagError::DuplicateStep("a".to_string()))
        );
        assert_eq!(validate_dag(&[]), Err(DagError::Empty));
    }

    #[test]
    fn topo_order_respects_every_edge() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
            step("e", &["d"]),
        ];
        let order = topo_order(&steps);
        let pos = |n: &str| order.iter().position(|s| s == n).unwrap();
        for s in &steps {
            for dep in &s.depends_on {
                assert!(pos(dep) < pos(&s.name), "{dep} must precede {}", s.name);
            }
        }
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: for any forward-edge DAG, topo_order is a valid
            /// topological sort covering every step.
            #[test]
            fn topo_order_is_valid_for_random_dags(
                n in 1usize..12,
                edges in proptest::collection::vec((0usize..12, 0usize..12), 0..30)
            ) {
                // Only keep edges pointing backwards in index order, which
                // guarantees acyclicity.
                let mut steps: Vec<StepDefinition> = (0..n)
                    .map(|i| StepDefinition::new(format!("s{i}"), "skill"))
                    .collect();
                for (from, to) in edges {
                    let (from, to) = (from % n, to % n);
                    if to < from {
                        let dep = format!("s{to}");
                        if !steps[from].depends_on.contains(&dep) {
                            steps[from].depends_on.push(dep);
                        }
                    }
                }

                prop_assert_eq!(validate_dag(&steps), Ok(()));
                let order = topo_order(&steps);
                prop_assert_eq!(order.len(), steps.len());
                let pos = |name: &str| order.iter().position(|s| s == name).unwrap();
                for s in &steps {
                    for dep in &s.depends_on {
                        prop_assert!(pos(dep) < pos(&s.name));
                    }
                }
            }
        }
    }
}
