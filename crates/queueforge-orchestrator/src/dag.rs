//! Structural validation of a [`WorkflowStepSpec`] list: unique step keys,
//! no self-dependency, every `depends_on` entry names a step in the same
//! list, and the dependency graph has no cycle. Cycle detection is a
//! Kahn's-algorithm topological count rather than a DFS — nodes with no
//! remaining incoming edges are pushed to a ready list, and if fewer nodes
//! are ever popped than exist, a cycle remains.

use std::collections::{HashMap, HashSet};

use queueforge_core::error::QueueError;
use queueforge_core::model::WorkflowStepSpec;

/// Checks `steps` forms a valid DAG: non-empty, unique `step_key`s, no
/// self-dependency, no reference to an unknown step, no cycle.
pub fn validate_steps(steps: &[WorkflowStepSpec]) -> Result<(), QueueError> {
    if steps.is_empty() {
        return Err(QueueError::Validation("workflow must declare at least one step".into()));
    }

    let mut seen_keys = HashSet::new();
    for step in steps {
        if step.step_key.trim().is_empty() {
            return Err(QueueError::Validation("step_key must not be empty".into()));
        }
        if !seen_keys.insert(step.step_key.as_str()) {
            return Err(QueueError::Validation(format!("duplicate step_key: {}", step.step_key)));
        }
    }

    for step in steps {
        for dep in &step.depends_on {
            if dep == &step.step_key {
                return Err(QueueError::Validation(format!(
                    "step {} cannot depend on itself",
                    step.step_key
                )));
            }
            if !seen_keys.contains(dep.as_str()) {
                return Err(QueueError::Validation(format!(
                    "step {} depends on unknown step: {dep}",
                    step.step_key
                )));
            }
        }
    }

    let mut incoming: HashMap<&str, HashSet<&str>> = steps
        .iter()
        .map(|s| (s.step_key.as_str(), s.depends_on.iter().map(String::as_str).collect()))
        .collect();

    let mut ready: Vec<&str> = incoming
        .iter()
        .filter(|(_, deps)| deps.is_empty())
        .map(|(key, _)| *key)
        .collect();

    let mut visited = 0usize;
    while let Some(node) = ready.pop() {
        visited += 1;
        for (key, deps) in incoming.iter_mut() {
            if deps.remove(node) && deps.is_empty() && *key != node {
                ready.push(key);
            }
        }
    }

    if visited != steps.len() {
        return Err(QueueError::Validation("workflow steps contain a dependency cycle".into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn step(key: &str, depends_on: &[&str]) -> WorkflowStepSpec {
        WorkflowStepSpec {
            step_key: key.to_string(),
            definition_key: format!("{key}_definition"),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            payload: Map::new(),
        }
    }

    #[test]
    fn accepts_a_linear_chain() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])];
        assert!(validate_steps(&steps).is_ok());
    }

    #[test]
    fn accepts_a_diamond() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["a"]), step("d", &["b", "c"])];
        assert!(validate_steps(&steps).is_ok());
    }

    #[test]
    fn rejects_duplicate_step_keys() {
        let steps = vec![step("a", &[]), step("a", &[])];
        assert!(validate_steps(&steps).is_err());
    }

    #[test]
    fn rejects_self_dependency() {
        let steps = vec![step("a", &["a"])];
        assert!(validate_steps(&steps).is_err());
    }

    #[test]
    fn rejects_unknown_dependency() {
        let steps = vec![step("a", &["ghost"])];
        assert!(validate_steps(&steps).is_err());
    }

    #[test]
    fn rejects_a_two_node_cycle() {
        let steps = vec![step("a", &["b"]), step("b", &["a"])];
        assert!(validate_steps(&steps).is_err());
    }

    #[test]
    fn rejects_a_longer_cycle() {
        let steps = vec![step("a", &["c"]), step("b", &["a"]), step("c", &["b"])];
        assert!(validate_steps(&steps).is_err());
    }

    #[test]
    fn rejects_an_empty_step_list() {
        assert!(validate_steps(&[]).is_err());
    }
}
