//! Dependency resolver: topologically orders step definitions into
//! execution phases, arena+index style (names interned once, edges stored
//! as integer index pairs) per the graph-representation design note.

use std::collections::{HashMap, HashSet};

use crate::errors::{CircularDependencyError, DependencyError};
use crate::step::StepDefinition;

pub type StepIndex = usize;

/// An arena-indexed view over a set of step definitions: names are stored
/// once, dependency edges are integer index pairs.
#[derive(Debug, Clone)]
pub struct StepGraph {
    steps: Vec<StepDefinition>,
    index_of: HashMap<String, StepIndex>,
    /// forward_edges[i] = indices of steps that i depends on (prerequisites)
    forward_edges: Vec<Vec<StepIndex>>,
    /// reverse_edges[i] = indices of steps that depend on i
    reverse_edges: Vec<Vec<StepIndex>>,
}

impl StepGraph {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, index: StepIndex) -> &StepDefinition {
        &self.steps[index]
    }

    pub fn index_of(&self, name: &str) -> Option<StepIndex> {
        self.index_of.get(name).copied()
    }

    pub fn dependencies(&self, index: StepIndex) -> &[StepIndex] {
        &self.forward_edges[index]
    }

    pub fn dependents(&self, index: StepIndex) -> &[StepIndex] {
        &self.reverse_edges[index]
    }

    pub fn names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name.clone()).collect()
    }
}

/// Builds a `StepGraph` from a flat list of step definitions, validating
/// that every dependency reference resolves and that the resulting graph
/// contains no cycle.
pub struct GraphBuilder {
    steps: Vec<StepDefinition>,
}

impl GraphBuilder {
    pub fn new(steps: Vec<StepDefinition>) -> Self {
        Self { steps }
    }

    pub fn build(self) -> Result<StepGraph, DependencyError> {
        let mut index_of = HashMap::with_capacity(self.steps.len());
        for (i, step) in self.steps.iter().enumerate() {
            index_of.insert(step.name.clone(), i);
        }

        let mut forward_edges = vec![Vec::new(); self.steps.len()];
        let mut reverse_edges = vec![Vec::new(); self.steps.len()];

        for (i, step) in self.steps.iter().enumerate() {
            for dep_name in &step.dependencies {
                let dep_index = index_of.get(dep_name).copied().ok_or_else(|| DependencyError::MissingDependency {
                    step: step.name.clone(),
                    missing: dep_name.clone(),
                })?;
                forward_edges[i].push(dep_index);
                reverse_edges[dep_index].push(i);
            }
        }

        Ok(StepGraph {
            steps: self.steps,
            index_of,
            forward_edges,
            reverse_edges,
        })
    }
}

/// Topologically layers a step graph into execution phases using Kahn-like
/// layering: phase 0 is every step with no unsatisfied prerequisite in the
/// remaining set; remove them and repeat.
pub fn resolve_execution_order(graph: &StepGraph) -> Result<Vec<Vec<String>>, CircularDependencyError> {
    let n = graph.len();
    let mut remaining: HashSet<StepIndex> = (0..n).collect();
    let mut phases = Vec::new();

    while !remaining.is_empty() {
        let mut ready: Vec<StepIndex> = remaining
            .iter()
            .copied()
            .filter(|&i| graph.dependencies(i).iter().all(|d| !remaining.contains(d)))
            .collect();

        if ready.is_empty() {
            let mut residual: Vec<String> = remaining.iter().map(|&i| graph.step(i).name.clone()).collect();
            residual.sort();
            return Err(CircularDependencyError { cycle: residual });
        }

        // Stable ordering by step id for reproducibility, as §4.3 recommends.
        ready.sort_by_key(|&i| graph.step(i).id);
        let phase_names: Vec<String> = ready.iter().map(|&i| graph.step(i).name.clone()).collect();
        for i in &ready {
            remaining.remove(i);
        }
        phases.push(phase_names);
    }

    Ok(phases)
}

pub fn check_dependencies_satisfied(graph: &StepGraph, name: &str, completed: &HashSet<String>) -> bool {
    match graph.index_of(name) {
        Some(index) => graph
            .dependencies(index)
            .iter()
            .all(|&dep| completed.contains(&graph.step(dep).name)),
        None => false,
    }
}

/// Cycle enumeration for reporting: DFS with an explicit recursion stack,
/// emitting the slice of the path from the first re-visited node onward.
pub fn find_circular_dependencies(defs: &[StepDefinition]) -> Vec<Vec<String>> {
    let deps: HashMap<&str, &[String]> = defs.iter().map(|d| (d.name.as_str(), d.dependencies.as_slice())).collect();

    let mut visited: HashSet<&str> = HashSet::new();
    let mut cycles = Vec::new();

    for def in defs {
        if !visited.contains(def.name.as_str()) {
            let mut stack = Vec::new();
            let mut on_stack: HashSet<&str> = HashSet::new();
            dfs_find_cycle(def.name.as_str(), &deps, &mut visited, &mut stack, &mut on_stack, &mut cycles);
        }
    }

    cycles
}

fn dfs_find_cycle<'a>(
    node: &'a str,
    deps: &HashMap<&'a str, &'a [String]>,
    visited: &mut HashSet<&'a str>,
    stack: &mut Vec<&'a str>,
    on_stack: &mut HashSet<&'a str>,
    cycles: &mut Vec<Vec<String>>,
) {
    visited.insert(node);
    stack.push(node);
    on_stack.insert(node);

    if let Some(prereqs) = deps.get(node) {
        for prereq in prereqs.iter() {
            let prereq = prereq.as_str();
            if on_stack.contains(prereq) {
                let start = stack.iter().position(|&n| n == prereq).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(prereq.to_string());
                cycles.push(cycle);
            } else if !visited.contains(prereq) {
                dfs_find_cycle(prereq, deps, visited, stack, on_stack, cycles);
            }
        }
    }

    stack.pop();
    on_stack.remove(node);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: u32, name: &str, deps: &[&str]) -> StepDefinition {
        StepDefinition::new(id, name, name).with_dependencies(deps.iter().map(|s| s.to_string()))
    }

    #[test]
    fn diamond_dag_layers_correctly() {
        let steps = vec![
            step(1, "a", &[]),
            step(2, "b", &["a"]),
            step(3, "c", &["a"]),
            step(4, "d", &["b", "c"]),
        ];
        let graph = GraphBuilder::new(steps).build().unwrap();
        let phases = resolve_execution_order(&graph).unwrap();
        assert_eq!(phases.len(), 3);
        assert_eq!(phases[0], vec!["a"]);
        let mut phase1 = phases[1].clone();
        phase1.sort();
        assert_eq!(phase1, vec!["b", "c"]);
        assert_eq!(phases[2], vec!["d"]);
    }

    #[test]
    fn phases_concatenation_is_permutation_of_names() {
        let steps = vec![step(1, "a", &[]), step(2, "b", &["a"]), step(3, "c", &["b"])];
        let graph = GraphBuilder::new(steps).build().unwrap();
        let phases = resolve_execution_order(&graph).unwrap();
        let mut flattened: Vec<String> = phases.into_iter().flatten().collect();
        flattened.sort();
        assert_eq!(flattened, vec!["a", "b", "c"]);
    }

    #[test]
    fn missing_dependency_is_rejected_at_build_time() {
        let steps = vec![step(1, "a", &["ghost"])];
        let result = GraphBuilder::new(steps).build();
        assert!(matches!(result, Err(DependencyError::MissingDependency { .. })));
    }

    #[test]
    fn cycle_is_detected_during_layering() {
        let steps = vec![step(1, "a", &["b"]), step(2, "b", &["a"])];
        let graph = GraphBuilder::new(steps).build().unwrap();
        let err = resolve_execution_order(&graph).unwrap_err();
        assert_eq!(err.cycle.len(), 2);
    }

    #[test]
    fn find_circular_dependencies_reports_cycle_slice() {
        let steps = vec![step(1, "a", &["b"]), step(2, "b", &["c"]), step(3, "c", &["a"])];
        let cycles = find_circular_dependencies(&steps);
        assert!(!cycles.is_empty());
        assert!(cycles[0].len() >= 3);
    }

    #[test]
    fn find_circular_dependencies_empty_for_acyclic_graph() {
        let steps = vec![step(1, "a", &[]), step(2, "b", &["a"])];
        assert!(find_circular_dependencies(&steps).is_empty());
    }

    #[test]
    fn check_dependencies_satisfied_true_when_all_complete() {
        let steps = vec![step(1, "a", &[]), step(2, "b", &["a"])];
        let graph = GraphBuilder::new(steps).build().unwrap();
        let mut completed = HashSet::new();
        assert!(!check_dependencies_satisfied(&graph, "b", &completed));
        completed.insert("a".to_string());
        assert!(check_dependencies_satisfied(&graph, "b", &completed));
    }

    #[test]
    fn empty_graph_resolves_to_no_phases() {
        let graph = GraphBuilder::new(vec![]).build().unwrap();
        assert!(resolve_execution_order(&graph).unwrap().is_empty());
    }
}
