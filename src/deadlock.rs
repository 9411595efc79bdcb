//! Deadlock detector: dependency-cycle detection (shared with the resolver)
//! plus resource wait-for-graph cycle detection.

use std::collections::{HashMap, HashSet};

use crate::step::StepDefinition;

/// A step's resource hold/wait state for a single deadlock check: resources
/// it currently holds ("primary") and resources it is awaiting
/// ("secondary").
#[derive(Debug, Clone, Default)]
pub struct ResourceRequest {
    pub primary: Vec<String>,
    pub secondary: Vec<String>,
}

/// Generic DFS-with-recursion-stack cycle finder over a `name -> [name]`
/// adjacency map, reused for both dependency cycles and resource wait-for
/// cycles.
fn find_cycles(adjacency: &HashMap<String, Vec<String>>) -> Vec<Vec<String>> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut cycles = Vec::new();

    let mut nodes: Vec<&String> = adjacency.keys().collect();
    nodes.sort();

    for node in nodes {
        if !visited.contains(node) {
            let mut stack: Vec<String> = Vec::new();
            let mut on_stack: HashSet<String> = HashSet::new();
            dfs(node, adjacency, &mut visited, &mut stack, &mut on_stack, &mut cycles);
        }
    }

    cycles
}

fn dfs(
    node: &str,
    adjacency: &HashMap<String, Vec<String>>,
    visited: &mut HashSet<String>,
    stack: &mut Vec<String>,
    on_stack: &mut HashSet<String>,
    cycles: &mut Vec<Vec<String>>,
) {
    visited.insert(node.to_string());
    stack.push(node.to_string());
    on_stack.insert(node.to_string());

    if let Some(neighbors) = adjacency.get(node) {
        for neighbor in neighbors {
            if on_stack.contains(neighbor) {
                let start = stack.iter().position(|n| n == neighbor).unwrap_or(0);
                let mut cycle = stack[start..].to_vec();
                cycle.push(neighbor.clone());
                cycles.push(cycle);
            } else if !visited.contains(neighbor) {
                dfs(neighbor, adjacency, visited, stack, on_stack, cycles);
            }
        }
    }

    stack.pop();
    on_stack.remove(node);
}

/// `find_dependency_cycles`: builds the `name -> [prereq names]` adjacency
/// directly from step definitions and runs the shared cycle finder.
pub fn find_dependency_cycles(defs: &[StepDefinition]) -> Vec<Vec<String>> {
    let adjacency: HashMap<String, Vec<String>> = defs.iter().map(|d| (d.name.clone(), d.dependencies.clone())).collect();
    find_cycles(&adjacency)
}

pub fn detect_deadlock(defs: &[StepDefinition]) -> bool {
    !find_dependency_cycles(defs).is_empty()
}

/// Builds the resource wait-for graph from a `step -> {primary, secondary}`
/// request map: an edge `A -> B` exists when B holds (as primary) a
/// resource that A is awaiting (as secondary).
pub fn build_wait_for_graph(requests: &HashMap<String, ResourceRequest>) -> HashMap<String, Vec<String>> {
    // resource -> holder step names (their primary list contains it)
    let mut holders: HashMap<&str, Vec<&str>> = HashMap::new();
    for (step, request) in requests {
        for resource in &request.primary {
            holders.entry(resource.as_str()).or_default().push(step.as_str());
        }
    }

    let mut graph: HashMap<String, Vec<String>> = requests.keys().map(|s| (s.clone(), Vec::new())).collect();

    for (step, request) in requests {
        for resource in &request.secondary {
            if let Some(owning_steps) = holders.get(resource.as_str()) {
                for owner in owning_steps {
                    if *owner != step.as_str() {
                        graph.get_mut(step).unwrap().push(owner.to_string());
                    }
                }
            }
        }
    }

    graph
}

/// `detect_resource_deadlock`: constructs the wait-for graph and reports
/// whether it contains a cycle.
pub fn detect_resource_deadlock(requests: &HashMap<String, ResourceRequest>) -> bool {
    !find_cycles(&build_wait_for_graph(requests)).is_empty()
}

pub fn find_resource_deadlock_cycles(requests: &HashMap<String, ResourceRequest>) -> Vec<Vec<String>> {
    find_cycles(&build_wait_for_graph(requests))
}
