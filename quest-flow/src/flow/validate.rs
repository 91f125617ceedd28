//! Structural checks over a flow document and the step dependency graph.

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::error::{PipelineError, Result};
use crate::flow::types::{FlowNode, GroupNode, StepNode};

/// Dependency graph over the steps of a flow, in input order.
///
/// Edges run from prerequisite to dependent. A step ID in `dependsOn` is a
/// plain edge. The first group ID in `dependsOn` places the step in that
/// group's section; any further group ID adds an edge from every step of that
/// group.
#[derive(Debug)]
pub struct StepGraph<'a> {
    steps: Vec<&'a StepNode>,
    sections: Vec<Option<&'a GroupNode>>,
    graph: DiGraph<usize, ()>,
}

impl<'a> StepGraph<'a> {
    /// Build the graph. Fails on references to node IDs that do not exist.
    pub fn build(nodes: &'a [FlowNode]) -> Result<Self> {
        let mut groups: HashMap<&str, &GroupNode> = HashMap::new();
        let mut steps: Vec<&StepNode> = Vec::new();
        for node in nodes {
            match node {
                FlowNode::Group(group) => {
                    groups.insert(group.id.as_str(), group);
                }
                FlowNode::Step(step) => steps.push(step),
            }
        }

        let step_index: HashMap<&str, usize> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        // Section membership first; ordering edges need every step's group.
        let mut sections: Vec<Option<&GroupNode>> = Vec::with_capacity(steps.len());
        for step in &steps {
            let mut section = None;
            for dep in &step.depends_on {
                if let Some(group) = groups.get(dep.as_str()) {
                    section = Some(*group);
                    break;
                }
                if !step_index.contains_key(dep.as_str()) {
                    return Err(unknown_reference(step, dep));
                }
            }
            sections.push(section);
        }

        let mut members: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, section) in sections.iter().enumerate() {
            if let Some(group) = section {
                members.entry(group.id.as_str()).or_default().push(i);
            }
        }

        let mut graph = DiGraph::<usize, ()>::with_capacity(steps.len(), 0);
        for i in 0..steps.len() {
            graph.add_node(i);
        }

        let mut seen_edges: HashSet<(usize, usize)> = HashSet::new();
        for (i, step) in steps.iter().enumerate() {
            let own_section = sections[i].map(|g| g.id.as_str());
            for dep in &step.depends_on {
                let before: Vec<usize> = if let Some(&j) = step_index.get(dep.as_str()) {
                    vec![j]
                } else if groups.contains_key(dep.as_str()) {
                    if Some(dep.as_str()) == own_section {
                        continue;
                    }
                    members.get(dep.as_str()).cloned().unwrap_or_default()
                } else {
                    return Err(unknown_reference(step, dep));
                };

                for j in before {
                    if seen_edges.insert((j, i)) {
                        graph.add_edge(NodeIndex::new(j), NodeIndex::new(i), ());
                    }
                }
            }
        }

        Ok(Self {
            steps,
            sections,
            graph,
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, index: usize) -> &'a StepNode {
        self.steps[index]
    }

    /// Group whose section the step belongs to, if any.
    pub fn section_of(&self, index: usize) -> Option<&'a GroupNode> {
        self.sections[index]
    }

    /// Kahn's algorithm; among ready steps the one earliest in the input goes
    /// first. A cycle fails with the IDs of every step on it.
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        let mut in_degree: Vec<usize> = (0..self.len())
            .map(|i| {
                self.graph
                    .neighbors_directed(NodeIndex::new(i), Direction::Incoming)
                    .count()
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for next in self
                .graph
                .neighbors_directed(NodeIndex::new(i), Direction::Outgoing)
            {
                let j = next.index();
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.push(Reverse(j));
                }
            }
        }

        if order.len() < self.len() {
            return Err(PipelineError::DependencyCycle {
                ids: self.cycle_ids(),
            });
        }
        Ok(order)
    }

    /// IDs of steps that sit on a dependency cycle, in input order.
    pub fn cycle_ids(&self) -> Vec<String> {
        let mut on_cycle: Vec<usize> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0])
            })
            .flatten()
            .map(|idx| idx.index())
            .collect();
        on_cycle.sort_unstable();
        on_cycle
            .into_iter()
            .map(|i| self.steps[i].id.clone())
            .collect()
    }
}

fn unknown_reference(step: &StepNode, reference: &str) -> PipelineError {
    PipelineError::Validation {
        node: Some(step.id.clone()),
        message: format!("dependsOn references unknown node '{}'", reference),
    }
}

/// Every node has a non-empty, unique ID.
pub fn check_ids(nodes: &[FlowNode]) -> Result<()> {
    let mut seen: HashSet<&str> = HashSet::new();
    for node in nodes {
        let id = node.id();
        if id.trim().is_empty() {
            return Err(PipelineError::validation(format!(
                "node '{}' has an empty id",
                node.name()
            )));
        }
        if !seen.insert(id) {
            return Err(PipelineError::Validation {
                node: Some(id.to_string()),
                message: "duplicate node id".to_string(),
            });
        }
    }
    Ok(())
}

/// Full document check: non-empty, unique IDs, resolvable references, no cycles.
pub fn validate_flow(nodes: &[FlowNode]) -> Result<()> {
    if nodes.is_empty() {
        return Err(PipelineError::validation("flow contains no nodes"));
    }
    check_ids(nodes)?;
    StepGraph::build(nodes)?.topological_order()?;
    Ok(())
}
