//! Structural checks over the job graph.
//!
//! Finds duplicate ids, edges to unknown jobs and dependency cycles. Issues are
//! reported in job order so the caller can turn them into stubs
//! deterministically.

use std::collections::{HashMap, HashSet};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use super::PipelineGraph;

/// One structural violation, located by job position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuralIssue {
    /// A job reuses an id already taken by an earlier job
    DuplicateId { index: usize, id: String },
    /// A job depends on an id no job has
    DanglingDependency { index: usize, dependency: String },
    /// Jobs that depend on each other transitively, in job order
    Cycle { indices: Vec<usize> },
}

/// Validator for a pipeline graph.
pub struct GraphValidator<'a> {
    graph: &'a PipelineGraph,
}

impl<'a> GraphValidator<'a> {
    #[must_use]
    pub fn new(graph: &'a PipelineGraph) -> Self {
        Self { graph }
    }

    /// Runs every check.
    ///
    /// Duplicates are reported first, then dangling edges, then cycles. Cycle
    /// detection only considers the first job carrying each id.
    pub fn validate(&self) -> Vec<StructuralIssue> {
        let mut issues = Vec::new();
        let index = self.first_occurrences(&mut issues);

        for (position, job) in self.graph.jobs.iter().enumerate() {
            for dependency in job.dependency_ids() {
                if !index.contains_key(dependency) {
                    issues.push(StructuralIssue::DanglingDependency {
                        index: position,
                        dependency: dependency.to_string(),
                    });
                }
            }
        }

        issues.extend(self.cycles(&index));
        issues
    }

    /// Whether the graph passes every check.
    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }

    fn first_occurrences(&self, issues: &mut Vec<StructuralIssue>) -> HashMap<&'a str, usize> {
        let mut index = HashMap::new();
        for (position, job) in self.graph.jobs.iter().enumerate() {
            if index.contains_key(job.id.as_str()) {
                issues.push(StructuralIssue::DuplicateId {
                    index: position,
                    id: job.id.clone(),
                });
            } else {
                index.insert(job.id.as_str(), position);
            }
        }
        index
    }

    fn cycles(&self, index: &HashMap<&str, usize>) -> Vec<StructuralIssue> {
        let mut dag: DiGraph<usize, ()> = DiGraph::new();
        let mut nodes: HashMap<usize, NodeIndex> = HashMap::new();

        let mut positions: Vec<usize> = index.values().copied().collect();
        positions.sort_unstable();
        for position in &positions {
            nodes.insert(*position, dag.add_node(*position));
        }

        let mut self_loops = HashSet::new();
        for position in &positions {
            let job = &self.graph.jobs[*position];
            for dependency in job.dependency_ids() {
                if let Some(target) = index.get(dependency) {
                    if target == position {
                        self_loops.insert(*position);
                    }
                    dag.add_edge(nodes[target], nodes[position], ());
                }
            }
        }

        let mut cycles: Vec<Vec<usize>> = tarjan_scc(&dag)
            .into_iter()
            .filter_map(|component| {
                let mut members: Vec<usize> = component.iter().map(|n| dag[*n]).collect();
                members.sort_unstable();
                let cyclic = members.len() > 1 || self_loops.contains(&members[0]);
                cyclic.then_some(members)
            })
            .collect();
        cycles.sort();

        cycles
            .into_iter()
            .map(|indices| StructuralIssue::Cycle { indices })
            .collect()
    }
}
