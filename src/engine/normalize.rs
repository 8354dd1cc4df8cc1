//! Stage 1: make the graph structurally sound.

use std::collections::HashSet;

use super::Pass;
use crate::error::{StructuralReason, TranslateError};
use crate::ir::{Dependency, GraphValidator, PipelineGraph, StructuralIssue};

/// Deduplicates edges and turns every structurally broken job into a stub.
///
/// Duplicate ids are renamed `<id>-duplicate-<n>`, jobs with dangling edges
/// lose those edges, and members of a cycle lose their edges into it. Each
/// affected job carries one structural error.
pub(super) fn normalize(graph: &mut PipelineGraph, pass: &mut Pass<'_, '_>) {
    for job in &mut graph.jobs {
        dedupe_edges(&mut job.depends_on);
    }

    let issues = GraphValidator::new(graph).validate();
    if issues.is_empty() {
        return;
    }
    log::debug!("{} structural issues in source graph", issues.len());

    let mut taken: HashSet<String> = graph.jobs.iter().map(|j| j.id.clone()).collect();
    for issue in issues {
        match issue {
            StructuralIssue::DuplicateId { index, id } => {
                let renamed = free_id(&id, &mut taken);
                let job = &mut graph.jobs[index];
                let diagnostic = pass.diagnostics.push_error(&TranslateError::Structural {
                    job: renamed.clone(),
                    reason: StructuralReason::DuplicateId(id),
                });
                job.id = renamed;
                job.mark_unsupported(diagnostic, "duplicate job id");
            }
            StructuralIssue::DanglingDependency { index, dependency } => {
                let job = &mut graph.jobs[index];
                job.depends_on.retain(|d| d.job != dependency);
                let diagnostic = pass.diagnostics.push_error(&TranslateError::Structural {
                    job: job.id.clone(),
                    reason: StructuralReason::DanglingDependency(dependency.clone()),
                });
                if !job.is_unsupported() {
                    job.mark_unsupported(diagnostic, format!("depends on unknown job '{dependency}'"));
                }
            }
            StructuralIssue::Cycle { indices } => {
                let members: Vec<String> = indices.iter().map(|i| graph.jobs[*i].id.clone()).collect();
                for index in indices {
                    let job = &mut graph.jobs[index];
                    job.depends_on.retain(|d| !members.contains(&d.job));
                    let diagnostic = pass.diagnostics.push_error(&TranslateError::Structural {
                        job: job.id.clone(),
                        reason: StructuralReason::CyclicDependency(members.clone()),
                    });
                    if !job.is_unsupported() {
                        job.mark_unsupported(diagnostic, "part of a dependency cycle");
                    }
                }
            }
        }
    }
}

fn dedupe_edges(edges: &mut Vec<Dependency>) {
    let mut merged: Vec<Dependency> = Vec::with_capacity(edges.len());
    for edge in edges.drain(..) {
        match merged.iter_mut().find(|d| d.job == edge.job) {
            Some(existing) => existing.allow_failure |= edge.allow_failure,
            None => merged.push(edge),
        }
    }
    *edges = merged;
}

fn free_id(id: &str, taken: &mut HashSet<String>) -> String {
    let mut n = 1;
    loop {
        let candidate = format!("{id}-duplicate-{n}");
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{DiagnosticKind, Diagnostics};
    use crate::ir::JobNode;
    use crate::rules::RuleRegistry;
    use crate::vendor::Vendor;

    fn run(jobs: Vec<JobNode>) -> (PipelineGraph, Diagnostics) {
        let mut graph = PipelineGraph {
            jobs,
            ..PipelineGraph::default()
        };
        let mut diagnostics = Diagnostics::new();
        let mut pass = Pass {
            registry: RuleRegistry::builtin().expect("Should load built-in registry"),
            source: Vendor::GitlabCi,
            diagnostics: &mut diagnostics,
        };
        normalize(&mut graph, &mut pass);
        (graph, diagnostics)
    }

    #[test]
    fn test_duplicate_edges_are_merged() {
        let mut job = JobNode::new("test", "test");
        job.add_dependency("build", false);
        job.depends_on.push(Dependency {
            job: "build".to_string(),
            allow_failure: true,
        });
        let (graph, diagnostics) = run(vec![JobNode::new("build", "build"), job]);
        assert!(diagnostics.is_empty());
        assert_eq!(graph.jobs[1].depends_on.len(), 1);
        assert!(graph.jobs[1].depends_on[0].allow_failure);
    }

    #[test]
    fn test_duplicate_id_is_renamed_stub() {
        let (graph, diagnostics) = run(vec![
            JobNode::new("build", "build").with_command("make"),
            JobNode::new("build", "build again").with_command("make again"),
        ]);
        assert_eq!(graph.jobs[1].id, "build-duplicate-1");
        assert!(graph.jobs[1].is_unsupported());
        assert!(graph.jobs[1].commands.is_empty());
        assert!(!graph.jobs[0].is_unsupported(), "Should keep the first occurrence");
        assert_eq!(diagnostics.of_kind(DiagnosticKind::Structural).count(), 1);
    }

    #[test]
    fn test_dangling_edge_is_removed_and_job_stubbed() {
        let (graph, diagnostics) = run(vec![
            JobNode::new("build", "build"),
            JobNode::new("deploy", "deploy").depending_on("build").depending_on("ghost"),
        ]);
        let deploy = &graph.jobs[1];
        assert!(deploy.is_unsupported());
        assert_eq!(deploy.dependency_ids().collect::<Vec<_>>(), vec!["build"]);
        assert_eq!(diagnostics.error_count(), 1);
    }

    #[test]
    fn test_cycle_members_are_stubbed() {
        let (graph, diagnostics) = run(vec![
            JobNode::new("a", "a").depending_on("c"),
            JobNode::new("b", "b").depending_on("a"),
            JobNode::new("c", "c").depending_on("b"),
            JobNode::new("d", "d").depending_on("c"),
        ]);
        assert!(graph.jobs[..3].iter().all(|j| j.is_unsupported()));
        assert!(graph.jobs[..3].iter().all(|j| j.depends_on.is_empty()));
        assert!(!graph.jobs[3].is_unsupported(), "Should keep jobs outside the cycle");
        assert_eq!(diagnostics.of_kind(DiagnosticKind::Structural).count(), 3);
        assert!(GraphValidator::new(&graph).is_valid());
    }
}
