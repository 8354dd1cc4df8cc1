//! Stage 3: per-job feature translation and approval gates.

use std::collections::HashMap;

use super::Pass;
use crate::error::{StructuralReason, TranslateError};
use crate::ir::{Conditional, FeatureKind, JobKind, JobNode, PipelineGraph};
use crate::rules::{Effect, TransformContext};

pub(super) fn translate_jobs(graph: &mut PipelineGraph, pass: &mut Pass<'_, '_>) {
    let producers: HashMap<String, Vec<String>> = graph
        .jobs
        .iter()
        .filter(|j| j.is_emitted() && !j.is_unsupported() && !j.artifacts.produces.is_empty())
        .map(|j| (j.id.clone(), j.artifacts.produces.clone()))
        .collect();

    let mut gated = Vec::new();
    for index in 0..graph.jobs.len() {
        if translate_job(&mut graph.jobs[index], pass, &producers, true) {
            gated.push(index);
        }
    }

    // Later positions first so earlier indices stay valid
    for index in gated.into_iter().rev() {
        insert_gate(graph, index, pass, &producers);
    }
}

/// Applies one rule per populated feature of `job`.
///
/// With `report` unset the rules are applied without diagnostics or notes,
/// for synthesized jobs whose features were already reported on their origin.
/// Returns whether the job needs an approval gate.
fn translate_job(
    job: &mut JobNode,
    pass: &mut Pass<'_, '_>,
    producers: &HashMap<String, Vec<String>>,
    report: bool,
) -> bool {
    let profile = pass.profile();
    let context = TransformContext { profile, producers };
    let mut needs_gate = false;

    for feature in job.populated_features() {
        if feature == FeatureKind::Matrix {
            continue;
        }
        let intent = job.describe_feature(feature);
        let choice = pass.choose(feature, |rule| rule.applies_to(job, profile));
        let Some(choice) = choice else {
            if report {
                let id = job.id.clone();
                let note = pass.unmappable(feature, intent, Some(&id));
                job.notes.push(note);
            }
            continue;
        };

        if report {
            let id = job.id.clone();
            if let Some(note) = pass.record(&choice, feature, intent, Some(&id)) {
                job.notes.push(note);
            }
        }
        if choice.rule.transform.apply(job, &context) == Effect::InsertApprovalGate {
            needs_gate = true;
        }
    }
    needs_gate
}

/// Inserts `<id>-approval` in front of the job at `index`.
fn insert_gate(
    graph: &mut PipelineGraph,
    index: usize,
    pass: &mut Pass<'_, '_>,
    producers: &HashMap<String, Vec<String>>,
) {
    let job = &graph.jobs[index];
    let gate_id = format!("{}-approval", job.id);
    if graph.contains(&gate_id) {
        let diagnostic = pass.diagnostics.push_error(&TranslateError::Structural {
            job: job.id.clone(),
            reason: StructuralReason::DuplicateId(gate_id.clone()),
        });
        graph.jobs[index].mark_unsupported(diagnostic, format!("approval gate id '{gate_id}' is already in use"));
        return;
    }

    let prompt = job.approval.as_ref().and_then(|a| a.prompt.clone());
    let mut gate = JobNode::new(&gate_id, prompt.clone().unwrap_or_else(|| format!("Approve {}", job.label)));
    gate.kind = JobKind::Approval { prompt };
    gate.depends_on = job.depends_on.clone();
    gate.conditionals = job
        .conditionals
        .iter()
        .filter(|c| {
            matches!(
                c,
                Conditional::Branches(_) | Conditional::Tags { .. } | Conditional::Event { .. } | Conditional::Variable { .. }
            )
        })
        .cloned()
        .collect();
    translate_job(&mut gate, pass, producers, false);
    log::trace!("inserted approval gate {gate_id}");

    let job = &mut graph.jobs[index];
    job.depends_on.clear();
    job.add_dependency(gate_id, false);
    graph.jobs.insert(index, gate);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{DiagnosticKind, Diagnostics};
    use crate::ir::{ApprovalGate, Directive, GraphValidator};
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
            source: Vendor::Circleci,
            diagnostics: &mut diagnostics,
        };
        translate_jobs(&mut graph, &mut pass);
        (graph, diagnostics)
    }

    fn pipeline() -> Vec<JobNode> {
        let build = JobNode::new("build", "build").with_command("make");
        let test = JobNode::new("test", "test").with_command("make test").depending_on("build");
        let mut deploy = JobNode::new("deploy", "deploy")
            .with_command("make deploy")
            .depending_on("test");
        deploy.approval = Some(ApprovalGate {
            prompt: Some("Deploy to production?".to_string()),
            inferred: false,
        });
        deploy.conditionals.push(Conditional::only_branches(vec!["main".to_string()]));
        vec![build, test, deploy]
    }

    #[cfg(test)]
    mod insert_gate {
        use super::*;

        #[test]
        fn gate_sits_between_test_and_deploy() {
            let (graph, diagnostics) = run(pipeline());
            assert!(diagnostics.is_empty(), "{diagnostics:?}");
            let ids: Vec<&str> = graph.jobs.iter().map(|j| j.id.as_str()).collect();
            assert_eq!(ids, vec!["build", "test", "deploy-approval", "deploy"]);

            let gate = &graph.jobs[2];
            assert!(gate.is_approval());
            assert_eq!(gate.label, "Deploy to production?");
            assert_eq!(gate.dependency_ids().collect::<Vec<_>>(), vec!["test"]);
            assert_eq!(
                graph.jobs[3].dependency_ids().collect::<Vec<_>>(),
                vec!["deploy-approval"],
                "Should point deploy at the gate, not at test"
            );
            assert!(GraphValidator::new(&graph).is_valid());
        }

        #[test]
        fn gate_carries_branch_filter() {
            let (graph, _) = run(pipeline());
            assert_eq!(
                graph.jobs[2].directives,
                vec![Directive::Branches {
                    patterns: "main".to_string()
                }]
            );
        }

        #[test]
        fn colliding_gate_id_stubs_job() {
            let mut jobs = pipeline();
            jobs.push(JobNode::new("deploy-approval", "elsewhere").with_command("true"));
            let (graph, diagnostics) = run(jobs);
            assert!(graph.job("deploy").is_some_and(JobNode::is_unsupported));
            assert_eq!(diagnostics.of_kind(DiagnosticKind::Structural).count(), 1);
        }
    }

    #[test]
    fn test_inferred_approval_is_approximate() {
        let mut jobs = pipeline();
        if let Some(approval) = jobs[2].approval.as_mut() {
            approval.inferred = true;
        }
        let (graph, diagnostics) = run(jobs);
        assert_eq!(diagnostics.of_kind(DiagnosticKind::Degraded).count(), 1);
        assert_eq!(graph.jobs.len(), 4, "Should still insert the gate");
    }

    #[test]
    fn test_artifacts_download_from_producer() {
        let mut build = JobNode::new("build", "build").with_command("make");
        build.artifacts.produces.push("dist/app.tar".to_string());
        let mut test = JobNode::new("test", "test").with_command("make test").depending_on("build");
        test.artifacts.consumes.push("build".to_string());
        let (graph, _) = run(vec![build, test]);
        assert!(graph.jobs[0].has_directive("upload-artifacts"));
        assert!(graph.jobs[1].has_directive("download-artifacts"));
    }

    #[test]
    fn test_circleci_parallelism_is_approximate() {
        let mut job = JobNode::new("test", "test").with_command("make test");
        job.parallelism = Some(4);
        let (graph, diagnostics) = run(vec![job]);
        assert_eq!(diagnostics.of_kind(DiagnosticKind::Degraded).count(), 1);
        assert!(graph.jobs[0].has_directive("parallelism"));
        assert!(graph.jobs[0].notes[0].instruction.is_some());
    }
}
