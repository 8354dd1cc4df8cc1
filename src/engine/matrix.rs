//! Stage 2: native matrices or per-combination duplication.

use std::collections::HashSet;

use super::Pass;
use crate::error::{StructuralReason, TranslateError};
use crate::ir::{
    combination_suffix, substitute, Combination, Directive, FeatureKind, JobKind, JobNode, MatrixSpec, PipelineGraph,
};
use crate::rules::Transform;

pub(super) fn apply_matrices(graph: &mut PipelineGraph, pass: &mut Pass<'_, '_>) {
    let mut index = 0;
    while index < graph.jobs.len() {
        let job = &graph.jobs[index];
        let Some(spec) = job.matrix.clone().filter(|_| job.is_emitted() && !job.is_unsupported()) else {
            index += 1;
            continue;
        };

        let profile = pass.profile();
        let Some(choice) = pass.choose(FeatureKind::Matrix, |rule| rule.applies_to(job, profile)) else {
            let intent = job.describe_feature(FeatureKind::Matrix);
            let id = job.id.clone();
            let note = pass.unmappable(FeatureKind::Matrix, intent, Some(&id));
            graph.jobs[index].notes.push(note);
            index += 1;
            continue;
        };

        let native = choice.rule.transform == Transform::NativeMatrix;
        if let Err(detail) = spec.check_limits(&profile.matrix_limits, native) {
            stub(&mut graph.jobs[index], pass, StructuralReason::MatrixCapacity(detail));
            index += 1;
            continue;
        }

        let intent = job.describe_feature(FeatureKind::Matrix);
        let id = job.id.clone();
        if let Some(note) = pass.record(&choice, FeatureKind::Matrix, intent, Some(&id)) {
            graph.jobs[index].notes.push(note);
        }

        match choice.rule.transform {
            Transform::NativeMatrix => {
                log::trace!("job {id}: native matrix");
                graph.jobs[index].directives.push(Directive::NativeMatrix(spec));
                index += 1;
            }
            Transform::ExpandMatrix => index += expand(graph, index, &spec, pass),
            _ => index += 1,
        }
    }
}

/// Replaces the template at `index` with one job per combination and returns
/// how many positions to advance.
fn expand(graph: &mut PipelineGraph, index: usize, spec: &MatrixSpec, pass: &mut Pass<'_, '_>) -> usize {
    let combinations = spec.combinations();
    if combinations.is_empty() {
        let reason = StructuralReason::MatrixCapacity("no combinations remain after exclusions".to_string());
        stub(&mut graph.jobs[index], pass, reason);
        return 1;
    }

    let template = &graph.jobs[index];
    let expansions: Vec<JobNode> = combinations.iter().map(|c| instantiate(template, c)).collect();

    let mut seen = HashSet::new();
    let taken: HashSet<&str> = graph.jobs.iter().map(|j| j.id.as_str()).collect();
    if let Some(clash) = expansions
        .iter()
        .find(|j| taken.contains(j.id.as_str()) || !seen.insert(j.id.as_str()))
    {
        let reason = StructuralReason::DuplicateId(clash.id.clone());
        stub(&mut graph.jobs[index], pass, reason);
        return 1;
    }

    let template_id = template.id.clone();
    let ids: Vec<String> = expansions.iter().map(|j| j.id.clone()).collect();
    log::debug!("job {template_id}: expanded matrix into {} jobs", ids.len());

    for job in &mut graph.jobs {
        if let Some(position) = job.depends_on.iter().position(|d| d.job == template_id) {
            let allow_failure = job.depends_on.remove(position).allow_failure;
            for id in &ids {
                job.add_dependency(id.clone(), allow_failure);
            }
        }
        if let Some(position) = job.artifacts.consumes.iter().position(|c| *c == template_id) {
            job.artifacts.consumes.splice(position..=position, ids.iter().cloned());
        }
    }

    let count = expansions.len();
    graph.jobs[index].kind = JobKind::Expanded { into: ids };
    graph.jobs.splice(index + 1..index + 1, expansions);
    count + 1
}

/// One concrete job of a matrix template.
fn instantiate(template: &JobNode, combination: &Combination) -> JobNode {
    let mut job = template.clone();
    job.id = format!("{}-{}", template.id, combination_suffix(combination));
    let values: Vec<&str> = combination.values().map(String::as_str).collect();
    job.label = if template.label.contains("{{matrix.") {
        substitute(&template.label, combination)
    } else {
        format!("{} ({})", template.label, values.join(", "))
    };
    job.matrix = None;
    job.commands = template.commands.iter().map(|c| substitute(c, combination)).collect();
    job.post_commands = template.post_commands.iter().map(|c| substitute(c, combination)).collect();
    for value in job.environment.values_mut() {
        *value = substitute(value, combination);
    }
    if let Some(container) = job.container.as_mut() {
        container.image = substitute(&container.image, combination);
    }
    for service in &mut job.services {
        service.image = substitute(&service.image, combination);
    }
    if let Some(hint) = job.resource_hint.as_mut() {
        *hint = substitute(hint, combination);
    }
    for path in &mut job.artifacts.produces {
        *path = substitute(path, combination);
    }
    job
}

fn stub(job: &mut JobNode, pass: &mut Pass<'_, '_>, reason: StructuralReason) {
    let message = reason.to_string();
    let diagnostic = pass.diagnostics.push_error(&TranslateError::Structural {
        job: job.id.clone(),
        reason,
    });
    job.mark_unsupported(diagnostic, message);
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;
    use crate::diagnostics::{DiagnosticKind, Diagnostics};
    use crate::ir::{matrix_token, GraphValidator};
    use crate::rules::RuleRegistry;
    use crate::vendor::Vendor;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| (*s).to_string()).collect()
    }

    fn node_matrix() -> MatrixSpec {
        MatrixSpec::new()
            .with_dimension("os", strings(&["linux", "macos"]))
            .with_dimension("version", strings(&["18", "20"]))
            .with_adjustment(
                IndexMap::from([
                    ("os".to_string(), "macos".to_string()),
                    ("version".to_string(), "18".to_string()),
                ]),
                true,
            )
    }

    fn run(mut graph: PipelineGraph, native: bool) -> (PipelineGraph, Diagnostics) {
        let mut registry = RuleRegistry::builtin().expect("Should load built-in registry").clone();
        if !native {
            registry = RuleRegistry::from_yaml(
                &include_str!("../rules/registry.yaml").replace("native-matrix: true", "native-matrix: false"),
            )
            .expect("Should parse adjusted registry");
        }
        let mut diagnostics = Diagnostics::new();
        let mut pass = Pass {
            registry: &registry,
            source: Vendor::GithubActions,
            diagnostics: &mut diagnostics,
        };
        apply_matrices(&mut graph, &mut pass);
        (graph, diagnostics)
    }

    fn matrix_graph() -> PipelineGraph {
        let mut test = JobNode::new("test", "test")
            .with_command(format!("nvm use {}", matrix_token("version")))
            .depending_on("build");
        test.matrix = Some(node_matrix());
        let mut report = JobNode::new("report", "report").depending_on("test");
        report.artifacts.consumes.push("test".to_string());
        PipelineGraph {
            jobs: vec![JobNode::new("build", "build"), test, report],
            ..PipelineGraph::default()
        }
    }

    #[test]
    fn test_native_matrix_directive() {
        let (graph, diagnostics) = run(matrix_graph(), true);
        assert!(diagnostics.is_empty());
        assert_eq!(graph.jobs.len(), 3);
        assert_eq!(graph.jobs[1].directives, vec![Directive::NativeMatrix(node_matrix())]);
    }

    #[cfg(test)]
    mod expand {
        use super::*;

        #[test]
        fn produces_three_jobs_without_excluded_combination() {
            let (graph, diagnostics) = run(matrix_graph(), false);
            assert!(diagnostics.is_empty(), "{diagnostics:?}");
            let emitted: Vec<&str> = graph.emitted_jobs().map(|j| j.id.as_str()).collect();
            assert_eq!(
                emitted,
                vec!["build", "test-linux-18", "test-linux-20", "test-macos-20", "report"]
            );
            assert!(!emitted.iter().any(|id| id.ends_with("-macos-18")));
            assert_eq!(graph.jobs[2].commands, vec!["nvm use 18"]);
            assert_eq!(graph.jobs[2].dependency_ids().collect::<Vec<_>>(), vec!["build"]);
        }

        #[test]
        fn rewires_dependents_to_every_expansion() {
            let (graph, _) = run(matrix_graph(), false);
            let report = graph.job("report").expect("Should keep report");
            assert_eq!(
                report.dependency_ids().collect::<Vec<_>>(),
                vec!["test-linux-18", "test-linux-20", "test-macos-20"]
            );
            assert_eq!(report.artifacts.consumes.len(), 3);
            assert!(GraphValidator::new(&graph).is_valid());
        }

        #[test]
        fn capacity_overflow_stubs_the_job() {
            let mut graph = matrix_graph();
            let values: Vec<String> = (0..25).map(|n| n.to_string()).collect();
            graph.jobs[1].matrix = Some(MatrixSpec::new().with_dimension("shard", values));
            let (graph, diagnostics) = run(graph, false);
            assert!(graph.jobs[1].is_unsupported());
            assert_eq!(graph.jobs.len(), 3, "Should not truncate into partial expansions");
            assert_eq!(diagnostics.of_kind(DiagnosticKind::Structural).count(), 1);
        }

        #[test]
        fn huge_cross_product_is_rejected_by_count() {
            let mut graph = matrix_graph();
            let values: Vec<String> = (0..20).map(|n| n.to_string()).collect();
            let spec = (0..6).fold(MatrixSpec::new(), |m, d| m.with_dimension(format!("d{d}"), values.clone()));
            graph.jobs[1].matrix = Some(spec);
            for native in [true, false] {
                let (graph, diagnostics) = run(graph.clone(), native);
                assert!(graph.jobs[1].is_unsupported(), "Should stub the job (native: {native})");
                assert_eq!(graph.jobs.len(), 3);
                let structural: Vec<_> = diagnostics.of_kind(DiagnosticKind::Structural).collect();
                assert_eq!(structural.len(), 1);
                assert!(structural[0].message.contains("64000000 jobs"), "{}", structural[0].message);
            }
        }

        #[test]
        fn id_collision_is_structural_error() {
            let mut graph = matrix_graph();
            graph.jobs.push(JobNode::new("test-linux-18", "clash"));
            let (graph, diagnostics) = run(graph, false);
            assert!(graph.jobs[1].is_unsupported());
            assert_eq!(diagnostics.error_count(), 1);
        }
    }
}
