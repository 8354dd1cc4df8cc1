//! Stage 4: pipeline-level features.

use super::Pass;
use crate::ir::{Directive, PipelineGraph};
use crate::rules::Transform;

/// Translates schedules, trigger filters and global settings.
///
/// Only rules without a `when` predicate apply here; predicates test jobs.
/// Notes go to the first job that survives into the output, or to the
/// document header when none does.
pub(super) fn translate_pipeline(graph: &mut PipelineGraph, pass: &mut Pass<'_, '_>) {
    let mut notes = Vec::new();
    for feature in graph.populated_features() {
        let intent = graph.describe_feature(feature);
        let Some(choice) = pass.choose(feature, |rule| rule.when.is_empty()) else {
            notes.push(pass.unmappable(feature, intent, None));
            continue;
        };
        if let Some(note) = pass.record(&choice, feature, intent, None) {
            notes.push(note);
        }
        if choice.rule.transform == Transform::PipelineEnvironment
            && !graph.directives.contains(&Directive::PipelineEnvironment)
        {
            graph.directives.push(Directive::PipelineEnvironment);
        }
    }

    if notes.is_empty() {
        return;
    }
    match graph.jobs.iter_mut().find(|j| j.is_emitted() && !j.is_unsupported()) {
        Some(job) => job.notes.extend(notes),
        None => graph.notes.extend(notes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{DiagnosticKind, Diagnostics};
    use crate::ir::{FeatureKind, JobNode, Schedule};
    use crate::rules::RuleRegistry;
    use crate::vendor::Vendor;

    fn run(mut graph: PipelineGraph) -> (PipelineGraph, Diagnostics) {
        let mut diagnostics = Diagnostics::new();
        let mut pass = Pass {
            registry: RuleRegistry::builtin().expect("Should load built-in registry"),
            source: Vendor::Jenkins,
            diagnostics: &mut diagnostics,
        };
        translate_pipeline(&mut graph, &mut pass);
        (graph, diagnostics)
    }

    #[test]
    fn test_global_env_is_native() {
        let mut graph = PipelineGraph::new();
        graph.environment.insert("APP".to_string(), "shop".to_string());
        graph.jobs.push(JobNode::new("build", "build"));
        let (graph, diagnostics) = run(graph);
        assert!(diagnostics.is_empty());
        assert_eq!(graph.directives, vec![Directive::PipelineEnvironment]);
    }

    #[test]
    fn test_schedule_note_attaches_to_first_surviving_job() {
        let mut graph = PipelineGraph::new();
        graph.schedules.push(Schedule {
            cron: "H 4 * * 1-5".to_string(),
            branch: None,
        });
        let mut stub = JobNode::new("broken", "broken");
        stub.unsupported = Some(crate::ir::Unsupported {
            diagnostic: crate::diagnostics::DiagnosticId(0),
            reason: "parse".to_string(),
        });
        graph.jobs.push(stub);
        graph.jobs.push(JobNode::new("build", "build"));

        let (graph, diagnostics) = run(graph);
        let warnings: Vec<_> = diagnostics.of_kind(DiagnosticKind::Degraded).collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].job_id, None);
        assert!(graph.jobs[0].notes.is_empty());
        assert_eq!(graph.jobs[1].notes[0].feature, FeatureKind::ScheduledTrigger);
    }

    #[test]
    fn test_notes_fall_back_to_document_header() {
        let mut graph = PipelineGraph::new();
        graph.timeout_minutes = Some(60);
        let (graph, _) = run(graph);
        assert_eq!(graph.notes.len(), 1);
        assert_eq!(graph.notes[0].feature, FeatureKind::GlobalTimeout);
    }
}
