//! Rule engine: annotates a canonical graph with target directives.
//!
//! Runs four stages in a fixed order:
//!
//! 1. [`normalize`] rejects duplicate ids, dangling edges and cycles
//! 2. [`matrix`] turns matrices into native matrix directives or concrete jobs
//! 3. [`features`] translates the remaining job features and inserts gates
//! 4. [`pipeline`] translates pipeline-level features
//!
//! The engine knows nothing about vendors beyond passing the source vendor to
//! the registry lookup.

mod features;
mod matrix;
mod normalize;
mod pipeline;

use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::error::{Result, TranslateError};
use crate::ir::{Confidence, FeatureKind, Note, PipelineGraph};
use crate::rules::{RuleRegistry, TargetProfile, TranslationRule};
use crate::vendor::{Vendor, VendorPair};

/// Applies a [`RuleRegistry`] to pipeline graphs.
///
/// Holds no mutable state, so one engine may translate many graphs
/// concurrently.
#[derive(Debug, Clone, Copy)]
pub struct RuleEngine<'r> {
    registry: &'r RuleRegistry,
}

/// Per-translation state shared by the stages.
pub(crate) struct Pass<'r, 'd> {
    pub registry: &'r RuleRegistry,
    pub source: Vendor,
    pub diagnostics: &'d mut Diagnostics,
}

/// The rule picked for one feature slot.
pub(crate) struct Choice<'r> {
    pub rule: &'r TranslationRule,
    /// Other native rules that also matched
    pub ambiguous_with: Vec<&'r str>,
}

impl<'r> RuleEngine<'r> {
    pub fn new(registry: &'r RuleRegistry) -> Self {
        Self { registry }
    }

    pub fn profile(&self) -> &'r TargetProfile {
        self.registry.profile()
    }

    /// Translates `graph` for `pair`, returning it with its diagnostics.
    ///
    /// # Errors
    ///
    /// Returns [`TranslateError::UnsupportedTarget`] when the registry does
    /// not target `pair.target`. Job-scoped problems never fail the call.
    pub fn apply(&self, graph: PipelineGraph, pair: VendorPair) -> Result<(PipelineGraph, Diagnostics)> {
        let mut diagnostics = Diagnostics::new();
        let graph = self.apply_with(graph, pair, &mut diagnostics)?;
        Ok((graph, diagnostics))
    }

    /// Like [`RuleEngine::apply`], appending to an existing collector.
    ///
    /// # Errors
    ///
    /// Returns [`TranslateError::UnsupportedTarget`] when the registry does
    /// not target `pair.target`.
    pub fn apply_with(
        &self,
        mut graph: PipelineGraph,
        pair: VendorPair,
        diagnostics: &mut Diagnostics,
    ) -> Result<PipelineGraph> {
        if pair.target != self.profile().vendor {
            return Err(TranslateError::UnsupportedTarget(pair.target));
        }

        let mut pass = Pass {
            registry: self.registry,
            source: pair.source,
            diagnostics,
        };

        normalize::normalize(&mut graph, &mut pass);
        log::trace!("normalized graph has {} jobs", graph.jobs.len());
        matrix::apply_matrices(&mut graph, &mut pass);
        log::trace!("graph has {} jobs after matrix expansion", graph.jobs.len());
        features::translate_jobs(&mut graph, &mut pass);
        pipeline::translate_pipeline(&mut graph, &mut pass);

        log::debug!(
            "engine translated {} jobs from {} with {} diagnostics",
            graph.jobs.len(),
            pair.source,
            pass.diagnostics.len()
        );
        Ok(graph)
    }
}

impl<'r> Pass<'r, '_> {
    pub fn profile(&self) -> &'r TargetProfile {
        self.registry.profile()
    }

    /// Picks the highest-confidence applicable rule, first by declaration
    /// order among equals.
    pub fn choose(&self, feature: FeatureKind, applies: impl Fn(&TranslationRule) -> bool) -> Option<Choice<'r>> {
        let registry: &'r RuleRegistry = self.registry;
        let candidates: Vec<&'r TranslationRule> = registry
            .rules_for(self.source, feature)
            .filter(|rule| applies(rule))
            .collect();
        let best = candidates.iter().map(|rule| rule.confidence).max()?;
        let mut top = candidates.into_iter().filter(|rule| rule.confidence == best);
        let rule = top.next()?;
        let ambiguous_with = if best == Confidence::Native {
            top.map(|rule| rule.name.as_str()).collect()
        } else {
            Vec::new()
        };
        Some(Choice { rule, ambiguous_with })
    }

    /// Reports the outcome of a rule choice and returns the note to attach,
    /// if the translation is not exact.
    pub fn record(&mut self, choice: &Choice<'_>, feature: FeatureKind, intent: String, job: Option<&str>) -> Option<Note> {
        let rule = choice.rule;
        if !choice.ambiguous_with.is_empty() {
            let diagnostic = Diagnostic::warning(
                DiagnosticKind::AmbiguousRule,
                feature.id(),
                format!(
                    "native rules '{}' and '{}' both match; applied '{}'",
                    rule.name,
                    choice.ambiguous_with.join("', '"),
                    rule.name
                ),
            );
            self.diagnostics.push(scoped(diagnostic, job));
        }

        log::trace!("feature {feature} handled by rule '{}' ({})", rule.name, rule.confidence);
        if rule.confidence == Confidence::Native {
            return None;
        }

        let intent = match &rule.note {
            Some(note) if !intent.is_empty() => format!("{intent} ({note})"),
            Some(note) => note.clone(),
            None => intent,
        };
        let message = match rule.confidence {
            Confidence::Manual => format!("{feature} has no Buildkite equivalent: {intent}"),
            _ => format!("{feature} translated approximately: {intent}"),
        };
        let diagnostic = Diagnostic::warning(DiagnosticKind::Degraded, feature.id(), message)
            .with_instruction(rule.instruction.clone());
        self.diagnostics.push(scoped(diagnostic, job));

        Some(Note {
            feature,
            confidence: rule.confidence,
            intent,
            instruction: rule.instruction.clone(),
        })
    }

    /// Reports a populated feature that no rule handles.
    pub fn unmappable(&mut self, feature: FeatureKind, intent: String, job: Option<&str>) -> Note {
        let diagnostic = match job {
            Some(job) => Diagnostic::from_error(&TranslateError::UnmappableFeature {
                job: job.to_string(),
                feature,
            }),
            None => Diagnostic::error(
                DiagnosticKind::UnmappableFeature,
                feature.id(),
                format!("No translation rule matches pipeline feature '{feature}'"),
            ),
        };
        self.diagnostics.push(diagnostic);
        Note {
            feature,
            confidence: Confidence::Manual,
            intent,
            instruction: None,
        }
    }
}

fn scoped(diagnostic: Diagnostic, job: Option<&str>) -> Diagnostic {
    match job {
        Some(job) => diagnostic.for_job(job),
        None => diagnostic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Severity;
    use crate::ir::{Conditional, JobNode, RetryPolicy};

    fn pair() -> VendorPair {
        VendorPair::new(Vendor::GithubActions, Vendor::Buildkite)
    }

    fn translate(jobs: Vec<JobNode>) -> (PipelineGraph, Diagnostics) {
        let registry = RuleRegistry::builtin().expect("Should load built-in registry");
        let graph = PipelineGraph {
            jobs,
            ..PipelineGraph::default()
        };
        RuleEngine::new(registry).apply(graph, pair()).expect("Should translate")
    }

    #[test]
    fn test_rejects_unsupported_target() {
        let registry = RuleRegistry::builtin().expect("Should load built-in registry");
        let result = RuleEngine::new(registry).apply(
            PipelineGraph::default(),
            VendorPair::new(Vendor::GithubActions, Vendor::Jenkins),
        );
        assert!(matches!(result, Err(TranslateError::UnsupportedTarget(Vendor::Jenkins))));
    }

    #[test]
    fn test_native_feature_produces_no_diagnostic() {
        let mut job = JobNode::new("build", "build").with_command("make");
        job.timeout_minutes = Some(15);
        let (graph, diagnostics) = translate(vec![job]);
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        assert!(graph.jobs[0].has_directive("timeout"));
        assert!(graph.jobs[0].notes.is_empty());
    }

    #[test]
    fn test_manual_feature_produces_one_warning_and_one_note() {
        let mut job = JobNode::new("build", "build").with_command("make");
        job.conditionals.push(Conditional::Expression {
            source: "contains(github.event.head_commit.message, 'ci')".to_string(),
        });
        let (graph, diagnostics) = translate(vec![job]);

        let warnings: Vec<&Diagnostic> = diagnostics.of_kind(DiagnosticKind::Degraded).collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].severity, Severity::Warning);
        assert_eq!(warnings[0].feature, "conditional-expression");
        assert_eq!(warnings[0].job_id.as_deref(), Some("build"));
        assert!(warnings[0].instruction.is_some(), "Should carry the manual step");
        assert_eq!(graph.jobs[0].notes.len(), 1);
        assert_eq!(graph.jobs[0].notes[0].feature, FeatureKind::ConditionalExpression);
    }

    #[test]
    fn test_approximate_retry_is_capped() {
        let mut job = JobNode::new("flaky", "flaky").with_command("make");
        job.retry = Some(RetryPolicy {
            max_attempts: 25,
            conditions: Vec::new(),
        });
        let (graph, diagnostics) = translate(vec![job]);
        assert_eq!(diagnostics.of_kind(DiagnosticKind::Degraded).count(), 1);
        assert!(graph.jobs[0]
            .directives
            .contains(&crate::ir::Directive::Retry {
                limit: 10,
                exit_statuses: vec!["*".to_string()]
            }));
    }

    #[test]
    fn test_unmappable_feature_is_an_error_but_job_survives() {
        let registry = RuleRegistry::from_yaml(
            r#"
target:
  vendor: buildkite
  native-matrix: true
  matrix-limits: { max-dimensions: 6, max-values-per-dimension: 20, max-adjustments: 12, max-jobs: 50 }
  cache-levels: [file]
  cache-fallback: false
  max-retries: 10
  allowed-top-level-keys: [steps]
  anchors-section: x-anchors
  container-plugin: docker
  cache-plugin: cache
rules: []
"#,
        )
        .expect("Should parse");
        let mut job = JobNode::new("build", "build").with_command("make");
        job.timeout_minutes = Some(5);
        let graph = PipelineGraph {
            jobs: vec![job],
            ..PipelineGraph::default()
        };
        let (graph, diagnostics) = RuleEngine::new(&registry).apply(graph, pair()).expect("Should translate");

        assert_eq!(diagnostics.of_kind(DiagnosticKind::UnmappableFeature).count(), 1);
        assert_eq!(diagnostics.error_count(), 1);
        assert!(!graph.jobs[0].is_unsupported(), "Should still emit the job");
        assert_eq!(graph.jobs[0].notes[0].confidence, Confidence::Manual);
    }
}
