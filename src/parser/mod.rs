//! Dialect parsers: source pipeline text to canonical IR.
//!
//! Every parser is fail-soft per job. A source unit that cannot be lowered is
//! replaced by a placeholder carrying one `Parse` error diagnostic, its id and
//! whatever dependency edges could be salvaged. Only a document that cannot be
//! read at all aborts, with zero jobs and one `Document` diagnostic.

pub mod bitbucket;
pub mod circleci;
pub mod expr;
pub mod github;
pub mod gitlab;
pub mod jenkins;
pub mod yaml;

use std::collections::{HashMap, HashSet};

use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::{Result, TranslateError};
use crate::ir::{slugify, Dependency, JobNode, PipelineGraph};
use crate::vendor::Vendor;

/// Result of parsing one source document.
#[derive(Debug, Clone, Default)]
pub struct ParseOutput {
    pub graph: PipelineGraph,
    pub diagnostics: Diagnostics,
}

/// Parser for one source dialect.
pub trait DialectParser: Send + Sync {
    fn vendor(&self) -> Vendor;

    /// Lowers a whole document, recording job-scoped problems in `diagnostics`.
    ///
    /// # Errors
    ///
    /// Returns [`TranslateError::Document`] when the document as a whole is unreadable.
    fn parse_document(&self, text: &str, diagnostics: &mut Diagnostics) -> Result<PipelineGraph>;

    /// Parses `text` into a graph and its diagnostics. Never fails.
    fn parse(&self, text: &str) -> ParseOutput {
        let mut diagnostics = Diagnostics::new();
        match self.parse_document(text, &mut diagnostics) {
            Ok(graph) => {
                log::debug!(
                    "{} parser lowered {} jobs with {} diagnostics",
                    self.vendor(),
                    graph.jobs.len(),
                    diagnostics.len()
                );
                ParseOutput { graph, diagnostics }
            }
            Err(error) => {
                log::debug!("{} parser rejected document: {error}", self.vendor());
                let mut diagnostics = Diagnostics::new();
                diagnostics.push(Diagnostic::from_error(&error));
                ParseOutput {
                    graph: PipelineGraph::default(),
                    diagnostics,
                }
            }
        }
    }
}

/// Parser for a source vendor; `None` for target-only vendors.
pub fn parser_for(vendor: Vendor) -> Option<Box<dyn DialectParser>> {
    match vendor {
        Vendor::GithubActions => Some(Box::new(github::GithubParser)),
        Vendor::Circleci => Some(Box::new(circleci::CircleciParser)),
        Vendor::BitbucketPipelines => Some(Box::new(bitbucket::BitbucketParser)),
        Vendor::GitlabCi => Some(Box::new(gitlab::GitlabParser)),
        Vendor::Jenkins => Some(Box::new(jenkins::JenkinsParser)),
        Vendor::Buildkite => None,
    }
}

/// Document error for `vendor`.
pub(crate) fn document_error(vendor: Vendor, message: impl Into<String>) -> TranslateError {
    TranslateError::Document {
        vendor,
        message: message.into(),
    }
}

/// Records a parse error for `id` and returns its placeholder job.
pub(crate) fn placeholder(
    diagnostics: &mut Diagnostics,
    id: &str,
    label: &str,
    depends_on: Vec<Dependency>,
    message: impl Into<String>,
) -> JobNode {
    let message = message.into();
    let diagnostic = diagnostics.push_error(&TranslateError::Parse {
        unit: id.to_string(),
        message: message.clone(),
    });
    JobNode::placeholder(id, label, depends_on, diagnostic, message)
}

/// Job id for a source name.
///
/// Falls back to the positional synthetic label when the name has no usable
/// characters.
pub(crate) fn job_id(name: &str, position: usize) -> String {
    let slug = slugify(name);
    if slug.is_empty() {
        step_label(position)
    } else {
        slug
    }
}

/// Synthetic label for the unnamed source step at zero-based `position`.
pub(crate) fn step_label(position: usize) -> String {
    format!("step-{}", position + 1)
}

/// Hands out unique ids for dialects where steps are named, not keyed.
#[derive(Debug, Default)]
pub(crate) struct IdAllocator {
    used: HashSet<String>,
}

impl IdAllocator {
    /// Returns `base`, or the first free `base-<n>` when `base` is taken.
    pub(crate) fn allocate(&mut self, base: &str) -> String {
        let mut id = base.to_string();
        let mut n = 1;
        while self.used.contains(&id) {
            n += 1;
            id = format!("{base}-{n}");
        }
        self.used.insert(id.clone());
        id
    }
}

/// Fills `artifacts.consumes` of the given jobs with every upstream job that
/// produces artifacts, in job order.
pub(crate) fn consume_upstream_artifacts(jobs: &mut [JobNode], consumers: &[usize]) {
    let index: HashMap<String, usize> = jobs
        .iter()
        .enumerate()
        .map(|(i, job)| (job.id.clone(), i))
        .collect();

    for &position in consumers {
        let mut stack: Vec<usize> = jobs[position]
            .dependency_ids()
            .filter_map(|d| index.get(d).copied())
            .collect();
        let mut seen = vec![false; jobs.len()];
        let mut producers = Vec::new();
        while let Some(current) = stack.pop() {
            if std::mem::replace(&mut seen[current], true) {
                continue;
            }
            if !jobs[current].artifacts.produces.is_empty() {
                producers.push(current);
            }
            stack.extend(jobs[current].dependency_ids().filter_map(|d| index.get(d).copied()));
        }
        producers.sort_unstable();
        jobs[position].artifacts.consumes = producers.iter().map(|p| jobs[*p].id.clone()).collect();
    }
}

/// Plain dependency edges to the given ids.
pub(crate) fn edges<I, S>(ids: I) -> Vec<Dependency>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    ids.into_iter()
        .map(|id| Dependency {
            job: slugify(id.as_ref()),
            allow_failure: false,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticKind;

    #[test]
    fn test_parser_for_sources_only() {
        for vendor in Vendor::SOURCES {
            let parser = parser_for(vendor).expect("Should have a parser for every source");
            assert_eq!(parser.vendor(), vendor);
        }
        assert!(parser_for(Vendor::Buildkite).is_none());
    }

    #[test]
    fn test_document_error_yields_zero_jobs_and_one_diagnostic() {
        let output = github::GithubParser.parse("jobs: [unclosed");
        assert!(output.graph.jobs.is_empty());
        assert_eq!(output.diagnostics.len(), 1);
        assert_eq!(
            output.diagnostics.iter().next().map(|d| d.kind),
            Some(DiagnosticKind::Document)
        );
    }

    #[test]
    fn test_id_allocator_suffixes_repeats() {
        let mut ids = IdAllocator::default();
        assert_eq!(ids.allocate("build"), "build");
        assert_eq!(ids.allocate("build"), "build-2");
        assert_eq!(ids.allocate("build"), "build-3");
        assert_eq!(ids.allocate("test"), "test");
    }

    #[test]
    fn test_consume_upstream_artifacts_is_transitive() {
        let mut build = JobNode::new("build", "build");
        build.artifacts.produces.push("dist".to_string());
        let gate = JobNode::new("gate", "gate").depending_on("build");
        let deploy = JobNode::new("deploy", "deploy").depending_on("gate");
        let mut jobs = vec![build, gate, deploy];

        consume_upstream_artifacts(&mut jobs, &[2]);
        assert_eq!(jobs[2].artifacts.consumes, vec!["build"]);
        assert!(jobs[1].artifacts.consumes.is_empty(), "Should only touch listed consumers");
    }

    #[test]
    fn test_job_id_falls_back_to_step_label() {
        assert_eq!(job_id("Unit Tests", 0), "unit-tests");
        assert_eq!(job_id("!!!", 2), "step-3");
    }
}
