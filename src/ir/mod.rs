//! Canonical, vendor-neutral pipeline model.

pub mod cache;
pub mod condition;
pub mod directive;
pub mod feature;
pub mod graph;
pub mod job;
pub mod matrix;
pub mod validation;

pub use cache::{CacheKey, CacheKeyComponent, CacheLevel, CacheSpec};
pub use condition::{BranchFilter, CompareOp, Conditional, RunWhen, TriggerEvent};
pub use directive::{ArtifactDownload, Directive};
pub use feature::{Confidence, FeatureKind, FeatureScope, Note};
pub use graph::{PipelineGraph, Schedule, Trigger};
pub use job::{
    strip_version_pin, ApprovalGate, Artifacts, ConcurrencyGroup, Container, Dependency, JobKind,
    JobNode, RetryCondition, RetryPolicy, Service, TemplateResidue, Unsupported,
};
pub use matrix::{
    combination_suffix, matrix_token, substitute, Adjustment, Combination, MatrixLimits, MatrixSpec,
};
pub use validation::{GraphValidator, StructuralIssue};

/// Lowercases `text` and turns it into a step-key-safe identifier.
///
/// Runs of characters other than ASCII alphanumerics, `-` and `_` collapse
/// into a single `-`; leading and trailing separators are dropped.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}
