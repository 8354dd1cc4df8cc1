//! Applicability predicates of translation rules.
//!
//! A predicate is a set of optional tests; every test that is present must
//! hold. Tests look only at the job and the target profile, never at vendor
//! names.

use serde::{Deserialize, Serialize};

use super::TargetProfile;
use crate::ir::{CacheKeyComponent, Conditional, JobNode, RetryCondition, RunWhen};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Predicate {
    /// The matrix fits the target's native matrix construct
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matrix_fits_native: Option<bool>,
    /// The approval was inferred rather than declared
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_inferred: Option<bool>,
    /// The job's execution-status condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunWhen>,
    /// Retry attempts and conditions are expressible on the target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_fits: Option<bool>,
    /// Every cache key level is supported and the fallback chain is expressible
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_fits: Option<bool>,
    /// Branch patterns are plain globs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_globs: Option<bool>,
}

impl Predicate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn matches(&self, job: &JobNode, profile: &TargetProfile) -> bool {
        let test = |expected: Option<bool>, actual: &dyn Fn() -> bool| expected.map_or(true, |e| e == actual());

        test(self.matrix_fits_native, &|| matrix_fits_native(job, profile))
            && test(self.approval_inferred, &|| job.approval.as_ref().is_some_and(|a| a.inferred))
            && self.status.map_or(true, |when| status(job) == Some(when))
            && test(self.retry_fits, &|| retry_fits(job, profile))
            && test(self.cache_fits, &|| cache_fits(job, profile))
            && test(self.branch_globs, &|| branch_globs(job))
    }

    /// Short human-readable form for rule listings.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        let mut flag = |name: &str, value: Option<bool>| {
            if let Some(value) = value {
                parts.push(if value { name.to_string() } else { format!("not {name}") });
            }
        };
        flag("matrix-fits-native", self.matrix_fits_native);
        flag("approval-inferred", self.approval_inferred);
        flag("retry-fits", self.retry_fits);
        flag("cache-fits", self.cache_fits);
        flag("branch-globs", self.branch_globs);
        if let Some(when) = self.status {
            parts.push(format!("status {}", when.id()));
        }
        parts.join(", ")
    }
}

fn matrix_fits_native(job: &JobNode, profile: &TargetProfile) -> bool {
    profile.native_matrix
        && job
            .matrix
            .as_ref()
            .is_some_and(|m| m.check_limits(&profile.matrix_limits, true).is_ok())
}

fn status(job: &JobNode) -> Option<RunWhen> {
    job.conditionals.iter().find_map(|c| match c {
        Conditional::Status { when } => Some(*when),
        _ => None,
    })
}

fn retry_fits(job: &JobNode, profile: &TargetProfile) -> bool {
    job.retry.as_ref().is_some_and(|retry| {
        retry.max_attempts.saturating_sub(1) <= profile.max_retries
            && retry
                .conditions
                .iter()
                .all(|c| matches!(c, RetryCondition::ExitStatus(_) | RetryCondition::InfrastructureFailure))
    })
}

fn cache_fits(job: &JobNode, profile: &TargetProfile) -> bool {
    job.cache.as_ref().is_some_and(|cache| {
        let no_variables = cache
            .chain()
            .all(|key| !key.0.iter().any(|c| matches!(c, CacheKeyComponent::Variable(_))));
        let levels = cache.chain().all(|key| profile.supports_cache_level(key.level()));
        let fallback = cache.fallback.is_empty() || profile.cache_fallback;
        no_variables && levels && fallback
    })
}

fn branch_globs(job: &JobNode) -> bool {
    job.conditionals.iter().all(|c| match c {
        Conditional::Branches(filter) => filter
            .only
            .iter()
            .chain(filter.ignore.iter())
            .all(|p| !p.contains(['^', '$', '(', ')', '|', '+', '\\', ' '])),
        _ => true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CacheKey, CacheSpec, MatrixSpec, RetryPolicy};
    use crate::rules::RuleRegistry;

    fn profile() -> TargetProfile {
        RuleRegistry::builtin().expect("Should load built-in registry").profile().clone()
    }

    #[test]
    fn test_empty_predicate_matches_everything() {
        let predicate = Predicate::default();
        assert!(predicate.is_empty());
        assert!(predicate.matches(&JobNode::new("a", "a"), &profile()));
    }

    #[test]
    fn test_matrix_fits_native() {
        let mut job = JobNode::new("a", "a");
        job.matrix = Some(MatrixSpec::new().with_dimension("os", vec!["linux".to_string(), "macos".to_string()]));
        let predicate = Predicate {
            matrix_fits_native: Some(true),
            ..Predicate::default()
        };
        let mut profile = profile();
        assert!(predicate.matches(&job, &profile));
        profile.native_matrix = false;
        assert!(!predicate.matches(&job, &profile), "Should not fit when native matrix is disabled");
    }

    #[test]
    fn test_retry_fits() {
        let mut job = JobNode::new("a", "a");
        job.retry = Some(RetryPolicy {
            max_attempts: 3,
            conditions: vec![RetryCondition::InfrastructureFailure],
        });
        let predicate = Predicate {
            retry_fits: Some(true),
            ..Predicate::default()
        };
        assert!(predicate.matches(&job, &profile()));
        job.retry = Some(RetryPolicy {
            max_attempts: 30,
            conditions: Vec::new(),
        });
        assert!(!predicate.matches(&job, &profile()), "Should not fit above the retry cap");
    }

    #[test]
    fn test_cache_with_variable_does_not_fit() {
        let mut job = JobNode::new("a", "a");
        job.cache = Some(CacheSpec {
            key: CacheKey(vec![CacheKeyComponent::Variable("RUNNER_OS".to_string())]),
            paths: vec!["target".to_string()],
            fallback: Vec::new(),
        });
        let predicate = Predicate {
            cache_fits: Some(false),
            ..Predicate::default()
        };
        assert!(predicate.matches(&job, &profile()));
    }

    #[test]
    fn test_branch_globs() {
        let mut job = JobNode::new("a", "a");
        job.conditionals.push(Conditional::only_branches(vec!["release/*".to_string()]));
        assert!(branch_globs(&job));
        job.conditionals.push(Conditional::ignore_branches(vec!["^wip-.*$".to_string()]));
        assert!(!branch_globs(&job));
    }
}
