use serde::{Deserialize, Serialize};

/// A translatable feature slot of a job or of the pipeline.
///
/// Declaration order is the order in which the rule engine visits the slots
/// of one job, so rule application inside a job is fully ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeatureKind {
    Matrix,
    Container,
    ServiceContainer,
    Caching,
    ArtifactPassthrough,
    ConditionalBranchFilter,
    ConditionalPredicate,
    ConditionalExpression,
    ChangesetFilter,
    ExecutionStatus,
    ManualApproval,
    SecretScope,
    ExecutorSizing,
    Retry,
    Timeout,
    SoftFail,
    Concurrency,
    Parallelism,
    ExternalAction,
    ReusableTemplate,
    JobOutputs,
    PostHook,
    ScheduledTrigger,
    TriggerFilter,
    GlobalEnvironment,
    GlobalTimeout,
}

/// Whether a feature lives on a job or on the pipeline as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureScope {
    Job,
    Pipeline,
}

impl FeatureKind {
    pub const ALL: [FeatureKind; 26] = [
        FeatureKind::Matrix,
        FeatureKind::Container,
        FeatureKind::ServiceContainer,
        FeatureKind::Caching,
        FeatureKind::ArtifactPassthrough,
        FeatureKind::ConditionalBranchFilter,
        FeatureKind::ConditionalPredicate,
        FeatureKind::ConditionalExpression,
        FeatureKind::ChangesetFilter,
        FeatureKind::ExecutionStatus,
        FeatureKind::ManualApproval,
        FeatureKind::SecretScope,
        FeatureKind::ExecutorSizing,
        FeatureKind::Retry,
        FeatureKind::Timeout,
        FeatureKind::SoftFail,
        FeatureKind::Concurrency,
        FeatureKind::Parallelism,
        FeatureKind::ExternalAction,
        FeatureKind::ReusableTemplate,
        FeatureKind::JobOutputs,
        FeatureKind::PostHook,
        FeatureKind::ScheduledTrigger,
        FeatureKind::TriggerFilter,
        FeatureKind::GlobalEnvironment,
        FeatureKind::GlobalTimeout,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Self::Matrix => "matrix",
            Self::Container => "container",
            Self::ServiceContainer => "service-container",
            Self::Caching => "caching",
            Self::ArtifactPassthrough => "artifact-passthrough",
            Self::ConditionalBranchFilter => "conditional-branch-filter",
            Self::ConditionalPredicate => "conditional-predicate",
            Self::ConditionalExpression => "conditional-expression",
            Self::ChangesetFilter => "changeset-filter",
            Self::ExecutionStatus => "execution-status",
            Self::ManualApproval => "manual-approval",
            Self::SecretScope => "secret-scope",
            Self::ExecutorSizing => "executor-sizing",
            Self::Retry => "retry",
            Self::Timeout => "timeout",
            Self::SoftFail => "soft-fail",
            Self::Concurrency => "concurrency",
            Self::Parallelism => "parallelism",
            Self::ExternalAction => "external-action",
            Self::ReusableTemplate => "reusable-template",
            Self::JobOutputs => "job-outputs",
            Self::PostHook => "post-hook",
            Self::ScheduledTrigger => "scheduled-trigger",
            Self::TriggerFilter => "trigger-filter",
            Self::GlobalEnvironment => "global-environment",
            Self::GlobalTimeout => "global-timeout",
        }
    }

    pub fn scope(self) -> FeatureScope {
        match self {
            Self::ScheduledTrigger
            | Self::TriggerFilter
            | Self::GlobalEnvironment
            | Self::GlobalTimeout => FeatureScope::Pipeline,
            _ => FeatureScope::Job,
        }
    }
}

impl std::fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Fidelity of a translation rule.
///
/// Ordered so that `Native > Approximate > Manual`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// No target equivalent; only a placeholder comment is emitted
    Manual,
    /// Behavior preserved with caveats
    Approximate,
    /// Exact semantic equivalent
    Native,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Native => "native",
            Self::Approximate => "approximate",
            Self::Manual => "manual",
        })
    }
}

/// Intent of a degraded feature, rendered as a comment on the nearest job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub feature: FeatureKind,
    pub confidence: Confidence,
    /// What the source asked for, in structured form
    pub intent: String,
    /// Manual configuration step, when one exists
    pub instruction: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_ordering() {
        assert!(Confidence::Native > Confidence::Approximate);
        assert!(Confidence::Approximate > Confidence::Manual);
    }

    #[test]
    fn test_feature_ids_are_unique() {
        let mut ids: Vec<&str> = FeatureKind::ALL.iter().map(|f| f.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), FeatureKind::ALL.len(), "Should have one id per feature");
    }

    #[test]
    fn test_feature_serde_matches_id() {
        for feature in FeatureKind::ALL {
            let json = serde_json::to_string(&feature).unwrap();
            assert_eq!(json, format!("\"{}\"", feature.id()));
        }
    }

    #[test]
    fn test_pipeline_scoped_features() {
        assert_eq!(FeatureKind::ScheduledTrigger.scope(), FeatureScope::Pipeline);
        assert_eq!(FeatureKind::Caching.scope(), FeatureScope::Job);
    }
}
