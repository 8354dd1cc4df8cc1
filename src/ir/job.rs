use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::diagnostics::DiagnosticId;

use super::{CacheSpec, Conditional, Directive, FeatureKind, MatrixSpec, Note};

/// What kind of unit a job is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum JobKind {
    /// Runs commands
    #[default]
    Command,
    /// Manual approval gate; has no commands
    Approval { prompt: Option<String> },
    /// Matrix template materialized into the listed jobs; never emitted
    Expanded { into: Vec<String> },
}

/// A dependency edge to another job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub job: String,
    /// Run even when the dependency fails
    #[serde(default)]
    pub allow_failure: bool,
}

/// Container the job's commands run in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub image: String,
    pub workdir: Option<String>,
    /// Shell invocation style, e.g. `["bash", "-eo", "pipefail", "-c"]`
    pub shell: Option<Vec<String>>,
}

/// A sidecar service container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub image: String,
}

/// Artifacts produced by this job and jobs whose artifacts it consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifacts {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub produces: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consumes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first run
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<RetryCondition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type", content = "value")]
pub enum RetryCondition {
    ExitStatus(i32),
    InfrastructureFailure,
    Timeout,
    Other(String),
}

/// The job waits for a human before running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalGate {
    pub prompt: Option<String>,
    /// Approval was inferred (e.g. from a protected environment) rather than declared
    #[serde(default)]
    pub inferred: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyGroup {
    pub group: String,
    pub limit: u32,
}

/// Reusable block that could not be resolved by substitution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateResidue {
    pub name: String,
    pub reason: String,
}

/// Marks a job replaced by a placeholder stub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unsupported {
    pub diagnostic: DiagnosticId,
    pub reason: String,
}

/// One unit of work in the canonical IR.
///
/// Every attribute is fully resolved: there is no inheritance from the
/// pipeline, so rules only ever look at the job itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobNode {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub kind: JobKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<Dependency>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    pub container: Option<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<Service>,
    pub matrix: Option<MatrixSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditionals: Vec<Conditional>,
    #[serde(default)]
    pub artifacts: Artifacts,
    pub cache: Option<CacheSpec>,
    pub resource_hint: Option<String>,
    pub timeout_minutes: Option<u32>,
    pub retry: Option<RetryPolicy>,
    pub approval: Option<ApprovalGate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub soft_fail: bool,
    pub concurrency: Option<ConcurrencyGroup>,
    pub parallelism: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_commands: Vec<String>,
    pub template: Option<TemplateResidue>,
    pub unsupported: Option<Unsupported>,
    /// Target constructs chosen by the rule engine
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub directives: Vec<Directive>,
    /// Degraded intent, rendered as comments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Note>,
}

impl JobNode {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            ..Self::default()
        }
    }

    /// Placeholder for a job that could not be lowered or translated.
    ///
    /// Keeps identity and edges so the rest of the graph stays intact.
    pub fn placeholder(
        id: impl Into<String>,
        label: impl Into<String>,
        depends_on: Vec<Dependency>,
        diagnostic: DiagnosticId,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            depends_on,
            unsupported: Some(Unsupported {
                diagnostic,
                reason: reason.into(),
            }),
            ..Self::new(id, label)
        }
    }

    /// Turns a lowered job into a placeholder stub in place.
    pub fn mark_unsupported(&mut self, diagnostic: DiagnosticId, reason: impl Into<String>) {
        let stub = Self::placeholder(
            self.id.clone(),
            self.label.clone(),
            std::mem::take(&mut self.depends_on),
            diagnostic,
            reason,
        );
        *self = stub;
    }

    pub fn is_unsupported(&self) -> bool {
        self.unsupported.is_some()
    }

    /// Whether the job appears in emitted output.
    pub fn is_emitted(&self) -> bool {
        !matches!(self.kind, JobKind::Expanded { .. })
    }

    pub fn is_approval(&self) -> bool {
        matches!(self.kind, JobKind::Approval { .. })
    }

    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    #[must_use]
    pub fn depending_on(mut self, job: impl Into<String>) -> Self {
        self.add_dependency(job, false);
        self
    }

    /// Adds an edge unless one to the same job already exists.
    pub fn add_dependency(&mut self, job: impl Into<String>, allow_failure: bool) {
        let job = job.into();
        if let Some(existing) = self.depends_on.iter_mut().find(|d| d.job == job) {
            existing.allow_failure |= allow_failure;
        } else {
            self.depends_on.push(Dependency { job, allow_failure });
        }
    }

    pub fn dependency_ids(&self) -> impl Iterator<Item = &str> {
        self.depends_on.iter().map(|d| d.job.as_str())
    }

    pub fn has_directive(&self, name: &str) -> bool {
        self.directives.iter().any(|d| d.name() == name)
    }

    /// Feature slots that carry a value, in engine visiting order.
    pub fn populated_features(&self) -> Vec<FeatureKind> {
        if self.is_unsupported() || !self.is_emitted() {
            return Vec::new();
        }

        let conditional_features: Vec<FeatureKind> =
            self.conditionals.iter().filter_map(Conditional::feature).collect();

        // Gates only carry the conditions under which they are shown
        if self.is_approval() {
            return FeatureKind::ALL
                .into_iter()
                .filter(|f| conditional_features.contains(f))
                .collect();
        }

        FeatureKind::ALL
            .into_iter()
            .filter(|feature| match feature {
                FeatureKind::Matrix => self.matrix.is_some(),
                FeatureKind::Container => self.container.is_some(),
                FeatureKind::ServiceContainer => !self.services.is_empty(),
                FeatureKind::Caching => self.cache.is_some(),
                FeatureKind::ArtifactPassthrough => {
                    !self.artifacts.produces.is_empty() || !self.artifacts.consumes.is_empty()
                }
                FeatureKind::ConditionalBranchFilter
                | FeatureKind::ConditionalPredicate
                | FeatureKind::ConditionalExpression
                | FeatureKind::ChangesetFilter
                | FeatureKind::ExecutionStatus => conditional_features.contains(feature),
                FeatureKind::ManualApproval => self.approval.is_some(),
                FeatureKind::SecretScope => !self.secrets.is_empty(),
                FeatureKind::ExecutorSizing => self.resource_hint.is_some(),
                FeatureKind::Retry => self.retry.is_some(),
                FeatureKind::Timeout => self.timeout_minutes.is_some(),
                FeatureKind::SoftFail => self.soft_fail,
                FeatureKind::Concurrency => self.concurrency.is_some(),
                FeatureKind::Parallelism => self.parallelism.is_some_and(|n| n > 1),
                FeatureKind::ExternalAction => !self.external_actions.is_empty(),
                FeatureKind::ReusableTemplate => self.template.is_some(),
                FeatureKind::JobOutputs => !self.outputs.is_empty(),
                FeatureKind::PostHook => !self.post_commands.is_empty(),
                FeatureKind::ScheduledTrigger
                | FeatureKind::TriggerFilter
                | FeatureKind::GlobalEnvironment
                | FeatureKind::GlobalTimeout => false,
            })
            .collect()
    }

    /// Structured summary of what the source asked for in one feature slot.
    pub fn describe_feature(&self, feature: FeatureKind) -> String {
        match feature {
            FeatureKind::Matrix => self.matrix.as_ref().map_or_else(String::new, |m| {
                m.dimensions
                    .iter()
                    .map(|(k, v)| format!("{k}=[{}]", v.join(", ")))
                    .collect::<Vec<_>>()
                    .join(" ")
            }),
            FeatureKind::Container => self
                .container
                .as_ref()
                .map_or_else(String::new, |c| format!("image {}", c.image)),
            FeatureKind::ServiceContainer => format!(
                "services {}",
                self.services
                    .iter()
                    .map(|s| format!("{}={}", s.name, s.image))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            FeatureKind::Caching => self.cache.as_ref().map_or_else(String::new, |c| {
                let chain: Vec<String> = c.chain().map(ToString::to_string).collect();
                format!("keys [{}] paths [{}]", chain.join(", "), c.paths.join(", "))
            }),
            FeatureKind::ArtifactPassthrough => format!(
                "produces [{}] consumes from [{}]",
                self.artifacts.produces.join(", "),
                self.artifacts.consumes.join(", ")
            ),
            FeatureKind::ConditionalBranchFilter
            | FeatureKind::ConditionalPredicate
            | FeatureKind::ConditionalExpression
            | FeatureKind::ChangesetFilter
            | FeatureKind::ExecutionStatus => self
                .conditionals
                .iter()
                .filter(|c| c.feature() == Some(feature))
                .map(Conditional::describe)
                .collect::<Vec<_>>()
                .join("; "),
            FeatureKind::ManualApproval => self.approval.as_ref().map_or_else(String::new, |a| {
                a.prompt
                    .clone()
                    .unwrap_or_else(|| "approval required before running".to_string())
            }),
            FeatureKind::SecretScope => format!("secrets {}", self.secrets.join(", ")),
            FeatureKind::ExecutorSizing => {
                format!("resource {}", self.resource_hint.as_deref().unwrap_or_default())
            }
            FeatureKind::Retry => self.retry.as_ref().map_or_else(String::new, |r| {
                format!("max attempts {}", r.max_attempts)
            }),
            FeatureKind::Timeout => format!("{} minutes", self.timeout_minutes.unwrap_or_default()),
            FeatureKind::SoftFail => "failure does not fail the build".to_string(),
            FeatureKind::Concurrency => self.concurrency.as_ref().map_or_else(String::new, |c| {
                format!("group {} limit {}", c.group, c.limit)
            }),
            FeatureKind::Parallelism => format!("{} parallel copies", self.parallelism.unwrap_or(1)),
            FeatureKind::ExternalAction => {
                let refs: Vec<&str> = self.external_actions.iter().map(|a| strip_version_pin(a)).collect();
                format!("uses {}", refs.join(", "))
            }
            FeatureKind::ReusableTemplate => self.template.as_ref().map_or_else(String::new, |t| {
                format!("template {} ({})", t.name, t.reason)
            }),
            FeatureKind::JobOutputs => format!("outputs {}", self.outputs.join(", ")),
            FeatureKind::PostHook => format!("after commands: {}", self.post_commands.join(" && ")),
            FeatureKind::ScheduledTrigger
            | FeatureKind::TriggerFilter
            | FeatureKind::GlobalEnvironment
            | FeatureKind::GlobalTimeout => String::new(),
        }
    }
}

/// Drops an `@v4` / `#v1.2` / `:1.0.0` version pin from a shared action,
/// orb, pipe or plugin reference.
pub fn strip_version_pin(reference: &str) -> &str {
    let cut = reference
        .rfind('@')
        .or_else(|| reference.rfind('#'))
        .or_else(|| {
            reference
                .rfind(':')
                .filter(|&i| reference[i + 1..].chars().next().is_some_and(|c| c.is_ascii_digit()))
        });
    cut.map_or(reference, |i| &reference[..i])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CacheKey, Conditional, RunWhen};

    #[cfg(test)]
    mod populated_features {
        use super::*;

        #[test]
        fn empty_job_has_no_features() {
            let job = JobNode::new("build", "Build").with_command("make");
            assert!(job.populated_features().is_empty());
        }

        #[test]
        fn follows_declared_feature_order() {
            let mut job = JobNode::new("build", "Build");
            job.timeout_minutes = Some(10);
            job.cache = Some(CacheSpec {
                key: CacheKey::literal("deps"),
                paths: vec!["vendor".to_string()],
                fallback: vec![],
            });
            job.conditionals.push(Conditional::only_branches(vec!["main".to_string()]));

            assert_eq!(
                job.populated_features(),
                vec![
                    FeatureKind::Caching,
                    FeatureKind::ConditionalBranchFilter,
                    FeatureKind::Timeout
                ]
            );
        }

        #[test]
        fn single_parallel_copy_is_not_a_feature() {
            let mut job = JobNode::new("test", "Test");
            job.parallelism = Some(1);
            assert!(job.populated_features().is_empty());
        }

        #[test]
        fn on_success_status_is_not_a_feature() {
            let mut job = JobNode::new("test", "Test");
            job.conditionals.push(Conditional::Status { when: RunWhen::OnSuccess });
            assert!(job.populated_features().is_empty());
        }

        #[test]
        fn placeholder_has_no_features() {
            let mut job = JobNode::placeholder(
                "broken",
                "broken",
                vec![],
                DiagnosticId(0),
                "parse error",
            );
            job.timeout_minutes = Some(5);
            assert!(job.populated_features().is_empty());
        }
    }

    #[test]
    fn test_add_dependency_deduplicates_and_merges_allow_failure() {
        let mut job = JobNode::new("deploy", "Deploy");
        job.add_dependency("test", false);
        job.add_dependency("test", true);

        assert_eq!(job.depends_on.len(), 1);
        assert!(job.depends_on[0].allow_failure);
    }

    #[test]
    fn test_mark_unsupported_keeps_identity_and_edges() {
        let mut job = JobNode::new("deploy", "Deploy")
            .with_command("./deploy.sh")
            .depending_on("test");
        job.mark_unsupported(DiagnosticId(3), "cycle");

        assert_eq!(job.id, "deploy");
        assert!(job.commands.is_empty(), "Should drop executable commands");
        assert_eq!(job.dependency_ids().collect::<Vec<_>>(), vec!["test"]);
        assert_eq!(job.unsupported.as_ref().map(|u| u.diagnostic), Some(DiagnosticId(3)));
    }

    #[cfg(test)]
    mod strip_version_pin {
        use super::*;

        #[test]
        fn strips_action_ref() {
            assert_eq!(strip_version_pin("actions/setup-node@v4"), "actions/setup-node");
        }

        #[test]
        fn strips_plugin_ref() {
            assert_eq!(strip_version_pin("docker#v5.9.0"), "docker");
        }

        #[test]
        fn strips_pipe_ref() {
            assert_eq!(strip_version_pin("atlassian/aws-s3-deploy:1.1.0"), "atlassian/aws-s3-deploy");
        }

        #[test]
        fn keeps_unpinned_ref() {
            assert_eq!(strip_version_pin("node/install-packages"), "node/install-packages");
        }

        #[test]
        fn keeps_image_tag_like_names() {
            assert_eq!(strip_version_pin("orb:latest"), "orb:latest");
        }
    }
}
