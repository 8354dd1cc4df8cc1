//! Transform functions of translation rules.
//!
//! Transforms turn a populated feature slot into target [`Directive`]s. They
//! are a closed set named in registry data; the engine calls them without
//! knowing which vendor the job came from.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::TargetProfile;
use crate::ir::{
    slugify, ArtifactDownload, BranchFilter, CacheKeyComponent, CacheLevel, CompareOp, Conditional, Directive,
    FeatureKind, JobNode, RetryCondition, RunWhen, TriggerEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transform {
    ContainerPlugin,
    NativeMatrix,
    ExpandMatrix,
    CachePlugin,
    ArtifactSteps,
    BranchFilter,
    /// Branch filters rendered as an `if` expression
    BranchCondition,
    IfCondition,
    IfChanged,
    AllowDependencyFailure,
    RunOnFailure,
    BlockStep,
    StepSecrets,
    AgentQueue,
    AutomaticRetry,
    StepTimeout,
    SoftFail,
    ConcurrencyGroup,
    Parallelism,
    ExitTrap,
    PipelineEnvironment,
    /// Keep the intent as a comment only
    Note,
}

/// What a job transform asks the engine to do beyond attaching directives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Applied,
    /// Insert an approval gate in front of the job
    InsertApprovalGate,
}

/// Read-only inputs shared by every job transform of one translation.
pub struct TransformContext<'a> {
    pub profile: &'a TargetProfile,
    /// Artifact paths by producing job id
    pub producers: &'a HashMap<String, Vec<String>>,
}

impl Transform {
    pub fn id(self) -> &'static str {
        match self {
            Self::ContainerPlugin => "container-plugin",
            Self::NativeMatrix => "native-matrix",
            Self::ExpandMatrix => "expand-matrix",
            Self::CachePlugin => "cache-plugin",
            Self::ArtifactSteps => "artifact-steps",
            Self::BranchFilter => "branch-filter",
            Self::BranchCondition => "branch-condition",
            Self::IfCondition => "if-condition",
            Self::IfChanged => "if-changed",
            Self::AllowDependencyFailure => "allow-dependency-failure",
            Self::RunOnFailure => "run-on-failure",
            Self::BlockStep => "block-step",
            Self::StepSecrets => "step-secrets",
            Self::AgentQueue => "agent-queue",
            Self::AutomaticRetry => "automatic-retry",
            Self::StepTimeout => "step-timeout",
            Self::SoftFail => "soft-fail",
            Self::ConcurrencyGroup => "concurrency-group",
            Self::Parallelism => "parallelism",
            Self::ExitTrap => "exit-trap",
            Self::PipelineEnvironment => "pipeline-environment",
            Self::Note => "note",
        }
    }

    /// Whether this transform can handle `feature`.
    pub fn supports(self, feature: FeatureKind) -> bool {
        use FeatureKind as F;
        match self {
            Self::Note => true,
            Self::ContainerPlugin => feature == F::Container,
            Self::NativeMatrix | Self::ExpandMatrix => feature == F::Matrix,
            Self::CachePlugin => feature == F::Caching,
            Self::ArtifactSteps => feature == F::ArtifactPassthrough,
            Self::BranchFilter | Self::BranchCondition => feature == F::ConditionalBranchFilter,
            Self::IfCondition => feature == F::ConditionalPredicate,
            Self::IfChanged => feature == F::ChangesetFilter,
            Self::AllowDependencyFailure | Self::RunOnFailure => feature == F::ExecutionStatus,
            Self::BlockStep => feature == F::ManualApproval,
            Self::StepSecrets => feature == F::SecretScope,
            Self::AgentQueue => feature == F::ExecutorSizing,
            Self::AutomaticRetry => feature == F::Retry,
            Self::StepTimeout => feature == F::Timeout,
            Self::SoftFail => feature == F::SoftFail,
            Self::ConcurrencyGroup => feature == F::Concurrency,
            Self::Parallelism => feature == F::Parallelism,
            Self::ExitTrap => feature == F::PostHook,
            Self::PipelineEnvironment => feature == F::GlobalEnvironment,
        }
    }

    /// Applies a job-level transform.
    ///
    /// Matrix transforms are structural and handled by the engine's matrix
    /// stage; here they do nothing.
    pub fn apply(self, job: &mut JobNode, context: &TransformContext<'_>) -> Effect {
        let directives: Vec<Directive> = match self {
            Self::Note | Self::NativeMatrix | Self::ExpandMatrix | Self::PipelineEnvironment => Vec::new(),
            Self::BlockStep => return Effect::InsertApprovalGate,
            Self::ContainerPlugin => job
                .container
                .iter()
                .map(|c| Directive::Container {
                    image: c.image.clone(),
                    workdir: c.workdir.clone(),
                    shell: c.shell.clone(),
                })
                .collect(),
            Self::CachePlugin => cache_directive(job, context.profile).into_iter().collect(),
            Self::ArtifactSteps => artifact_directives(job, context.producers),
            Self::BranchFilter => {
                let patterns = branch_patterns(job);
                if patterns.is_empty() {
                    Vec::new()
                } else {
                    vec![Directive::Branches { patterns }]
                }
            }
            Self::BranchCondition => {
                let clauses: Vec<String> = job
                    .conditionals
                    .iter()
                    .filter(|c| matches!(c, Conditional::Branches(_)))
                    .filter_map(render_condition)
                    .collect();
                if clauses.is_empty() {
                    Vec::new()
                } else {
                    vec![Directive::If {
                        expression: join_and(&clauses),
                    }]
                }
            }
            Self::IfCondition => {
                let clauses: Vec<String> = job
                    .conditionals
                    .iter()
                    .filter(|c| c.feature() == Some(FeatureKind::ConditionalPredicate))
                    .filter_map(render_condition)
                    .collect();
                if clauses.is_empty() {
                    Vec::new()
                } else {
                    vec![Directive::If {
                        expression: join_and(&clauses),
                    }]
                }
            }
            Self::IfChanged => {
                let paths: Vec<String> = job
                    .conditionals
                    .iter()
                    .flat_map(|c| match c {
                        Conditional::Changes { paths } => paths.clone(),
                        _ => Vec::new(),
                    })
                    .collect();
                vec![Directive::IfChanged { paths }]
            }
            Self::AllowDependencyFailure => vec![Directive::AllowDependencyFailure],
            Self::RunOnFailure => vec![
                Directive::AllowDependencyFailure,
                Directive::If {
                    expression: "build.state == \"failing\"".to_string(),
                },
            ],
            Self::StepSecrets => vec![Directive::Secrets {
                names: job.secrets.clone(),
            }],
            Self::AgentQueue => job
                .resource_hint
                .iter()
                .map(|hint| Directive::AgentQueue { queue: slugify(hint) })
                .collect(),
            Self::AutomaticRetry => job
                .retry
                .as_ref()
                .map(|retry| Directive::Retry {
                    limit: context.profile.retry_limit(retry.max_attempts),
                    exit_statuses: exit_statuses(&retry.conditions),
                })
                .filter(|d| !matches!(d, Directive::Retry { limit: 0, .. }))
                .into_iter()
                .collect(),
            Self::StepTimeout => job
                .timeout_minutes
                .map(|minutes| Directive::Timeout { minutes })
                .into_iter()
                .collect(),
            Self::SoftFail => vec![Directive::SoftFail],
            Self::ConcurrencyGroup => job
                .concurrency
                .iter()
                .map(|c| Directive::Concurrency {
                    group: c.group.clone(),
                    limit: c.limit,
                })
                .collect(),
            Self::Parallelism => job
                .parallelism
                .map(|count| Directive::Parallelism { count })
                .into_iter()
                .collect(),
            Self::ExitTrap => {
                if !job.post_commands.is_empty() {
                    let body = job.post_commands.join("; ").replace('\'', "'\\''");
                    job.commands.insert(0, format!("trap '{body}' EXIT"));
                }
                Vec::new()
            }
        };
        job.directives.extend(directives);
        Effect::Applied
    }
}

fn cache_directive(job: &JobNode, profile: &TargetProfile) -> Option<Directive> {
    let cache = job.cache.as_ref()?;
    let has_variables = cache
        .chain()
        .any(|key| key.0.iter().any(|c| matches!(c, CacheKeyComponent::Variable(_))));

    let mut save = cache.save_level();
    // A key that varies by an unhashable value must not be shared more widely
    if has_variables && save > CacheLevel::Step {
        save = CacheLevel::Step;
    }
    let save = profile.cache_level_at_most(save).unwrap_or(save);
    let restore = profile
        .cache_level_at_most(cache.restore_level(profile.cache_fallback))
        .unwrap_or(save)
        .max(save);

    Some(Directive::Cache {
        manifest: cache.key.manifests().first().map(|m| (*m).to_string()),
        paths: cache.paths.clone(),
        save,
        restore,
    })
}

fn artifact_directives(job: &JobNode, producers: &HashMap<String, Vec<String>>) -> Vec<Directive> {
    let mut directives = Vec::new();
    if !job.artifacts.produces.is_empty() {
        directives.push(Directive::UploadArtifacts {
            paths: job.artifacts.produces.clone(),
        });
    }
    let downloads: Vec<ArtifactDownload> = job
        .artifacts
        .consumes
        .iter()
        .flat_map(|step| {
            producers
                .get(step)
                .into_iter()
                .flatten()
                .map(move |path| ArtifactDownload {
                    step: step.clone(),
                    path: path.clone(),
                })
        })
        .collect();
    if !downloads.is_empty() {
        directives.push(Directive::DownloadArtifacts { downloads });
    }
    directives
}

/// Space-separated branch patterns; ignored patterns carry a `!` prefix.
fn branch_patterns(job: &JobNode) -> String {
    let mut merged = BranchFilter::default();
    for conditional in &job.conditionals {
        if let Conditional::Branches(filter) = conditional {
            merged.only.extend(filter.only.iter().cloned());
            merged.ignore.extend(filter.ignore.iter().cloned());
        }
    }
    let (filter, conflicts) = merged.normalized();
    if !conflicts.is_empty() {
        log::debug!("job {}: ignored branches override only filter: {}", job.id, conflicts.join(", "));
    }
    filter
        .only
        .iter()
        .cloned()
        .chain(filter.ignore.iter().map(|p| format!("!{p}")))
        .collect::<Vec<_>>()
        .join(" ")
}

fn exit_statuses(conditions: &[RetryCondition]) -> Vec<String> {
    let mut statuses: Vec<String> = conditions
        .iter()
        .map(|c| match c {
            RetryCondition::ExitStatus(code) => code.to_string(),
            // Lost agents exit with -1
            RetryCondition::InfrastructureFailure => "-1".to_string(),
            RetryCondition::Timeout | RetryCondition::Other(_) => "*".to_string(),
        })
        .collect();
    if statuses.is_empty() || statuses.iter().any(|s| s == "*") {
        statuses = vec!["*".to_string()];
    }
    statuses.dedup();
    statuses
}

/// Joins clauses with `&&`, parenthesizing clauses that contain `||`.
pub fn join_and(clauses: &[String]) -> String {
    if clauses.len() == 1 {
        return clauses[0].clone();
    }
    clauses
        .iter()
        .map(|c| if c.contains("||") { format!("({c})") } else { c.clone() })
        .collect::<Vec<_>>()
        .join(" && ")
}

fn join_or(clauses: Vec<String>) -> String {
    clauses.join(" || ")
}

/// Renders a structured condition in the target's `if` language.
///
/// Returns `None` for conditions that have no expression form.
pub fn render_condition(conditional: &Conditional) -> Option<String> {
    match conditional {
        Conditional::Tags { patterns } => Some(join_or(
            patterns
                .iter()
                .map(|p| {
                    if p == "*" {
                        "build.tag != null".to_string()
                    } else {
                        format!("build.tag =~ /{}/", glob_to_regex(p))
                    }
                })
                .collect(),
        )),
        Conditional::Event { events } => Some(join_or(events.iter().map(|e| event_expression(*e)).collect())),
        Conditional::Variable { name, op, value } => {
            let lhs = variable_operand(name);
            Some(match op {
                CompareOp::Matches | CompareOp::NotMatches => {
                    let regex = if value.starts_with('/') && value.len() > 1 {
                        value.clone()
                    } else {
                        format!("/{value}/")
                    };
                    format!("{lhs} {} {regex}", op.symbol())
                }
                CompareOp::Eq | CompareOp::Ne if value.is_empty() => format!("{lhs} {} null", op.symbol()),
                CompareOp::Eq | CompareOp::Ne => {
                    let rhs = match value.strip_prefix('$') {
                        Some(reference) => variable_operand(reference.trim_start_matches('{').trim_end_matches('}')),
                        None => format!("\"{}\"", value.replace('"', "\\\"")),
                    };
                    format!("{lhs} {} {rhs}", op.symbol())
                }
            })
        }
        Conditional::Branches(filter) => {
            let (filter, _) = filter.normalized();
            let mut clauses = Vec::new();
            if !filter.only.is_empty() {
                clauses.push(join_or(
                    filter
                        .only
                        .iter()
                        .map(|p| format!("build.branch =~ /{}/", branch_regex(p)))
                        .collect(),
                ));
            }
            clauses.extend(
                filter
                    .ignore
                    .iter()
                    .map(|p| format!("build.branch !~ /{}/", branch_regex(p))),
            );
            (!clauses.is_empty()).then(|| join_and(&clauses))
        }
        Conditional::Status { when: RunWhen::OnFailure } => Some("build.state == \"failing\"".to_string()),
        Conditional::Status { .. }
        | Conditional::Changes { .. }
        | Conditional::Expression { .. }
        | Conditional::StepGuard { .. } => None,
    }
}

fn event_expression(event: TriggerEvent) -> String {
    match event {
        TriggerEvent::Push => "build.source == \"webhook\" && build.pull_request.id == null",
        TriggerEvent::PullRequest => "build.pull_request.id != null",
        TriggerEvent::Tag => "build.tag != null",
        TriggerEvent::Schedule => "build.source == \"schedule\"",
        TriggerEvent::Manual => "build.source == \"ui\"",
        TriggerEvent::Api => "build.source == \"api\"",
    }
    .to_string()
}

fn variable_operand(name: &str) -> String {
    match name {
        "BUILDKITE_BRANCH" => "build.branch".to_string(),
        "BUILDKITE_TAG" => "build.tag".to_string(),
        "BUILDKITE_COMMIT" => "build.commit".to_string(),
        "BUILDKITE_MESSAGE" => "build.message".to_string(),
        "BUILDKITE_SOURCE" => "build.source".to_string(),
        "BUILDKITE_PULL_REQUEST" => "build.pull_request.id".to_string(),
        "BUILDKITE_PIPELINE_DEFAULT_BRANCH" => "pipeline.default_branch".to_string(),
        other => format!("build.env(\"{other}\")"),
    }
}

/// Regex for a branch pattern: globs are translated, anything that already
/// looks like a regex is kept as written.
fn branch_regex(pattern: &str) -> String {
    let trimmed = pattern.trim_matches('/');
    if pattern.contains(['^', '$', '(', ')', '|', '+', '\\']) {
        trimmed.replace('/', "\\/")
    } else {
        glob_to_regex(pattern)
    }
}

/// Anchored regex for a branch or tag glob. `**` and `*` both match any run
/// of characters.
pub fn glob_to_regex(glob: &str) -> String {
    let mut regex = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                while chars.peek() == Some(&'*') {
                    chars.next();
                }
                regex.push_str(".*");
            }
            '?' => regex.push('.'),
            '/' => regex.push_str("\\/"),
            c if "\\.+()|[]{}^$".contains(c) => {
                regex.push('\\');
                regex.push(c);
            }
            c => regex.push(c),
        }
    }
    regex.push('$');
    regex
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CacheKey, CacheSpec, RetryPolicy};
    use crate::rules::RuleRegistry;

    fn apply(transform: Transform, job: &mut JobNode) -> Effect {
        let registry = RuleRegistry::builtin().expect("Should load built-in registry");
        let producers = HashMap::from([("build".to_string(), vec!["dist/**".to_string()])]);
        let context = TransformContext {
            profile: registry.profile(),
            producers: &producers,
        };
        transform.apply(job, &context)
    }

    #[test]
    fn test_supports_matches_feature() {
        assert!(Transform::CachePlugin.supports(FeatureKind::Caching));
        assert!(!Transform::CachePlugin.supports(FeatureKind::Matrix));
        assert!(Transform::Note.supports(FeatureKind::GlobalTimeout));
    }

    #[cfg(test)]
    mod cache_plugin {
        use super::*;

        #[test]
        fn saves_at_most_specific_level() {
            let mut job = JobNode::new("a", "a");
            job.cache = Some(CacheSpec {
                key: CacheKey(vec![
                    CacheKeyComponent::Literal("v1-deps-".to_string()),
                    CacheKeyComponent::FileHash(vec!["package-lock.json".to_string()]),
                ]),
                paths: vec!["node_modules".to_string()],
                fallback: vec![CacheKey::literal("v1-deps-")],
            });
            apply(Transform::CachePlugin, &mut job);
            assert_eq!(
                job.directives,
                vec![Directive::Cache {
                    manifest: Some("package-lock.json".to_string()),
                    paths: vec!["node_modules".to_string()],
                    save: CacheLevel::File,
                    restore: CacheLevel::Pipeline,
                }]
            );
        }

        #[test]
        fn variable_keys_stay_step_scoped() {
            let mut job = JobNode::new("a", "a");
            job.cache = Some(CacheSpec {
                key: CacheKey(vec![CacheKeyComponent::Variable("RUNNER_OS".to_string())]),
                paths: vec!["target".to_string()],
                fallback: Vec::new(),
            });
            apply(Transform::CachePlugin, &mut job);
            assert!(matches!(
                job.directives[0],
                Directive::Cache {
                    save: CacheLevel::Step,
                    ..
                }
            ));
        }
    }

    #[test]
    fn test_artifacts_download_from_producers() {
        let mut job = JobNode::new("test", "test");
        job.artifacts.consumes.push("build".to_string());
        apply(Transform::ArtifactSteps, &mut job);
        assert_eq!(
            job.directives,
            vec![Directive::DownloadArtifacts {
                downloads: vec![ArtifactDownload {
                    step: "build".to_string(),
                    path: "dist/**".to_string(),
                }]
            }]
        );
    }

    #[test]
    fn test_branch_filter_ignore_wins() {
        let mut job = JobNode::new("a", "a");
        job.conditionals.push(Conditional::Branches(BranchFilter {
            only: vec!["main".to_string(), "release/*".to_string()],
            ignore: vec!["main".to_string()],
        }));
        apply(Transform::BranchFilter, &mut job);
        assert_eq!(
            job.directives,
            vec![Directive::Branches {
                patterns: "release/* !main".to_string()
            }]
        );
    }

    #[test]
    fn test_branch_condition_keeps_regex() {
        let mut job = JobNode::new("a", "a");
        job.conditionals.push(Conditional::ignore_branches(vec!["^wip-.*$".to_string()]));
        apply(Transform::BranchCondition, &mut job);
        assert_eq!(
            job.directives,
            vec![Directive::If {
                expression: "build.branch !~ /^wip-.*$/".to_string()
            }]
        );
    }

    #[test]
    fn test_retry_limit_and_statuses() {
        let mut job = JobNode::new("a", "a");
        job.retry = Some(RetryPolicy {
            max_attempts: 3,
            conditions: vec![RetryCondition::InfrastructureFailure],
        });
        apply(Transform::AutomaticRetry, &mut job);
        assert_eq!(
            job.directives,
            vec![Directive::Retry {
                limit: 2,
                exit_statuses: vec!["-1".to_string()]
            }]
        );
    }

    #[test]
    fn test_exit_trap_runs_post_commands() {
        let mut job = JobNode::new("a", "a").with_command("make");
        job.post_commands.push("echo 'done'".to_string());
        apply(Transform::ExitTrap, &mut job);
        assert_eq!(job.commands[0], "trap 'echo '\\''done'\\''' EXIT");
    }

    #[test]
    fn test_block_step_requests_gate() {
        let mut job = JobNode::new("a", "a");
        assert_eq!(apply(Transform::BlockStep, &mut job), Effect::InsertApprovalGate);
        assert!(job.directives.is_empty());
    }

    #[cfg(test)]
    mod render_condition {
        use super::*;

        #[test]
        fn events() {
            let condition = Conditional::Event {
                events: vec![TriggerEvent::Schedule, TriggerEvent::Manual],
            };
            assert_eq!(
                render_condition(&condition).as_deref(),
                Some("build.source == \"schedule\" || build.source == \"ui\"")
            );
        }

        #[test]
        fn variables() {
            let condition = Conditional::Variable {
                name: "BUILDKITE_BRANCH".to_string(),
                op: CompareOp::Eq,
                value: "$BUILDKITE_PIPELINE_DEFAULT_BRANCH".to_string(),
            };
            assert_eq!(
                render_condition(&condition).as_deref(),
                Some("build.branch == pipeline.default_branch")
            );
            let presence = Conditional::Variable {
                name: "DEPLOY".to_string(),
                op: CompareOp::Ne,
                value: String::new(),
            };
            assert_eq!(render_condition(&presence).as_deref(), Some("build.env(\"DEPLOY\") != null"));
        }

        #[test]
        fn tags() {
            let condition = Conditional::Tags {
                patterns: vec!["v*".to_string()],
            };
            assert_eq!(render_condition(&condition).as_deref(), Some("build.tag =~ /^v.*$/"));
        }
    }

    #[test]
    fn test_glob_to_regex() {
        assert_eq!(glob_to_regex("release/**"), "^release\\/.*$");
        assert_eq!(glob_to_regex("v1.2"), "^v1\\.2$");
    }
}
