use serde::{Deserialize, Serialize};

use super::FeatureKind;

/// A boolean predicate over the build context. A job runs only when all of
/// its conditionals hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum Conditional {
    Branches(BranchFilter),
    /// Tag glob patterns; the build must be for a matching tag
    Tags { patterns: Vec<String> },
    /// Build must have been triggered by one of these events
    Event { events: Vec<TriggerEvent> },
    Variable { name: String, op: CompareOp, value: String },
    /// Paths whose change triggers the job
    Changes { paths: Vec<String> },
    Status { when: RunWhen },
    /// Source expression with no structured equivalent
    Expression { source: String },
    /// A condition on one step that cannot be lifted to the job
    StepGuard { step: String, source: String },
}

/// Only/ignore branch patterns.
///
/// When a branch matches both lists, `ignore` wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub only: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerEvent {
    Push,
    PullRequest,
    Tag,
    Schedule,
    Manual,
    Api,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompareOp {
    Eq,
    Ne,
    Matches,
    NotMatches,
}

/// When a job runs relative to the outcome of its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunWhen {
    OnSuccess,
    OnFailure,
    Always,
}

impl Conditional {
    pub fn only_branches(patterns: Vec<String>) -> Self {
        Self::Branches(BranchFilter {
            only: patterns,
            ignore: Vec::new(),
        })
    }

    pub fn ignore_branches(patterns: Vec<String>) -> Self {
        Self::Branches(BranchFilter {
            only: Vec::new(),
            ignore: patterns,
        })
    }

    /// Feature slot this conditional populates.
    pub fn feature(&self) -> Option<FeatureKind> {
        match self {
            Self::Branches(_) => Some(FeatureKind::ConditionalBranchFilter),
            Self::Tags { .. } | Self::Event { .. } | Self::Variable { .. } => {
                Some(FeatureKind::ConditionalPredicate)
            }
            Self::Expression { .. } | Self::StepGuard { .. } => {
                Some(FeatureKind::ConditionalExpression)
            }
            Self::Changes { .. } => Some(FeatureKind::ChangesetFilter),
            Self::Status { when: RunWhen::OnSuccess } => None,
            Self::Status { .. } => Some(FeatureKind::ExecutionStatus),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Branches(filter) => filter.describe(),
            Self::Tags { patterns } => format!("tags: {}", patterns.join(", ")),
            Self::Event { events } => format!(
                "events: {}",
                events.iter().map(|e| e.id()).collect::<Vec<_>>().join(", ")
            ),
            Self::Variable { name, op, value } => format!("{name} {} {value}", op.symbol()),
            Self::Changes { paths } => format!("changes: {}", paths.join(", ")),
            Self::Status { when } => format!("run when: {}", when.id()),
            Self::Expression { source } => format!("if: {source}"),
            Self::StepGuard { step, source } => format!("step '{step}' if: {source}"),
        }
    }
}

impl BranchFilter {
    /// Resolves only/ignore overlap with ignore-wins precedence.
    ///
    /// Returns the normalized filter and the patterns that were removed from
    /// `only` because they were also ignored.
    pub fn normalized(&self) -> (BranchFilter, Vec<String>) {
        let mut conflicts = Vec::new();
        let only = self
            .only
            .iter()
            .filter(|pattern| {
                let ignored = self.ignore.contains(pattern);
                if ignored {
                    conflicts.push((*pattern).clone());
                }
                !ignored
            })
            .cloned()
            .collect();

        (
            BranchFilter {
                only,
                ignore: self.ignore.clone(),
            },
            conflicts,
        )
    }

    pub fn is_empty(&self) -> bool {
        self.only.is_empty() && self.ignore.is_empty()
    }

    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if !self.only.is_empty() {
            parts.push(format!("only branches {}", self.only.join(", ")));
        }
        if !self.ignore.is_empty() {
            parts.push(format!("ignore branches {}", self.ignore.join(", ")));
        }
        parts.join("; ")
    }
}

impl TriggerEvent {
    pub fn id(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::PullRequest => "pull-request",
            Self::Tag => "tag",
            Self::Schedule => "schedule",
            Self::Manual => "manual",
            Self::Api => "api",
        }
    }
}

impl CompareOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Matches => "=~",
            Self::NotMatches => "!~",
        }
    }
}

impl RunWhen {
    pub fn id(self) -> &'static str {
        match self {
            Self::OnSuccess => "on-success",
            Self::OnFailure => "on-failure",
            Self::Always => "always",
        }
    }
}
