use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::{Directive, FeatureKind, JobNode, Note, TriggerEvent};

/// A cron schedule that starts the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub cron: String,
    pub branch: Option<String>,
}

/// An event filter on the pipeline as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub event: TriggerEvent,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
}

/// Root of the canonical IR.
///
/// Jobs are kept in source order, which is the emission order. Dependency
/// edges are the only ordering guarantee.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineGraph {
    pub name: Option<String>,
    pub jobs: Vec<JobNode>,
    /// Pipeline-wide environment; also pushed down into every job by parsers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    pub timeout_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schedules: Vec<Schedule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<Trigger>,
    /// Unrecognized top-level keys of the source document
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub extensions: IndexMap<String, serde_yaml::Value>,
    /// Pipeline-level target constructs chosen by the rule engine
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub directives: Vec<Directive>,
    /// Pipeline-level notes when no job survives to carry them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Note>,
}

impl PipelineGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(&self, id: &str) -> Option<&JobNode> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn job_mut(&mut self, id: &str) -> Option<&mut JobNode> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.job(id).is_some()
    }

    /// Jobs that appear in emitted output, in order.
    pub fn emitted_jobs(&self) -> impl Iterator<Item = &JobNode> {
        self.jobs.iter().filter(|j| j.is_emitted())
    }

    /// Ids of jobs that depend on `id`.
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        self.jobs
            .iter()
            .filter(|j| j.dependency_ids().any(|d| d == id))
            .map(|j| j.id.clone())
            .collect()
    }

    /// Pipeline-scoped feature slots that carry a value.
    pub fn populated_features(&self) -> Vec<FeatureKind> {
        let mut features = Vec::new();
        if !self.schedules.is_empty() {
            features.push(FeatureKind::ScheduledTrigger);
        }
        if !self.triggers.is_empty() {
            features.push(FeatureKind::TriggerFilter);
        }
        if !self.environment.is_empty() {
            features.push(FeatureKind::GlobalEnvironment);
        }
        if self.timeout_minutes.is_some() {
            features.push(FeatureKind::GlobalTimeout);
        }
        features
    }

    pub fn describe_feature(&self, feature: FeatureKind) -> String {
        match feature {
            FeatureKind::ScheduledTrigger => self
                .schedules
                .iter()
                .map(|s| match &s.branch {
                    Some(branch) => format!("cron '{}' on {branch}", s.cron),
                    None => format!("cron '{}'", s.cron),
                })
                .collect::<Vec<_>>()
                .join("; "),
            FeatureKind::TriggerFilter => self
                .triggers
                .iter()
                .map(|t| {
                    let mut text = format!("on {}", t.event.id());
                    if !t.branches.is_empty() {
                        text.push_str(&format!(" branches [{}]", t.branches.join(", ")));
                    }
                    if !t.paths.is_empty() {
                        text.push_str(&format!(" paths [{}]", t.paths.join(", ")));
                    }
                    text
                })
                .collect::<Vec<_>>()
                .join("; "),
            FeatureKind::GlobalEnvironment => {
                format!("variables {}", self.environment.keys().cloned().collect::<Vec<_>>().join(", "))
            }
            FeatureKind::GlobalTimeout => {
                format!("{} minutes", self.timeout_minutes.unwrap_or_default())
            }
            _ => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> PipelineGraph {
        let mut graph = PipelineGraph::new();
        graph.jobs.push(JobNode::new("build", "Build"));
        graph.jobs.push(JobNode::new("test", "Test").depending_on("build"));
        graph.jobs.push(JobNode::new("lint", "Lint").depending_on("build"));
        graph
    }

    #[test]
    fn test_dependents_of_in_job_order() {
        assert_eq!(chain().dependents_of("build"), vec!["test", "lint"]);
        assert!(chain().dependents_of("test").is_empty());
    }

    #[test]
    fn test_pipeline_features() {
        let mut graph = chain();
        assert!(graph.populated_features().is_empty());

        graph.schedules.push(Schedule {
            cron: "0 3 * * *".to_string(),
            branch: None,
        });
        graph.environment.insert("CI".to_string(), "true".to_string());
        assert_eq!(
            graph.populated_features(),
            vec![FeatureKind::ScheduledTrigger, FeatureKind::GlobalEnvironment]
        );
        assert_eq!(graph.describe_feature(FeatureKind::ScheduledTrigger), "cron '0 3 * * *'");
    }
}
