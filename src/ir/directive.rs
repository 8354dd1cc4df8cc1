//! Target constructs attached to jobs by translation rules.
//!
//! Directives are the only channel through which rule transforms talk to the
//! emitter. They describe target-side constructs in structured form; the
//! emitter decides how they are rendered.

use serde::{Deserialize, Serialize};

use super::{CacheLevel, MatrixSpec};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum Directive {
    /// Run the step inside a container image
    Container {
        image: String,
        workdir: Option<String>,
        shell: Option<Vec<String>>,
    },
    NativeMatrix(MatrixSpec),
    Cache {
        manifest: Option<String>,
        paths: Vec<String>,
        save: CacheLevel,
        restore: CacheLevel,
    },
    UploadArtifacts { paths: Vec<String> },
    DownloadArtifacts { downloads: Vec<ArtifactDownload> },
    /// Space-separated branch patterns with `!` negation
    Branches { patterns: String },
    /// Boolean expression in the target's condition language; several are ANDed
    If { expression: String },
    IfChanged { paths: Vec<String> },
    AllowDependencyFailure,
    AgentQueue { queue: String },
    Retry { limit: u32, exit_statuses: Vec<String> },
    Timeout { minutes: u32 },
    SoftFail,
    Concurrency { group: String, limit: u32 },
    Parallelism { count: u32 },
    Secrets { names: Vec<String> },
    /// Render the pipeline environment once at the top level
    PipelineEnvironment,
}

/// One artifact path fetched from the step that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDownload {
    pub step: String,
    pub path: String,
}

impl Directive {
    /// Stable name used in logs and tests.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Container { .. } => "container",
            Self::NativeMatrix(_) => "native-matrix",
            Self::Cache { .. } => "cache",
            Self::UploadArtifacts { .. } => "upload-artifacts",
            Self::DownloadArtifacts { .. } => "download-artifacts",
            Self::Branches { .. } => "branches",
            Self::If { .. } => "if",
            Self::IfChanged { .. } => "if-changed",
            Self::AllowDependencyFailure => "allow-dependency-failure",
            Self::AgentQueue { .. } => "agent-queue",
            Self::Retry { .. } => "retry",
            Self::Timeout { .. } => "timeout",
            Self::SoftFail => "soft-fail",
            Self::Concurrency { .. } => "concurrency",
            Self::Parallelism { .. } => "parallelism",
            Self::Secrets { .. } => "secrets",
            Self::PipelineEnvironment => "pipeline-environment",
        }
    }
}
