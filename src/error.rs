use thiserror::Error;

use crate::ir::FeatureKind;
use crate::vendor::Vendor;

#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("Malformed source unit '{unit}': {message}")]
    Parse { unit: String, message: String },

    #[error("No translation rule matches feature '{feature}' of job '{job}'")]
    UnmappableFeature { job: String, feature: FeatureKind },

    #[error("Structural violation in job '{job}': {reason}")]
    Structural { job: String, reason: StructuralReason },

    #[error("Cannot satisfy target invariant for job '{job}': {message}")]
    EmissionInvariant { job: String, message: String },

    #[error("Source document cannot be parsed as {vendor}: {message}")]
    Document { vendor: Vendor, message: String },

    #[error("Unsupported target vendor: {0}")]
    UnsupportedTarget(Vendor),

    #[error("Invalid rule registry: {0}")]
    Registry(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a job failed the graph's structural checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuralReason {
    CyclicDependency(Vec<String>),
    DanglingDependency(String),
    DuplicateId(String),
    MatrixCapacity(String),
}

impl std::fmt::Display for StructuralReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CyclicDependency(cycle) => {
                write!(f, "cyclic dependency ({})", cycle.join(" -> "))
            }
            Self::DanglingDependency(dep) => write!(f, "depends on unknown job '{dep}'"),
            Self::DuplicateId(id) => write!(f, "job id '{id}' is already in use"),
            Self::MatrixCapacity(detail) => write!(f, "matrix exceeds target capacity: {detail}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, TranslateError>;
