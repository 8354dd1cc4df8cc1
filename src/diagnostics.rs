use serde::{Deserialize, Serialize};

use crate::error::TranslateError;

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// Classification of a diagnostic, mirroring the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiagnosticKind {
    /// A source job could not be lowered and was replaced by a placeholder.
    Parse,
    /// A populated feature has no rule at all.
    UnmappableFeature,
    /// A feature was translated with caveats or left as a placeholder.
    Degraded,
    /// More than one native rule matched a feature.
    AmbiguousRule,
    /// Cycle, dangling edge, id collision or matrix capacity overflow.
    Structural,
    /// The emitter could not satisfy a target invariant.
    EmissionInvariant,
    /// The whole source document was rejected.
    Document,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

impl DiagnosticKind {
    pub fn id(self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::UnmappableFeature => "unmappable-feature",
            Self::Degraded => "degraded",
            Self::AmbiguousRule => "ambiguous-rule",
            Self::Structural => "structural",
            Self::EmissionInvariant => "emission-invariant",
            Self::Document => "document",
        }
    }
}

/// Index of a diagnostic inside its collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiagnosticId(pub usize);

/// A warning or error surfaced to the caller.
///
/// Immutable once pushed into a [`Diagnostics`] collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    /// Job the diagnostic refers to; `None` for pipeline or document scope
    pub job_id: Option<String>,
    /// Feature or construct name (e.g. "caching", "parse")
    pub feature: String,
    pub message: String,
    /// Manual configuration step, when one exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
}

impl Diagnostic {
    pub fn warning(kind: DiagnosticKind, feature: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            kind,
            job_id: None,
            feature: feature.into(),
            message: message.into(),
            instruction: None,
        }
    }

    pub fn error(kind: DiagnosticKind, feature: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            ..Self::warning(kind, feature, message)
        }
    }

    #[must_use]
    pub fn for_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    #[must_use]
    pub fn with_instruction(mut self, instruction: Option<String>) -> Self {
        self.instruction = instruction;
        self
    }

    /// Builds an error diagnostic from a job- or document-scoped error.
    pub fn from_error(error: &TranslateError) -> Self {
        let (kind, feature, job) = match error {
            TranslateError::Parse { unit, .. } => (DiagnosticKind::Parse, "parse".to_string(), Some(unit.clone())),
            TranslateError::UnmappableFeature { job, feature } => {
                (DiagnosticKind::UnmappableFeature, feature.id().to_string(), Some(job.clone()))
            }
            TranslateError::Structural { job, .. } => {
                (DiagnosticKind::Structural, "graph".to_string(), Some(job.clone()))
            }
            TranslateError::EmissionInvariant { job, .. } => {
                (DiagnosticKind::EmissionInvariant, "emission".to_string(), Some(job.clone()))
            }
            _ => (DiagnosticKind::Document, "document".to_string(), None),
        };

        Self {
            severity: Severity::Error,
            kind,
            job_id: job,
            feature,
            message: error.to_string(),
            instruction: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Ordered, append-only collection of diagnostics for one translation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) -> DiagnosticId {
        log::trace!(
            "diagnostic [{:?}] {}: {}",
            diagnostic.severity,
            diagnostic.feature,
            diagnostic.message
        );
        self.items.push(diagnostic);
        DiagnosticId(self.items.len() - 1)
    }

    /// Records a job-scoped error and returns its id for back-references.
    pub fn push_error(&mut self, error: &TranslateError) -> DiagnosticId {
        self.push(Diagnostic::from_error(error))
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.items.extend(other.items);
    }

    pub fn get(&self, id: DiagnosticId) -> Option<&Diagnostic> {
        self.items.get(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.items.iter().filter(|d| d.is_error()).count()
    }

    pub fn warning_count(&self) -> usize {
        self.items.len() - self.error_count()
    }

    pub fn of_kind(&self, kind: DiagnosticKind) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter().filter(move |d| d.kind == kind)
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.items
    }
}
