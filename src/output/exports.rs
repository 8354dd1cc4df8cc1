use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

use cishift::diagnostics::{Diagnostic, Diagnostics};
use cishift::validate::ValidationReport;
use cishift::{Translation, Vendor, VendorPair};

/// Machine-readable record of one translation.
///
/// Reports carry the time they were written; the translated pipeline itself
/// never does.
#[derive(Debug, Clone, Serialize)]
pub struct TranslationReport {
    pub generated_at: DateTime<Utc>,
    pub source_file: String,
    pub source: Vendor,
    pub target: Vendor,
    pub output_file: Option<String>,
    pub steps: usize,
    pub stubs: usize,
    pub errors: usize,
    pub warnings: usize,
    pub diagnostics: Vec<Diagnostic>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub validation: Vec<ValidationReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub generated_at: DateTime<Utc>,
    pub translations: Vec<TranslationReport>,
    /// Files that could not be read, written or translated at all
    pub failures: Vec<BatchFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub source_file: String,
    pub message: String,
}

impl TranslationReport {
    pub fn new(
        source_file: &Path,
        pair: VendorPair,
        output_file: Option<&Path>,
        translation: &Translation,
        validation: Vec<ValidationReport>,
    ) -> Self {
        let graph = &translation.graph;
        Self {
            generated_at: Utc::now(),
            source_file: source_file.display().to_string(),
            source: pair.source,
            target: pair.target,
            output_file: output_file.map(|p| p.display().to_string()),
            steps: graph.emitted_jobs().count(),
            stubs: graph.emitted_jobs().filter(|j| j.is_unsupported()).count(),
            errors: translation.diagnostics.error_count(),
            warnings: translation.diagnostics.warning_count(),
            diagnostics: translation.diagnostics.iter().cloned().collect(),
            validation,
        }
    }
}

impl BatchReport {
    pub fn new(translations: Vec<TranslationReport>, failures: Vec<BatchFailure>) -> Self {
        Self {
            generated_at: Utc::now(),
            translations,
            failures,
        }
    }
}

/// Writes any report as JSON.
pub fn export_report<T: Serialize>(report: &T, pretty: bool, output: &mut dyn Write) -> Result<()> {
    let json = if pretty {
        serde_json::to_string_pretty(report)?
    } else {
        serde_json::to_string(report)?
    };
    writeln!(output, "{json}")?;
    Ok(())
}

/// Writes the diagnostic list alone as a JSON array.
pub fn export_diagnostics(diagnostics: &Diagnostics, pretty: bool, output: &mut dyn Write) -> Result<()> {
    let items: Vec<&Diagnostic> = diagnostics.iter().collect();
    export_report(&items, pretty, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cishift::Translator;

    fn translation() -> Translation {
        let text = "stages: [build]\nbuild:\n  stage: build\n  script: make\n  retry: 2\n";
        Translator::builtin()
            .unwrap()
            .translate(text, VendorPair::new(Vendor::GitlabCi, Vendor::Buildkite))
            .unwrap()
    }

    #[test]
    fn test_report_counts_and_vendors() {
        let translation = translation();
        let report = TranslationReport::new(
            Path::new(".gitlab-ci.yml"),
            VendorPair::new(Vendor::GitlabCi, Vendor::Buildkite),
            Some(Path::new("pipeline.yml")),
            &translation,
            Vec::new(),
        );
        assert_eq!(report.steps, 1);
        assert_eq!(report.stubs, 0);
        assert_eq!(report.errors, 0);
        assert_eq!(report.warnings, translation.diagnostics.warning_count());

        let mut output = Vec::new();
        export_report(&report, false, &mut output).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(json["source"], "gitlab-ci");
        assert_eq!(json["target"], "buildkite");
        assert_eq!(json["output_file"], "pipeline.yml");
        assert!(json["generated_at"].is_string());
        assert!(json.get("validation").is_none(), "Should omit empty validation");
    }

    #[test]
    fn test_export_diagnostics_is_array() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.push(Diagnostic::warning(
            cishift::diagnostics::DiagnosticKind::Degraded,
            "retry",
            "retry translated approximately",
        ));
        let mut output = Vec::new();
        export_diagnostics(&diagnostics, true, &mut output).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(json[0]["kind"], "degraded");
        assert_eq!(json[0]["severity"], "warning");
        assert_eq!(json[0]["feature"], "retry");
    }
}
