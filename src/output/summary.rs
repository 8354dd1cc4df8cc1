use std::fmt::Write;
use std::path::Path;

use cishift::diagnostics::Diagnostics;
use cishift::rules::RuleRegistry;
use cishift::validate::ValidationReport;
use cishift::{Translation, Vendor, VendorPair};
use comfy_table::Cell;

use super::styling::{bright, bright_green, bright_red, bright_yellow, count, cyan, dim};
use super::tables::{confidence_cell, count_cell, create_table, header, severity_cell};

/// One line of the batch summary table.
#[derive(Debug, Clone)]
pub struct BatchRow {
    pub source: String,
    pub vendor: Option<Vendor>,
    pub output: Option<String>,
    pub steps: usize,
    pub warnings: usize,
    pub errors: usize,
    /// Why the file produced no output at all
    pub failure: Option<String>,
}

/// Prints the outcome of one translation to stderr.
///
/// Shows an overview, the diagnostics table and any validation findings.
/// The translated pipeline itself goes to stdout or a file, never here.
pub fn print_translation_summary(
    source: &Path,
    pair: VendorPair,
    translation: &Translation,
    validation: &[ValidationReport],
) {
    eprintln!("{}", render_translation_summary(source, pair, translation, validation));
}

pub fn print_batch_summary(rows: &[BatchRow]) {
    eprintln!("{}", render_batch_summary(rows));
}

pub fn print_rules(registry: &RuleRegistry, source: Option<Vendor>) {
    println!("{}", render_rules(registry, source));
}

fn add_section_header(output: &mut String, emoji: &str, title: &str) {
    let _ = writeln!(output, "{} {}", bright(emoji), bright(title).underlined());
}

fn render_translation_summary(
    source: &Path,
    pair: VendorPair,
    translation: &Translation,
    validation: &[ValidationReport],
) -> String {
    let mut output = String::new();
    let graph = &translation.graph;
    let diagnostics = &translation.diagnostics;

    add_section_header(&mut output, "📄", "Translation");
    let stubs = graph.emitted_jobs().filter(|j| j.is_unsupported()).count();
    let _ = writeln!(
        output,
        "  {} {} {}\n  {} {}\n  {} {}\n  {} {}\n  {} {}  {} {}\n",
        dim("Source:"),
        cyan(source.display()),
        dim(format!("({})", pair.source)),
        dim("Target:"),
        cyan(pair.target),
        dim("Steps emitted:"),
        bright_yellow(graph.emitted_jobs().count()),
        dim("Placeholder stubs:"),
        count(stubs, true),
        dim("Warnings:"),
        count(diagnostics.warning_count(), false),
        dim("Errors:"),
        count(diagnostics.error_count(), true),
    );

    if diagnostics.is_empty() {
        let _ = writeln!(output, "{}\n", bright_green("Every feature translated natively ✓"));
    } else {
        add_section_header(&mut output, "⚠️", "Diagnostics");
        let _ = writeln!(output, "{}\n", diagnostics_table(diagnostics));
    }

    if !validation.is_empty() {
        add_section_header(&mut output, "🔎", "Validation");
        for report in validation {
            if report.ok {
                let _ = writeln!(output, "  {} {}", cyan(&report.validator), bright_green("passed ✓"));
            } else {
                let _ = writeln!(output, "  {} {}", cyan(&report.validator), bright_red("failed"));
                for message in &report.messages {
                    let _ = writeln!(output, "    {}", dim(message));
                }
            }
        }
        output.push('\n');
    }

    output
}

fn diagnostics_table(diagnostics: &Diagnostics) -> comfy_table::Table {
    let mut table = create_table();
    table.set_header(header(&["Severity", "Kind", "Job", "Feature", "Message", "Manual step"]));
    for diagnostic in diagnostics.iter() {
        table.add_row(vec![
            severity_cell(diagnostic.severity),
            Cell::new(diagnostic.kind.id()),
            Cell::new(diagnostic.job_id.as_deref().unwrap_or("(pipeline)")),
            Cell::new(&diagnostic.feature),
            Cell::new(&diagnostic.message),
            Cell::new(diagnostic.instruction.as_deref().unwrap_or("")),
        ]);
    }
    table
}

fn render_batch_summary(rows: &[BatchRow]) -> String {
    let mut output = String::new();
    add_section_header(&mut output, "📋", "Batch");

    let mut table = create_table();
    table.set_header(header(&["Source", "Dialect", "Output", "Steps", "Warnings", "Errors"]));
    for row in rows {
        let vendor = row.vendor.map_or_else(|| "?".to_string(), |v| v.to_string());
        match &row.failure {
            Some(failure) => {
                table.add_row(vec![
                    Cell::new(&row.source),
                    Cell::new(vendor),
                    Cell::new(failure).fg(comfy_table::Color::Red),
                    Cell::new("-"),
                    Cell::new("-"),
                    Cell::new("-"),
                ]);
            }
            None => {
                table.add_row(vec![
                    Cell::new(&row.source),
                    Cell::new(vendor),
                    Cell::new(row.output.as_deref().unwrap_or("")),
                    Cell::new(row.steps),
                    count_cell(row.warnings, false),
                    count_cell(row.errors, true),
                ]);
            }
        }
    }
    let _ = writeln!(output, "{table}");

    let failed = rows.iter().filter(|r| r.failure.is_some()).count();
    let _ = writeln!(
        output,
        "\n  {} {}  {} {}\n",
        dim("Translated:"),
        bright_green(rows.len() - failed),
        dim("Failed:"),
        count(failed, true),
    );
    output
}

fn render_rules(registry: &RuleRegistry, source: Option<Vendor>) -> String {
    let mut output = String::new();
    let title = match source {
        Some(vendor) => format!("Rules for {vendor} → {}", registry.profile().vendor),
        None => format!("Rules targeting {}", registry.profile().vendor),
    };
    add_section_header(&mut output, "📚", &title);

    let mut table = create_table();
    table.set_header(header(&["Rule", "Feature", "Sources", "Confidence", "When", "Transform"]));
    for rule in registry.rules_from(source) {
        table.add_row(vec![
            Cell::new(&rule.name),
            Cell::new(rule.feature),
            Cell::new(rule.sources.describe()),
            confidence_cell(rule.confidence),
            Cell::new(rule.when.describe()),
            Cell::new(rule.transform.id()),
        ]);
    }
    let _ = writeln!(output, "{table}");
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use cishift::Translator;

    fn translate(text: &str, source: Vendor) -> Translation {
        Translator::builtin()
            .unwrap()
            .translate(text, VendorPair::new(source, Vendor::Buildkite))
            .unwrap()
    }

    #[test]
    fn test_render_summary_without_diagnostics() {
        let translation = translate("build:\n  script: make\n", Vendor::GitlabCi);
        let pair = VendorPair::new(Vendor::GitlabCi, Vendor::Buildkite);
        let output = render_translation_summary(Path::new(".gitlab-ci.yml"), pair, &translation, &[]);
        assert!(output.contains(".gitlab-ci.yml"));
        assert!(output.contains("GitLab CI"));
        assert!(output.contains("Every feature translated natively"));
        assert!(!output.contains("Validation"));
    }

    #[test]
    fn test_render_summary_lists_diagnostics_and_validation() {
        let text = "jobs:\n  lint:\n    steps:\n      - uses: github/super-linter@v5\n";
        let translation = translate(text, Vendor::GithubActions);
        let pair = VendorPair::new(Vendor::GithubActions, Vendor::Buildkite);
        let validation = vec![ValidationReport {
            validator: "buildkite-lint".to_string(),
            ok: false,
            messages: vec!["steps[0]: unknown key".to_string()],
        }];
        let output = render_translation_summary(Path::new("ci.yml"), pair, &translation, &validation);
        assert!(output.contains("Diagnostics"));
        assert!(output.contains("external-action"));
        assert!(output.contains("buildkite-lint"));
        assert!(output.contains("steps[0]: unknown key"));
    }

    #[test]
    fn test_render_batch_summary_counts_failures() {
        let rows = vec![
            BatchRow {
                source: "a/.gitlab-ci.yml".to_string(),
                vendor: Some(Vendor::GitlabCi),
                output: Some("out/gitlab-ci.yml".to_string()),
                steps: 3,
                warnings: 1,
                errors: 0,
                failure: None,
            },
            BatchRow {
                source: "b/unknown.yml".to_string(),
                vendor: None,
                output: None,
                steps: 0,
                warnings: 0,
                errors: 0,
                failure: Some("cannot infer source dialect".to_string()),
            },
        ];
        let output = render_batch_summary(&rows);
        assert!(output.contains("out/gitlab-ci.yml"));
        assert!(output.contains("cannot infer source dialect"));
    }

    #[test]
    fn test_render_rules_filters_by_source() {
        let registry = RuleRegistry::builtin().unwrap();
        let circleci = render_rules(registry, Some(Vendor::Circleci));
        assert!(circleci.contains("parallel-test-splitting"));
        assert!(circleci.contains("CircleCI"));
        let jenkins = render_rules(registry, Some(Vendor::Jenkins));
        assert!(!jenkins.contains("parallel-test-splitting"));
    }
}
