mod exports;
mod progress;
mod styling;
mod summary;
mod tables;

pub use exports::{export_diagnostics, export_report, BatchFailure, BatchReport, TranslationReport};
pub use progress::BatchProgress;
pub use styling::{dim, magenta_bold};
pub use summary::{print_batch_summary, print_rules, print_translation_summary, BatchRow};

/// Prints the `cishift` banner to stderr.
///
/// Displays the tool name, version, and description at the start of execution.
pub fn print_banner() {
    eprintln!(
        r"
{} {}
  {}
",
        magenta_bold("🔀 cishift"),
        dim(env!("CARGO_PKG_VERSION")),
        dim("CI pipeline translator")
    );
}
