use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cishift::rules::RuleRegistry;
use cishift::validate::{CommandValidator, StructuralValidator, ValidationReport, Validator};
use cishift::{Translation, Translator, Vendor, VendorPair};

use crate::batch::{output_paths, run_batch, BatchJob};
use crate::config::{Config, DiagnosticsFormat};
use crate::output::{
    export_diagnostics, export_report, print_batch_summary, print_rules, print_translation_summary,
    BatchFailure, BatchProgress, BatchReport, BatchRow, TranslationReport,
};

#[derive(Parser)]
#[command(name = "cishift")]
#[command(author, version, about = "CI pipeline translator", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: ./cishift.toml or the user config dir)
    #[arg(short, long, global = true, env = "CISHIFT_CONFIG")]
    config: Option<PathBuf>,

    /// How diagnostics are shown on stderr
    #[arg(long, global = true, value_enum)]
    diagnostics: Option<DiagnosticsFormat>,

    #[arg(short, long, global = true, default_value_t = false)]
    pretty: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Translate one pipeline file
    Translate {
        file: PathBuf,

        /// Source dialect, inferred from the file path when omitted
        #[arg(short, long, value_enum)]
        from: Option<Vendor>,

        /// Target dialect
        #[arg(short, long, value_enum)]
        to: Option<Vendor>,

        /// Write the pipeline here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// External command that receives the pipeline on stdin
        #[arg(long)]
        validate_with: Option<String>,

        /// Write a JSON report here
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Translate many pipeline files in parallel
    Batch {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(short, long, value_enum)]
        from: Option<Vendor>,

        #[arg(short, long, value_enum)]
        to: Option<Vendor>,

        #[arg(long)]
        out_dir: PathBuf,

        /// Translations running at once
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// List translation rules
    Rules {
        /// Only rules that apply to this source dialect
        #[arg(short, long, value_enum)]
        from: Option<Vendor>,
    },
}

/// Source dialect implied by a well-known pipeline file location.
pub fn infer_vendor(path: &Path) -> Option<Vendor> {
    let name = path.file_name()?.to_str()?;
    let parent = |n: usize| {
        path.ancestors()
            .nth(n)
            .and_then(Path::file_name)
            .and_then(|p| p.to_str())
    };
    let yaml = name.ends_with(".yml") || name.ends_with(".yaml");

    if name == "Jenkinsfile" || name.ends_with(".jenkinsfile") || name.starts_with("Jenkinsfile.") {
        Some(Vendor::Jenkins)
    } else if name == ".gitlab-ci.yml" || name == ".gitlab-ci.yaml" {
        Some(Vendor::GitlabCi)
    } else if name == "bitbucket-pipelines.yml" || name == "bitbucket-pipelines.yaml" {
        Some(Vendor::BitbucketPipelines)
    } else if yaml && parent(1) == Some(".circleci") {
        Some(Vendor::Circleci)
    } else if yaml && parent(1) == Some("workflows") && parent(2) == Some(".github") {
        Some(Vendor::GithubActions)
    } else {
        None
    }
}

impl Cli {
    fn settings(&self) -> Result<(Config, Translator)> {
        let config = Config::load(self.config.as_deref())?;

        let registry = match &config.translate.rules_file {
            Some(path) => {
                info!("Using rules from {}", path.display());
                RuleRegistry::load(path)
                    .with_context(|| format!("Failed to load rules file: {}", path.display()))?
            }
            None => RuleRegistry::builtin()?.clone(),
        };
        let registry = match config.translate.native_matrix {
            Some(enabled) => registry.with_native_matrix(enabled),
            None => registry,
        };
        let translator = Translator::new(registry).with_default_queue(config.translate.default_queue.clone());
        Ok((config, translator))
    }

    fn pair(&self, config: &Config, file: &Path, from: Option<Vendor>, to: Option<Vendor>) -> Result<VendorPair> {
        let source = match from.or_else(|| infer_vendor(file)) {
            Some(source) => source,
            None => bail!(
                "Cannot tell which CI dialect {} is written in; pass --from",
                file.display()
            ),
        };
        Ok(VendorPair::new(source, to.unwrap_or(config.translate.target)))
    }

    fn show_diagnostics(
        &self,
        config: &Config,
        file: &Path,
        pair: VendorPair,
        translation: &Translation,
        validation: &[ValidationReport],
    ) -> Result<()> {
        let pretty = self.pretty || config.output.pretty;
        match self.diagnostics.unwrap_or(config.output.diagnostics) {
            DiagnosticsFormat::Table => print_translation_summary(file, pair, translation, validation),
            DiagnosticsFormat::Json => export_diagnostics(&translation.diagnostics, pretty, &mut std::io::stderr())?,
            DiagnosticsFormat::None => {}
        }
        Ok(())
    }

    fn execute_translate(
        &self,
        file: &Path,
        pair: (Option<Vendor>, Option<Vendor>),
        output: Option<&Path>,
        validate_with: Option<&str>,
        report: Option<&Path>,
    ) -> Result<()> {
        let (config, translator) = self.settings()?;
        let pair = self.pair(&config, file, pair.0, pair.1)?;
        info!("Translating {} from {} to {}", file.display(), pair.source, pair.target);

        let text = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read pipeline file: {}", file.display()))?;
        let translation = translator.translate(&text, pair)?;

        if translation.is_document_failure() {
            self.show_diagnostics(&config, file, pair, &translation, &[])?;
            bail!("{} could not be read as {}", file.display(), pair.source);
        }

        match output {
            Some(path) => {
                std::fs::write(path, &translation.text)
                    .with_context(|| format!("Failed to write pipeline: {}", path.display()))?;
                info!("Pipeline written to: {}", path.display());
            }
            None => print!("{}", translation.text),
        }

        let mut validators: Vec<Box<dyn Validator>> = vec![Box::new(StructuralValidator::new(translator.registry().profile()))];
        if let Some(command) = validate_with {
            let validator = CommandValidator::parse(command).context("--validate-with needs a command")?;
            validators.push(Box::new(validator));
        }
        let validation: Vec<ValidationReport> = validators.iter().map(|v| v.validate(&translation.text)).collect();

        self.show_diagnostics(&config, file, pair, &translation, &validation)?;

        if let Some(path) = report {
            let report = TranslationReport::new(file, pair, output, &translation, validation.clone());
            let mut writer = std::fs::File::create(path)
                .with_context(|| format!("Failed to create report: {}", path.display()))?;
            export_report(&report, self.pretty || config.output.pretty, &mut writer)?;
            info!("Report written to: {}", path.display());
        }

        if let Some(failed) = validation.iter().find(|v| !v.ok) {
            warn!("Validator {} rejected the pipeline", failed.validator);
            bail!("Validation failed: {}", failed.messages.join("; "));
        }
        Ok(())
    }

    async fn execute_batch(
        &self,
        files: &[PathBuf],
        pair: (Option<Vendor>, Option<Vendor>),
        out_dir: &Path,
        concurrency: Option<usize>,
        report: Option<&Path>,
    ) -> Result<()> {
        let (config, translator) = self.settings()?;
        std::fs::create_dir_all(out_dir)
            .with_context(|| format!("Failed to create output directory: {}", out_dir.display()))?;

        let target = pair.1.unwrap_or(config.translate.target);
        let extension = translator
            .emitters()
            .get(target)
            .map_or("yml", |emitter| emitter.file_extension());
        let outputs = output_paths(files, out_dir, extension);

        let mut rows = Vec::new();
        let mut failures = Vec::new();
        let mut jobs = Vec::new();
        for (file, output) in files.iter().zip(outputs) {
            match self.pair(&config, file, pair.0, pair.1) {
                Ok(pair) => jobs.push(BatchJob {
                    source: file.clone(),
                    pair,
                    output,
                }),
                Err(e) => {
                    warn!("Skipping {}: {e}", file.display());
                    rows.push(failure_row(file, None, &e));
                    failures.push(BatchFailure {
                        source_file: file.display().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let format = self.diagnostics.unwrap_or(config.output.diagnostics);
        let progress = match format {
            DiagnosticsFormat::Table => BatchProgress::start(jobs.len()),
            _ => BatchProgress::hidden(),
        };
        let concurrency = concurrency.unwrap_or(config.batch.concurrency);
        let outcomes = run_batch(Arc::new(translator), jobs, concurrency, &progress).await;
        progress.finish();

        let mut reports = Vec::new();
        for outcome in outcomes {
            let job = outcome.job;
            match outcome.result {
                Ok(translation) => {
                    rows.push(BatchRow {
                        source: job.source.display().to_string(),
                        vendor: Some(job.pair.source),
                        output: Some(job.output.display().to_string()),
                        steps: translation.graph.emitted_jobs().count(),
                        warnings: translation.diagnostics.warning_count(),
                        errors: translation.diagnostics.error_count(),
                        failure: None,
                    });
                    reports.push(TranslationReport::new(
                        &job.source,
                        job.pair,
                        Some(&job.output),
                        &translation,
                        Vec::new(),
                    ));
                }
                Err(e) => {
                    rows.push(failure_row(&job.source, Some(job.pair.source), &e));
                    failures.push(BatchFailure {
                        source_file: job.source.display().to_string(),
                        message: format!("{e:#}"),
                    });
                }
            }
        }

        if format == DiagnosticsFormat::Table {
            print_batch_summary(&rows);
        }
        if let Some(path) = report {
            let mut writer = std::fs::File::create(path)
                .with_context(|| format!("Failed to create report: {}", path.display()))?;
            export_report(&BatchReport::new(reports, failures.clone()), self.pretty || config.output.pretty, &mut writer)?;
            info!("Report written to: {}", path.display());
        }

        if !failures.is_empty() {
            bail!("{} of {} pipelines failed", failures.len(), files.len());
        }
        Ok(())
    }

    fn execute_rules(&self, from: Option<Vendor>) -> Result<()> {
        let (_, translator) = self.settings()?;
        print_rules(translator.registry(), from);
        Ok(())
    }

    pub async fn execute(&self) -> Result<()> {
        match &self.command {
            Commands::Translate {
                file,
                from,
                to,
                output,
                validate_with,
                report,
            } => self.execute_translate(
                file,
                (*from, *to),
                output.as_deref(),
                validate_with.as_deref(),
                report.as_deref(),
            ),
            Commands::Batch {
                files,
                from,
                to,
                out_dir,
                concurrency,
                report,
            } => {
                self.execute_batch(files, (*from, *to), out_dir, *concurrency, report.as_deref())
                    .await
            }
            Commands::Rules { from } => self.execute_rules(*from),
        }
    }
}

fn failure_row(file: &Path, vendor: Option<Vendor>, error: &anyhow::Error) -> BatchRow {
    BatchRow {
        source: file.display().to_string(),
        vendor,
        output: None,
        steps: 0,
        warnings: 0,
        errors: 0,
        failure: Some(format!("{error:#}")),
    }
}
