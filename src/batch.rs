use anyhow::{Context, Result};
use log::{info, warn};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;

use cishift::ir::slugify;
use cishift::{Translation, Translator, VendorPair};

use crate::output::BatchProgress;

/// One file of a batch run.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub source: PathBuf,
    pub pair: VendorPair,
    pub output: PathBuf,
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub job: BatchJob,
    pub result: Result<Translation>,
}

/// Output file names for `sources`, unique within `out_dir`.
///
/// Names derive from the source file, so the same inputs always land in the
/// same outputs.
pub fn output_paths(sources: &[PathBuf], out_dir: &Path, extension: &str) -> Vec<PathBuf> {
    let mut taken = HashSet::new();
    sources
        .iter()
        .map(|source| {
            let stem = source
                .file_stem()
                .and_then(|s| s.to_str())
                .map(slugify)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "pipeline".to_string());
            let mut name = stem.clone();
            let mut n = 2;
            while !taken.insert(name.clone()) {
                name = format!("{stem}-{n}");
                n += 1;
            }
            out_dir.join(format!("{name}.{extension}"))
        })
        .collect()
}

/// Translates every job as an independent blocking task.
///
/// At most `concurrency` translations run at once. Outcomes come back in
/// input order regardless of completion order.
pub async fn run_batch(
    translator: Arc<Translator>,
    jobs: Vec<BatchJob>,
    concurrency: usize,
    progress: &BatchProgress,
) -> Vec<BatchOutcome> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    info!("Translating {} pipelines, {} at a time", jobs.len(), concurrency.max(1));

    let futures: Vec<_> = jobs
        .into_iter()
        .map(|job| {
            let translator = Arc::clone(&translator);
            let semaphore = Arc::clone(&semaphore);
            async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        let task_job = job.clone();
                        tokio::task::spawn_blocking(move || translate_file(&translator, &task_job))
                            .await
                            .context("Translation task panicked")
                            .and_then(|r| r)
                    }
                    Err(e) => Err(e.into()),
                };
                progress.advance(&job.source.display().to_string());
                BatchOutcome { job, result }
            }
        })
        .collect();

    let outcomes = futures::future::join_all(futures).await;
    let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
    if failed > 0 {
        warn!("{failed} of {} pipelines failed", outcomes.len());
    }
    outcomes
}

fn translate_file(translator: &Translator, job: &BatchJob) -> Result<Translation> {
    let text = std::fs::read_to_string(&job.source)
        .with_context(|| format!("Failed to read {}", job.source.display()))?;
    let translation = translator.translate(&text, job.pair)?;
    if translation.is_document_failure() {
        let message = translation
            .diagnostics
            .iter()
            .next()
            .map_or_else(String::new, |d| d.message.clone());
        anyhow::bail!("{message}");
    }
    std::fs::write(&job.output, &translation.text)
        .with_context(|| format!("Failed to write {}", job.output.display()))?;
    Ok(translation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cishift::Vendor;

    #[test]
    fn test_output_paths_are_unique_and_stable() {
        let sources = vec![
            PathBuf::from("a/.gitlab-ci.yml"),
            PathBuf::from("b/.gitlab-ci.yml"),
            PathBuf::from("Jenkinsfile"),
        ];
        let paths = output_paths(&sources, Path::new("out"), "yml");
        assert_eq!(
            paths,
            vec![
                PathBuf::from("out/gitlab-ci.yml"),
                PathBuf::from("out/gitlab-ci-2.yml"),
                PathBuf::from("out/jenkinsfile.yml"),
            ]
        );
    }

    #[tokio::test]
    async fn test_run_batch_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join(".gitlab-ci.yml");
        std::fs::write(&good, "build:\n  script: make\n").unwrap();
        let bad = dir.path().join("broken.yml");
        std::fs::write(&bad, "jobs: [unclosed").unwrap();
        let missing = dir.path().join("missing.yml");

        let sources = vec![good, bad, missing];
        let outputs = output_paths(&sources, dir.path(), "out.yml");
        let vendors = [Vendor::GitlabCi, Vendor::GithubActions, Vendor::GithubActions];
        let jobs: Vec<BatchJob> = sources
            .into_iter()
            .zip(outputs)
            .zip(vendors)
            .map(|((source, output), vendor)| BatchJob {
                source,
                pair: VendorPair::new(vendor, Vendor::Buildkite),
                output,
            })
            .collect();

        let translator = Arc::new(Translator::builtin().unwrap());
        let outcomes = run_batch(translator, jobs, 2, &BatchProgress::hidden()).await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].result.is_ok(), "Should translate the good file");
        assert!(outcomes[0].job.output.exists());
        assert!(outcomes[1].result.is_err(), "Should reject the unreadable document");
        assert!(!outcomes[1].job.output.exists());
        assert!(outcomes[2].result.is_err());
    }
}
