//! End-to-end translation: parse, apply rules, emit.

use serde_yaml::{Mapping, Value};

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::emitter::EmitterRegistry;
use crate::engine::RuleEngine;
use crate::error::{Result, TranslateError};
use crate::ir::PipelineGraph;
use crate::parser::parser_for;
use crate::rules::RuleRegistry;
use crate::vendor::VendorPair;

/// Outcome of translating one document.
#[derive(Debug, Clone)]
pub struct Translation {
    /// Target pipeline text
    pub text: String,
    pub diagnostics: Diagnostics,
    /// The annotated graph the text was emitted from
    pub graph: PipelineGraph,
}

impl Translation {
    /// Whether the source document could not be read at all.
    pub fn is_document_failure(&self) -> bool {
        self.diagnostics.of_kind(DiagnosticKind::Document).next().is_some()
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.error_count() > 0
    }
}

/// Translates pipeline documents between dialects.
///
/// Immutable after construction, so one translator can serve any number of
/// concurrent translations.
pub struct Translator {
    registry: RuleRegistry,
    emitters: EmitterRegistry,
    default_queue: Option<String>,
}

impl Translator {
    pub fn new(registry: RuleRegistry) -> Self {
        let emitters = EmitterRegistry::new(registry.profile());
        Self {
            registry,
            emitters,
            default_queue: None,
        }
    }

    /// Agent queue for steps that do not pick one, emitted as top-level `agents`.
    #[must_use]
    pub fn with_default_queue(mut self, queue: Option<String>) -> Self {
        self.default_queue = queue;
        self
    }

    /// Translator over the embedded rule registry.
    ///
    /// # Errors
    ///
    /// Returns [`TranslateError::Registry`] if the embedded rules are invalid.
    pub fn builtin() -> Result<Self> {
        Ok(Self::new(RuleRegistry::builtin()?.clone()))
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    pub fn emitters(&self) -> &EmitterRegistry {
        &self.emitters
    }

    /// Translates `text` from `pair.source` to `pair.target`.
    ///
    /// Job-scoped problems are reported in the returned diagnostics. A
    /// document that cannot be read yields an empty pipeline and a single
    /// `Document` diagnostic.
    ///
    /// # Errors
    ///
    /// Fails only for an unsupported vendor pair or an emitter I/O failure.
    pub fn translate(&self, text: &str, pair: VendorPair) -> Result<Translation> {
        let emitter = self
            .emitters
            .get(pair.target)
            .ok_or(TranslateError::UnsupportedTarget(pair.target))?;
        let parser = parser_for(pair.source).ok_or_else(|| TranslateError::Document {
            vendor: pair.source,
            message: "not a supported source dialect".to_string(),
        })?;

        let output = parser.parse(text);
        let mut diagnostics = output.diagnostics;
        let document_failed = diagnostics.of_kind(DiagnosticKind::Document).next().is_some();
        let graph = if document_failed {
            output.graph
        } else {
            let mut graph = RuleEngine::new(&self.registry).apply_with(output.graph, pair, &mut diagnostics)?;
            if let Some(queue) = &self.default_queue {
                let mut agents = Mapping::new();
                agents.insert(Value::from("queue"), Value::from(queue.as_str()));
                graph.extensions.entry("agents".to_string()).or_insert(Value::Mapping(agents));
            }
            graph
        };

        let text = emitter.emit(&graph, &mut diagnostics)?;
        log::debug!(
            "translated {} to {}: {} steps, {} errors, {} warnings",
            pair.source,
            pair.target,
            graph.emitted_jobs().count(),
            diagnostics.error_count(),
            diagnostics.warning_count()
        );
        Ok(Translation {
            text,
            diagnostics,
            graph,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use super::*;
    use crate::vendor::Vendor;

    const WORKFLOW: &str = r#"
name: CI
on:
  push:
    branches: [main]
  schedule:
    - cron: "0 4 * * 1"
env:
  NODE_ENV: test
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
      - uses: actions/cache@v4
        with:
          path: ~/.npm
          key: npm-${{ hashFiles('package-lock.json') }}
          restore-keys: |
            npm-
      - run: npm ci && npm run build
      - uses: actions/upload-artifact@v4
        with:
          name: dist
          path: dist/
  test:
    needs: build
    runs-on: ubuntu-latest
    strategy:
      matrix:
        os: [linux, macos]
        version: [18, 20]
        exclude:
          - os: macos
            version: 18
    steps:
      - uses: actions/download-artifact@v4
        with:
          name: dist
      - run: npm test -- --node ${{ matrix.version }}
  lint:
    needs: build
    runs-on: ubuntu-latest
    steps:
      - uses: github/super-linter@v5
      - run: npm run lint
  deploy:
    needs: [test, lint]
    if: github.ref == 'refs/heads/main'
    environment: production
    runs-on: ubuntu-latest
    steps:
      - run: ./deploy.sh ${{ secrets.DEPLOY_TOKEN }}
"#;

    fn github() -> VendorPair {
        VendorPair::new(Vendor::GithubActions, Vendor::Buildkite)
    }

    fn translator() -> Translator {
        Translator::builtin().expect("Should build translator")
    }

    /// Translator for a target without a native matrix construct.
    fn expanding_translator() -> Translator {
        let registry = RuleRegistry::builtin().expect("Should load built-in registry").clone();
        Translator::new(registry.with_native_matrix(false))
    }

    fn steps(text: &str) -> Vec<Value> {
        let value: Value = serde_yaml::from_str(text).expect("Should emit valid YAML");
        value["steps"].as_sequence().cloned().unwrap_or_default()
    }

    fn key(step: &Value) -> String {
        step["key"].as_str().unwrap_or_default().to_string()
    }

    fn dependencies(step: &Value) -> Vec<String> {
        step["depends_on"]
            .as_sequence()
            .map(|deps| {
                deps.iter()
                    .filter_map(|d| d.as_str().or_else(|| d["step"].as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn test_translation_is_deterministic() {
        let first = translator().translate(WORKFLOW, github()).expect("Should translate");
        let second = translator().translate(WORKFLOW, github()).expect("Should translate");
        assert_eq!(first.text, second.text, "Should emit byte-identical text");
        assert_eq!(first.diagnostics, second.diagnostics);

        let first = expanding_translator().translate(WORKFLOW, github()).expect("Should translate");
        let second = expanding_translator().translate(WORKFLOW, github()).expect("Should translate");
        assert_eq!(first.text, second.text);
    }

    #[test]
    fn test_dependency_order_is_preserved() {
        let translation = expanding_translator().translate(WORKFLOW, github()).expect("Should translate");
        let steps = steps(&translation.text);
        let edges: HashMap<String, Vec<String>> = steps.iter().map(|s| (key(s), dependencies(s))).collect();

        // Every dependency is emitted earlier, so the step graph has no cycle
        let mut seen = HashSet::new();
        for step in &steps {
            for dependency in dependencies(step) {
                assert!(seen.contains(&dependency), "Should emit {dependency} before {}", key(step));
            }
            seen.insert(key(step));
        }

        let reaches = |from: &str, to: &str| {
            let mut stack = vec![from.to_string()];
            let mut visited = HashSet::new();
            while let Some(current) = stack.pop() {
                if current == to {
                    return true;
                }
                if visited.insert(current.clone()) {
                    stack.extend(edges.get(&current).cloned().unwrap_or_default());
                }
            }
            false
        };
        assert!(reaches("deploy", "test-linux-18"));
        assert!(reaches("deploy", "lint"));
        assert!(reaches("test-macos-20", "build"));
        assert!(!reaches("build", "deploy"), "Should never invert an edge");
    }

    #[test]
    fn test_every_degraded_feature_has_one_comment() {
        let translation = translator().translate(WORKFLOW, github()).expect("Should translate");
        let warnings: Vec<_> = translation.diagnostics.of_kind(DiagnosticKind::Degraded).collect();
        assert!(!warnings.is_empty(), "Should degrade the external action and inferred approval");
        let comments: Vec<&str> = translation
            .text
            .lines()
            .map(str::trim_start)
            .filter(|line| line.starts_with("# [approximate] ") || line.starts_with("# [manual] "))
            .collect();
        assert_eq!(comments.len(), warnings.len(), "Should emit one comment per warning");
        for warning in warnings {
            let needle = format!("] {}: ", warning.feature);
            assert_eq!(
                comments.iter().filter(|c| c.contains(&needle)).count(),
                translation
                    .diagnostics
                    .of_kind(DiagnosticKind::Degraded)
                    .filter(|d| d.feature == warning.feature)
                    .count(),
                "Should reference feature {} in a comment",
                warning.feature
            );
        }
    }

    #[test]
    fn test_matrix_expands_to_three_jobs() {
        let translation = expanding_translator().translate(WORKFLOW, github()).expect("Should translate");
        let keys: Vec<String> = steps(&translation.text).iter().map(key).collect();
        let matrix_keys: Vec<&String> = keys.iter().filter(|k| k.starts_with("test-")).collect();
        assert_eq!(matrix_keys, vec!["test-linux-18", "test-linux-20", "test-macos-20"]);
        assert!(!keys.iter().any(|k| k.ends_with("-macos-18")));
        assert!(!keys.contains(&"test".to_string()), "Should not emit the template");
    }

    #[test]
    fn test_native_matrix_keeps_one_step() {
        let translation = translator().translate(WORKFLOW, github()).expect("Should translate");
        let steps = steps(&translation.text);
        let test = steps.iter().find(|s| key(s) == "test").expect("Should emit test");
        assert_eq!(test["matrix"]["adjustments"][0]["skip"].as_bool(), Some(true));
        assert_eq!(test["commands"][1].as_str(), Some("npm test -- --node {{matrix.version}}"));
    }

    #[test]
    fn test_cache_saves_at_most_specific_level() {
        let translation = translator().translate(WORKFLOW, github()).expect("Should translate");
        let steps = steps(&translation.text);
        let cache = &steps[0]["plugins"][0]["cache"];
        assert_eq!(cache["save"].as_str(), Some("file"));
        assert_eq!(cache["manifest"].as_str(), Some("package-lock.json"));
        assert_ne!(cache["restore"].as_str(), None);
    }

    #[test]
    fn test_malformed_job_is_isolated() {
        let mut text = String::from("jobs:\n");
        for n in 0..10 {
            text.push_str(&format!("  job{n}:\n"));
            if n > 0 {
                text.push_str(&format!("    needs: job{}\n", n - 1));
            }
            if n == 4 {
                text.push_str("    timeout-minutes: soon\n");
            }
            text.push_str(&format!("    steps:\n      - run: echo {n}\n"));
        }

        let translation = translator().translate(&text, github()).expect("Should translate");
        let steps = steps(&translation.text);
        assert_eq!(steps.len(), 10);
        let stubs: Vec<String> = steps.iter().filter(|s| s.get("skip").is_some()).map(key).collect();
        assert_eq!(stubs, vec!["job4"]);
        assert_eq!(steps.iter().filter(|s| s["command"].as_str().is_some_and(|c| c.starts_with("echo"))).count(), 9);
        assert_eq!(translation.diagnostics.of_kind(DiagnosticKind::Parse).count(), 1);
        assert_eq!(translation.diagnostics.error_count(), 1);
    }

    #[test]
    fn test_manual_approval_inserts_gate() {
        let text = r#"
stages: [build, test, deploy]
build:
  stage: build
  script: make
test:
  stage: test
  script: make test
deploy:
  stage: deploy
  script: make deploy
  when: manual
"#;
        let pair = VendorPair::new(Vendor::GitlabCi, Vendor::Buildkite);
        let translation = translator().translate(text, pair).expect("Should translate");
        assert!(translation.diagnostics.is_empty(), "{:?}", translation.diagnostics);

        let steps = steps(&translation.text);
        let keys: Vec<String> = steps.iter().map(key).collect();
        assert_eq!(keys, vec!["build", "test", "deploy-approval", "deploy"]);
        assert_eq!(steps[2]["block"].as_str(), Some("Run deploy"));
        assert_eq!(dependencies(&steps[2]), vec!["test"]);
        assert_eq!(dependencies(&steps[3]), vec!["deploy-approval"]);
    }

    #[test]
    fn test_unreadable_document_yields_no_jobs() {
        let translation = translator()
            .translate("jobs: [unclosed", github())
            .expect("Should still return a translation");
        assert!(translation.is_document_failure());
        assert!(translation.graph.jobs.is_empty());
        assert_eq!(translation.diagnostics.len(), 1);
        assert!(steps(&translation.text).is_empty());
    }

    #[test]
    fn test_default_queue_becomes_top_level_agents() {
        let translator = translator().with_default_queue(Some("linux".to_string()));
        let translation = translator.translate(WORKFLOW, github()).expect("Should translate");
        let value: Value = serde_yaml::from_str(&translation.text).expect("Should emit valid YAML");
        assert_eq!(value["agents"]["queue"].as_str(), Some("linux"));
        assert!(translation.text.starts_with("# Pipeline: CI\n"));
    }

    #[test]
    fn test_rejects_unsupported_vendors() {
        let result = translator().translate("jobs: {}", VendorPair::new(Vendor::GithubActions, Vendor::Jenkins));
        assert!(matches!(result, Err(TranslateError::UnsupportedTarget(Vendor::Jenkins))));
        let result = translator().translate("steps: []", VendorPair::new(Vendor::Buildkite, Vendor::Buildkite));
        assert!(matches!(result, Err(TranslateError::Document { .. })));
    }
}
