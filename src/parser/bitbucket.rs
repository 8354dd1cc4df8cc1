//! Bitbucket Pipelines parser.
//!
//! Every pipeline section (`default`, `branches`, `tags`, `pull-requests`,
//! `custom`) is flattened into one graph. Items run in sequence, `parallel`
//! groups fan out and join, and `stage` groups are lowered recursively.
//! The section a step came from becomes a condition on the step.

use std::collections::{BTreeMap, HashMap};

use indexmap::IndexMap;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use super::expr::{rename_variables, BITBUCKET_VARIABLES};
use super::yaml::{decode, duration_minutes, get, key_str, load_document, scalar, Text};
use super::{consume_upstream_artifacts, document_error, edges, placeholder, step_label, DialectParser, IdAllocator};
use crate::diagnostics::Diagnostics;
use crate::error::Result;
use crate::ir::{
    slugify, ApprovalGate, CacheKey, CacheKeyComponent, CacheSpec, ConcurrencyGroup, Conditional,
    Container, JobNode, PipelineGraph, Service, TriggerEvent,
};
use crate::vendor::Vendor;

/// Caches Bitbucket defines without a `definitions` entry.
const PREDEFINED_CACHES: &[(&str, &str)] = &[
    ("composer", "~/.composer/cache"),
    ("dotnetcore", "~/.nuget/packages"),
    ("gradle", "~/.gradle/caches"),
    ("ivy2", "~/.ivy2/cache"),
    ("maven", "~/.m2/repository"),
    ("node", "node_modules"),
    ("pip", "~/.cache/pip"),
    ("sbt", "~/.sbt"),
];

const KNOWN_KEYS: &[&str] = &["image", "options", "definitions", "pipelines", "clone"];

pub struct BitbucketParser;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct BbStep {
    name: Option<String>,
    #[serde(default)]
    script: Vec<Value>,
    #[serde(default)]
    after_script: Vec<Value>,
    image: Option<Value>,
    #[serde(default)]
    caches: Vec<String>,
    #[serde(default)]
    services: Vec<String>,
    artifacts: Option<Value>,
    trigger: Option<String>,
    deployment: Option<String>,
    size: Option<String>,
    max_time: Option<u32>,
    condition: Option<BbCondition>,
    #[serde(default)]
    runs_on: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BbCondition {
    changesets: Option<BbChangesets>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BbChangesets {
    #[serde(default)]
    include_paths: Vec<String>,
}

/// Document-wide settings pushed down into every step.
#[derive(Debug, Default)]
struct Globals {
    image: Option<String>,
    timeout_minutes: Option<u32>,
    size: Option<String>,
    caches: HashMap<String, (CacheKey, String)>,
    services: HashMap<String, String>,
}

/// Where a section's steps run.
struct Section {
    prefix: Option<String>,
    conditionals: Vec<Conditional>,
    environment: BTreeMap<String, String>,
}

/// Lowering state shared by every section.
struct Lowering<'a> {
    globals: &'a Globals,
    ids: IdAllocator,
    jobs: Vec<JobNode>,
    diagnostics: &'a mut Diagnostics,
    /// Jobs that consume artifacts of earlier steps
    consumers: Vec<usize>,
}

impl DialectParser for BitbucketParser {
    fn vendor(&self) -> Vendor {
        Vendor::BitbucketPipelines
    }

    fn parse_document(&self, text: &str, diagnostics: &mut Diagnostics) -> Result<PipelineGraph> {
        let doc = load_document(text, self.vendor())?;
        let Some(Value::Mapping(pipelines)) = get(&doc, "pipelines") else {
            return Err(document_error(self.vendor(), "document has no 'pipelines' mapping"));
        };

        let globals = globals(&doc);
        let mut graph = PipelineGraph::new();
        graph.timeout_minutes = globals.timeout_minutes;
        for (key, value) in &doc {
            if let Some(key) = key_str(key) {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    graph.extensions.insert(key, value.clone());
                }
            }
        }

        let sections = sections(pipelines);
        let prefix_ids = sections.len() > 1;
        let mut lowering = Lowering {
            globals: &globals,
            ids: IdAllocator::default(),
            jobs: Vec::new(),
            diagnostics,
            consumers: Vec::new(),
        };

        for (name, conditionals, items) in sections {
            let mut environment = BTreeMap::new();
            let mut items = items.as_slice();
            // Custom pipelines may open with their input variables
            if let Some(Value::Mapping(first)) = items.first() {
                if let Some(variables) = get(first, "variables") {
                    let variables: Vec<IndexMap<String, Text>> = decode(variables).unwrap_or_default();
                    for variable in variables {
                        if let Some(name) = variable.get("name") {
                            let default = variable.get("default").map(|t| t.0.clone()).unwrap_or_default();
                            environment.insert(name.0.clone(), default);
                        }
                    }
                    items = &items[1..];
                }
            }
            let section = Section {
                prefix: prefix_ids.then(|| slugify(&name)),
                conditionals,
                environment,
            };
            let mut counter = 0;
            lowering.lower_items(items, &section, Vec::new(), &mut counter);
        }

        let Lowering { mut jobs, consumers, .. } = lowering;
        consume_upstream_artifacts(&mut jobs, &consumers);
        graph.jobs = jobs;
        Ok(graph)
    }
}

fn globals(doc: &Mapping) -> Globals {
    let mut globals = Globals {
        image: get(doc, "image").and_then(image_name),
        ..Globals::default()
    };

    if let Some(Value::Mapping(options)) = get(doc, "options") {
        globals.timeout_minutes = get(options, "max-time")
            .and_then(scalar)
            .and_then(|t| duration_minutes(&t));
        globals.size = get(options, "size").and_then(scalar);
    }

    for (name, path) in PREDEFINED_CACHES {
        globals
            .caches
            .insert((*name).to_string(), (CacheKey::literal(*name), (*path).to_string()));
    }

    let definitions = get(doc, "definitions").and_then(Value::as_mapping);
    if let Some(Value::Mapping(caches)) = definitions.and_then(|d| get(d, "caches")) {
        for (name, cache) in caches {
            let Some(name) = key_str(name) else { continue };
            let entry = match cache {
                Value::Mapping(m) => {
                    let path = get(m, "path").and_then(scalar).unwrap_or_default();
                    let files: Vec<String> = get(m, "key")
                        .and_then(Value::as_mapping)
                        .and_then(|k| get(k, "files"))
                        .and_then(|f| decode(f).ok())
                        .unwrap_or_default();
                    let key = if files.is_empty() {
                        CacheKey::literal(name.clone())
                    } else {
                        CacheKey(vec![
                            CacheKeyComponent::Literal(format!("{name}-")),
                            CacheKeyComponent::FileHash(files),
                        ])
                    };
                    (key, path)
                }
                other => (CacheKey::literal(name.clone()), scalar(other).unwrap_or_default()),
            };
            globals.caches.insert(name, entry);
        }
    }

    if let Some(Value::Mapping(services)) = definitions.and_then(|d| get(d, "services")) {
        for (name, service) in services {
            let image = service.as_mapping().and_then(|s| get(s, "image")).and_then(image_name);
            if let (Some(name), Some(image)) = (key_str(name), image) {
                globals.services.insert(name, image);
            }
        }
    }

    globals
}

fn image_name(value: &Value) -> Option<String> {
    match value {
        Value::Mapping(m) => get(m, "name").and_then(scalar),
        other => scalar(other),
    }
}

/// Pipeline sections in document order with the conditions they imply.
fn sections(pipelines: &Mapping) -> Vec<(String, Vec<Conditional>, Vec<Value>)> {
    let branch_patterns: Vec<String> = get(pipelines, "branches")
        .and_then(Value::as_mapping)
        .map(|b| b.keys().filter_map(key_str).collect())
        .unwrap_or_default();

    let mut sections = Vec::new();
    for (kind, value) in pipelines {
        let Some(kind) = key_str(kind) else { continue };
        match (kind.as_str(), value) {
            ("default", Value::Sequence(items)) => {
                let conditionals = if branch_patterns.is_empty() {
                    Vec::new()
                } else {
                    vec![Conditional::ignore_branches(branch_patterns.clone())]
                };
                sections.push((kind.clone(), conditionals, items.clone()));
            }
            ("branches" | "tags" | "pull-requests" | "custom", Value::Mapping(named)) => {
                for (pattern, items) in named {
                    let (Some(pattern), Value::Sequence(items)) = (key_str(pattern), items) else {
                        continue;
                    };
                    let conditional = match kind.as_str() {
                        "branches" => Conditional::only_branches(vec![pattern.clone()]),
                        "tags" => Conditional::Tags {
                            patterns: vec![pattern.clone()],
                        },
                        "pull-requests" => Conditional::Event {
                            events: vec![TriggerEvent::PullRequest],
                        },
                        _ => Conditional::Event {
                            events: vec![TriggerEvent::Manual],
                        },
                    };
                    sections.push((format!("{kind}-{pattern}"), vec![conditional], items.clone()));
                }
            }
            _ => {}
        }
    }
    sections
}

impl Lowering<'_> {
    /// Lowers a sequence of items; returns the ids the next item must wait for.
    fn lower_items(
        &mut self,
        items: &[Value],
        section: &Section,
        mut predecessors: Vec<String>,
        counter: &mut usize,
    ) -> Vec<String> {
        for item in items {
            predecessors = self.lower_item(item, section, predecessors, counter);
        }
        predecessors
    }

    fn lower_item(
        &mut self,
        item: &Value,
        section: &Section,
        predecessors: Vec<String>,
        counter: &mut usize,
    ) -> Vec<String> {
        let Some(item) = item.as_mapping() else {
            return predecessors;
        };

        if let Some(step) = get(item, "step") {
            return vec![self.lower_step(step, section, &predecessors, counter)];
        }

        if let Some(parallel) = get(item, "parallel") {
            let branches: Vec<Value> = match parallel {
                Value::Mapping(m) => get(m, "steps").and_then(|s| decode(s).ok()).unwrap_or_default(),
                other => decode(other).unwrap_or_default(),
            };
            let mut terminals = Vec::new();
            for branch in &branches {
                terminals.extend(self.lower_item(branch, section, predecessors.clone(), counter));
            }
            return if terminals.is_empty() { predecessors } else { terminals };
        }

        if let Some(Value::Mapping(stage)) = get(item, "stage") {
            let steps: Vec<Value> = get(stage, "steps").and_then(|s| decode(s).ok()).unwrap_or_default();
            let first = self.jobs.len();
            let terminals = self.lower_items(&steps, section, predecessors.clone(), counter);
            self.apply_stage(stage, first);
            return terminals;
        }

        predecessors
    }

    /// Stage-level settings apply to every step lowered from the stage.
    fn apply_stage(&mut self, stage: &Mapping, first: usize) {
        let manual = get(stage, "trigger").and_then(scalar).as_deref() == Some("manual");
        let deployment = get(stage, "deployment").and_then(scalar);
        let changes: Vec<String> = get(stage, "condition")
            .and_then(|c| decode::<BbCondition>(c).ok())
            .and_then(|c| c.changesets)
            .map(|c| c.include_paths)
            .unwrap_or_default();
        let name = get(stage, "name").and_then(scalar);

        for (offset, job) in self.jobs[first..].iter_mut().enumerate() {
            if job.is_unsupported() {
                continue;
            }
            if manual && offset == 0 {
                job.approval = Some(ApprovalGate {
                    prompt: Some(format!("Run stage {}", name.as_deref().unwrap_or(&job.label))),
                    inferred: false,
                });
            }
            if let Some(deployment) = &deployment {
                job.concurrency = Some(ConcurrencyGroup {
                    group: format!("deployment-{deployment}"),
                    limit: 1,
                });
            }
            if !changes.is_empty() {
                job.conditionals.push(Conditional::Changes { paths: changes.clone() });
            }
        }
    }

    fn lower_step(&mut self, step: &Value, section: &Section, predecessors: &[String], counter: &mut usize) -> String {
        let position = *counter;
        *counter += 1;

        let name = step.as_mapping().and_then(|m| get(m, "name")).and_then(scalar);
        let label = name.clone().unwrap_or_else(|| step_label(position));
        let base = super::job_id(&label, position);
        let base = match &section.prefix {
            Some(prefix) => format!("{prefix}-{base}"),
            None => base,
        };
        let id = self.ids.allocate(&base);

        let job = match decode::<BbStep>(step) {
            Ok(source) => self.lower_source(&id, &label, source, section, predecessors),
            Err(message) => placeholder(self.diagnostics, &id, &label, edges(predecessors), message),
        };
        let downloads = step
            .as_mapping()
            .and_then(|m| get(m, "artifacts"))
            .and_then(Value::as_mapping)
            .and_then(|a| get(a, "download"))
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if downloads && !job.is_unsupported() {
            self.consumers.push(self.jobs.len());
        }
        self.jobs.push(job);
        id
    }

    fn lower_source(
        &mut self,
        id: &str,
        label: &str,
        source: BbStep,
        section: &Section,
        predecessors: &[String],
    ) -> JobNode {
        let mut job = JobNode::new(id, label);
        job.depends_on = edges(predecessors);
        job.conditionals = section.conditionals.clone();
        job.environment = section.environment.clone();

        let image = source.image.as_ref().and_then(image_name).or_else(|| self.globals.image.clone());
        job.container = image.map(|image| Container {
            image,
            workdir: None,
            shell: None,
        });

        for entry in &source.script {
            match entry {
                Value::Mapping(m) => {
                    if let Some(pipe) = get(m, "pipe").and_then(scalar) {
                        job.external_actions.push(pipe);
                    }
                }
                other => {
                    if let Some(command) = scalar(other) {
                        job.commands.push(rename_variables(command.trim_end(), BITBUCKET_VARIABLES));
                    }
                }
            }
        }
        job.post_commands = source
            .after_script
            .iter()
            .filter_map(scalar)
            .map(|c| rename_variables(c.trim_end(), BITBUCKET_VARIABLES))
            .collect();

        let mut key_parts = Vec::new();
        let mut paths = Vec::new();
        for name in &source.caches {
            if name == "docker" {
                continue;
            }
            if let Some((key, path)) = self.globals.caches.get(name) {
                if !key_parts.is_empty() {
                    key_parts.push(CacheKeyComponent::Literal("-".to_string()));
                }
                key_parts.extend(key.0.iter().cloned());
                paths.push(path.clone());
            }
        }
        if !key_parts.is_empty() {
            job.cache = Some(CacheSpec {
                key: CacheKey(key_parts),
                paths,
                fallback: Vec::new(),
            });
        }

        job.services = source
            .services
            .iter()
            .filter(|name| name.as_str() != "docker")
            .filter_map(|name| {
                Some(Service {
                    name: name.clone(),
                    image: self.globals.services.get(name)?.clone(),
                })
            })
            .collect();

        job.artifacts.produces = match &source.artifacts {
            Some(Value::Mapping(m)) => get(m, "paths").and_then(|p| decode(p).ok()).unwrap_or_default(),
            Some(other) => decode(other).unwrap_or_default(),
            None => Vec::new(),
        };

        if source.trigger.as_deref() == Some("manual") {
            job.approval = Some(ApprovalGate {
                prompt: Some(format!("Run {label}")),
                inferred: false,
            });
        }
        if let Some(deployment) = source.deployment {
            job.environment.insert("DEPLOYMENT_ENVIRONMENT".to_string(), deployment.clone());
            job.concurrency = Some(ConcurrencyGroup {
                group: format!("deployment-{deployment}"),
                limit: 1,
            });
        }
        job.resource_hint = if source.runs_on.is_empty() {
            source.size.or_else(|| self.globals.size.clone())
        } else {
            Some(source.runs_on.join(","))
        };
        job.timeout_minutes = source.max_time.or(self.globals.timeout_minutes);
        if let Some(paths) = source.condition.and_then(|c| c.changesets).map(|c| c.include_paths) {
            if !paths.is_empty() {
                job.conditionals.push(Conditional::Changes { paths });
            }
        }
        job
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticKind;
    use crate::ir::CacheLevel;

    const PIPELINE: &str = r#"
image: node:18
options:
  max-time: 30
definitions:
  caches:
    deps:
      key:
        files: [package-lock.json]
      path: node_modules
  services:
    postgres:
      image: postgres:14
  steps:
    - step: &test
        name: Test
        caches: [deps]
        services: [postgres]
        script:
          - npm test
pipelines:
  default:
    - step:
        name: Build
        caches: [deps]
        script:
          - npm ci
          - npm run build -- --sha $BITBUCKET_COMMIT
        artifacts:
          - dist/**
    - parallel:
        - step: *test
        - step:
            script:
              - npm run lint
    - step:
        name: Deploy
        trigger: manual
        deployment: production
        script:
          - pipe: atlassian/aws-s3-deploy:1.1.0
            variables:
              S3_BUCKET: site
          - echo done
"#;

    fn parse(text: &str) -> (PipelineGraph, Diagnostics) {
        let output = BitbucketParser.parse(text);
        (output.graph, output.diagnostics)
    }

    #[test]
    fn test_sequence_and_parallel_become_explicit_edges() {
        let (graph, diagnostics) = parse(PIPELINE);
        assert!(diagnostics.is_empty(), "Should parse cleanly: {diagnostics:?}");
        let ids: Vec<&str> = graph.jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["build", "test", "step-3", "deploy"]);
        assert_eq!(graph.jobs[1].dependency_ids().collect::<Vec<_>>(), vec!["build"]);
        assert_eq!(graph.jobs[2].dependency_ids().collect::<Vec<_>>(), vec!["build"]);
        assert_eq!(
            graph.jobs[3].dependency_ids().collect::<Vec<_>>(),
            vec!["test", "step-3"],
            "Should join the parallel group"
        );
    }

    #[test]
    fn test_global_image_and_timeout_are_pushed_down() {
        let (graph, _) = parse(PIPELINE);
        assert_eq!(graph.timeout_minutes, Some(30));
        for job in &graph.jobs {
            assert_eq!(job.container.as_ref().map(|c| c.image.as_str()), Some("node:18"));
            assert_eq!(job.timeout_minutes, Some(30));
        }
    }

    #[test]
    fn test_cache_services_and_artifacts() {
        let (graph, _) = parse(PIPELINE);
        let build = &graph.jobs[0];
        let cache = build.cache.as_ref().expect("Should lower deps cache");
        assert_eq!(cache.save_level(), CacheLevel::File);
        assert_eq!(cache.paths, vec!["node_modules"]);
        assert_eq!(build.artifacts.produces, vec!["dist/**"]);
        assert_eq!(build.commands[1], "npm run build -- --sha $BUILDKITE_COMMIT");

        let test = &graph.jobs[1];
        assert_eq!(test.services[0].image, "postgres:14");
        assert_eq!(test.artifacts.consumes, vec!["build"]);
    }

    #[test]
    fn test_manual_trigger_and_pipe() {
        let (graph, _) = parse(PIPELINE);
        let deploy = &graph.jobs[3];
        assert!(deploy.approval.as_ref().is_some_and(|a| !a.inferred));
        assert_eq!(deploy.external_actions, vec!["atlassian/aws-s3-deploy:1.1.0"]);
        assert_eq!(deploy.commands, vec!["echo done"]);
        assert_eq!(deploy.artifacts.consumes, vec!["build"]);
    }

    #[test]
    fn test_branch_sections_are_conditions() {
        let text = r#"
pipelines:
  default:
    - step:
        script: [make test]
  branches:
    main:
      - step:
          name: Release
          script: [make release]
"#;
        let (graph, _) = parse(text);
        assert_eq!(graph.jobs[0].id, "default-step-1");
        assert_eq!(
            graph.jobs[0].conditionals,
            vec![Conditional::ignore_branches(vec!["main".to_string()])]
        );
        assert_eq!(graph.jobs[1].id, "branches-main-release");
        assert_eq!(
            graph.jobs[1].conditionals,
            vec![Conditional::only_branches(vec!["main".to_string()])]
        );
    }

    #[test]
    fn test_stage_steps_are_sequential_and_gated() {
        let text = r#"
pipelines:
  default:
    - stage:
        name: Deploy
        trigger: manual
        deployment: staging
        steps:
          - step:
              name: Migrate
              script: [./migrate.sh]
          - step:
              name: Release
              script: [./release.sh]
"#;
        let (graph, _) = parse(text);
        assert_eq!(graph.jobs[1].dependency_ids().collect::<Vec<_>>(), vec!["migrate"]);
        assert!(graph.jobs[0].approval.is_some());
        assert!(graph.jobs[1].approval.is_none());
        assert_eq!(
            graph.jobs[1].concurrency.as_ref().map(|c| c.group.as_str()),
            Some("deployment-staging")
        );
    }

    #[test]
    fn test_malformed_step_keeps_its_edges() {
        let text = r#"
pipelines:
  default:
    - step:
        name: Build
        script: [make]
    - step:
        name: Broken
        max-time: forever
        script: [make test]
    - step:
        name: After
        script: [echo]
"#;
        let (graph, diagnostics) = parse(text);
        assert_eq!(graph.jobs.len(), 3);
        assert!(graph.jobs[1].is_unsupported());
        assert_eq!(graph.jobs[1].dependency_ids().collect::<Vec<_>>(), vec!["build"]);
        assert_eq!(graph.jobs[2].dependency_ids().collect::<Vec<_>>(), vec!["broken"]);
        assert_eq!(diagnostics.of_kind(DiagnosticKind::Parse).count(), 1);
    }

    #[test]
    fn test_missing_pipelines_is_document_error() {
        let (graph, diagnostics) = parse("image: node\n");
        assert!(graph.jobs.is_empty());
        assert_eq!(diagnostics.of_kind(DiagnosticKind::Document).count(), 1);
    }
}
