//! GitHub Actions workflow parser.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use super::expr::{has_github_expression, rewrite_github};
use super::yaml::{decode, get, key_str, load_document, scalar, OneOrMany, Text};
use super::{document_error, edges, job_id, placeholder, DialectParser};
use crate::diagnostics::Diagnostics;
use crate::error::Result;
use crate::ir::{
    ApprovalGate, CacheKey, CacheKeyComponent, CacheSpec, CompareOp, ConcurrencyGroup, Conditional,
    Container, JobNode, MatrixSpec, PipelineGraph, RunWhen, Schedule, Service, TemplateResidue,
    Trigger, TriggerEvent,
};
use crate::vendor::Vendor;

static SECRET_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*secrets\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid secret pattern")
});

static HASH_FILES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^hashFiles\(\s*(.*?)\s*\)$").expect("valid hashFiles pattern")
});

static KEY_PART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\{\s*(.*?)\s*\}\}").expect("valid key part pattern"));

static REF_COMPARE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^github\.(ref|ref_name|head_ref|base_ref|event_name)\s*(==|!=)\s*'([^']*)'$")
        .expect("valid comparison pattern")
});

static STARTS_WITH_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^startsWith\(\s*github\.ref\s*,\s*'refs/tags/([^']*)'\s*\)$")
        .expect("valid startsWith pattern")
});

static VAR_COMPARE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:env|vars)\.([A-Za-z_][A-Za-z0-9_]*)\s*(==|!=)\s*'([^']*)'$")
        .expect("valid variable comparison pattern")
});

const DEFAULT_RUNNERS: &[&str] = &["ubuntu-latest", "ubuntu-24.04", "ubuntu-22.04", "ubuntu-20.04"];

const KNOWN_KEYS: &[&str] = &["name", "on", "env", "defaults", "jobs"];

pub struct GithubParser;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct GhJob {
    name: Option<String>,
    #[serde(default)]
    needs: OneOrMany<String>,
    #[serde(rename = "if")]
    condition: Option<Text>,
    runs_on: Option<Value>,
    container: Option<Value>,
    #[serde(default)]
    services: IndexMap<String, Value>,
    strategy: Option<GhStrategy>,
    timeout_minutes: Option<u32>,
    continue_on_error: Option<Value>,
    environment: Option<Value>,
    concurrency: Option<Value>,
    #[serde(default)]
    outputs: IndexMap<String, Text>,
    uses: Option<String>,
    #[serde(default)]
    env: IndexMap<String, Text>,
    defaults: Option<GhDefaults>,
    #[serde(default)]
    steps: Vec<GhStep>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct GhStrategy {
    matrix: Option<Value>,
    max_parallel: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct GhDefaults {
    run: Option<GhRunDefaults>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct GhRunDefaults {
    shell: Option<String>,
    working_directory: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct GhStep {
    name: Option<String>,
    uses: Option<String>,
    run: Option<String>,
    #[serde(default)]
    with: IndexMap<String, Text>,
    #[serde(rename = "if")]
    condition: Option<Text>,
    working_directory: Option<String>,
}

/// Workflow-wide settings pushed down into every job.
#[derive(Debug, Default)]
struct Globals {
    environment: BTreeMap<String, String>,
    shell: Option<String>,
    working_directory: Option<String>,
    /// Artifact name to producing job id
    artifact_producers: HashMap<String, String>,
}

impl DialectParser for GithubParser {
    fn vendor(&self) -> Vendor {
        Vendor::GithubActions
    }

    fn parse_document(&self, text: &str, diagnostics: &mut Diagnostics) -> Result<PipelineGraph> {
        let doc = load_document(text, self.vendor())?;
        let Some(Value::Mapping(jobs)) = get(&doc, "jobs") else {
            return Err(document_error(self.vendor(), "workflow has no 'jobs' mapping"));
        };

        let mut graph = PipelineGraph::new();
        graph.name = get(&doc, "name").and_then(scalar);
        for (key, value) in &doc {
            if let Some(key) = key_str(key) {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    graph.extensions.insert(key, value.clone());
                }
            }
        }
        if let Some(on) = get(&doc, "on") {
            lower_triggers(on, &mut graph);
        }

        let mut globals = Globals::default();
        for (name, value) in super::yaml::string_pairs(get(&doc, "env")) {
            globals.environment.insert(name, rewrite_github(&value));
        }
        if let Ok(defaults) = get(&doc, "defaults").map(decode::<GhDefaults>).transpose() {
            if let Some(run) = defaults.and_then(|d| d.run) {
                globals.shell = run.shell;
                globals.working_directory = run.working_directory;
            }
        }
        globals.artifact_producers = artifact_producers(jobs);
        graph.environment = globals.environment.clone();

        for (position, (key, value)) in jobs.iter().enumerate() {
            let key = key_str(key).unwrap_or_default();
            let id = job_id(&key, position);
            let job = match decode::<GhJob>(value) {
                Ok(source) => lower_job(&id, &key, source, &globals),
                Err(message) => {
                    let needs = salvage_needs(value);
                    placeholder(diagnostics, &id, &key, edges(needs), message)
                }
            };
            graph.jobs.push(job);
        }

        Ok(graph)
    }
}

fn salvage_needs(value: &Value) -> Vec<String> {
    value
        .as_mapping()
        .and_then(|m| get(m, "needs"))
        .and_then(|needs| decode::<OneOrMany<String>>(needs).ok())
        .map(OneOrMany::into_vec)
        .unwrap_or_default()
}

fn artifact_producers(jobs: &Mapping) -> HashMap<String, String> {
    let mut producers = HashMap::new();
    for (position, (key, value)) in jobs.iter().enumerate() {
        let id = job_id(&key_str(key).unwrap_or_default(), position);
        let Ok(job) = decode::<GhJob>(value) else {
            continue;
        };
        for step in &job.steps {
            if step.uses.as_deref().is_some_and(|u| action_name(u) == "actions/upload-artifact") {
                let name = step.with.get("name").map_or("artifact", |t| t.0.as_str());
                producers.entry(name.to_string()).or_insert_with(|| id.clone());
            }
        }
    }
    producers
}

fn action_name(uses: &str) -> &str {
    uses.split('@').next().unwrap_or(uses)
}

fn lower_job(id: &str, key: &str, source: GhJob, globals: &Globals) -> JobNode {
    let mut job = JobNode::new(id, source.name.clone().map_or_else(|| key.to_string(), |n| rewrite_github(&n)));
    job.depends_on = edges(source.needs.into_vec());

    job.environment = globals.environment.clone();
    for (name, value) in source.env {
        job.environment.insert(name, rewrite_github(&value.0));
    }

    let run_defaults = source.defaults.and_then(|d| d.run).unwrap_or_default();
    let shell = run_defaults.shell.or_else(|| globals.shell.clone());
    let working_directory = run_defaults
        .working_directory
        .or_else(|| globals.working_directory.clone());

    if let Some(container) = &source.container {
        job.container = lower_container(container, shell.as_deref());
    }
    job.services = source
        .services
        .iter()
        .filter_map(|(name, value)| {
            let image = match value {
                Value::Mapping(m) => get(m, "image").and_then(scalar)?,
                other => scalar(other)?,
            };
            Some(Service {
                name: name.clone(),
                image: rewrite_github(&image),
            })
        })
        .collect();

    if let Some(runs_on) = source.runs_on.as_ref().and_then(runner_label) {
        if !DEFAULT_RUNNERS.contains(&runs_on.as_str()) {
            job.resource_hint = Some(rewrite_github(&runs_on));
        }
    }

    if let Some(strategy) = source.strategy {
        if let Some(matrix) = &strategy.matrix {
            match lower_matrix(matrix) {
                Some(spec) => job.matrix = Some(spec),
                None => {
                    job.template = Some(TemplateResidue {
                        name: "strategy.matrix".to_string(),
                        reason: "matrix is computed at runtime".to_string(),
                    });
                }
            }
        }
        if let Some(limit) = strategy.max_parallel {
            job.concurrency = Some(ConcurrencyGroup {
                group: format!("{id}-matrix"),
                limit,
            });
        }
    }

    if let Some(condition) = &source.condition {
        job.conditionals.extend(parse_condition(&condition.0));
    }

    job.timeout_minutes = source.timeout_minutes;
    job.soft_fail = matches!(source.continue_on_error, Some(Value::Bool(true)));

    if let Some(environment) = &source.environment {
        let name = match environment {
            Value::Mapping(m) => get(m, "name").and_then(scalar),
            other => scalar(other),
        };
        if let Some(name) = name {
            job.approval = Some(ApprovalGate {
                prompt: Some(format!("Deploy to {}", rewrite_github(&name))),
                inferred: true,
            });
        }
    }

    if let Some(concurrency) = &source.concurrency {
        let group = match concurrency {
            Value::Mapping(m) => get(m, "group").and_then(scalar),
            other => scalar(other),
        };
        if let Some(group) = group {
            job.concurrency = Some(ConcurrencyGroup {
                group: rewrite_github(&group),
                limit: 1,
            });
        }
    }

    job.outputs = source.outputs.keys().cloned().collect();

    if let Some(uses) = source.uses {
        job.template = Some(TemplateResidue {
            name: uses,
            reason: "reusable workflow call".to_string(),
        });
    }

    for (position, step) in source.steps.into_iter().enumerate() {
        lower_step(&mut job, position, step, working_directory.as_deref(), globals);
    }

    job
}

fn runner_label(runs_on: &Value) -> Option<String> {
    match runs_on {
        Value::Sequence(labels) => {
            let labels: Vec<String> = labels.iter().filter_map(scalar).collect();
            (!labels.is_empty()).then(|| labels.join(","))
        }
        Value::Mapping(m) => get(m, "group")
            .or_else(|| get(m, "labels"))
            .and_then(runner_label),
        other => scalar(other),
    }
}

fn lower_container(value: &Value, shell: Option<&str>) -> Option<Container> {
    let image = match value {
        Value::Mapping(m) => get(m, "image").and_then(scalar)?,
        other => scalar(other)?,
    };
    Some(Container {
        image: rewrite_github(&image),
        workdir: None,
        shell: shell.map(shell_invocation),
    })
}

fn shell_invocation(shell: &str) -> Vec<String> {
    match shell {
        "bash" => vec!["bash".into(), "-eo".into(), "pipefail".into(), "-c".into()],
        "sh" => vec!["sh".into(), "-e".into(), "-c".into()],
        other => other.split_whitespace().map(String::from).collect(),
    }
}

fn lower_matrix(value: &Value) -> Option<MatrixSpec> {
    let Value::Mapping(mapping) = value else {
        return None;
    };

    let mut spec = MatrixSpec::new();
    for (key, values) in mapping {
        let key = key_str(key)?;
        match key.as_str() {
            "include" | "exclude" => continue,
            _ => {
                let values: Vec<Text> = decode(values).ok()?;
                spec.dimensions.insert(key, values.into_iter().map(String::from).collect());
            }
        }
    }

    for (key, skip) in [("include", false), ("exclude", true)] {
        let Some(entries) = get(mapping, key) else {
            continue;
        };
        let entries: Vec<IndexMap<String, Text>> = decode(entries).ok()?;
        for entry in entries {
            let with = entry.into_iter().map(|(k, v)| (k, v.0)).collect();
            spec.adjustments.push(crate::ir::Adjustment { with, skip });
        }
    }

    Some(spec)
}

fn lower_step(
    job: &mut JobNode,
    position: usize,
    step: GhStep,
    working_directory: Option<&str>,
    globals: &Globals,
) {
    for text in step.run.iter().chain(step.with.values().map(|t| &t.0)) {
        for caps in SECRET_REF.captures_iter(text) {
            let name = caps[1].to_string();
            if !job.secrets.contains(&name) {
                job.secrets.push(name);
            }
        }
    }

    if let Some(condition) = &step.condition {
        let label = step.name.clone().unwrap_or_else(|| super::step_label(position));
        job.conditionals.push(Conditional::StepGuard {
            step: label,
            source: condition.0.clone(),
        });
    }

    if let Some(run) = &step.run {
        let command = rewrite_github(run);
        let directory = step.working_directory.as_deref().or(working_directory);
        job.commands.push(match directory {
            Some(dir) if command.contains('\n') => format!("(\ncd {dir}\n{command}\n)"),
            Some(dir) => format!("(cd {dir} && {command})"),
            None => command,
        });
        return;
    }

    let Some(uses) = &step.uses else {
        return;
    };
    match action_name(uses) {
        "actions/checkout" => {}
        "actions/cache" | "actions/cache/restore" => {
            let key = step.with.get("key").map(|t| parse_cache_key(&t.0));
            let paths = step
                .with
                .get("path")
                .map(|t| lines(&t.0))
                .unwrap_or_default();
            let fallback = step
                .with
                .get("restore-keys")
                .map(|t| lines(&t.0).iter().map(|k| parse_cache_key(k)).collect())
                .unwrap_or_default();
            if let Some(key) = key {
                job.cache = Some(CacheSpec { key, paths, fallback });
            }
        }
        "actions/upload-artifact" => {
            if let Some(path) = step.with.get("path") {
                job.artifacts.produces.extend(lines(&path.0));
            }
        }
        "actions/download-artifact" => {
            let producers: Vec<String> = match step.with.get("name") {
                Some(name) => globals.artifact_producers.get(&name.0).cloned().into_iter().collect(),
                None => {
                    let needs: Vec<&str> = job.dependency_ids().collect();
                    let mut all: Vec<String> = globals
                        .artifact_producers
                        .values()
                        .filter(|p| needs.contains(&p.as_str()))
                        .cloned()
                        .collect();
                    all.sort();
                    all.dedup();
                    all
                }
            };
            for producer in producers {
                if !job.artifacts.consumes.contains(&producer) {
                    job.artifacts.consumes.push(producer);
                }
            }
        }
        _ => job.external_actions.push(uses.clone()),
    }
}

fn lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// Splits a cache key such as `${{ runner.os }}-node-${{ hashFiles('**/package-lock.json') }}`
/// into key components.
fn parse_cache_key(text: &str) -> CacheKey {
    let mut components = Vec::new();
    let mut last = 0;
    for caps in KEY_PART.captures_iter(text) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        if whole.start > last {
            components.push(CacheKeyComponent::Literal(text[last..whole.start].to_string()));
        }
        let inner = &caps[1];
        components.push(match HASH_FILES.captures(inner) {
            Some(files) => CacheKeyComponent::FileHash(
                files[1]
                    .split(',')
                    .map(|f| f.trim().trim_matches('\'').trim_matches('"').to_string())
                    .filter(|f| !f.is_empty())
                    .collect(),
            ),
            None if inner == "github.ref" || inner == "github.ref_name" => CacheKeyComponent::Branch,
            None => CacheKeyComponent::Variable(inner.to_string()),
        });
        last = whole.end;
    }
    if last < text.len() {
        components.push(CacheKeyComponent::Literal(text[last..].to_string()));
    }
    CacheKey(components)
}

/// Recognizes the common shapes of a job `if:`.
///
/// A conjunction of branch, tag, event, variable and status checks becomes
/// structured conditionals; anything else is kept as one raw expression.
fn parse_condition(text: &str) -> Vec<Conditional> {
    let trimmed = text.trim();
    let inner = trimmed
        .strip_prefix("${{")
        .and_then(|s| s.strip_suffix("}}"))
        .unwrap_or(trimmed)
        .trim();

    let raw = || vec![Conditional::Expression { source: inner.to_string() }];
    if inner.contains("||") || has_github_expression(inner) {
        return raw();
    }

    let mut conditionals = Vec::new();
    for clause in inner.split("&&").map(str::trim) {
        match parse_clause(clause) {
            Some(Some(conditional)) => conditionals.push(conditional),
            Some(None) => {}
            None => return raw(),
        }
    }
    conditionals
}

/// `None` when the clause is not recognized, `Some(None)` when it is a no-op.
fn parse_clause(clause: &str) -> Option<Option<Conditional>> {
    match clause {
        "success()" => return Some(None),
        "always()" | "!cancelled()" => return Some(Some(Conditional::Status { when: RunWhen::Always })),
        "failure()" => return Some(Some(Conditional::Status { when: RunWhen::OnFailure })),
        _ => {}
    }

    if let Some(caps) = STARTS_WITH_TAG.captures(clause) {
        let pattern = format!("{}*", &caps[1]);
        return Some(Some(Conditional::Tags { patterns: vec![pattern] }));
    }

    if let Some(caps) = REF_COMPARE.captures(clause) {
        let negated = &caps[2] == "!=";
        let value = caps[3].to_string();
        let conditional = match &caps[1] {
            "event_name" => {
                let event = match value.as_str() {
                    "push" => TriggerEvent::Push,
                    "pull_request" | "pull_request_target" => TriggerEvent::PullRequest,
                    "schedule" => TriggerEvent::Schedule,
                    "workflow_dispatch" => TriggerEvent::Manual,
                    "repository_dispatch" | "workflow_call" => TriggerEvent::Api,
                    _ => return None,
                };
                if negated {
                    return None;
                }
                Conditional::Event { events: vec![event] }
            }
            "ref" if value.starts_with("refs/tags/") => {
                if negated {
                    return None;
                }
                Conditional::Tags {
                    patterns: vec![value.trim_start_matches("refs/tags/").to_string()],
                }
            }
            _ => {
                let branch = value.trim_start_matches("refs/heads/").to_string();
                if negated {
                    Conditional::ignore_branches(vec![branch])
                } else {
                    Conditional::only_branches(vec![branch])
                }
            }
        };
        return Some(Some(conditional));
    }

    if let Some(caps) = VAR_COMPARE.captures(clause) {
        return Some(Some(Conditional::Variable {
            name: caps[1].to_string(),
            op: if &caps[2] == "==" { CompareOp::Eq } else { CompareOp::Ne },
            value: caps[3].to_string(),
        }));
    }

    None
}

fn lower_triggers(on: &Value, graph: &mut PipelineGraph) {
    let plain = |event: &str| -> Option<TriggerEvent> {
        match event {
            "push" => Some(TriggerEvent::Push),
            "pull_request" | "pull_request_target" => Some(TriggerEvent::PullRequest),
            "workflow_dispatch" => Some(TriggerEvent::Manual),
            "repository_dispatch" | "workflow_call" => Some(TriggerEvent::Api),
            _ => None,
        }
    };

    match on {
        Value::Mapping(events) => {
            for (event, config) in events {
                let Some(event) = key_str(event) else { continue };
                if event == "schedule" {
                    let entries: Vec<IndexMap<String, String>> = decode(config).unwrap_or_default();
                    for entry in entries {
                        if let Some(cron) = entry.get("cron") {
                            graph.schedules.push(Schedule {
                                cron: cron.clone(),
                                branch: None,
                            });
                        }
                    }
                    continue;
                }
                let Some(kind) = plain(&event) else { continue };
                let filters = config.as_mapping();
                let list = |name: &str| -> Vec<String> {
                    filters
                        .and_then(|m| get(m, name))
                        .and_then(|v| decode::<OneOrMany<String>>(v).ok())
                        .map(OneOrMany::into_vec)
                        .unwrap_or_default()
                };
                let tags = list("tags");
                if !tags.is_empty() {
                    graph.triggers.push(Trigger {
                        event: TriggerEvent::Tag,
                        branches: tags,
                        paths: Vec::new(),
                    });
                }
                let branches = list("branches");
                let paths = list("paths");
                let tags_only = !list("tags").is_empty() && branches.is_empty() && paths.is_empty();
                if !tags_only {
                    graph.triggers.push(Trigger {
                        event: kind,
                        branches,
                        paths,
                    });
                }
            }
        }
        Value::Sequence(events) => {
            for event in events.iter().filter_map(scalar) {
                if let Some(kind) = plain(&event) {
                    graph.triggers.push(Trigger {
                        event: kind,
                        branches: Vec::new(),
                        paths: Vec::new(),
                    });
                }
            }
        }
        other => {
            if let Some(kind) = scalar(other).as_deref().and_then(plain) {
                graph.triggers.push(Trigger {
                    event: kind,
                    branches: Vec::new(),
                    paths: Vec::new(),
                });
            }
        }
    }
}
