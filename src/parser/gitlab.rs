//! GitLab CI parser.
//!
//! Hidden templates, `extends` and `!reference` tags are resolved first,
//! then `default` and legacy top-level settings are pushed into every job.
//! Stage order becomes explicit edges for jobs without `needs`.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use super::expr::{rename_variable, rename_variables, GITLAB_VARIABLES};
use super::yaml::{decode, duration_minutes, get, key_str, load_document, scalar, OneOrMany, Text};
use super::{document_error, edges, job_id, placeholder, DialectParser};
use crate::diagnostics::Diagnostics;
use crate::error::Result;
use crate::ir::{
    matrix_token, ApprovalGate, BranchFilter, CacheKey, CacheKeyComponent, CacheSpec, CompareOp,
    ConcurrencyGroup, Conditional, Container, JobNode, MatrixSpec, PipelineGraph, RetryCondition,
    RetryPolicy, RunWhen, Service, TemplateResidue, Trigger, TriggerEvent,
};
use crate::vendor::Vendor;

static EQUALITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\$\{?(\w+)\}?\s*(==|!=)\s*(?:"([^"]*)"|'([^']*)'|\$\{?(\w+)\}?)$"#)
        .expect("valid equality pattern")
});

static MATCHING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\$\{?(\w+)\}?\s*(=~|!~)\s*(/.*/[a-z]*)$").expect("valid match pattern")
});

static PRESENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$\{?(\w+)\}?$").expect("valid presence pattern"));

const RESERVED_KEYS: &[&str] = &[
    "stages",
    "default",
    "variables",
    "workflow",
    "include",
    "image",
    "services",
    "before_script",
    "after_script",
    "cache",
    "spec",
];

/// Keys `default` (and legacy top-level settings) push into jobs.
const DEFAULT_KEYS: &[&str] = &[
    "image",
    "services",
    "before_script",
    "after_script",
    "cache",
    "retry",
    "timeout",
    "tags",
    "artifacts",
];

const DEFAULT_STAGES: &[&str] = &["build", "test", "deploy"];

const MAX_EXTENDS_DEPTH: usize = 10;

pub struct GitlabParser;

#[derive(Debug, Default, Deserialize)]
struct GlJob {
    stage: Option<String>,
    image: Option<Value>,
    #[serde(default)]
    services: Vec<Value>,
    before_script: Option<Value>,
    script: Option<Value>,
    after_script: Option<Value>,
    needs: Option<Vec<Value>>,
    dependencies: Option<Vec<String>>,
    #[serde(default)]
    variables: Mapping,
    artifacts: Option<GlArtifacts>,
    cache: Option<OneOrMany<GlCache>>,
    rules: Option<Vec<GlRule>>,
    only: Option<Value>,
    except: Option<Value>,
    when: Option<String>,
    start_in: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    retry: Option<Value>,
    timeout: Option<Text>,
    allow_failure: Option<Value>,
    parallel: Option<Value>,
    resource_group: Option<String>,
    trigger: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct GlArtifacts {
    #[serde(default)]
    paths: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GlCache {
    key: Option<Value>,
    #[serde(default)]
    paths: Vec<String>,
    #[serde(default)]
    fallback_keys: Vec<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct GlRule {
    #[serde(rename = "if")]
    condition: Option<String>,
    changes: Option<Value>,
    when: Option<String>,
    allow_failure: Option<bool>,
}

/// One job before edges are resolved.
struct Pending {
    job: JobNode,
    stage: usize,
    /// `Some` when the job declares `needs`, which replaces stage ordering
    needs: Option<Vec<(String, bool)>>,
    dependencies: Option<Vec<String>>,
}

impl DialectParser for GitlabParser {
    fn vendor(&self) -> Vendor {
        Vendor::GitlabCi
    }

    fn parse_document(&self, text: &str, diagnostics: &mut Diagnostics) -> Result<PipelineGraph> {
        let raw = load_document(text, self.vendor())?;
        let doc = match resolve_references(&Value::Mapping(raw.clone()), &raw, 0) {
            Ok(Value::Mapping(doc)) => doc,
            Ok(_) => return Err(document_error(self.vendor(), "document root is not a mapping")),
            Err(message) => return Err(document_error(self.vendor(), message)),
        };

        let stages = stage_order(&doc);
        let defaults = defaults(&doc);

        let mut graph = PipelineGraph::new();
        for (name, value) in variable_pairs(get(&doc, "variables").and_then(Value::as_mapping)) {
            graph.environment.insert(name, rename_variables(&value, GITLAB_VARIABLES));
        }
        for key in ["include", "spec"] {
            if let Some(value) = get(&doc, key) {
                graph.extensions.insert(key.to_string(), value.clone());
            }
        }
        if let Some(Value::Mapping(workflow)) = get(&doc, "workflow") {
            lower_workflow(workflow, &mut graph);
        }

        let job_keys: Vec<String> = doc
            .iter()
            .filter_map(|(k, v)| Some((key_str(k)?, v)))
            .filter(|(k, v)| !k.starts_with('.') && !RESERVED_KEYS.contains(&k.as_str()) && v.is_mapping())
            .map(|(k, _)| k)
            .collect();
        if job_keys.is_empty() {
            return Err(document_error(self.vendor(), "document defines no jobs"));
        }

        let mut pending = Vec::new();
        for (position, key) in job_keys.iter().enumerate() {
            let id = job_id(key, position);
            let lowered = resolve_extends(&doc, key, 0)
                .map(|mut merged| {
                    apply_defaults(&mut merged, &defaults);
                    merged
                })
                .and_then(|merged| {
                    let source: GlJob = decode(&Value::Mapping(merged))?;
                    lower_job(&id, key, source, &stages, &graph.environment)
                });
            pending.push(match lowered {
                Ok(pending) => pending,
                Err(message) => salvage(&doc, key, &id, &stages, diagnostics, message),
            });
        }

        graph.jobs = resolve_edges(pending, &job_keys);
        Ok(graph)
    }
}

/// Replaces `!reference [.template, key]` tags with the referenced values.
fn resolve_references(value: &Value, doc: &Mapping, depth: usize) -> std::result::Result<Value, String> {
    if depth > MAX_EXTENDS_DEPTH {
        return Err("!reference tags nest too deeply".to_string());
    }
    match value {
        Value::Tagged(tagged) if tagged.tag.to_string().trim_start_matches('!') == "reference" => {
            let path: Vec<String> = decode(&tagged.value).map_err(|e| format!("invalid !reference: {e}"))?;
            let (first, rest) = path.split_first().ok_or("empty !reference")?;
            let mut current = get(doc, first);
            for segment in rest {
                current = current.and_then(Value::as_mapping).and_then(|m| get(m, segment));
            }
            let current = current.ok_or_else(|| format!("!reference to unknown key '{}'", path.join(".")))?;
            resolve_references(current, doc, depth + 1)
        }
        Value::Mapping(mapping) => {
            let mut resolved = Mapping::new();
            for (k, v) in mapping {
                resolved.insert(k.clone(), resolve_references(v, doc, depth)?);
            }
            Ok(Value::Mapping(resolved))
        }
        Value::Sequence(items) => items
            .iter()
            .map(|item| resolve_references(item, doc, depth))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Value::Sequence),
        other => Ok(other.clone()),
    }
}

fn stage_order(doc: &Mapping) -> Vec<String> {
    let declared: Vec<String> = get(doc, "stages")
        .and_then(|s| decode(s).ok())
        .unwrap_or_else(|| DEFAULT_STAGES.iter().map(|s| (*s).to_string()).collect());
    let mut stages = vec![".pre".to_string()];
    stages.extend(declared.into_iter().filter(|s| s != ".pre" && s != ".post"));
    stages.push(".post".to_string());
    stages
}

fn defaults(doc: &Mapping) -> Mapping {
    let mut defaults = Mapping::new();
    for key in DEFAULT_KEYS {
        if let Some(value) = get(doc, key) {
            defaults.insert(Value::from(*key), value.clone());
        }
    }
    if let Some(Value::Mapping(default)) = get(doc, "default") {
        for (key, value) in default {
            defaults.insert(key.clone(), value.clone());
        }
    }
    defaults
}

fn apply_defaults(job: &mut Mapping, defaults: &Mapping) {
    for (key, value) in defaults {
        if !job.contains_key(key) {
            job.insert(key.clone(), value.clone());
        }
    }
}

/// Merges `overlay` into `base`; nested mappings merge, everything else is replaced.
fn deep_merge(base: &mut Mapping, overlay: &Mapping) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Mapping(existing)), Value::Mapping(incoming)) => deep_merge(existing, incoming),
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn resolve_extends(doc: &Mapping, name: &str, depth: usize) -> std::result::Result<Mapping, String> {
    if depth > MAX_EXTENDS_DEPTH {
        return Err(format!("extends chain through '{name}' is too deep or cyclic"));
    }
    let own = get(doc, name)
        .and_then(Value::as_mapping)
        .ok_or_else(|| format!("extends unknown template '{name}'"))?;

    let parents: Vec<String> = match get(own, "extends") {
        Some(parents) => decode::<OneOrMany<String>>(parents)?.into_vec(),
        None => Vec::new(),
    };

    let mut merged = Mapping::new();
    for parent in parents {
        let resolved = resolve_extends(doc, &parent, depth + 1)?;
        deep_merge(&mut merged, &resolved);
    }
    let mut own = own.clone();
    own.remove("extends");
    deep_merge(&mut merged, &own);
    Ok(merged)
}

fn variable_pairs(variables: Option<&Mapping>) -> Vec<(String, String)> {
    let Some(variables) = variables else {
        return Vec::new();
    };
    variables
        .iter()
        .filter_map(|(k, v)| {
            let value = match v {
                Value::Mapping(m) => get(m, "value").and_then(scalar).unwrap_or_default(),
                other => scalar(other).unwrap_or_default(),
            };
            Some((key_str(k)?, value))
        })
        .collect()
}

fn script_lines(value: Option<&Value>) -> std::result::Result<Vec<String>, String> {
    fn flatten(value: &Value, lines: &mut Vec<String>) -> std::result::Result<(), String> {
        match value {
            Value::Sequence(items) => items.iter().try_for_each(|item| flatten(item, lines)),
            Value::Null => Ok(()),
            other => {
                let line = scalar(other).ok_or("script entries must be strings")?;
                lines.push(rename_variables(line.trim_end(), GITLAB_VARIABLES));
                Ok(())
            }
        }
    }
    let mut lines = Vec::new();
    if let Some(value) = value {
        flatten(value, &mut lines)?;
    }
    Ok(lines)
}

fn lower_job(
    id: &str,
    key: &str,
    source: GlJob,
    stages: &[String],
    global_environment: &BTreeMap<String, String>,
) -> std::result::Result<Pending, String> {
    let stage_name = source.stage.clone().unwrap_or_else(|| "test".to_string());
    let stage = stages
        .iter()
        .position(|s| *s == stage_name)
        .ok_or_else(|| format!("stage '{stage_name}' is not declared"))?;

    let mut job = JobNode::new(id, key);
    job.environment = global_environment.clone();
    for (name, value) in variable_pairs(Some(&source.variables)) {
        job.environment.insert(name, rename_variables(&value, GITLAB_VARIABLES));
    }

    let mut commands = script_lines(source.before_script.as_ref())?;
    let script = script_lines(source.script.as_ref())?;
    if script.is_empty() && source.trigger.is_none() {
        return Err("job has no script".to_string());
    }
    commands.extend(script);
    job.commands = commands;
    job.post_commands = script_lines(source.after_script.as_ref())?;

    if let Some(trigger) = &source.trigger {
        let target = match trigger {
            Value::Mapping(m) => get(m, "project")
                .or_else(|| get(m, "include"))
                .and_then(scalar)
                .unwrap_or_else(|| "child pipeline".to_string()),
            other => scalar(other).unwrap_or_default(),
        };
        job.template = Some(TemplateResidue {
            name: target,
            reason: "downstream pipeline trigger".to_string(),
        });
    }

    job.container = match &source.image {
        Some(Value::Mapping(m)) => get(m, "name").and_then(scalar),
        Some(other) => scalar(other),
        None => None,
    }
    .map(|image| Container {
        image: rename_variables(&image, GITLAB_VARIABLES),
        workdir: None,
        shell: None,
    });

    job.services = source
        .services
        .iter()
        .filter_map(|service| {
            let (image, alias) = match service {
                Value::Mapping(m) => (get(m, "name").and_then(scalar)?, get(m, "alias").and_then(scalar)),
                other => (scalar(other)?, None),
            };
            let name = alias.unwrap_or_else(|| service_alias(&image));
            Some(Service { name, image })
        })
        .collect();

    if let Some(artifacts) = source.artifacts {
        job.artifacts.produces = artifacts.paths;
    }

    if let Some(cache) = source.cache {
        job.cache = lower_cache(cache.into_vec());
    }

    if !source.tags.is_empty() {
        job.resource_hint = Some(source.tags.join(","));
    }
    job.timeout_minutes = match &source.timeout {
        Some(text) => Some(duration_minutes(&text.0).ok_or_else(|| format!("invalid timeout '{}'", text.0))?),
        None => None,
    };
    if let Some(retry) = &source.retry {
        job.retry = lower_retry(retry)?;
    }
    job.soft_fail = match &source.allow_failure {
        Some(Value::Bool(b)) => *b,
        Some(Value::Mapping(_)) => true,
        _ => false,
    };

    match &source.parallel {
        Some(Value::Mapping(m)) => {
            let entries: Vec<IndexMap<String, OneOrMany<Text>>> = get(m, "matrix")
                .map(decode)
                .transpose()?
                .ok_or("parallel mapping has no matrix")?;
            match lower_matrix(entries) {
                Ok(matrix) => {
                    for name in matrix.dimensions.keys() {
                        job.environment.insert(name.clone(), matrix_token(name));
                    }
                    job.matrix = Some(matrix);
                }
                Err(reason) => {
                    job.template = Some(TemplateResidue {
                        name: "parallel.matrix".to_string(),
                        reason: reason.to_string(),
                    });
                }
            }
        }
        Some(other) => {
            let count = scalar(other)
                .and_then(|c| c.parse::<u32>().ok())
                .ok_or("parallel must be a number or a matrix")?;
            job.parallelism = Some(count);
        }
        None => {}
    }

    if let Some(group) = source.resource_group {
        job.concurrency = Some(ConcurrencyGroup { group, limit: 1 });
    }

    if let Some(only) = &source.only {
        job.conditionals.extend(lower_refs(only, false));
    }
    if let Some(except) = &source.except {
        job.conditionals.extend(lower_refs(except, true));
    }
    let mut when = source.when.clone();
    if let Some(rules) = &source.rules {
        let outcome = lower_rules(rules);
        job.conditionals.extend(outcome.conditionals);
        when = outcome.when.or(when);
        job.soft_fail |= outcome.allow_failure;
    }
    match when.as_deref() {
        Some("manual") => {
            job.approval = Some(ApprovalGate {
                prompt: Some(format!("Run {key}")),
                inferred: false,
            });
        }
        Some("always") => job.conditionals.push(Conditional::Status { when: RunWhen::Always }),
        Some("on_failure") => job.conditionals.push(Conditional::Status { when: RunWhen::OnFailure }),
        Some("delayed") => job.conditionals.push(Conditional::Expression {
            source: format!("when: delayed, start_in: {}", source.start_in.as_deref().unwrap_or("?")),
        }),
        _ => {}
    }

    let needs = match source.needs {
        Some(needs) => Some(
            needs
                .iter()
                .map(|need| match need {
                    Value::Mapping(m) => Ok((
                        get(m, "job").and_then(scalar).ok_or("need has no job")?,
                        get(m, "artifacts").and_then(Value::as_bool).unwrap_or(true),
                    )),
                    other => Ok((scalar(other).ok_or("need is not a job name")?, true)),
                })
                .collect::<std::result::Result<Vec<_>, String>>()?,
        ),
        None => None,
    };

    Ok(Pending {
        job,
        stage,
        needs,
        dependencies: source.dependencies,
    })
}

fn service_alias(image: &str) -> String {
    let base = image.split(':').next().unwrap_or(image);
    base.rsplit('/').next().unwrap_or(base).to_string()
}

fn lower_cache(caches: Vec<GlCache>) -> Option<CacheSpec> {
    let mut caches = caches.into_iter();
    let first = caches.next()?;
    let mut paths = first.paths;
    for other in caches {
        paths.extend(other.paths);
    }

    let key = match &first.key {
        Some(Value::Mapping(m)) => {
            let files: Vec<String> = get(m, "files").and_then(|f| decode(f).ok()).unwrap_or_default();
            let mut components = Vec::new();
            if let Some(prefix) = get(m, "prefix").and_then(scalar) {
                components.extend(cache_key_text(&prefix).0);
                components.push(CacheKeyComponent::Literal("-".to_string()));
            }
            components.push(CacheKeyComponent::FileHash(files));
            CacheKey(components)
        }
        Some(other) => cache_key_text(&scalar(other).unwrap_or_default()),
        None => CacheKey::literal("default"),
    };
    let fallback = first.fallback_keys.iter().map(|k| cache_key_text(k)).collect();
    Some(CacheSpec { key, paths, fallback })
}

/// A textual cache key; predefined variables become key components.
fn cache_key_text(text: &str) -> CacheKey {
    static VARIABLE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\$\{?(\w+)\}?").expect("valid variable pattern"));
    let mut components = Vec::new();
    let mut last = 0;
    for caps in VARIABLE.captures_iter(text) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        if whole.start > last {
            components.push(CacheKeyComponent::Literal(text[last..whole.start].to_string()));
        }
        components.push(match &caps[1] {
            "CI_COMMIT_REF_SLUG" | "CI_COMMIT_REF_NAME" | "CI_COMMIT_BRANCH" => CacheKeyComponent::Branch,
            name => CacheKeyComponent::Variable(rename_variable(name, GITLAB_VARIABLES)),
        });
        last = whole.end;
    }
    if last < text.len() {
        components.push(CacheKeyComponent::Literal(text[last..].to_string()));
    }
    CacheKey(components)
}

fn lower_retry(retry: &Value) -> std::result::Result<Option<RetryPolicy>, String> {
    let (max, when): (u32, Vec<String>) = match retry {
        Value::Mapping(m) => (
            get(m, "max").and_then(scalar).and_then(|v| v.parse().ok()).unwrap_or(0),
            get(m, "when")
                .map(|w| decode::<OneOrMany<String>>(w).map(OneOrMany::into_vec))
                .transpose()?
                .unwrap_or_default(),
        ),
        other => (
            scalar(other).and_then(|v| v.parse().ok()).ok_or("retry must be a number")?,
            Vec::new(),
        ),
    };
    if max == 0 {
        return Ok(None);
    }
    let conditions = when
        .into_iter()
        .filter(|w| w != "always")
        .map(|w| match w.as_str() {
            "runner_system_failure" | "stuck_or_timeout_failure" => RetryCondition::InfrastructureFailure,
            "job_execution_timeout" => RetryCondition::Timeout,
            _ => RetryCondition::Other(w),
        })
        .collect();
    Ok(Some(RetryPolicy {
        max_attempts: max + 1,
        conditions,
    }))
}

/// GitLab refuses `parallel: matrix` beyond this many jobs.
const MAX_PARALLEL_MATRIX_JOBS: usize = 200;

/// Matrix entries are unioned; all entries must use the same variables.
fn lower_matrix(entries: Vec<IndexMap<String, OneOrMany<Text>>>) -> std::result::Result<MatrixSpec, &'static str> {
    let mut entries = entries.into_iter().map(|entry| {
        entry
            .into_iter()
            .map(|(name, values)| (name, values.into_vec().into_iter().map(String::from).collect::<Vec<_>>()))
            .collect::<IndexMap<String, Vec<String>>>()
    });

    let first = entries.next().ok_or("matrix has no entries")?;
    let mut spec = MatrixSpec {
        dimensions: first,
        adjustments: Vec::new(),
    };
    for entry in entries {
        if entry.len() != spec.dimensions.len() || !entry.keys().all(|k| spec.dimensions.contains_key(k)) {
            return Err("matrix entries use different variables");
        }
        let extra = MatrixSpec {
            dimensions: entry,
            adjustments: Vec::new(),
        };
        let combinations = extra
            .combinations_within(MAX_PARALLEL_MATRIX_JOBS)
            .ok_or("matrix entry expands to too many jobs")?;
        for combination in combinations {
            let ordered = spec
                .dimensions
                .keys()
                .filter_map(|k| combination.get(k).map(|v| (k.clone(), v.clone())))
                .collect();
            spec = spec.with_adjustment(ordered, false);
        }
    }
    Ok(spec)
}

struct RulesOutcome {
    conditionals: Vec<Conditional>,
    when: Option<String>,
    allow_failure: bool,
}

/// Lowers `rules`.
///
/// Leading `when: never` rules on branches become ignore filters; a single
/// remaining rule becomes structured conditions. Anything else is kept as
/// one raw expression.
fn lower_rules(rules: &[GlRule]) -> RulesOutcome {
    let mut outcome = RulesOutcome {
        conditionals: Vec::new(),
        when: None,
        allow_failure: false,
    };

    let raw = |rules: &[GlRule]| Conditional::Expression {
        source: rules
            .iter()
            .map(|r| {
                format!(
                    "{} => {}",
                    r.condition.as_deref().unwrap_or("always"),
                    r.when.as_deref().unwrap_or("on_success")
                )
            })
            .collect::<Vec<_>>()
            .join("; "),
    };

    let mut ignored = Vec::new();
    let mut positive = Vec::new();
    for rule in rules {
        if rule.when.as_deref() == Some("never") {
            let negated = rule
                .condition
                .as_deref()
                .and_then(parse_if)
                .and_then(|c| match c.as_slice() {
                    [Conditional::Branches(BranchFilter { only, ignore })] if ignore.is_empty() => {
                        Some(only.clone())
                    }
                    _ => None,
                });
            match negated {
                Some(branches) if positive.is_empty() => ignored.extend(branches),
                _ => {
                    outcome.conditionals.push(raw(rules));
                    return outcome;
                }
            }
        } else {
            positive.push(rule.clone());
        }
    }

    if !ignored.is_empty() {
        outcome.conditionals.push(Conditional::ignore_branches(ignored));
    }

    match positive.as_slice() {
        [] => {}
        [rule] => {
            if let Some(condition) = &rule.condition {
                match parse_if(condition) {
                    Some(conditionals) => outcome.conditionals.extend(conditionals),
                    None => {
                        outcome.conditionals.push(raw(rules));
                        return outcome;
                    }
                }
            }
            if let Some(changes) = &rule.changes {
                let paths: Vec<String> = match changes {
                    Value::Mapping(m) => get(m, "paths").and_then(|p| decode(p).ok()).unwrap_or_default(),
                    other => decode(other).unwrap_or_default(),
                };
                outcome.conditionals.push(Conditional::Changes { paths });
            }
            outcome.when = rule.when.clone();
            outcome.allow_failure = rule.allow_failure.unwrap_or(false);
        }
        _ => outcome.conditionals.push(raw(rules)),
    }
    outcome
}

/// Parses a conjunction of simple `rules:if` clauses.
fn parse_if(expression: &str) -> Option<Vec<Conditional>> {
    if expression.contains("||") || expression.contains('(') {
        return None;
    }
    expression.split("&&").map(|clause| parse_clause(clause.trim())).collect()
}

fn parse_clause(clause: &str) -> Option<Conditional> {
    let is_branch = |name: &str| matches!(name, "CI_COMMIT_BRANCH" | "CI_COMMIT_REF_NAME");

    if let Some(caps) = EQUALITY.captures(clause) {
        let name = &caps[1];
        let negated = &caps[2] == "!=";
        let literal = caps.get(3).or_else(|| caps.get(4)).map(|m| m.as_str().to_string());

        return match (name, literal) {
            (name, Some(value)) if is_branch(name) => Some(if negated {
                Conditional::ignore_branches(vec![value])
            } else {
                Conditional::only_branches(vec![value])
            }),
            ("CI_PIPELINE_SOURCE", Some(value)) if !negated => {
                let event = match value.as_str() {
                    "push" => TriggerEvent::Push,
                    "merge_request_event" | "external_pull_request_event" => TriggerEvent::PullRequest,
                    "schedule" => TriggerEvent::Schedule,
                    "web" => TriggerEvent::Manual,
                    "api" | "trigger" | "pipeline" => TriggerEvent::Api,
                    _ => return None,
                };
                Some(Conditional::Event { events: vec![event] })
            }
            (name, literal) => {
                let value = match literal {
                    Some(value) => value,
                    None => format!("${}", rename_variable(caps.get(5)?.as_str(), GITLAB_VARIABLES)),
                };
                Some(Conditional::Variable {
                    name: rename_variable(name, GITLAB_VARIABLES),
                    op: if negated { CompareOp::Ne } else { CompareOp::Eq },
                    value,
                })
            }
        };
    }

    if let Some(caps) = MATCHING.captures(clause) {
        return Some(Conditional::Variable {
            name: rename_variable(&caps[1], GITLAB_VARIABLES),
            op: if &caps[2] == "=~" { CompareOp::Matches } else { CompareOp::NotMatches },
            value: caps[3].to_string(),
        });
    }

    if let Some(caps) = PRESENCE.captures(clause) {
        return Some(match &caps[1] {
            "CI_COMMIT_TAG" => Conditional::Tags {
                patterns: vec!["*".to_string()],
            },
            name => Conditional::Variable {
                name: rename_variable(name, GITLAB_VARIABLES),
                op: CompareOp::Ne,
                value: String::new(),
            },
        });
    }

    None
}

/// Lowers `only`/`except` ref lists.
fn lower_refs(value: &Value, except: bool) -> Vec<Conditional> {
    let (refs, changes, variables): (Vec<String>, Vec<String>, Vec<String>) = match value {
        Value::Mapping(m) => (
            get(m, "refs").and_then(|r| decode(r).ok()).unwrap_or_default(),
            get(m, "changes").and_then(|c| decode(c).ok()).unwrap_or_default(),
            get(m, "variables").and_then(|v| decode(v).ok()).unwrap_or_default(),
        ),
        other => (
            decode::<OneOrMany<String>>(other).map(OneOrMany::into_vec).unwrap_or_default(),
            Vec::new(),
            Vec::new(),
        ),
    };

    let keyword = if except { "except" } else { "only" };
    let mut conditionals = Vec::new();
    let branches: Vec<String> = refs
        .iter()
        .filter(|r| !matches!(r.as_str(), "tags" | "merge_requests" | "schedules" | "web" | "api" | "triggers" | "pipelines" | "branches" | "pushes"))
        .map(|r| ref_pattern(r))
        .collect();

    if branches.len() == refs.len() {
        if !branches.is_empty() {
            conditionals.push(if except {
                Conditional::ignore_branches(branches)
            } else {
                Conditional::only_branches(branches)
            });
        }
    } else if !except && refs.len() == 1 {
        let conditional = match refs[0].as_str() {
            "tags" => Some(Conditional::Tags {
                patterns: vec!["*".to_string()],
            }),
            "merge_requests" => Some(Conditional::Event {
                events: vec![TriggerEvent::PullRequest],
            }),
            "schedules" => Some(Conditional::Event {
                events: vec![TriggerEvent::Schedule],
            }),
            "web" => Some(Conditional::Event {
                events: vec![TriggerEvent::Manual],
            }),
            "api" | "triggers" | "pipelines" => Some(Conditional::Event {
                events: vec![TriggerEvent::Api],
            }),
            _ => None,
        };
        conditionals.extend(conditional);
    } else {
        conditionals.push(Conditional::Expression {
            source: format!("{keyword}: {}", refs.join(", ")),
        });
    }

    if !changes.is_empty() {
        if except {
            conditionals.push(Conditional::Expression {
                source: format!("except changes: {}", changes.join(", ")),
            });
        } else {
            conditionals.push(Conditional::Changes { paths: changes });
        }
    }
    for variable in variables {
        match (except, parse_if(&variable)) {
            (false, Some(parsed)) => conditionals.extend(parsed),
            _ => conditionals.push(Conditional::Expression {
                source: format!("{keyword} variables: {variable}"),
            }),
        }
    }
    conditionals
}

/// `/^release-.*$/` style ref regexes become globs.
fn ref_pattern(reference: &str) -> String {
    match reference.strip_prefix('/').and_then(|r| r.strip_suffix('/')) {
        Some(regex) => regex
            .trim_start_matches('^')
            .trim_end_matches('$')
            .replace(".*", "*")
            .replace("\\.", "."),
        None => reference.to_string(),
    }
}

fn lower_workflow(workflow: &Mapping, graph: &mut PipelineGraph) {
    let Some(rules) = get(workflow, "rules").and_then(|r| decode::<Vec<GlRule>>(r).ok()) else {
        return;
    };
    let mut unresolved = false;
    for rule in &rules {
        if rule.when.as_deref() == Some("never") {
            unresolved = true;
            continue;
        }
        let Some(condition) = &rule.condition else { continue };
        match parse_if(condition).as_deref() {
            Some([Conditional::Event { events }]) => {
                for event in events {
                    graph.triggers.push(Trigger {
                        event: *event,
                        branches: Vec::new(),
                        paths: Vec::new(),
                    });
                }
            }
            Some([Conditional::Branches(filter)]) if filter.ignore.is_empty() => {
                graph.triggers.push(Trigger {
                    event: TriggerEvent::Push,
                    branches: filter.only.clone(),
                    paths: Vec::new(),
                });
            }
            Some([Conditional::Tags { patterns }]) => {
                graph.triggers.push(Trigger {
                    event: TriggerEvent::Tag,
                    branches: patterns.clone(),
                    paths: Vec::new(),
                });
            }
            _ => unresolved = true,
        }
    }
    if unresolved {
        if let Some(value) = get(workflow, "rules") {
            graph.extensions.insert("workflow".to_string(), value.clone());
        }
    }
}

/// Placeholder for a job that failed to lower, keeping its stage and needs.
fn salvage(
    doc: &Mapping,
    key: &str,
    id: &str,
    stages: &[String],
    diagnostics: &mut Diagnostics,
    message: String,
) -> Pending {
    let raw = get(doc, key).and_then(Value::as_mapping);
    let stage = raw
        .and_then(|m| get(m, "stage"))
        .and_then(scalar)
        .and_then(|s| stages.iter().position(|known| *known == s))
        .unwrap_or_else(|| stages.iter().position(|s| s == "test").unwrap_or(0));
    let needs = raw
        .and_then(|m| get(m, "needs"))
        .and_then(|n| decode::<Vec<Value>>(n).ok())
        .map(|needs| {
            needs
                .iter()
                .filter_map(|need| match need {
                    Value::Mapping(m) => get(m, "job").and_then(scalar),
                    other => scalar(other),
                })
                .map(|n| (n, false))
                .collect()
        });
    Pending {
        job: placeholder(diagnostics, id, key, Vec::new(), message),
        stage,
        needs,
        dependencies: None,
    }
}

/// Adds stage or needs edges and resolves artifact consumption.
fn resolve_edges(pending: Vec<Pending>, keys: &[String]) -> Vec<JobNode> {
    let ids: HashMap<&str, usize> = keys.iter().enumerate().map(|(i, k)| (k.as_str(), i)).collect();
    let mut by_stage: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, p) in pending.iter().enumerate() {
        by_stage.entry(p.stage).or_default().push(i);
    }

    let produces: Vec<bool> = pending.iter().map(|p| !p.job.artifacts.produces.is_empty()).collect();
    let job_ids: Vec<String> = pending.iter().map(|p| p.job.id.clone()).collect();

    pending
        .into_iter()
        .map(|p| {
            let Pending {
                mut job,
                stage,
                needs,
                dependencies,
            } = p;
            let unsupported = job.is_unsupported();

            let (upstream, artifact_sources): (Vec<usize>, Vec<usize>) = match &needs {
                Some(needs) => {
                    job.depends_on = edges(needs.iter().map(|(n, _)| n.as_str()));
                    let sources = needs
                        .iter()
                        .filter(|(_, artifacts)| *artifacts)
                        .filter_map(|(n, _)| ids.get(n.as_str()).copied())
                        .collect();
                    (Vec::new(), sources)
                }
                None => {
                    let previous = by_stage
                        .range(..stage)
                        .next_back()
                        .map(|(_, jobs)| jobs.clone())
                        .unwrap_or_default();
                    let earlier: Vec<usize> = by_stage.range(..stage).flat_map(|(_, jobs)| jobs.clone()).collect();
                    (previous, earlier)
                }
            };
            for upstream in upstream {
                job.add_dependency(job_ids[upstream].clone(), false);
            }

            if !unsupported {
                let sources: Vec<usize> = match &dependencies {
                    Some(names) => names.iter().filter_map(|n| ids.get(n.as_str()).copied()).collect(),
                    None => artifact_sources,
                };
                job.artifacts.consumes = sources
                    .into_iter()
                    .filter(|s| produces[*s])
                    .map(|s| job_ids[s].clone())
                    .collect();
            }
            job
        })
        .collect()
}
