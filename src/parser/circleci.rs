//! CircleCI config parser.
//!
//! The graph comes from `workflows`: every workflow job entry becomes one
//! job, lowered from its definition in `jobs` with parameters, executors and
//! reusable `commands` resolved by substitution.

use std::collections::HashMap;
use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;
use serde_yaml::{Mapping, Value};

use super::expr::{rename_variables, rewrite_circleci_matrix, substitute_parameters, CIRCLECI_VARIABLES};
use super::yaml::{decode, get, key_str, load_document, scalar, string_pairs, OneOrMany, Text};
use super::{consume_upstream_artifacts, document_error, edges, job_id, placeholder, DialectParser};
use crate::diagnostics::Diagnostics;
use crate::error::Result;
use crate::ir::{
    matrix_token, strip_version_pin, CacheKey, CacheKeyComponent, CacheSpec,
    Conditional, Container, JobKind, JobNode, MatrixSpec, PipelineGraph, Schedule, Service,
    TemplateResidue,
};
use crate::vendor::Vendor;

static TEMPLATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*(.*?)\s*\}\}").expect("valid template pattern"));

static CHECKSUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^checksum\s+"([^"]+)"$"#).expect("valid checksum pattern"));

/// Nesting limit for reusable command expansion.
const MAX_COMMAND_DEPTH: usize = 8;

const WORKFLOW_ENTRY_KEYS: &[&str] = &["requires", "filters", "context", "matrix", "type", "name"];

pub struct CircleciParser;

/// Document-wide definitions used while lowering jobs.
struct Definitions<'a> {
    jobs: &'a Mapping,
    commands: Option<&'a Mapping>,
    executors: Option<&'a Mapping>,
    orbs: HashMap<String, String>,
    pipeline_parameters: HashMap<String, String>,
}

/// Parameter values visible while lowering one job or command.
#[derive(Debug, Clone, Default)]
struct Scope {
    values: HashMap<String, String>,
}

/// Cache steps seen in one job, combined once the job is lowered.
#[derive(Debug, Default)]
struct CacheSteps {
    save: Option<(CacheKey, Vec<String>)>,
    restore: Vec<CacheKey>,
}

/// A lowered job plus what is resolved after the whole graph exists.
struct Lowered {
    job: JobNode,
    attaches_workspace: bool,
}

impl DialectParser for CircleciParser {
    fn vendor(&self) -> Vendor {
        Vendor::Circleci
    }

    fn parse_document(&self, text: &str, diagnostics: &mut Diagnostics) -> Result<PipelineGraph> {
        let doc = load_document(text, self.vendor())?;
        let Some(Value::Mapping(jobs)) = get(&doc, "jobs") else {
            return Err(document_error(self.vendor(), "config has no 'jobs' mapping"));
        };

        let definitions = Definitions {
            jobs,
            commands: get(&doc, "commands").and_then(Value::as_mapping),
            executors: get(&doc, "executors").and_then(Value::as_mapping),
            orbs: string_pairs(get(&doc, "orbs")).into_iter().collect(),
            pipeline_parameters: parameter_defaults(get(&doc, "parameters")),
        };

        let mut graph = PipelineGraph::new();
        for (key, value) in &doc {
            if let Some(key) = key_str(key) {
                if !matches!(
                    key.as_str(),
                    "version" | "jobs" | "workflows" | "commands" | "executors" | "orbs" | "parameters"
                ) {
                    graph.extensions.insert(key, value.clone());
                }
            }
        }

        let mut lowered = Vec::new();
        match get(&doc, "workflows").and_then(Value::as_mapping) {
            Some(workflows) => {
                let workflows: Vec<(String, &Mapping)> = workflows
                    .iter()
                    .filter_map(|(k, v)| Some((key_str(k)?, v.as_mapping()?)))
                    .filter(|(name, _)| name != "version")
                    .collect();
                let prefix_ids = workflows.len() > 1;
                for (name, workflow) in workflows {
                    lower_workflow(&definitions, &name, workflow, prefix_ids, &mut graph, &mut lowered, diagnostics);
                }
            }
            None => {
                for (position, (key, _)) in jobs.iter().enumerate() {
                    let name = key_str(key).unwrap_or_default();
                    let id = job_id(&name, position);
                    lowered.push(lower_or_placeholder(&definitions, &id, &name, &Mapping::new(), None, diagnostics));
                }
            }
        }

        let consumers: Vec<usize> = lowered
            .iter()
            .enumerate()
            .filter(|(_, l)| l.attaches_workspace)
            .map(|(i, _)| i)
            .collect();
        graph.jobs = lowered.into_iter().map(|l| l.job).collect();
        consume_upstream_artifacts(&mut graph.jobs, &consumers);
        Ok(graph)
    }
}

fn parameter_defaults(value: Option<&Value>) -> HashMap<String, String> {
    let Some(Value::Mapping(parameters)) = value else {
        return HashMap::new();
    };
    parameters
        .iter()
        .filter_map(|(name, spec)| {
            let default = spec.as_mapping().and_then(|m| get(m, "default")).and_then(scalar)?;
            Some((key_str(name)?, default))
        })
        .collect()
}

fn lower_workflow(
    definitions: &Definitions<'_>,
    name: &str,
    workflow: &Mapping,
    prefix_ids: bool,
    graph: &mut PipelineGraph,
    lowered: &mut Vec<Lowered>,
    diagnostics: &mut Diagnostics,
) {
    let qualify = |id: &str| {
        if prefix_ids {
            format!("{}-{id}", crate::ir::slugify(name))
        } else {
            id.to_string()
        }
    };

    if let Some(Value::Sequence(triggers)) = get(workflow, "triggers") {
        for trigger in triggers {
            let schedule = trigger
                .as_mapping()
                .and_then(|t| get(t, "schedule"))
                .and_then(Value::as_mapping);
            if let Some(schedule) = schedule {
                let branch = get(schedule, "filters")
                    .and_then(Value::as_mapping)
                    .and_then(|f| get(f, "branches"))
                    .and_then(Value::as_mapping)
                    .and_then(|b| get(b, "only"))
                    .and_then(|only| decode::<OneOrMany<String>>(only).ok())
                    .and_then(|only| only.into_vec().into_iter().next());
                if let Some(cron) = get(schedule, "cron").and_then(scalar) {
                    graph.schedules.push(Schedule { cron, branch });
                }
            }
        }
    }

    let Some(Value::Sequence(entries)) = get(workflow, "jobs") else {
        return;
    };

    for (position, entry) in entries.iter().enumerate() {
        let (job_name, config) = match entry {
            Value::Mapping(m) if m.len() == 1 => {
                let Some((k, v)) = m.iter().next() else { continue };
                (key_str(k).unwrap_or_default(), v.as_mapping().cloned().unwrap_or_default())
            }
            other => (scalar(other).unwrap_or_default(), Mapping::new()),
        };
        let alias = get(&config, "name").and_then(scalar).unwrap_or_else(|| job_name.clone());
        let id = qualify(&job_id(&alias, position));

        let requires: Vec<String> = get(&config, "requires")
            .and_then(|r| decode::<OneOrMany<String>>(r).ok())
            .map(OneOrMany::into_vec)
            .unwrap_or_default()
            .iter()
            .map(|r| qualify(&crate::ir::slugify(r)))
            .collect();

        let mut lowered_job = if get(&config, "type").and_then(scalar).as_deref() == Some("approval") {
            let mut gate = JobNode::new(&id, &alias);
            gate.kind = JobKind::Approval {
                prompt: Some(alias.clone()),
            };
            Lowered {
                job: gate,
                attaches_workspace: false,
            }
        } else {
            let matrix = get(&config, "matrix").and_then(lower_matrix);
            lower_or_placeholder(definitions, &id, &job_name, &config, matrix, diagnostics)
        };

        let job = &mut lowered_job.job;
        if job.label == job_name && alias != job_name {
            job.label = alias.clone();
        }
        for dependency in edges(requires) {
            job.add_dependency(dependency.job, false);
        }
        job.conditionals.extend(lower_filters(get(&config, "filters")));
        if let Some(contexts) = get(&config, "context").and_then(|c| decode::<OneOrMany<String>>(c).ok()) {
            if !job.is_unsupported() {
                job.secrets.extend(contexts.into_vec());
            }
        }
        lowered.push(lowered_job);
    }
}

fn lower_matrix(value: &Value) -> Option<MatrixSpec> {
    let matrix = value.as_mapping()?;
    let parameters = get(matrix, "parameters")?.as_mapping()?;
    let mut spec = MatrixSpec::new();
    for (name, values) in parameters {
        let values: Vec<Text> = decode(values).ok()?;
        spec.dimensions.insert(key_str(name)?, values.into_iter().map(String::from).collect());
    }
    if let Some(excludes) = get(matrix, "exclude") {
        let excludes: Vec<IndexMap<String, Text>> = decode(excludes).ok()?;
        for exclude in excludes {
            spec = spec.with_adjustment(exclude.into_iter().map(|(k, v)| (k, v.0)).collect(), true);
        }
    }
    Some(spec)
}

fn lower_filters(filters: Option<&Value>) -> Vec<Conditional> {
    let Some(Value::Mapping(filters)) = filters else {
        return Vec::new();
    };
    let list = |section: &str, key: &str| -> Vec<String> {
        get(filters, section)
            .and_then(Value::as_mapping)
            .and_then(|s| get(s, key))
            .and_then(|v| decode::<OneOrMany<String>>(v).ok())
            .map(OneOrMany::into_vec)
            .unwrap_or_default()
            .into_iter()
            .map(|p| regex_to_glob(&p))
            .collect()
    };

    let mut conditionals = Vec::new();
    let (only, ignore) = (list("branches", "only"), list("branches", "ignore"));
    if !only.is_empty() || !ignore.is_empty() {
        conditionals.push(Conditional::Branches(crate::ir::BranchFilter { only, ignore }));
    }
    let tags = list("tags", "only");
    if !tags.is_empty() {
        conditionals.push(Conditional::Tags { patterns: tags });
    }
    conditionals
}

/// Filter values may be `/regex/`; the common `^prefix.*` shapes become globs.
fn regex_to_glob(pattern: &str) -> String {
    let Some(inner) = pattern.strip_prefix('/').and_then(|p| p.strip_suffix('/')) else {
        return pattern.to_string();
    };
    inner
        .trim_start_matches('^')
        .trim_end_matches('$')
        .replace(".*", "*")
        .replace("\\.", ".")
}

fn lower_or_placeholder(
    definitions: &Definitions<'_>,
    id: &str,
    job_name: &str,
    entry: &Mapping,
    matrix: Option<MatrixSpec>,
    diagnostics: &mut Diagnostics,
) -> Lowered {
    match lower_job(definitions, id, job_name, entry, matrix) {
        Ok(lowered) => lowered,
        Err(message) => Lowered {
            job: placeholder(diagnostics, id, job_name, Vec::new(), message),
            attaches_workspace: false,
        },
    }
}

fn lower_job(
    definitions: &Definitions<'_>,
    id: &str,
    job_name: &str,
    entry: &Mapping,
    matrix: Option<MatrixSpec>,
) -> std::result::Result<Lowered, String> {
    let definition = get(definitions.jobs, job_name)
        .and_then(Value::as_mapping)
        .ok_or_else(|| format!("job '{job_name}' is not defined"))?;

    let mut scope = Scope {
        values: parameter_defaults(get(definition, "parameters")),
    };
    for (key, value) in entry {
        if let Some(key) = key_str(key) {
            if !WORKFLOW_ENTRY_KEYS.contains(&key.as_str()) {
                scope.values.insert(key, scalar(value).unwrap_or_default());
            }
        }
    }
    if let Some(matrix) = &matrix {
        for name in matrix.dimensions.keys() {
            scope.values.insert(name.clone(), matrix_token(name));
        }
    }

    let mut job = JobNode::new(id, job_name);
    job.matrix = matrix;
    let mut lowering = JobLowering {
        definitions,
        job: &mut job,
        cache: CacheSteps::default(),
        attaches_workspace: false,
        missing: Vec::new(),
    };

    let executor = resolve_executor(definitions, definition, &scope)?;
    lowering.apply_executor(&executor, &scope)?;
    lowering.apply_executor(definition, &scope)?;

    if let Some(parallelism) = get(definition, "parallelism") {
        let count = scalar(parallelism)
            .and_then(|p| lowering.substitute(&p, &scope).parse::<u32>().ok())
            .ok_or("parallelism must be a number")?;
        lowering.job.parallelism = Some(count);
    }

    let steps: Vec<Value> = match get(definition, "steps") {
        Some(steps) => decode(steps)?,
        None => return Err("job has no steps".to_string()),
    };
    lowering.lower_steps(&steps, &scope, 0)?;
    lowering.finish();

    let attaches_workspace = lowering.attaches_workspace;
    if let Some(dimensions) = job.matrix.as_ref().map(|m| m.dimensions.keys().cloned().collect::<Vec<_>>()) {
        for command in &mut job.commands {
            *command = rewrite_circleci_matrix(command, &dimensions);
        }
    }
    Ok(Lowered { job, attaches_workspace })
}

/// The executor mapping a job runs on, with its own parameters resolved.
fn resolve_executor(definitions: &Definitions<'_>, definition: &Mapping, scope: &Scope) -> std::result::Result<Mapping, String> {
    let Some(reference) = get(definition, "executor") else {
        return Ok(Mapping::new());
    };
    let (name, args) = match reference {
        Value::Mapping(m) => (
            get(m, "name").and_then(scalar).ok_or("executor reference has no name")?,
            m.clone(),
        ),
        other => (scalar(other).ok_or("executor reference is not a name")?, Mapping::new()),
    };

    let Some(executor) = definitions.executors.and_then(|e| get(e, &name)).and_then(Value::as_mapping) else {
        // Orb executors are resolved by CircleCI at runtime
        let mut external = Mapping::new();
        external.insert(Value::from("orb-executor"), Value::from(name));
        return Ok(external);
    };

    let mut executor_scope = Scope {
        values: parameter_defaults(get(executor, "parameters")),
    };
    for (key, value) in &args {
        if let (Some(key), Some(value)) = (key_str(key), scalar(value)) {
            let (value, _) = substitute_parameters(&value, |_, n| scope.values.get(n).cloned());
            executor_scope.values.insert(key, value);
        }
    }

    let text = serde_yaml::to_string(executor).map_err(|e| e.to_string())?;
    let (text, missing) = substitute_parameters(&text, |_, n| executor_scope.values.get(n).cloned());
    if let Some(name) = missing.first() {
        return Err(format!("executor parameter '{name}' has no value"));
    }
    serde_yaml::from_str(&text).map_err(|e| e.to_string())
}

struct JobLowering<'a, 'd> {
    definitions: &'a Definitions<'d>,
    job: &'a mut JobNode,
    cache: CacheSteps,
    attaches_workspace: bool,
    missing: Vec<String>,
}

impl JobLowering<'_, '_> {
    fn substitute(&mut self, text: &str, scope: &Scope) -> String {
        let text = text
            .replace("<< pipeline.git.branch >>", "$BUILDKITE_BRANCH")
            .replace("<< pipeline.git.revision >>", "$BUILDKITE_COMMIT")
            .replace("<< pipeline.number >>", "$BUILDKITE_BUILD_NUMBER");
        let pipeline = &self.definitions.pipeline_parameters;
        let (text, missing) = substitute_parameters(&text, |is_pipeline, name| {
            if is_pipeline {
                pipeline.get(name).cloned()
            } else {
                scope.values.get(name).cloned()
            }
        });
        self.missing.extend(missing);
        rename_variables(&text, CIRCLECI_VARIABLES)
    }

    /// Applies the container, sizing and environment keys of a job or executor.
    fn apply_executor(&mut self, source: &Mapping, scope: &Scope) -> std::result::Result<(), String> {
        if let Some(orb) = get(source, "orb-executor").and_then(scalar) {
            let reference = self.orb_reference(&orb);
            self.job.external_actions.push(reference);
        }
        if let Some(images) = get(source, "docker") {
            let images: Vec<Mapping> = decode(images)?;
            for (position, image) in images.iter().enumerate() {
                let name = get(image, "image").and_then(scalar).ok_or("docker entry has no image")?;
                let name = self.substitute(&name, scope);
                if position == 0 {
                    self.job.container = Some(Container {
                        image: name,
                        workdir: None,
                        shell: None,
                    });
                    for (key, value) in string_pairs(get(image, "environment")) {
                        let value = self.substitute(&value, scope);
                        self.job.environment.insert(key, value);
                    }
                } else {
                    let service = get(image, "name")
                        .and_then(scalar)
                        .unwrap_or_else(|| service_name(&name));
                    self.job.services.push(Service { name: service, image: name });
                }
            }
        }
        if get(source, "machine").is_some() {
            self.job.resource_hint = Some("machine".to_string());
        }
        if get(source, "macos").is_some() {
            self.job.resource_hint = Some("macos".to_string());
        }
        if let Some(class) = get(source, "resource_class").and_then(scalar) {
            let class = self.substitute(&class, scope);
            self.job.resource_hint = Some(class);
        }
        if let Some(workdir) = get(source, "working_directory").and_then(scalar) {
            if let Some(container) = &mut self.job.container {
                container.workdir = Some(workdir);
            }
        }
        if let Some(shell) = get(source, "shell").and_then(scalar) {
            if let Some(container) = &mut self.job.container {
                container.shell = Some(shell.split_whitespace().map(String::from).collect());
            }
        }
        for (key, value) in string_pairs(get(source, "environment")) {
            let value = self.substitute(&value, scope);
            self.job.environment.insert(key, value);
        }
        Ok(())
    }

    fn orb_reference(&self, invocation: &str) -> String {
        match invocation.split_once('/') {
            Some((orb, command)) => match self.definitions.orbs.get(orb) {
                Some(reference) => format!("{}/{command}", strip_version_pin(reference)),
                None => invocation.to_string(),
            },
            None => invocation.to_string(),
        }
    }

    fn lower_steps(&mut self, steps: &[Value], scope: &Scope, depth: usize) -> std::result::Result<(), String> {
        if depth > MAX_COMMAND_DEPTH {
            return Err("reusable commands nest too deeply".to_string());
        }
        for step in steps {
            let (name, args) = match step {
                Value::Mapping(m) if m.len() == 1 => {
                    let Some((k, v)) = m.iter().next() else { continue };
                    (key_str(k).unwrap_or_default(), v.clone())
                }
                other => (scalar(other).ok_or("step is neither a name nor a mapping")?, Value::Null),
            };
            self.lower_step(&name, &args, scope, depth)?;
        }
        Ok(())
    }

    fn lower_step(&mut self, name: &str, args: &Value, scope: &Scope, depth: usize) -> std::result::Result<(), String> {
        let field = |key: &str| args.as_mapping().and_then(|m| get(m, key));
        match name {
            "checkout" | "setup_remote_docker" | "add_ssh_keys" | "store_test_results" => {}
            "run" => {
                let command = match args {
                    Value::Mapping(_) => field("command").and_then(scalar).ok_or("run step has no command")?,
                    other => scalar(other).ok_or("run step has no command")?,
                };
                let command = self.substitute(command.trim_end(), scope);
                match field("when").and_then(scalar).as_deref() {
                    Some("always" | "on_fail") => self.job.post_commands.push(command),
                    _ => self.job.commands.push(command),
                }
            }
            "save_cache" => {
                let key = field("key").and_then(scalar).ok_or("save_cache has no key")?;
                let paths: Vec<String> = field("paths").map(decode).transpose()?.unwrap_or_default();
                let key = self.substitute(&key, scope);
                self.cache.save = Some((parse_cache_key(&key), paths));
            }
            "restore_cache" => {
                let keys: Vec<String> = match (field("keys"), field("key")) {
                    (Some(keys), _) => decode(keys)?,
                    (None, Some(key)) => vec![scalar(key).ok_or("restore_cache key is not a string")?],
                    (None, None) => return Err("restore_cache has no key".to_string()),
                };
                for key in keys {
                    let key = self.substitute(&key, scope);
                    self.cache.restore.push(parse_cache_key(&key));
                }
            }
            "persist_to_workspace" => {
                let root = field("root").and_then(scalar).unwrap_or_else(|| ".".to_string());
                let paths: Vec<String> = field("paths").map(decode).transpose()?.unwrap_or_default();
                for path in paths {
                    let path = if root == "." { path } else { format!("{}/{path}", root.trim_end_matches('/')) };
                    let path = self.substitute(&path, scope);
                    self.job.artifacts.produces.push(path);
                }
            }
            "attach_workspace" => self.attaches_workspace = true,
            "store_artifacts" => {
                let path = field("path").and_then(scalar).ok_or("store_artifacts has no path")?;
                let path = self.substitute(&path, scope);
                self.job.artifacts.produces.push(path);
            }
            "when" | "unless" => {
                let condition = field("condition").map(|c| self.condition_value(c, scope));
                let run = match (name, condition) {
                    ("when", Some(Some(value))) => Some(value),
                    ("unless", Some(Some(value))) => Some(!value),
                    _ => None,
                };
                match run {
                    Some(true) => {
                        let steps: Vec<Value> = field("steps").map(decode).transpose()?.unwrap_or_default();
                        self.lower_steps(&steps, scope, depth + 1)?;
                    }
                    Some(false) => {}
                    None => {
                        self.job.template = Some(TemplateResidue {
                            name: name.to_string(),
                            reason: "condition is only known at runtime".to_string(),
                        });
                    }
                }
            }
            other => self.invoke(other, args, scope, depth)?,
        }
        Ok(())
    }

    /// Literal truth value of a `when`/`unless` condition, if it has one.
    fn condition_value(&mut self, condition: &Value, scope: &Scope) -> Option<bool> {
        match condition {
            Value::Bool(b) => Some(*b),
            Value::String(text) => match self.substitute(text, scope).trim() {
                "true" => Some(true),
                "false" | "" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// A reusable command or an orb command.
    fn invoke(&mut self, name: &str, args: &Value, scope: &Scope, depth: usize) -> std::result::Result<(), String> {
        let Some(command) = self.definitions.commands.and_then(|c| get(c, name)).and_then(Value::as_mapping) else {
            if name.contains('/') {
                let reference = self.orb_reference(name);
                self.job.external_actions.push(reference);
                return Ok(());
            }
            return Err(format!("unknown step '{name}'"));
        };

        let mut inner = Scope {
            values: parameter_defaults(get(command, "parameters")),
        };
        if let Value::Mapping(args) = args {
            for (key, value) in args {
                if let (Some(key), Some(value)) = (key_str(key), scalar(value)) {
                    let value = self.substitute(&value, scope);
                    inner.values.insert(key, value);
                }
            }
        }
        let steps: Vec<Value> = get(command, "steps").map(decode).transpose()?.unwrap_or_default();
        self.lower_steps(&steps, &inner, depth + 1)
    }

    fn finish(&mut self) {
        let cache = std::mem::take(&mut self.cache);
        self.job.cache = match (cache.save, cache.restore.is_empty()) {
            (Some((key, paths)), _) => {
                let fallback = cache.restore.into_iter().filter(|k| *k != key).collect();
                Some(CacheSpec { key, paths, fallback })
            }
            (None, false) => {
                let mut keys = cache.restore.into_iter();
                keys.next().map(|key| CacheSpec {
                    key,
                    paths: Vec::new(),
                    fallback: keys.collect(),
                })
            }
            (None, true) => None,
        };

        if !self.missing.is_empty() {
            self.missing.sort();
            self.missing.dedup();
            self.job.template = Some(TemplateResidue {
                name: "parameters".to_string(),
                reason: format!("no value for {}", self.missing.join(", ")),
            });
        }
    }
}

fn service_name(image: &str) -> String {
    let base = image.rsplit('/').next().unwrap_or(image);
    base.split(':').next().unwrap_or(base).to_string()
}

/// Splits `v1-deps-{{ checksum "package-lock.json" }}` into key components.
fn parse_cache_key(text: &str) -> CacheKey {
    let mut components = Vec::new();
    let mut last = 0;
    for caps in TEMPLATE.captures_iter(text) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        if whole.start > last {
            components.push(CacheKeyComponent::Literal(text[last..whole.start].to_string()));
        }
        let inner = &caps[1];
        components.push(match CHECKSUM.captures(inner) {
            Some(file) => CacheKeyComponent::FileHash(vec![file[1].to_string()]),
            None if inner == ".Branch" => CacheKeyComponent::Branch,
            None => CacheKeyComponent::Variable(inner.trim_start_matches('.').to_string()),
        });
        last = whole.end;
    }
    if last < text.len() {
        components.push(CacheKeyComponent::Literal(text[last..].to_string()));
    }
    CacheKey(components)
}
