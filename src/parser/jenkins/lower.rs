//! Lowers a declarative pipeline tree into the canonical IR.
//!
//! Sequential stages chain through explicit edges, `parallel` children fan
//! out from the same predecessors and nested `stages` recurse. Agent,
//! environment, options and `when` flow from enclosing stages into the jobs
//! they contain.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_yaml::Value;

use super::syntax::{Expr, Node, NodeKind};
use crate::diagnostics::Diagnostics;
use crate::ir::{
    matrix_token, slugify, ApprovalGate, CompareOp, Conditional, Container, Dependency, JobNode, MatrixSpec, PipelineGraph,
    RetryPolicy, RunWhen, Schedule, TemplateResidue, Trigger, TriggerEvent,
};
use crate::parser::expr::{rename_variable, rename_variables, JENKINS_VARIABLES};
use crate::parser::{edges, placeholder, IdAllocator};

static GROOVY_BRACED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\s*(?:env|params)\.(\w+)\s*\}").expect("valid braced interpolation pattern")
});

static GROOVY_BARE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(?:env|params)\.(\w+)").expect("valid bare interpolation pattern"));

/// Combinations one `exclude` block may expand to.
const MAX_EXCLUDED_COMBINATIONS: usize = 256;

const POST_CONDITIONS: &[&str] = &[
    "always",
    "success",
    "failure",
    "unsuccessful",
    "unstable",
    "changed",
    "fixed",
    "regression",
    "aborted",
    "cleanup",
];

/// Inherited settings of the enclosing stages.
#[derive(Debug, Clone, Default)]
struct Context {
    environment: BTreeMap<String, String>,
    secrets: Vec<String>,
    container: Option<Container>,
    resource_hint: Option<String>,
    agent_residue: Option<TemplateResidue>,
    conditionals: Vec<Conditional>,
    timeout_minutes: Option<u32>,
    retry: Option<RetryPolicy>,
}

struct Lowering<'d> {
    diagnostics: &'d mut Diagnostics,
    ids: IdAllocator,
    jobs: Vec<JobNode>,
    /// Stash name to the job that stashed it
    stashes: HashMap<String, String>,
    unstashes: Vec<(usize, String)>,
}

/// Lowers the statements of a Jenkinsfile.
///
/// # Errors
///
/// Returns a message when there is no declarative `pipeline` block.
pub(super) fn lower(nodes: &[Node], diagnostics: &mut Diagnostics) -> Result<PipelineGraph, String> {
    let mut graph = PipelineGraph::new();
    let libraries: Vec<Value> = nodes
        .iter()
        .filter(|n| n.name == "@Library")
        .map(|n| Value::String(n.text.clone()))
        .collect();
    if !libraries.is_empty() {
        graph.extensions.insert("libraries".to_string(), Value::Sequence(libraries));
    }

    let pipeline = match nodes.iter().find(|n| n.name == "pipeline") {
        Some(pipeline) => pipeline,
        None if nodes.iter().any(|n| n.name == "node") => {
            return Err("scripted pipelines are not supported; expected a declarative pipeline block".to_string())
        }
        None => return Err("no declarative pipeline block".to_string()),
    };

    let mut context = Context::default();
    for section in pipeline.body() {
        match section.name.as_str() {
            "agent" => apply_agent(section, &mut context),
            "environment" => apply_environment(section, &mut context),
            "options" => {
                apply_options(section, &mut context);
                for option in section.body() {
                    if option.name == "disableConcurrentBuilds" {
                        graph.extensions.insert("disableConcurrentBuilds".to_string(), Value::Bool(true));
                    }
                }
            }
            "parameters" => {
                for parameter in section.body() {
                    if let Some((name, default)) = parameter_default(parameter) {
                        context.environment.insert(name, default);
                    }
                }
            }
            "triggers" => lower_triggers(section, &mut graph),
            "stages" | "post" => {}
            other => {
                graph
                    .extensions
                    .insert(other.to_string(), Value::String(section.text.clone()));
            }
        }
    }
    graph.environment = context.environment.clone();
    graph.timeout_minutes = context.timeout_minutes;

    let stages = pipeline
        .child("stages")
        .ok_or("pipeline block has no stages section")?;

    let mut lowering = Lowering {
        diagnostics,
        ids: IdAllocator::default(),
        jobs: Vec::new(),
        stashes: HashMap::new(),
        unstashes: Vec::new(),
    };
    let exits = lowering.sequence(stages.body(), &context, &[]);
    if let Some(post) = pipeline.child("post") {
        lowering.pipeline_post(post, &context, &exits);
    }
    lowering.resolve_unstashes();

    graph.jobs = lowering.jobs;
    Ok(graph)
}

impl Lowering<'_> {
    /// Lowers sequential stages; returns the ids the next stage should wait on.
    fn sequence(&mut self, stages: &[Node], context: &Context, upstream: &[String]) -> Vec<String> {
        let mut current = upstream.to_vec();
        for stage in stages.iter().filter(|n| n.name == "stage") {
            current = self.stage(stage, context, &current);
        }
        current
    }

    fn stage(&mut self, stage: &Node, parent: &Context, upstream: &[String]) -> Vec<String> {
        let label = stage
            .positional(0)
            .and_then(Expr::literal)
            .map(str::to_string);
        let base = label.as_deref().map(slugify).filter(|s| !s.is_empty());
        let id = self.ids.allocate(base.as_deref().unwrap_or("stage"));
        let label = label.unwrap_or_else(|| id.clone());

        if base.is_none() {
            return vec![self.failed(&id, &label, upstream, "stage has no name")];
        }
        if let NodeKind::Invalid(message) = &stage.kind {
            return vec![self.failed(&id, &label, upstream, message.as_str())];
        }

        let mut context = parent.clone();
        for section in stage.body() {
            match section.name.as_str() {
                "agent" => apply_agent(section, &mut context),
                "environment" => apply_environment(section, &mut context),
                "options" => apply_options(section, &mut context),
                "when" => context.conditionals.extend(lower_when(section)),
                _ => {}
            }
        }

        let first_job = self.jobs.len();
        let unstash_mark = self.unstashes.len();
        let exits = if let Some(steps) = stage.child("steps") {
            match self.job(&id, &label, steps, stage, &context, upstream) {
                Ok(job) => {
                    self.jobs.push(job);
                    vec![id]
                }
                Err(message) => {
                    self.unstashes.truncate(unstash_mark);
                    vec![self.failed(&id, &label, upstream, message)]
                }
            }
        } else if let Some(parallel) = stage.child("parallel") {
            let mut exits = Vec::new();
            for child in parallel.children("stage") {
                exits.extend(self.stage(child, &context, upstream));
            }
            exits
        } else if let Some(stages) = stage.child("stages") {
            self.sequence(stages.body(), &context, upstream)
        } else if let Some(matrix) = stage.child("matrix") {
            match self.matrix_job(&id, &label, matrix, &context, upstream) {
                Ok(job) => {
                    self.jobs.push(job);
                    vec![id]
                }
                Err(message) => {
                    self.unstashes.truncate(unstash_mark);
                    vec![self.failed(&id, &label, upstream, message)]
                }
            }
        } else {
            vec![self.failed(&id, &label, upstream, "stage has no steps, stages, parallel or matrix section")]
        };

        if let Some(input) = stage.child("input") {
            let prompt = input
                .child("message")
                .and_then(|m| m.positional(0))
                .or_else(|| input.arg("message"))
                .and_then(Expr::literal)
                .map(str::to_string);
            for job in self.jobs[first_job..]
                .iter_mut()
                .filter(|j| !j.is_unsupported() && j.dependency_ids().all(|d| upstream.iter().any(|u| u == d)))
            {
                job.approval = Some(ApprovalGate {
                    prompt: prompt.clone(),
                    inferred: false,
                });
            }
        }
        exits
    }

    fn failed(&mut self, id: &str, label: &str, upstream: &[String], message: impl Into<String>) -> String {
        let job = placeholder(self.diagnostics, id, label, edges(upstream), message);
        self.jobs.push(job);
        id.to_string()
    }

    fn base_job(&self, id: &str, label: &str, context: &Context, upstream: &[String]) -> JobNode {
        let mut job = JobNode::new(id, label);
        job.depends_on = upstream
            .iter()
            .map(|u| Dependency {
                job: u.clone(),
                allow_failure: false,
            })
            .collect();
        job.environment = context.environment.clone();
        job.secrets = context.secrets.clone();
        job.container = context.container.clone();
        job.resource_hint = context.resource_hint.clone();
        job.template = context.agent_residue.clone();
        job.conditionals = context.conditionals.clone();
        job.timeout_minutes = context.timeout_minutes;
        job.retry = context.retry.clone();
        job
    }

    fn job(
        &mut self,
        id: &str,
        label: &str,
        steps: &Node,
        stage: &Node,
        context: &Context,
        upstream: &[String],
    ) -> Result<JobNode, String> {
        let mut job = self.base_job(id, label, context, upstream);
        let position = self.jobs.len();
        self.steps(steps.body(), &mut job, position, None)?;
        if let Some(post) = stage.child("post") {
            self.stage_post(post, &mut job, position)?;
        }
        Ok(job)
    }

    fn matrix_job(
        &mut self,
        id: &str,
        label: &str,
        matrix: &Node,
        context: &Context,
        upstream: &[String],
    ) -> Result<JobNode, String> {
        let mut context = context.clone();
        for section in matrix.body() {
            match section.name.as_str() {
                "agent" => apply_agent(section, &mut context),
                "environment" => apply_environment(section, &mut context),
                "when" => context.conditionals.extend(lower_when(section)),
                _ => {}
            }
        }

        let mut spec = MatrixSpec::new();
        for axis in matrix
            .child("axes")
            .ok_or("matrix has no axes")?
            .children("axis")
        {
            let (name, values) = axis_values(axis, "values").ok_or("matrix axis needs a name and values")?;
            spec = spec.with_dimension(name, values);
        }
        if let Some(excludes) = matrix.child("excludes") {
            for exclude in excludes.children("exclude") {
                let mut partial = MatrixSpec::new();
                for axis in exclude.children("axis") {
                    let (name, values) = axis_values(axis, "values").ok_or("matrix exclude needs values")?;
                    partial = partial.with_dimension(name, values);
                }
                let combinations = partial
                    .combinations_within(MAX_EXCLUDED_COMBINATIONS)
                    .ok_or("matrix exclude expands to too many combinations")?;
                for combination in combinations {
                    spec = spec.with_adjustment(combination, true);
                }
            }
        }

        let mut job = self.base_job(id, label, &context, upstream);
        for name in spec.dimensions.keys() {
            job.environment.insert(name.clone(), matrix_token(name));
        }
        job.matrix = Some(spec);

        let position = self.jobs.len();
        let inner = matrix.child("stages").ok_or("matrix has no stages")?;
        for stage in inner.children("stage") {
            let steps = stage
                .child("steps")
                .ok_or("matrix stages must contain steps")?;
            self.steps(steps.body(), &mut job, position, None)?;
            if let Some(post) = stage.child("post") {
                self.stage_post(post, &mut job, position)?;
            }
        }
        Ok(job)
    }

    /// Lowers step statements into `job`.
    fn steps(&mut self, steps: &[Node], job: &mut JobNode, position: usize, dir: Option<&str>) -> Result<(), String> {
        for step in steps {
            match (&step.kind, step.name.as_str()) {
                (NodeKind::Raw(_), _) => set_residue(job, &step.name, "Groovy script block"),
                (NodeKind::Assign(_), _) => set_residue(job, &step.name, "Groovy assignment"),
                (NodeKind::Block(body), "dir") => {
                    let sub = step
                        .arg_or_first("path")
                        .and_then(Expr::literal)
                        .ok_or("dir step needs a path")?;
                    let nested = match dir {
                        Some(outer) => format!("{outer}/{sub}"),
                        None => sub.to_string(),
                    };
                    self.steps(body, job, position, Some(&nested))?;
                }
                (NodeKind::Block(body), "retry") => {
                    let attempts = step
                        .arg_or_first("count")
                        .and_then(Expr::literal)
                        .and_then(|n| n.parse().ok())
                        .ok_or("retry step needs a count")?;
                    job.retry = Some(RetryPolicy {
                        max_attempts: attempts,
                        conditions: Vec::new(),
                    });
                    self.steps(body, job, position, dir)?;
                }
                (NodeKind::Block(body), "timeout") => {
                    job.timeout_minutes = Some(timeout_minutes(step).ok_or("timeout step needs a time")?);
                    self.steps(body, job, position, dir)?;
                }
                (NodeKind::Block(body), "withEnv") => {
                    for pair in step.positional(0).map(Expr::literals).unwrap_or_default() {
                        if let Some((name, value)) = pair.split_once('=') {
                            job.environment.insert(name.to_string(), text(value, true));
                        }
                    }
                    self.steps(body, job, position, dir)?;
                }
                (NodeKind::Block(body), "withCredentials") => {
                    job.secrets.extend(credential_variables(step));
                    self.steps(body, job, position, dir)?;
                }
                (NodeKind::Block(body), "catchError" | "warnError") => {
                    job.soft_fail = true;
                    self.steps(body, job, position, dir)?;
                }
                (NodeKind::Block(body), "timestamps" | "ansiColor" | "wrap" | "node" | "container" | "sshagent") => {
                    self.steps(body, job, position, dir)?;
                }
                (NodeKind::Block(_), name) => set_residue(job, name, "unsupported step block"),
                (NodeKind::Call, name) => self.call(step, name, job, position, dir)?,
                (NodeKind::Invalid(message), _) => return Err(message.clone()),
            }
        }
        Ok(())
    }

    fn call(&mut self, step: &Node, name: &str, job: &mut JobNode, position: usize, dir: Option<&str>) -> Result<(), String> {
        let push = |job: &mut JobNode, command: String| {
            job.commands.push(match dir {
                Some(dir) => format!("(cd {dir} && {command})"),
                None => command,
            });
        };

        match name {
            "sh" | "bat" | "pwsh" | "powershell" => {
                let script = step
                    .arg_or_first("script")
                    .ok_or_else(|| format!("{name} step has no script"))?;
                let (source, interpolated) = match script {
                    Expr::Str { value, interpolated } => (value.as_str(), *interpolated),
                    Expr::Raw(_) => {
                        set_residue(job, name, "script is computed by Groovy");
                        return Ok(());
                    }
                    other => (other.literal().ok_or_else(|| format!("{name} script is not a string"))?, false),
                };
                for line in source.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    push(job, text(line, interpolated));
                }
            }
            "echo" => {
                let message = step.positional(0).map(expr_text).unwrap_or_default();
                push(job, format!("echo \"{}\"", message.replace('"', "\\\"")));
            }
            "error" => {
                let message = step.arg_or_first("message").map(expr_text).unwrap_or_default();
                push(job, format!("echo \"{}\" >&2 && exit 1", message.replace('"', "\\\"")));
            }
            "sleep" => {
                let seconds = step
                    .arg_or_first("time")
                    .and_then(Expr::literal)
                    .and_then(|t| t.parse::<u64>().ok())
                    .ok_or("sleep step needs a time")?;
                let multiplier = match step.arg("unit").and_then(Expr::literal) {
                    Some("MINUTES") => 60,
                    Some("HOURS") => 3600,
                    _ => 1,
                };
                push(job, format!("sleep {}", seconds * multiplier));
            }
            "archiveArtifacts" => {
                let paths = step
                    .arg_or_first("artifacts")
                    .and_then(Expr::literal)
                    .ok_or("archiveArtifacts needs artifacts")?;
                job.artifacts
                    .produces
                    .extend(paths.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()));
            }
            "stash" => {
                let stash = step
                    .arg_or_first("name")
                    .and_then(Expr::literal)
                    .ok_or("stash needs a name")?;
                let includes = step.arg("includes").and_then(Expr::literal).unwrap_or("**");
                job.artifacts.produces.push(includes.to_string());
                self.stashes.insert(stash.to_string(), job.id.clone());
            }
            "unstash" => {
                let stash = step
                    .arg_or_first("name")
                    .and_then(Expr::literal)
                    .ok_or("unstash needs a name")?;
                self.unstashes.push((position, stash.to_string()));
            }
            "input" => {
                job.approval = Some(ApprovalGate {
                    prompt: step.arg_or_first("message").and_then(Expr::literal).map(str::to_string),
                    inferred: false,
                });
            }
            "checkout" | "git" | "cleanWs" | "deleteDir" | "skipDefaultCheckout" => {}
            other => job.external_actions.push(other.to_string()),
        }
        Ok(())
    }

    /// Stage `post`: `always` and `cleanup` run as post commands, `success`
    /// runs after the steps; other conditions have no per-step equivalent.
    fn stage_post(&mut self, post: &Node, job: &mut JobNode, position: usize) -> Result<(), String> {
        for condition in post.body() {
            let mut scratch = JobNode::new(job.id.clone(), job.label.clone());
            self.steps(condition.body(), &mut scratch, position, None)?;
            match condition.name.as_str() {
                "always" | "cleanup" => job.post_commands.extend(scratch.commands),
                "success" => job.commands.extend(scratch.commands),
                other => set_residue(job, &format!("post.{other}"), "stage post condition"),
            }
            job.artifacts.produces.extend(scratch.artifacts.produces);
            job.external_actions.extend(scratch.external_actions);
        }
        Ok(())
    }

    /// Pipeline `post` conditions become jobs after every final stage.
    fn pipeline_post(&mut self, post: &Node, context: &Context, exits: &[String]) {
        for condition in post.body() {
            let name = condition.name.as_str();
            if !POST_CONDITIONS.contains(&name) {
                continue;
            }
            let id = self.ids.allocate(&format!("post-{name}"));
            let runs_on_failure = matches!(name, "always" | "cleanup" | "failure" | "unsuccessful");
            let mut job = self.base_job(&id, &format!("post {name}"), context, exits);
            for dependency in &mut job.depends_on {
                dependency.allow_failure = runs_on_failure;
            }
            match name {
                "always" | "cleanup" => job.conditionals.push(Conditional::Status { when: RunWhen::Always }),
                "failure" | "unsuccessful" => job.conditionals.push(Conditional::Status { when: RunWhen::OnFailure }),
                "success" => {}
                other => job.conditionals.push(Conditional::Expression {
                    source: format!("post {other}"),
                }),
            }

            let position = self.jobs.len();
            let unstash_mark = self.unstashes.len();
            match self.steps(condition.body(), &mut job, position, None) {
                Ok(()) if is_empty(&job) => {
                    log::trace!("skipping empty post condition {name}");
                    self.unstashes.truncate(unstash_mark);
                }
                Ok(()) => self.jobs.push(job),
                Err(message) => {
                    self.unstashes.truncate(unstash_mark);
                    let dependencies = std::mem::take(&mut job.depends_on);
                    let stub = placeholder(self.diagnostics, &id, &job.label, dependencies, message);
                    self.jobs.push(stub);
                }
            }
        }
    }

    fn resolve_unstashes(&mut self) {
        for (position, stash) in std::mem::take(&mut self.unstashes) {
            let Some(producer) = self.stashes.get(&stash) else {
                log::debug!("unstash of unknown stash '{stash}'");
                continue;
            };
            if let Some(job) = self.jobs.get_mut(position) {
                if job.id != *producer && !job.artifacts.consumes.contains(producer) {
                    job.artifacts.consumes.push(producer.clone());
                }
            }
        }
    }
}

fn is_empty(job: &JobNode) -> bool {
    job.commands.is_empty()
        && job.external_actions.is_empty()
        && job.artifacts.produces.is_empty()
        && job.template.is_none()
}

fn set_residue(job: &mut JobNode, name: &str, reason: &str) {
    if job.template.is_none() {
        job.template = Some(TemplateResidue {
            name: name.to_string(),
            reason: reason.to_string(),
        });
    }
}

/// Groovy interpolation of `env.` and `params.` becomes shell variables and
/// Jenkins variables are renamed.
fn text(source: &str, interpolated: bool) -> String {
    let source = if interpolated {
        let braced = GROOVY_BRACED.replace_all(source, |caps: &Captures| format!("${{{}}}", &caps[1]));
        GROOVY_BARE
            .replace_all(&braced, |caps: &Captures| format!("${}", &caps[1]))
            .into_owned()
    } else {
        source.to_string()
    };
    rename_variables(&source, JENKINS_VARIABLES)
}

fn expr_text(expr: &Expr) -> String {
    match expr {
        Expr::Str { value, interpolated } => text(value, *interpolated),
        Expr::Raw(raw) => raw.clone(),
        other => other.literal().unwrap_or_default().to_string(),
    }
}

fn apply_agent(agent: &Node, context: &mut Context) {
    if let Some(kind) = agent.positional(0).and_then(Expr::literal) {
        if matches!(kind, "any" | "none") {
            context.container = None;
            context.resource_hint = None;
            context.agent_residue = None;
        }
        return;
    }
    for section in agent.body() {
        match section.name.as_str() {
            "docker" => {
                let image = section
                    .positional(0)
                    .or_else(|| section.child("image").and_then(|i| i.positional(0)))
                    .and_then(Expr::literal);
                if let Some(image) = image {
                    context.container = Some(Container {
                        image: text(image, true),
                        workdir: None,
                        shell: None,
                    });
                }
                if let Some(label) = section.child("label").and_then(|l| l.positional(0)).and_then(Expr::literal) {
                    context.resource_hint = Some(label.to_string());
                }
            }
            "label" => {
                context.resource_hint = section.positional(0).and_then(Expr::literal).map(str::to_string);
            }
            "node" => {
                context.resource_hint = section
                    .child("label")
                    .and_then(|l| l.positional(0))
                    .and_then(Expr::literal)
                    .map(str::to_string);
            }
            other @ ("kubernetes" | "dockerfile") => {
                context.agent_residue = Some(TemplateResidue {
                    name: format!("agent.{other}"),
                    reason: "agent is defined by a pod or build file".to_string(),
                });
            }
            _ => {}
        }
    }
}

fn apply_environment(environment: &Node, context: &mut Context) {
    for entry in environment.body() {
        let NodeKind::Assign(value) = &entry.kind else {
            continue;
        };
        match value {
            Expr::Call { name, .. } if name == "credentials" => {
                context.secrets.push(entry.name.clone());
                context.environment.remove(&entry.name);
            }
            other => {
                context.environment.insert(entry.name.clone(), expr_text(other));
            }
        }
    }
}

fn apply_options(options: &Node, context: &mut Context) {
    for option in options.body() {
        match option.name.as_str() {
            "timeout" => context.timeout_minutes = timeout_minutes(option).or(context.timeout_minutes),
            "retry" => {
                if let Some(attempts) = option
                    .arg_or_first("count")
                    .and_then(Expr::literal)
                    .and_then(|n| n.parse().ok())
                {
                    context.retry = Some(RetryPolicy {
                        max_attempts: attempts,
                        conditions: Vec::new(),
                    });
                }
            }
            other => log::trace!("ignoring option {other}"),
        }
    }
}

fn timeout_minutes(node: &Node) -> Option<u32> {
    let time: u32 = node.arg_or_first("time").and_then(Expr::literal)?.parse().ok()?;
    Some(match node.arg("unit").and_then(Expr::literal).unwrap_or("MINUTES") {
        "SECONDS" => time.div_ceil(60),
        "HOURS" => time * 60,
        "DAYS" => time * 60 * 24,
        _ => time,
    })
}

fn parameter_default(parameter: &Node) -> Option<(String, String)> {
    let name = parameter.arg("name").and_then(Expr::literal)?.to_string();
    let default = match parameter.name.as_str() {
        "choice" => parameter
            .arg("choices")
            .map(Expr::literals)
            .and_then(|choices| choices.first().map(|c| (*c).to_string()))
            .unwrap_or_default(),
        _ => parameter
            .arg("defaultValue")
            .and_then(Expr::literal)
            .unwrap_or_default()
            .to_string(),
    };
    Some((name, default))
}

fn lower_triggers(triggers: &Node, graph: &mut PipelineGraph) {
    for trigger in triggers.body() {
        let spec = trigger.arg_or_first("spec").and_then(Expr::literal);
        match (trigger.name.as_str(), spec) {
            ("cron", Some(cron)) => graph.schedules.push(Schedule {
                cron: cron.trim().to_string(),
                branch: None,
            }),
            ("pollSCM", _) => graph.triggers.push(Trigger {
                event: TriggerEvent::Push,
                branches: Vec::new(),
                paths: Vec::new(),
            }),
            (other, _) => {
                graph
                    .extensions
                    .insert(format!("triggers.{other}"), Value::String(trigger.text.clone()));
            }
        }
    }
}

fn axis_values(axis: &Node, key: &str) -> Option<(String, Vec<String>)> {
    let name = axis.child("name")?.positional(0).and_then(Expr::literal)?.to_string();
    let values: Vec<String> = axis
        .child(key)?
        .args
        .iter()
        .flat_map(|a| a.value.literals())
        .map(str::to_string)
        .collect();
    (!values.is_empty()).then_some((name, values))
}

fn credential_variables(step: &Node) -> Vec<String> {
    let mut names = Vec::new();
    for arg in &step.args {
        let bindings = match &arg.value {
            Expr::List(items) => items.iter().collect(),
            other => vec![other],
        };
        for binding in bindings {
            if let Expr::Call { args, .. } = binding {
                names.extend(
                    args.iter()
                        .filter(|a| a.name.as_deref().is_some_and(|n| n.ends_with("Variable")))
                        .filter_map(|a| a.value.literal())
                        .map(str::to_string),
                );
            }
        }
    }
    names
}

/// `when` conditions are a conjunction of their children.
fn lower_when(when: &Node) -> Vec<Conditional> {
    when.body().iter().filter_map(condition).collect()
}

fn condition(node: &Node) -> Option<Conditional> {
    let first = || node.arg_or_first("pattern").and_then(Expr::literal).map(str::to_string);
    let regexp = node.arg("comparator").and_then(Expr::literal) == Some("REGEXP");
    let raw = || Conditional::Expression {
        source: node.text.clone(),
    };

    Some(match (node.name.as_str(), &node.kind) {
        ("beforeAgent" | "beforeInput" | "beforeOptions", _) => return None,
        ("branch", NodeKind::Call) if !regexp => Conditional::only_branches(vec![first()?]),
        ("tag", NodeKind::Call) if !regexp => Conditional::Tags {
            patterns: vec![first().unwrap_or_else(|| "*".to_string())],
        },
        ("buildingTag", NodeKind::Call) => Conditional::Tags {
            patterns: vec!["*".to_string()],
        },
        ("changeRequest", NodeKind::Call) => Conditional::Event {
            events: vec![TriggerEvent::PullRequest],
        },
        ("changeset", NodeKind::Call) if !regexp => Conditional::Changes { paths: vec![first()?] },
        ("environment", NodeKind::Call) => Conditional::Variable {
            name: rename_variable(node.arg("name").and_then(Expr::literal)?, JENKINS_VARIABLES),
            op: CompareOp::Eq,
            value: node.arg("value").and_then(Expr::literal)?.to_string(),
        },
        ("triggeredBy", NodeKind::Call) => match node.arg_or_first("cause").and_then(Expr::literal) {
            Some("TimerTrigger") => Conditional::Event {
                events: vec![TriggerEvent::Schedule],
            },
            Some("UserIdCause") => Conditional::Event {
                events: vec![TriggerEvent::Manual],
            },
            _ => raw(),
        },
        ("not", NodeKind::Block(body)) => match body.as_slice() {
            [inner] => match condition(inner) {
                Some(Conditional::Branches(filter)) if filter.ignore.is_empty() => {
                    Conditional::ignore_branches(filter.only)
                }
                _ => raw(),
            },
            _ => raw(),
        },
        ("anyOf", NodeKind::Block(body)) => {
            let branches: Option<Vec<String>> = body
                .iter()
                .map(|inner| match condition(inner) {
                    Some(Conditional::Branches(filter)) if filter.ignore.is_empty() => Some(filter.only),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()
                .map(|groups| groups.concat());
            match branches {
                Some(only) if !only.is_empty() => Conditional::only_branches(only),
                _ => raw(),
            }
        }
        ("allOf", NodeKind::Block(body)) => {
            let mut inner: Vec<Conditional> = body.iter().filter_map(condition).collect();
            match inner.len() {
                1 => inner.remove(0),
                _ => raw(),
            }
        }
        ("expression", NodeKind::Raw(source)) => Conditional::Expression {
            source: source.clone(),
        },
        _ => raw(),
    })
}
