//! Buildkite pipeline emitter.

use std::collections::BTreeMap;

use super::yaml::{render, Document, Node};
use super::Emitter;
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::error::{Result, TranslateError};
use crate::ir::{
    slugify, strip_version_pin, BranchFilter, CacheLevel, Conditional, Dependency, Directive, JobKind, JobNode,
    MatrixSpec, Note, PipelineGraph,
};
use crate::rules::transform::join_and;
use crate::rules::{render_condition, TargetProfile};
use crate::vendor::Vendor;

/// Serializes an annotated graph into a Buildkite `pipeline.yml`.
///
/// Output depends only on the graph: jobs keep their order, step keys follow
/// one canonical order and anchors are named after the first job using them.
pub struct BuildkiteEmitter {
    profile: TargetProfile,
}

/// A plugin reference on a step.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Plugin {
    name: String,
    config: Node,
}

/// A step before plugin anchors are resolved.
struct StepParts {
    key: String,
    comments: Vec<String>,
    head: Vec<(String, Node)>,
    plugins: Vec<Plugin>,
    tail: Vec<(String, Node)>,
}

impl Emitter for BuildkiteEmitter {
    fn vendor(&self) -> Vendor {
        Vendor::Buildkite
    }

    fn format_name(&self) -> &'static str {
        "Buildkite pipeline"
    }

    fn file_extension(&self) -> &'static str {
        "yml"
    }

    fn emit(&self, graph: &PipelineGraph, diagnostics: &mut Diagnostics) -> Result<String> {
        let empty = BTreeMap::new();
        let global_env = if graph.directives.contains(&Directive::PipelineEnvironment) {
            &graph.environment
        } else {
            &empty
        };

        let parts: Vec<StepParts> = graph
            .emitted_jobs()
            .map(|job| self.step(job, global_env, diagnostics))
            .collect();
        let anchors = shared_plugins(&parts);
        let steps: Vec<Node> = parts.into_iter().map(|p| assemble(p, &anchors)).collect();

        let mut root = Vec::new();
        if !anchors.is_empty() {
            let section = anchors
                .iter()
                .map(|(plugin, name)| (name.clone(), Node::Anchor(name.clone(), Box::new(plugin_node(plugin)))))
                .collect();
            root.push((self.profile.anchors_section.clone(), Node::Map(section)));
        }

        let mut rendered_keys = Vec::new();
        for key in &self.profile.allowed_top_level_keys {
            if key == "steps" || *key == self.profile.anchors_section {
                continue;
            }
            if key == "env" && !global_env.is_empty() {
                root.push(("env".to_string(), env_node(global_env.iter())));
                rendered_keys.push(key.as_str());
            } else if let Some(value) = graph.extensions.get(key) {
                root.push((key.clone(), Node::from_value(value)));
                rendered_keys.push(key.as_str());
            }
        }
        root.push(("steps".to_string(), Node::Seq(steps)));

        for key in graph.extensions.keys() {
            if !rendered_keys.contains(&key.as_str()) {
                log::debug!("stripping top-level key '{key}'");
                diagnostics.push(Diagnostic::warning(
                    DiagnosticKind::EmissionInvariant,
                    "top-level-key",
                    format!("top-level key '{key}' is not allowed in a Buildkite pipeline and was dropped"),
                ));
            }
        }

        let mut header = Vec::new();
        if let Some(name) = &graph.name {
            header.push(format!("Pipeline: {name}"));
        }
        header.extend(graph.notes.iter().flat_map(note_comments));

        render(&Document { header, root }).map_err(TranslateError::from)
    }
}

impl BuildkiteEmitter {
    pub fn new(profile: TargetProfile) -> Self {
        Self { profile }
    }

    fn step(&self, job: &JobNode, global_env: &BTreeMap<String, String>, diagnostics: &mut Diagnostics) -> StepParts {
        let mut comments: Vec<String> = job.notes.iter().flat_map(note_comments).collect();

        if let Some(unsupported) = &job.unsupported {
            comments.insert(0, format!("unsupported: {}", unsupported.reason));
            return stub(job, comments);
        }

        if let JobKind::Approval { prompt } = &job.kind {
            let mut head = vec![("block".to_string(), Node::str(&job.label)), ("key".to_string(), Node::str(&job.id))];
            if let Some(prompt) = prompt.as_ref().filter(|p| **p != job.label) {
                head.push(("prompt".to_string(), Node::str(prompt)));
            }
            head.extend(dependency_entries(job));
            head.extend(condition_entries(job));
            return StepParts {
                key: job.id.clone(),
                comments,
                head,
                plugins: Vec::new(),
                tail: Vec::new(),
            };
        }

        let commands = step_commands(job);
        let plugins = self.plugins(job, global_env);
        if commands.is_empty() && plugins.is_empty() {
            let error = TranslateError::EmissionInvariant {
                job: job.id.clone(),
                message: "command step has neither commands nor plugins".to_string(),
            };
            diagnostics.push_error(&error);
            comments.insert(0, "unsupported: nothing to run on Buildkite".to_string());
            return stub(job, comments);
        }

        let mut head = vec![("label".to_string(), Node::str(&job.label)), ("key".to_string(), Node::str(&job.id))];
        head.extend(dependency_entries(job));
        head.extend(condition_entries(job));

        for directive in &job.directives {
            if let Directive::AgentQueue { queue } = directive {
                head.push(("agents".to_string(), Node::Map(vec![("queue".to_string(), Node::str(queue))])));
            }
        }
        let env: Vec<(&String, &String)> = job
            .environment
            .iter()
            .filter(|(k, v)| global_env.get(*k) != Some(*v))
            .collect();
        if !env.is_empty() {
            head.push(("env".to_string(), env_node(env.into_iter())));
        }
        for directive in &job.directives {
            if let Directive::Secrets { names } = directive {
                head.push(("secrets".to_string(), Node::strings(names.iter().cloned())));
            }
        }
        match commands.as_slice() {
            [] => {}
            [single] => head.push(("command".to_string(), Node::str(single))),
            many => head.push(("commands".to_string(), Node::strings(many.iter().cloned()))),
        }

        StepParts {
            key: job.id.clone(),
            comments,
            head,
            plugins,
            tail: tail_entries(job),
        }
    }

    fn plugins(&self, job: &JobNode, global_env: &BTreeMap<String, String>) -> Vec<Plugin> {
        let mut plugins = Vec::new();
        for directive in &job.directives {
            match directive {
                Directive::Container { image, workdir, shell } => {
                    let mut config = vec![("image".to_string(), Node::str(image))];
                    if let Some(workdir) = workdir {
                        config.push(("workdir".to_string(), Node::str(workdir)));
                    }
                    if let Some(shell) = shell {
                        config.push(("shell".to_string(), Node::strings(shell.iter().cloned())));
                    }
                    if !job.environment.is_empty() || !global_env.is_empty() {
                        config.push(("propagate-environment".to_string(), Node::Bool(true)));
                    }
                    plugins.push(Plugin {
                        name: strip_version_pin(&self.profile.container_plugin).to_string(),
                        config: Node::Map(config),
                    });
                }
                Directive::Cache {
                    manifest,
                    paths,
                    save,
                    restore,
                } => {
                    for path in paths {
                        let mut config = Vec::new();
                        if let Some(manifest) = manifest {
                            config.push(("manifest".to_string(), Node::str(manifest)));
                        }
                        config.push(("path".to_string(), Node::str(path)));
                        config.push(("restore".to_string(), level(*restore)));
                        config.push(("save".to_string(), level(*save)));
                        plugins.push(Plugin {
                            name: strip_version_pin(&self.profile.cache_plugin).to_string(),
                            config: Node::Map(config),
                        });
                    }
                }
                _ => {}
            }
        }
        plugins
    }
}

fn level(level: CacheLevel) -> Node {
    Node::str(level.id())
}

/// Downloads first, then the job's own commands.
fn step_commands(job: &JobNode) -> Vec<String> {
    let mut commands: Vec<String> = job
        .directives
        .iter()
        .filter_map(|d| match d {
            Directive::DownloadArtifacts { downloads } => Some(downloads),
            _ => None,
        })
        .flatten()
        .map(|d| {
            format!(
                "buildkite-agent artifact download {} . --step {}",
                shell_quote(&d.path),
                shell_quote(&d.step)
            )
        })
        .collect();
    commands.extend(job.commands.iter().cloned());
    commands
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "'\\''"))
}

fn dependency_entries(job: &JobNode) -> Vec<(String, Node)> {
    let mut entries = Vec::new();
    if !job.depends_on.is_empty() {
        let items = job.depends_on.iter().map(dependency_node).collect();
        entries.push(("depends_on".to_string(), Node::Seq(items)));
    }
    if job.directives.contains(&Directive::AllowDependencyFailure) {
        entries.push(("allow_dependency_failure".to_string(), Node::Bool(true)));
    }
    entries
}

fn dependency_node(dependency: &Dependency) -> Node {
    if dependency.allow_failure {
        Node::Map(vec![
            ("step".to_string(), Node::str(&dependency.job)),
            ("allow_failure".to_string(), Node::Bool(true)),
        ])
    } else {
        Node::str(&dependency.job)
    }
}

/// `if`, `if_changed` and `branches`, folding branches into `if` when both
/// are present since a step cannot carry both.
fn condition_entries(job: &JobNode) -> Vec<(String, Node)> {
    let mut expressions: Vec<String> = Vec::new();
    let mut branches: Option<&str> = None;
    let mut changed: Vec<String> = Vec::new();
    for directive in &job.directives {
        match directive {
            Directive::If { expression } if !expressions.contains(expression) => expressions.push(expression.clone()),
            Directive::Branches { patterns } => branches = Some(patterns),
            Directive::IfChanged { paths } => changed.extend(paths.iter().cloned()),
            _ => {}
        }
    }

    if let Some(patterns) = branches.filter(|_| !expressions.is_empty()) {
        if let Some(expression) = render_condition(&Conditional::Branches(parse_branches(patterns))) {
            expressions.insert(0, expression);
        }
        branches = None;
    }

    let mut entries = Vec::new();
    if !expressions.is_empty() {
        entries.push(("if".to_string(), Node::str(join_and(&expressions))));
    }
    match changed.as_slice() {
        [] => {}
        [single] => entries.push(("if_changed".to_string(), Node::str(single))),
        many => entries.push(("if_changed".to_string(), Node::str(format!("{{{}}}", many.join(","))))),
    }
    if let Some(patterns) = branches {
        entries.push(("branches".to_string(), Node::str(patterns)));
    }
    entries
}

fn parse_branches(patterns: &str) -> BranchFilter {
    let mut filter = BranchFilter::default();
    for pattern in patterns.split_whitespace() {
        match pattern.strip_prefix('!') {
            Some(ignored) => filter.ignore.push(ignored.to_string()),
            None => filter.only.push(pattern.to_string()),
        }
    }
    filter
}

fn tail_entries(job: &JobNode) -> Vec<(String, Node)> {
    let mut entries = Vec::new();
    for directive in &job.directives {
        match directive {
            Directive::NativeMatrix(spec) => entries.push(("matrix".to_string(), matrix_node(spec))),
            Directive::Parallelism { count } => entries.push(("parallelism".to_string(), Node::number(count))),
            Directive::UploadArtifacts { paths } => {
                entries.push(("artifact_paths".to_string(), Node::strings(paths.iter().cloned())));
            }
            Directive::Concurrency { group, limit } => {
                entries.push(("concurrency".to_string(), Node::number(limit)));
                entries.push(("concurrency_group".to_string(), Node::str(group)));
            }
            Directive::Timeout { minutes } => entries.push(("timeout_in_minutes".to_string(), Node::number(minutes))),
            Directive::Retry { limit, exit_statuses } => {
                let automatic = exit_statuses
                    .iter()
                    .map(|status| {
                        let exit_status = match status.parse::<i32>() {
                            Ok(code) => Node::number(code),
                            Err(_) => Node::str(status),
                        };
                        Node::Map(vec![
                            ("exit_status".to_string(), exit_status),
                            ("limit".to_string(), Node::number(limit)),
                        ])
                    })
                    .collect();
                entries.push((
                    "retry".to_string(),
                    Node::Map(vec![("automatic".to_string(), Node::Seq(automatic))]),
                ));
            }
            Directive::SoftFail => entries.push(("soft_fail".to_string(), Node::Bool(true))),
            _ => {}
        }
    }
    let rank = |key: &str| TAIL_ORDER.iter().position(|k| *k == key).unwrap_or(TAIL_ORDER.len());
    entries.sort_by_key(|(key, _)| rank(key));
    entries
}

const TAIL_ORDER: [&str; 8] = [
    "matrix",
    "parallelism",
    "artifact_paths",
    "concurrency",
    "concurrency_group",
    "timeout_in_minutes",
    "retry",
    "soft_fail",
];

fn matrix_node(spec: &MatrixSpec) -> Node {
    let setup = spec
        .dimensions
        .iter()
        .map(|(name, values)| (name.clone(), Node::strings(values.iter().cloned())))
        .collect();
    let mut entries = vec![("setup".to_string(), Node::Map(setup))];
    if !spec.adjustments.is_empty() {
        let adjustments = spec
            .adjustments
            .iter()
            .map(|adjustment| {
                let with = adjustment
                    .with
                    .iter()
                    .map(|(k, v)| (k.clone(), Node::str(v)))
                    .collect();
                let mut entry = vec![("with".to_string(), Node::Map(with))];
                if adjustment.skip {
                    entry.push(("skip".to_string(), Node::Bool(true)));
                }
                Node::Map(entry)
            })
            .collect();
        entries.push(("adjustments".to_string(), Node::Seq(adjustments)));
    }
    Node::Map(entries)
}

fn env_node<'a>(env: impl Iterator<Item = (&'a String, &'a String)>) -> Node {
    Node::Map(env.map(|(k, v)| (k.clone(), Node::str(v))).collect())
}

/// A skipped placeholder that keeps the job's key and edges.
fn stub(job: &JobNode, comments: Vec<String>) -> StepParts {
    let mut head = vec![("label".to_string(), Node::str(&job.label)), ("key".to_string(), Node::str(&job.id))];
    head.extend(dependency_entries(job));
    head.push(("command".to_string(), Node::str("exit 0")));
    StepParts {
        key: job.id.clone(),
        comments,
        head,
        plugins: Vec::new(),
        tail: vec![("skip".to_string(), Node::str("not translated, see comments"))],
    }
}

fn note_comments(note: &Note) -> Vec<String> {
    let mut lines = vec![format!("[{}] {}: {}", note.confidence, note.feature, note.intent)];
    if let Some(instruction) = &note.instruction {
        lines.push(format!("  manual step: {instruction}"));
    }
    lines
}

/// Plugin configurations used by two or more steps, with their anchor names.
fn shared_plugins(parts: &[StepParts]) -> Vec<(Plugin, String)> {
    let mut anchors: Vec<(Plugin, String)> = Vec::new();
    for (position, part) in parts.iter().enumerate() {
        for plugin in &part.plugins {
            if anchors.iter().any(|(p, _)| p == plugin) {
                continue;
            }
            let shared = parts[position + 1..].iter().any(|other| other.plugins.contains(plugin));
            if shared {
                let name = format!("{}-{}", slugify(&plugin.name), part.key);
                anchors.push((plugin.clone(), name));
            }
        }
    }
    anchors
}

fn plugin_node(plugin: &Plugin) -> Node {
    Node::Map(vec![(plugin.name.clone(), plugin.config.clone())])
}

fn assemble(parts: StepParts, anchors: &[(Plugin, String)]) -> Node {
    let mut entries = parts.head;
    if !parts.plugins.is_empty() {
        let plugins = parts
            .plugins
            .iter()
            .map(|plugin| match anchors.iter().find(|(p, _)| p == plugin) {
                Some((_, name)) => Node::Alias(name.clone()),
                None => plugin_node(plugin),
            })
            .collect();
        entries.push(("plugins".to_string(), Node::Seq(plugins)));
    }
    entries.extend(parts.tail);
    Node::Map(entries).with_comments(parts.comments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ArtifactDownload, Confidence, FeatureKind};
    use crate::rules::RuleRegistry;
    use serde_yaml::Value;

    fn emitter() -> BuildkiteEmitter {
        BuildkiteEmitter::new(RuleRegistry::builtin().expect("Should load built-in registry").profile().clone())
    }

    fn emit(graph: &PipelineGraph) -> (String, Diagnostics) {
        let mut diagnostics = Diagnostics::new();
        let text = emitter().emit(graph, &mut diagnostics).expect("Should emit");
        (text, diagnostics)
    }

    fn parse(text: &str) -> Value {
        serde_yaml::from_str(text).expect("Should emit valid YAML")
    }

    fn graph(jobs: Vec<JobNode>) -> PipelineGraph {
        PipelineGraph {
            jobs,
            ..PipelineGraph::default()
        }
    }

    #[test]
    fn test_command_step_key_order() {
        let mut job = JobNode::new("test", "Test").with_command("make test").depending_on("build");
        job.directives.push(Directive::Timeout { minutes: 10 });
        job.directives.push(Directive::If {
            expression: "build.tag != null".to_string(),
        });
        let (text, diagnostics) = emit(&graph(vec![JobNode::new("build", "Build").with_command("make"), job]));
        assert!(diagnostics.is_empty());
        assert_eq!(
            text,
            "steps:\n  - label: Build\n    key: build\n    command: make\n  - label: Test\n    key: test\n    depends_on:\n      - build\n    if: build.tag != null\n    command: make test\n    timeout_in_minutes: 10\n"
        );
    }

    #[test]
    fn test_branches_fold_into_if() {
        let mut job = JobNode::new("deploy", "deploy").with_command("make deploy");
        job.directives.push(Directive::Branches {
            patterns: "main".to_string(),
        });
        job.directives.push(Directive::If {
            expression: "build.source == \"ui\"".to_string(),
        });
        let (text, _) = emit(&graph(vec![job]));
        let step = &parse(&text)["steps"][0];
        assert!(step.get("branches").is_none(), "Should not emit branches next to if");
        assert_eq!(
            step["if"].as_str(),
            Some("build.branch =~ /^main$/ && build.source == \"ui\"")
        );
    }

    #[test]
    fn test_shared_plugins_are_anchored() {
        let container = Directive::Container {
            image: "node:20".to_string(),
            workdir: None,
            shell: None,
        };
        let mut lint = JobNode::new("lint", "lint").with_command("npm run lint");
        lint.directives.push(container.clone());
        let mut test = JobNode::new("test", "test").with_command("npm test");
        test.directives.push(container);
        let (text, _) = emit(&graph(vec![lint, test]));

        assert!(text.starts_with("x-anchors:\n  docker-lint: &docker-lint\n"), "{text}");
        assert_eq!(text.matches("*docker-lint").count(), 2);
        let value = parse(&text);
        assert_eq!(value["steps"][1]["plugins"][0]["docker"]["image"].as_str(), Some("node:20"));
        assert!(!text.contains('#'), "Should never pin plugin versions");
    }

    #[test]
    fn test_unsupported_job_is_skipped_stub() {
        let mut job = JobNode::new("broken", "broken").depending_on("build");
        job.unsupported = Some(crate::ir::Unsupported {
            diagnostic: crate::diagnostics::DiagnosticId(0),
            reason: "cannot parse job".to_string(),
        });
        let (text, _) = emit(&graph(vec![JobNode::new("build", "build").with_command("make"), job]));
        assert!(text.contains("# unsupported: cannot parse job"));
        let step = &parse(&text)["steps"][1];
        assert_eq!(step["key"].as_str(), Some("broken"));
        assert_eq!(step["command"].as_str(), Some("exit 0"));
        assert!(step["skip"].is_string());
        assert_eq!(step["depends_on"][0].as_str(), Some("build"));
    }

    #[test]
    fn test_empty_command_step_is_emission_error() {
        let (text, diagnostics) = emit(&graph(vec![JobNode::new("noop", "noop")]));
        assert_eq!(diagnostics.of_kind(DiagnosticKind::EmissionInvariant).count(), 1);
        assert_eq!(diagnostics.error_count(), 1);
        assert!(parse(&text)["steps"][0]["skip"].is_string());
    }

    #[test]
    fn test_block_step_and_notes() {
        let mut gate = JobNode::new("deploy-approval", "Ship it?");
        gate.kind = JobKind::Approval {
            prompt: Some("Ship it?".to_string()),
        };
        let mut deploy = JobNode::new("deploy", "deploy").with_command("make deploy").depending_on("deploy-approval");
        deploy.notes.push(Note {
            feature: FeatureKind::ExternalAction,
            confidence: Confidence::Manual,
            intent: "uses actions/deploy".to_string(),
            instruction: Some("Replace it".to_string()),
        });
        let (text, _) = emit(&graph(vec![gate, deploy]));
        assert!(text.contains("  # [manual] external-action: uses actions/deploy\n  #   manual step: Replace it\n  - label: deploy"));
        let value = parse(&text);
        assert_eq!(value["steps"][0]["block"].as_str(), Some("Ship it?"));
        assert!(value["steps"][0].get("prompt").is_none());
    }

    #[test]
    fn test_global_env_and_stripped_keys() {
        let mut g = graph(vec![JobNode::new("build", "build").with_command("make")]);
        g.environment.insert("APP".to_string(), "shop".to_string());
        g.jobs[0].environment.insert("APP".to_string(), "shop".to_string());
        g.jobs[0].environment.insert("MODE".to_string(), "ci".to_string());
        g.directives.push(Directive::PipelineEnvironment);
        g.extensions.insert("workflow".to_string(), Value::Null);
        g.extensions.insert("notify".to_string(), serde_yaml::from_str("[{email: a@b.c}]").unwrap());

        let (text, diagnostics) = emit(&g);
        let value = parse(&text);
        assert_eq!(value["env"]["APP"].as_str(), Some("shop"));
        assert!(value["steps"][0]["env"].get("APP").is_none(), "Should not repeat global env");
        assert_eq!(value["steps"][0]["env"]["MODE"].as_str(), Some("ci"));
        assert!(value.get("notify").is_some());
        assert!(value.get("workflow").is_none());
        assert_eq!(diagnostics.of_kind(DiagnosticKind::EmissionInvariant).count(), 1);
        assert_eq!(diagnostics.error_count(), 0);
    }

    #[test]
    fn test_downloads_and_cache_plugin() {
        let mut job = JobNode::new("test", "test").with_command("make test");
        job.directives.push(Directive::DownloadArtifacts {
            downloads: vec![ArtifactDownload {
                step: "build".to_string(),
                path: "dist/**".to_string(),
            }],
        });
        job.directives.push(Directive::Cache {
            manifest: Some("package-lock.json".to_string()),
            paths: vec!["node_modules".to_string()],
            save: CacheLevel::File,
            restore: CacheLevel::Pipeline,
        });
        let (text, _) = emit(&graph(vec![job]));
        let step = &parse(&text)["steps"][0];
        assert_eq!(
            step["commands"][0].as_str(),
            Some("buildkite-agent artifact download 'dist/**' . --step 'build'")
        );
        assert_eq!(step["plugins"][0]["cache"]["save"].as_str(), Some("file"));
        assert_eq!(step["plugins"][0]["cache"]["restore"].as_str(), Some("pipeline"));
    }
}
