//! Conformance checks run on emitted text.
//!
//! Validation is feedback for the caller. The translator never consults a
//! validator itself.

use std::collections::HashSet;
use std::io::{self, Read, Write as _};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use serde_yaml::Value;

use crate::rules::TargetProfile;

/// Verdict of one validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub validator: String,
    pub ok: bool,
    pub messages: Vec<String>,
}

impl ValidationReport {
    fn new(validator: &str, messages: Vec<String>) -> Self {
        Self {
            validator: validator.to_string(),
            ok: messages.is_empty(),
            messages,
        }
    }
}

pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, text: &str) -> ValidationReport;
}

/// Re-reads a Buildkite pipeline and checks its step graph.
pub struct StructuralValidator {
    allowed_top_level_keys: Vec<String>,
}

const STEP_TYPES: &[&str] = &["command", "commands", "plugins", "block", "input", "wait", "trigger", "group"];

impl StructuralValidator {
    pub fn new(profile: &TargetProfile) -> Self {
        let mut allowed_top_level_keys = profile.allowed_top_level_keys.clone();
        allowed_top_level_keys.push(profile.anchors_section.clone());
        Self { allowed_top_level_keys }
    }

    fn check(&self, text: &str) -> Vec<String> {
        let root: Value = match serde_yaml::from_str(text) {
            Ok(root) => root,
            Err(e) => return vec![format!("not valid YAML: {e}")],
        };
        let Value::Mapping(root) = root else {
            return vec!["document root is not a mapping".to_string()];
        };

        let mut messages = Vec::new();
        for key in root.keys() {
            match key.as_str() {
                Some(key) if self.allowed_top_level_keys.iter().any(|k| k == key) => {}
                _ => messages.push(format!("unexpected top-level key {}", describe(key))),
            }
        }
        let Some(steps) = root.get("steps").and_then(Value::as_sequence) else {
            messages.push("'steps' is missing or not a list".to_string());
            return messages;
        };

        let mut keys = HashSet::new();
        for (position, step) in steps.iter().enumerate() {
            let name = step_name(step, position);
            if !step.is_mapping() {
                messages.push(format!("{name} is not a mapping"));
                continue;
            }
            if !STEP_TYPES.iter().any(|t| step.get(*t).is_some()) {
                messages.push(format!("{name} has no command, plugins or block"));
            }
            if let Some(key) = step.get("key").and_then(Value::as_str) {
                if !keys.insert(key.to_string()) {
                    messages.push(format!("duplicate step key '{key}'"));
                }
            }
            // Dependencies must point backwards
            for dependency in dependencies(step) {
                if !keys.contains(&dependency) || step.get("key").and_then(Value::as_str) == Some(&dependency) {
                    messages.push(format!("{name} depends on '{dependency}', which is not an earlier step"));
                }
            }
        }
        messages
    }
}

impl Validator for StructuralValidator {
    fn name(&self) -> &str {
        "structure"
    }

    fn validate(&self, text: &str) -> ValidationReport {
        ValidationReport::new(self.name(), self.check(text))
    }
}

fn describe(key: &Value) -> String {
    match key.as_str() {
        Some(key) => format!("'{key}'"),
        None => format!("{key:?}"),
    }
}

fn step_name(step: &Value, position: usize) -> String {
    match step.get("key").and_then(Value::as_str) {
        Some(key) => format!("step '{key}'"),
        None => format!("step {}", position + 1),
    }
}

fn dependencies(step: &Value) -> Vec<String> {
    match step.get("depends_on") {
        Some(Value::String(single)) => vec![single.clone()],
        Some(Value::Sequence(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(id) => Some(id.clone()),
                other => other.get("step").and_then(Value::as_str).map(str::to_string),
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Pipes the text into an external command; success means valid.
///
/// Output lines of a failing command become the report's messages.
pub struct CommandValidator {
    program: String,
    args: Vec<String>,
}

impl CommandValidator {
    /// Splits a command line on whitespace. `None` when it is empty.
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut words = command_line.split_whitespace().map(str::to_string);
        let program = words.next()?;
        Some(Self {
            program,
            args: words.collect(),
        })
    }

    /// Feeds `text` to the command while draining its output, so a command
    /// that streams output before reading all its input cannot stall.
    fn run(&self, text: &str) -> io::Result<(bool, String)> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take();
        let input = text.to_string();
        let writer = thread::spawn(move || -> io::Result<()> {
            if let Some(mut stdin) = stdin {
                // A validator may exit without reading its input
                match stdin.write_all(input.as_bytes()) {
                    Err(e) if e.kind() != io::ErrorKind::BrokenPipe => return Err(e),
                    _ => {}
                }
            }
            Ok(())
        });
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match child.wait() {
            Ok(status) => status,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };
        joined(writer)?;
        let mut combined = String::from_utf8_lossy(&joined(stdout)?).into_owned();
        combined.push_str(&String::from_utf8_lossy(&joined(stderr)?));
        Ok((status.success(), combined))
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buffer)?;
        }
        Ok(buffer)
    })
}

fn joined<T>(handle: JoinHandle<io::Result<T>>) -> io::Result<T> {
    handle
        .join()
        .map_err(|_| io::Error::other("validator pipe thread panicked"))?
}

impl Validator for CommandValidator {
    fn name(&self) -> &str {
        &self.program
    }

    fn validate(&self, text: &str) -> ValidationReport {
        log::debug!("validating with {} {:?}", self.program, self.args);
        match self.run(text) {
            Ok((true, _)) => ValidationReport::new(self.name(), Vec::new()),
            Ok((false, output)) => {
                let mut messages: Vec<String> = output
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect();
                if messages.is_empty() {
                    messages.push(format!("{} rejected the pipeline", self.program));
                }
                ValidationReport::new(self.name(), messages)
            }
            Err(e) => ValidationReport::new(self.name(), vec![format!("cannot run {}: {e}", self.program)]),
        }
    }
}
