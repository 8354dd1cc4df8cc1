use anyhow::{Context, Result};
use cishift::Vendor;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration file structure for cishift.
///
/// Lets users keep translation defaults next to their pipelines or in their
/// user config directory. Command-line flags override every value here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub translate: TranslateConfig,

    /// Diagnostics display preferences
    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub batch: BatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TranslateConfig {
    /// Target dialect
    #[serde(default = "default_target")]
    pub target: Vendor,

    /// Force the target's matrix construct on or off
    pub native_matrix: Option<bool>,

    /// Rule registry replacing the built-in one
    pub rules_file: Option<PathBuf>,

    /// Agent queue for steps that do not select one
    pub default_queue: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputConfig {
    #[serde(default)]
    pub diagnostics: DiagnosticsFormat,

    /// Pretty-print JSON output
    #[serde(default)]
    pub pretty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticsFormat {
    #[default]
    Table,
    Json,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BatchConfig {
    /// Translations running at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for TranslateConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            native_matrix: None,
            rules_file: None,
            default_queue: None,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

fn default_target() -> Vendor {
    Vendor::Buildkite
}

fn default_concurrency() -> usize {
    4
}

const CANDIDATES: [&str; 4] = ["cishift.toml", "cishift.json", "cishift.yaml", "cishift.yml"];

impl Config {
    /// Load configuration from a file.
    ///
    /// Searches for configuration files in this order:
    /// 1. Specified path
    /// 2. ./cishift.toml, ./cishift.json, ./cishift.yaml, ./cishift.yml
    /// 3. `<user config dir>/cishift/config.toml`
    ///
    /// Returns default configuration if no file is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_path(path);
        }
        Self::discover(Path::new("."), dirs::config_dir().as_deref())
    }

    fn discover(dir: &Path, user_config_dir: Option<&Path>) -> Result<Self> {
        for candidate in &CANDIDATES {
            let path = dir.join(candidate);
            if path.exists() {
                return Self::load_from_path(&path);
            }
        }

        if let Some(user_dir) = user_config_dir {
            let path = user_dir.join("cishift").join("config.toml");
            if path.exists() {
                return Self::load_from_path(&path);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file path.
    fn load_from_path(path: &Path) -> Result<Self> {
        log::info!("Loading config from {}", path.display());
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

        match extension {
            "toml" => toml::from_str(&contents)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display())),
            "json" => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display())),
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display())),
            _ => toml::from_str(&contents)
                .or_else(|_| serde_json::from_str(&contents))
                .or_else(|_| serde_yaml::from_str(&contents))
                .with_context(|| format!("Failed to parse config file: {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.translate.target, Vendor::Buildkite);
        assert_eq!(config.translate.native_matrix, None);
        assert_eq!(config.output.diagnostics, DiagnosticsFormat::Table);
        assert_eq!(config.batch.concurrency, 4);
    }

    #[test]
    fn test_load_toml_config() {
        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        let toml_content = r#"
[translate]
native-matrix = false
rules-file = "rules/custom.yaml"
default-queue = "linux-large"

[output]
diagnostics = "json"
pretty = true

[batch]
concurrency = 8
"#;
        write!(temp_file, "{toml_content}").unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.translate.target, Vendor::Buildkite);
        assert_eq!(config.translate.native_matrix, Some(false));
        assert_eq!(config.translate.rules_file, Some(PathBuf::from("rules/custom.yaml")));
        assert_eq!(config.translate.default_queue.as_deref(), Some("linux-large"));
        assert_eq!(config.output.diagnostics, DiagnosticsFormat::Json);
        assert!(config.output.pretty);
        assert_eq!(config.batch.concurrency, 8);
    }

    #[test]
    fn test_load_yaml_config() {
        let mut temp_file = NamedTempFile::with_suffix(".yml").unwrap();
        write!(temp_file, "translate:\n  target: buildkite\noutput:\n  diagnostics: none\n").unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.output.diagnostics, DiagnosticsFormat::None);
        assert_eq!(config.batch.concurrency, 4, "Should default missing sections");
    }

    #[test]
    fn test_rejects_unknown_target() {
        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, r#"{{"translate": {{"target": "travis"}}}}"#).unwrap();
        assert!(Config::load_from_path(temp_file.path()).is_err());
    }

    #[test]
    fn test_missing_explicit_path_is_an_error() {
        assert!(Config::load(Some(Path::new("nonexistent-cishift.toml"))).is_err());
    }

    #[cfg(test)]
    mod discover {
        use super::*;

        #[test]
        fn prefers_working_directory() {
            let work = tempfile::tempdir().unwrap();
            let user = tempfile::tempdir().unwrap();
            std::fs::write(work.path().join("cishift.json"), r#"{"batch": {"concurrency": 2}}"#).unwrap();
            std::fs::create_dir_all(user.path().join("cishift")).unwrap();
            std::fs::write(user.path().join("cishift/config.toml"), "[batch]\nconcurrency = 16\n").unwrap();

            let config = Config::discover(work.path(), Some(user.path())).unwrap();
            assert_eq!(config.batch.concurrency, 2);
        }

        #[test]
        fn falls_back_to_user_config_dir() {
            let work = tempfile::tempdir().unwrap();
            let user = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(user.path().join("cishift")).unwrap();
            std::fs::write(user.path().join("cishift/config.toml"), "[batch]\nconcurrency = 16\n").unwrap();

            let config = Config::discover(work.path(), Some(user.path())).unwrap();
            assert_eq!(config.batch.concurrency, 16);
        }

        #[test]
        fn defaults_when_nothing_is_found() {
            let work = tempfile::tempdir().unwrap();
            let config = Config::discover(work.path(), None).unwrap();
            assert_eq!(config.batch.concurrency, 4);
        }
    }
}
