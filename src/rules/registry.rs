use std::path::Path;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use super::{Predicate, TargetProfile, Transform};
use crate::error::{Result, TranslateError};
use crate::ir::{Confidence, FeatureKind, JobNode};
use crate::vendor::Vendor;

static BUILTIN: OnceLock<std::result::Result<RuleRegistry, String>> = OnceLock::new();

/// Which source vendors a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceSet {
    All(AllSources),
    Vendors(Vec<Vendor>),
}

/// The literal `all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllSources {
    All,
}

impl SourceSet {
    pub fn contains(&self, vendor: Vendor) -> bool {
        match self {
            Self::All(_) => true,
            Self::Vendors(vendors) => vendors.contains(&vendor),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::All(_) => "all".to_string(),
            Self::Vendors(vendors) => vendors.iter().map(|v| v.id()).collect::<Vec<_>>().join(", "),
        }
    }
}

/// One entry of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TranslationRule {
    pub name: String,
    pub feature: FeatureKind,
    pub sources: SourceSet,
    pub confidence: Confidence,
    #[serde(default, skip_serializing_if = "Predicate::is_empty")]
    pub when: Predicate,
    pub transform: Transform,
    /// Caveat recorded with approximate and manual translations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Manual configuration step for the user, when one exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
}

impl TranslationRule {
    /// Whether the rule's predicate holds for `job`.
    pub fn applies_to(&self, job: &JobNode, profile: &TargetProfile) -> bool {
        self.when.matches(job, profile)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RegistryDocument {
    target: TargetProfile,
    rules: Vec<TranslationRule>,
}

/// Immutable, ordered table of translation rules plus the target profile.
///
/// Declaration order is priority among rules of equal confidence.
#[derive(Debug, Clone)]
pub struct RuleRegistry {
    profile: TargetProfile,
    rules: Vec<TranslationRule>,
}

impl RuleRegistry {
    /// The registry shipped with the crate, parsed once per process.
    ///
    /// # Errors
    ///
    /// Returns [`TranslateError::Registry`] if the embedded data is invalid.
    pub fn builtin() -> Result<&'static RuleRegistry> {
        BUILTIN
            .get_or_init(|| {
                log::debug!("loading built-in rule registry");
                Self::from_yaml(include_str!("registry.yaml")).map_err(|e| e.to_string())
            })
            .as_ref()
            .map_err(|message| TranslateError::Registry(message.clone()))
    }

    /// Parses and validates a registry document.
    ///
    /// # Errors
    ///
    /// Returns [`TranslateError::Registry`] for malformed data, duplicate or
    /// empty rule names, and transforms that cannot handle their feature.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let document: RegistryDocument =
            serde_yaml::from_str(text).map_err(|e| TranslateError::Registry(e.to_string()))?;

        let mut names = std::collections::HashSet::new();
        for rule in &document.rules {
            if rule.name.trim().is_empty() {
                return Err(TranslateError::Registry(format!(
                    "rule for feature '{}' has an empty name",
                    rule.feature
                )));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(TranslateError::Registry(format!("duplicate rule name '{}'", rule.name)));
            }
            if !rule.transform.supports(rule.feature) {
                return Err(TranslateError::Registry(format!(
                    "rule '{}': transform '{}' cannot handle feature '{}'",
                    rule.name,
                    rule.transform.id(),
                    rule.feature
                )));
            }
        }
        if !document.target.vendor.is_target() {
            return Err(TranslateError::Registry(format!(
                "'{}' is not a target vendor",
                document.target.vendor.id()
            )));
        }

        log::debug!("registry loaded with {} rules", document.rules.len());
        Ok(Self {
            profile: document.target,
            rules: document.rules,
        })
    }

    /// Loads a user-supplied registry file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or a registry error.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn profile(&self) -> &TargetProfile {
        &self.profile
    }

    /// Overrides whether the target's matrix construct is used.
    #[must_use]
    pub fn with_native_matrix(mut self, enabled: bool) -> Self {
        self.profile.native_matrix = enabled;
        self
    }

    pub fn rules(&self) -> &[TranslationRule] {
        &self.rules
    }

    /// Rules for `(source, feature)` in priority order.
    pub fn rules_for(&self, source: Vendor, feature: FeatureKind) -> impl Iterator<Item = &TranslationRule> {
        self.rules
            .iter()
            .filter(move |rule| rule.feature == feature && rule.sources.contains(source))
    }

    /// Rules relevant to `source`, or all rules when `None`.
    pub fn rules_from(&self, source: Option<Vendor>) -> impl Iterator<Item = &TranslationRule> {
        self.rules
            .iter()
            .filter(move |rule| source.map_or(true, |vendor| rule.sources.contains(vendor)))
    }
}
