use serde::{Deserialize, Serialize};

/// One component of a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type", content = "value")]
pub enum CacheKeyComponent {
    Literal(String),
    /// Hash of the contents of one or more files (paths or globs)
    FileHash(Vec<String>),
    /// The branch being built
    Branch,
    /// Any other build-context value (OS, architecture, env var)
    Variable(String),
}

/// An ordered cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey(pub Vec<CacheKeyComponent>);

/// Identity granularity of a cache entry, from most to least specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLevel {
    File,
    Step,
    Branch,
    Pipeline,
    All,
}

impl CacheLevel {
    pub fn id(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Step => "step",
            Self::Branch => "branch",
            Self::Pipeline => "pipeline",
            Self::All => "all",
        }
    }
}

/// Cache configuration of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSpec {
    /// Most specific key
    pub key: CacheKey,
    pub paths: Vec<String>,
    /// Broader restore keys, most specific first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback: Vec<CacheKey>,
}

impl CacheKey {
    pub fn literal(text: impl Into<String>) -> Self {
        Self(vec![CacheKeyComponent::Literal(text.into())])
    }

    /// Files whose contents identify the key, in order of appearance.
    pub fn manifests(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter_map(|c| match c {
                CacheKeyComponent::FileHash(paths) => Some(paths.iter().map(String::as_str)),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// The most specific level this key can be represented at.
    pub fn level(&self) -> CacheLevel {
        if self.0.iter().any(|c| matches!(c, CacheKeyComponent::FileHash(_))) {
            CacheLevel::File
        } else if self.0.iter().any(|c| matches!(c, CacheKeyComponent::Branch)) {
            CacheLevel::Branch
        } else {
            CacheLevel::Pipeline
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for component in &self.0 {
            match component {
                CacheKeyComponent::Literal(text) => f.write_str(text)?,
                CacheKeyComponent::FileHash(paths) => write!(f, "<hash:{}>", paths.join(","))?,
                CacheKeyComponent::Branch => f.write_str("<branch>")?,
                CacheKeyComponent::Variable(name) => write!(f, "<{name}>")?,
            }
        }
        Ok(())
    }
}

impl CacheSpec {
    /// Level at which the cache is saved: always the most specific key's level.
    pub fn save_level(&self) -> CacheLevel {
        self.key.level()
    }

    /// Broadest level reached by the fallback chain.
    ///
    /// When the target has a single identity granularity the restore level
    /// collapses onto the save level, never onto a broader one.
    pub fn restore_level(&self, supports_fallback: bool) -> CacheLevel {
        let save = self.save_level();
        if !supports_fallback {
            return save;
        }
        self.fallback
            .iter()
            .map(CacheKey::level)
            .fold(save, std::cmp::Ord::max)
    }

    /// Every key in specificity order, the primary key first.
    pub fn chain(&self) -> impl Iterator<Item = &CacheKey> {
        std::iter::once(&self.key).chain(self.fallback.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circleci_style() -> CacheSpec {
        CacheSpec {
            key: CacheKey(vec![
                CacheKeyComponent::Literal("v1-deps-".to_string()),
                CacheKeyComponent::FileHash(vec!["package-lock.json".to_string()]),
            ]),
            paths: vec!["node_modules".to_string()],
            fallback: vec![CacheKey::literal("v1-deps-")],
        }
    }

    #[test]
    fn test_save_level_is_most_specific() {
        assert_eq!(circleci_style().save_level(), CacheLevel::File);
    }

    #[test]
    fn test_restore_level_follows_fallback_chain() {
        assert_eq!(circleci_style().restore_level(true), CacheLevel::Pipeline);
    }

    #[test]
    fn test_restore_level_collapses_without_fallback_support() {
        assert_eq!(
            circleci_style().restore_level(false),
            CacheLevel::File,
            "Should never pick a broader level than the primary key"
        );
    }

    #[test]
    fn test_branch_component_level() {
        let key = CacheKey(vec![
            CacheKeyComponent::Literal("deps-".to_string()),
            CacheKeyComponent::Branch,
        ]);
        assert_eq!(key.level(), CacheLevel::Branch);
    }

    #[test]
    fn test_manifests_flatten_in_order() {
        let key = CacheKey(vec![
            CacheKeyComponent::FileHash(vec!["a.lock".to_string(), "b.lock".to_string()]),
            CacheKeyComponent::Literal("-".to_string()),
            CacheKeyComponent::FileHash(vec!["c.lock".to_string()]),
        ]);
        assert_eq!(key.manifests(), vec!["a.lock", "b.lock", "c.lock"]);
    }

    #[test]
    fn test_display_renders_components() {
        assert_eq!(
            circleci_style().key.to_string(),
            "v1-deps-<hash:package-lock.json>"
        );
    }
}
