use serde::{Deserialize, Serialize};

use crate::ir::{CacheLevel, MatrixLimits};
use crate::vendor::Vendor;

/// Capabilities of the target dialect.
///
/// Loaded from registry data together with the rules; nothing about the
/// target is hard-coded in the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TargetProfile {
    pub vendor: Vendor,
    /// Whether the target has a matrix construct at all
    pub native_matrix: bool,
    pub matrix_limits: MatrixLimits,
    /// Cache identity levels the target's cache construct understands
    pub cache_levels: Vec<CacheLevel>,
    /// Whether a restore may fall back to a broader level than the save
    pub cache_fallback: bool,
    /// Upper bound on automatic retries of one step
    pub max_retries: u32,
    pub allowed_top_level_keys: Vec<String>,
    /// Reserved top-level section the target ignores, used to hold anchors
    pub anchors_section: String,
    /// Plugin used to run a step inside a container
    pub container_plugin: String,
    pub cache_plugin: String,
}

impl TargetProfile {
    pub fn supports_cache_level(&self, level: CacheLevel) -> bool {
        self.cache_levels.contains(&level)
    }

    /// Most specific supported level that is at least as specific as `level`.
    ///
    /// Never returns a broader level than asked for.
    pub fn cache_level_at_most(&self, level: CacheLevel) -> Option<CacheLevel> {
        self.cache_levels.iter().copied().filter(|l| *l <= level).max()
    }

    pub fn allows_top_level_key(&self, key: &str) -> bool {
        key == self.anchors_section || self.allowed_top_level_keys.iter().any(|k| k == key)
    }

    /// Retry limit of the target for `max_attempts` total attempts, capped.
    pub fn retry_limit(&self, max_attempts: u32) -> u32 {
        max_attempts.saturating_sub(1).min(self.max_retries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> TargetProfile {
        TargetProfile {
            vendor: Vendor::Buildkite,
            native_matrix: true,
            matrix_limits: MatrixLimits {
                max_dimensions: 6,
                max_values_per_dimension: 20,
                max_adjustments: 12,
                max_jobs: 50,
            },
            cache_levels: vec![CacheLevel::File, CacheLevel::Branch, CacheLevel::Pipeline],
            cache_fallback: true,
            max_retries: 10,
            allowed_top_level_keys: vec!["steps".to_string(), "env".to_string()],
            anchors_section: "x-anchors".to_string(),
            container_plugin: "docker".to_string(),
            cache_plugin: "cache".to_string(),
        }
    }

    #[test]
    fn test_cache_level_never_broadens() {
        let profile = profile();
        assert_eq!(profile.cache_level_at_most(CacheLevel::Step), Some(CacheLevel::File));
        assert_eq!(profile.cache_level_at_most(CacheLevel::All), Some(CacheLevel::Pipeline));
    }

    #[test]
    fn test_retry_limit_is_attempts_minus_one_capped() {
        let profile = profile();
        assert_eq!(profile.retry_limit(3), 2);
        assert_eq!(profile.retry_limit(1), 0);
        assert_eq!(profile.retry_limit(40), 10);
    }

    #[test]
    fn test_anchor_section_is_always_allowed() {
        let profile = profile();
        assert!(profile.allows_top_level_key("x-anchors"));
        assert!(profile.allows_top_level_key("steps"));
        assert!(!profile.allows_top_level_key("jobs"));
    }
}
