//! Target dialect emitters.

pub mod buildkite;
pub mod yaml;

pub use buildkite::BuildkiteEmitter;

use crate::diagnostics::Diagnostics;
use crate::error::Result;
use crate::ir::PipelineGraph;
use crate::rules::TargetProfile;
use crate::vendor::Vendor;

/// Serializes an annotated graph into one target dialect.
pub trait Emitter: Send + Sync {
    fn vendor(&self) -> Vendor;

    /// Human-readable name of the produced file format
    fn format_name(&self) -> &'static str;

    fn file_extension(&self) -> &'static str;

    /// Renders `graph`, reporting constructs the target cannot hold.
    ///
    /// Output is a pure function of the graph.
    fn emit(&self, graph: &PipelineGraph, diagnostics: &mut Diagnostics) -> Result<String>;
}

/// Emitters keyed by target vendor.
pub struct EmitterRegistry {
    emitters: Vec<Box<dyn Emitter>>,
}

impl EmitterRegistry {
    /// Registry with every built-in emitter, configured from `profile`.
    pub fn new(profile: &TargetProfile) -> Self {
        Self {
            emitters: vec![Box::new(BuildkiteEmitter::new(profile.clone()))],
        }
    }

    pub fn get(&self, vendor: Vendor) -> Option<&dyn Emitter> {
        self.emitters.iter().find(|e| e.vendor() == vendor).map(AsRef::as_ref)
    }

    pub fn targets(&self) -> impl Iterator<Item = Vendor> + '_ {
        self.emitters.iter().map(|e| e.vendor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleRegistry;

    #[test]
    fn test_registry_has_buildkite() {
        let registry = RuleRegistry::builtin().expect("Should load built-in registry");
        let emitters = EmitterRegistry::new(registry.profile());
        let emitter = emitters.get(Vendor::Buildkite).expect("Should register Buildkite");
        assert_eq!(emitter.file_extension(), "yml");
        assert!(emitters.get(Vendor::GithubActions).is_none());
        assert_eq!(emitters.targets().collect::<Vec<_>>(), vec![Vendor::Buildkite]);
    }
}
