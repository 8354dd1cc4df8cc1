//! Data-driven translation rules.
//!
//! The registry is the single source of translation truth: which rule handles
//! which feature for which source, at what confidence, and under which
//! predicate. The engine only interprets it.

pub mod predicate;
pub mod profile;
pub mod registry;
pub mod transform;

pub use predicate::Predicate;
pub use profile::TargetProfile;
pub use registry::{AllSources, RuleRegistry, SourceSet, TranslationRule};
pub use transform::{glob_to_regex, render_condition, Effect, Transform, TransformContext};
