//! Deterministic translation of CI pipeline definitions into Buildkite.
//!
//! Source documents are parsed into a vendor-neutral [`ir::PipelineGraph`],
//! annotated by the data-driven [`rules`] through the [`engine`], and written
//! out by an [`emitter`]. Every feature that cannot be carried over exactly is
//! reported as a [`diagnostics::Diagnostic`] and left as a comment in the output.
//!
//! ```no_run
//! use cishift::translate::Translator;
//! use cishift::vendor::{Vendor, VendorPair};
//!
//! let translator = Translator::builtin()?;
//! let source = std::fs::read_to_string(".gitlab-ci.yml")?;
//! let translation = translator.translate(&source, VendorPair::new(Vendor::GitlabCi, Vendor::Buildkite))?;
//! println!("{}", translation.text);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod diagnostics;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod ir;
pub mod parser;
pub mod rules;
pub mod translate;
pub mod validate;
pub mod vendor;

pub use error::{Result, TranslateError};
pub use translate::{Translation, Translator};
pub use vendor::{Vendor, VendorPair};
