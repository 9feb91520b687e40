//! Manifest apply engine
//!
//! Fetches a multi-document manifest from a file, URL or inline text,
//! substitutes placeholders, splits it into documents and hands each decoded
//! document to an [`Applier`]. Documents are independent: one failing never
//! stops the rest, and nothing is rolled back.

#![deny(missing_docs)]

mod applier;
mod decode;
mod engine;
mod source;
mod text;

pub use applier::{classify_create, Applier, ApplyOutcome, CreateOnlyApplier};
pub use decode::{parse_yaml, ManifestObject};
pub use engine::{ApplyReport, ManifestEngine};
pub use source::ManifestSource;
pub use text::{split_documents, Substitutions};

#[cfg(test)]
pub use applier::MockApplier;
