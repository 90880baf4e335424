//! Core infrastructure for weavemark.
//!
//! This crate provides the advice-reference tracking engine:
//! - Aspect definitions, introductions, and type-pattern matching
//! - Per-unit reference indexes and the bean-metadata cache
//! - Registries with change notification and persisted state
//! - Coalescing rebuild scheduling on worker threads
//! - Analyzer and metadata-provider traits for pluggable front ends
//! - Error types, configuration, and JSON output types for CLI responses

pub mod adapter;
pub mod config;
pub mod definition;
pub mod error;
pub mod index;
pub mod metadata;
pub mod output;
pub mod persistence;
pub mod rebuild;
pub mod reference;
pub mod registry;
pub mod scheduler;
pub mod tracker;
pub mod types;
pub mod workspace;

pub use error::{OutputErrorCode, WeaveError, WeaveResult};
pub use index::{ReferenceIndex, UnitStore};
pub use registry::{ReferenceRegistry, Registry};
pub use tracker::WeavingTracker;
