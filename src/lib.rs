//! Weavemark: incremental AOP advice-reference index and bean-metadata cache.
//!
//! The tracking engine lives in `weavemark-core`; this crate adds the `weave`
//! query CLI over persisted tracker state.

// Core infrastructure - re-exported from weavemark-core
pub use weavemark_core::adapter;
pub use weavemark_core::config;
pub use weavemark_core::definition;
pub use weavemark_core::error;
pub use weavemark_core::index;
pub use weavemark_core::metadata;
pub use weavemark_core::output;
pub use weavemark_core::persistence;
pub use weavemark_core::rebuild;
pub use weavemark_core::reference;
pub use weavemark_core::registry;
pub use weavemark_core::scheduler;
pub use weavemark_core::tracker;
pub use weavemark_core::types;
pub use weavemark_core::workspace;

// Front door
pub mod cli;

pub use weavemark_core::{OutputErrorCode, WeaveError, WeaveResult, WeavingTracker};
