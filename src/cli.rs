//! CLI front door: read-only queries over persisted tracker state.
//!
//! Provides the command implementations behind the `weave` binary:
//! - `units` - Units present in either registry with their counts
//! - `references` - Every reference, optionally for one unit
//! - `touching` - References affecting one artifact
//! - `advised` / `advice` - Whether a member is a join point or an advice
//! - `metadata` - Cached bean metadata for one bean
//!
//! ## State
//!
//! [`StateView::open`] reads both state files from the configured state
//! directory with strict decoding, so a corrupt file is reported rather than
//! silently treated as empty. The view never writes back.
//!
//! ## Error Handling
//!
//! All functions return `Result<T, WeaveError>`; the binary maps the error to
//! an exit code and a JSON `ErrorResponse`.

use indexmap::IndexMap;
use tracing::debug;

use weavemark_core::config::TrackerConfig;
use weavemark_core::error::{WeaveError, WeaveResult};
use weavemark_core::index::{ReferenceSnapshot, UnitStore};
use weavemark_core::metadata::{BeanMetadataHolder, MetadataRegistry};
use weavemark_core::output::{MemberResponse, MetadataResponse, ReferencesResponse, UnitSummary, UnitsResponse};
use weavemark_core::persistence::{FileStateStore, MemoryStateStore};
use weavemark_core::reference::Reference;
use weavemark_core::registry::{ReferenceRegistry, Registry};
use weavemark_core::types::{ArtifactPath, UnitId};

/// Registries restored from the state directory.
pub struct StateView {
    references: ReferenceRegistry,
    metadata: MetadataRegistry,
}

impl StateView {
    /// Load both registries. Missing files read as empty.
    pub fn open(config: &TrackerConfig) -> WeaveResult<Self> {
        let references: ReferenceRegistry = Registry::new("references", Box::new(MemoryStateStore::new()));
        let metadata: MetadataRegistry = Registry::new("metadata", Box::new(MemoryStateStore::new()));

        let reference_state = FileStateStore::<ReferenceSnapshot>::new(config.references_path()).try_load()?;
        let metadata_state = FileStateStore::<Vec<BeanMetadataHolder>>::new(config.metadata_path()).try_load()?;
        debug!(
            state_dir = %config.state_dir.value.display(),
            reference_units = reference_state.units.len(),
            metadata_units = metadata_state.units.len(),
            "opened state"
        );
        references.restore_state(reference_state);
        metadata.restore_state(metadata_state);

        Ok(StateView { references, metadata })
    }

    pub fn references(&self) -> &ReferenceRegistry {
        &self.references
    }

    pub fn metadata(&self) -> &MetadataRegistry {
        &self.metadata
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Units present in either registry, reference units first.
pub fn units(view: &StateView) -> UnitsResponse {
    let mut summaries: IndexMap<UnitId, UnitSummary> = IndexMap::new();
    for index in view.references.stores() {
        let entry = summary_entry(&mut summaries, index.unit());
        entry.references = index.len();
    }
    for index in view.metadata.stores() {
        let entry = summary_entry(&mut summaries, index.unit());
        entry.beans = index.len();
    }
    UnitsResponse::new(summaries.into_values().collect())
}

fn summary_entry<'a>(summaries: &'a mut IndexMap<UnitId, UnitSummary>, unit: &UnitId) -> &'a mut UnitSummary {
    summaries.entry(unit.clone()).or_insert_with(|| UnitSummary {
        unit: unit.to_string(),
        references: 0,
        beans: 0,
    })
}

/// Every reference in the workspace, or in `unit` only.
pub fn references(view: &StateView, unit: Option<&str>) -> WeaveResult<ReferencesResponse> {
    match unit {
        None => Ok(ReferencesResponse::new(None, &view.references.all_references_in_workspace())),
        Some(name) => {
            let index = view
                .references
                .get(&UnitId::new(name))
                .ok_or_else(|| WeaveError::unit_not_found(name))?;
            Ok(ReferencesResponse::new(Some(name.to_string()), &index.all_references()))
        }
    }
}

/// References affecting `file` as aspect, target, bean, or advice file.
pub fn touching(view: &StateView, file: &str) -> WeaveResult<ReferencesResponse> {
    let file = non_empty("file", file)?;
    let found = view.references.references_touching_file(&ArtifactPath::new(file));
    Ok(ReferencesResponse::new(Some(file.to_string()), &found))
}

/// References whose target is `member` (`Type.method`, or `Type`).
pub fn advised(view: &StateView, member: &str) -> WeaveResult<MemberResponse> {
    let member = non_empty("member", member)?;
    let found: Vec<Reference> = view
        .references
        .all_references_in_workspace()
        .into_iter()
        .filter(|r| r.target.qualified_name() == member)
        .collect();
    Ok(MemberResponse::new(member, "advised", &found))
}

/// References whose advice (source) is `member`.
pub fn advice(view: &StateView, member: &str) -> WeaveResult<MemberResponse> {
    let member = non_empty("member", member)?;
    let found: Vec<Reference> = view
        .references
        .all_references_in_workspace()
        .into_iter()
        .filter(|r| r.source.as_ref().is_some_and(|s| s.qualified_name() == member))
        .collect();
    Ok(MemberResponse::new(member, "advice", &found))
}

/// Cached metadata for `bean` across all units.
pub fn metadata(view: &StateView, bean: &str) -> WeaveResult<MetadataResponse> {
    let bean = non_empty("bean", bean)?;
    let entries = view.metadata.metadata_for_bean(bean);
    if entries.is_empty() {
        return Err(WeaveError::BeanNotFound { bean: bean.to_string() });
    }
    Ok(MetadataResponse::new(bean, entries))
}

fn non_empty<'a>(what: &str, value: &'a str) -> WeaveResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(WeaveError::invalid_args_with_details(
            format!("{} must not be empty", what),
            serde_json::json!({ "argument": what }),
        ));
    }
    Ok(trimmed)
}

// ============================================================================
// Tests
// ============================================================================
