//! Per-unit indexes.
//!
//! Each analyzed unit owns one store behind the registry. Stores guard their
//! contents with a reader/writer lock held for exactly one mutation or one
//! snapshot; callers never see a lock guard.
//!
//! [`ReferenceIndex`] holds the advice reference set of one unit. The
//! metadata cache implements the same [`UnitStore`] contract in
//! [`crate::metadata`].

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::definition::Definition;
use crate::reference::{Reference, ReferenceRecord};
use crate::types::{ArtifactPath, Member, UnitId};

// ============================================================================
// Store Contract
// ============================================================================

/// Contract shared by every per-unit store the registry manages.
pub trait UnitStore: Send + Sync + 'static {
    /// Persisted form of one unit's contents.
    type Snapshot: Serialize + DeserializeOwned + Send;

    /// An empty store for `unit`.
    fn create(unit: UnitId) -> Self;

    /// Rebuild a store from its persisted form.
    fn restore(unit: UnitId, snapshot: Self::Snapshot) -> Self;

    fn unit(&self) -> &UnitId;

    /// Drop every entry derived from `artifact`. Returns how many were removed.
    fn invalidate(&self, artifact: &ArtifactPath) -> usize;

    fn snapshot(&self) -> Self::Snapshot;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Reference Index
// ============================================================================

/// Insertion-ordered, deduplicated reference set for one unit.
#[derive(Debug)]
pub struct ReferenceIndex {
    unit: UnitId,
    references: RwLock<IndexSet<Reference>>,
}

impl ReferenceIndex {
    pub fn new(unit: UnitId) -> Self {
        ReferenceIndex {
            unit,
            references: RwLock::new(IndexSet::new()),
        }
    }

    /// Insert a reference. Returns `false` if an equal edge was already present.
    pub fn add(&self, reference: Reference) -> bool {
        self.references.write().insert(reference)
    }

    /// Insert a batch under one write lock. Returns how many were new.
    pub fn add_all(&self, references: impl IntoIterator<Item = Reference>) -> usize {
        let mut set = self.references.write();
        let mut added = 0;
        for reference in references {
            if set.insert(reference) {
                added += 1;
            }
        }
        added
    }

    /// Remove the references of `artifact` and add `references` under one
    /// write lock, so readers see either the old or the new state.
    pub fn replace_artifact(&self, artifact: &ArtifactPath, references: Vec<Reference>) -> usize {
        self.replace_artifacts(std::slice::from_ref(artifact), references)
    }

    /// [`ReferenceIndex::replace_artifact`] for several artifacts at once.
    pub fn replace_artifacts(&self, artifacts: &[ArtifactPath], references: Vec<Reference>) -> usize {
        let mut set = self.references.write();
        set.retain(|r| !artifacts.contains(&r.definition.file));
        let mut added = 0;
        for reference in references {
            if set.insert(reference) {
                added += 1;
            }
        }
        added
    }

    pub fn all_references(&self) -> Vec<Reference> {
        self.references.read().iter().cloned().collect()
    }

    /// References declared in `artifact` or whose definition lives there.
    pub fn references_touching(&self, artifact: &ArtifactPath) -> Vec<Reference> {
        self.references
            .read()
            .iter()
            .filter(|r| r.touches(artifact))
            .cloned()
            .collect()
    }

    pub fn is_advised(&self, member: &Member) -> bool {
        self.references.read().iter().any(|r| r.target == *member)
    }

    pub fn is_advice(&self, member: &Member) -> bool {
        self.references
            .read()
            .iter()
            .any(|r| r.source.as_ref() == Some(member))
    }

    /// Distinct definitions owning at least one reference, in first-seen order.
    pub fn definitions(&self) -> Vec<Arc<Definition>> {
        let set = self.references.read();
        let mut seen: IndexMap<&Definition, Arc<Definition>> = IndexMap::new();
        for reference in set.iter() {
            seen.entry(reference.definition.as_ref())
                .or_insert_with(|| Arc::clone(&reference.definition));
        }
        seen.into_values().collect()
    }
}

/// Persisted layout: each definition once, its references nested under it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceSnapshot {
    pub definitions: Vec<DefinitionGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionGroup {
    pub definition: Definition,
    pub references: Vec<ReferenceRecord>,
}

impl ReferenceSnapshot {
    pub fn reference_count(&self) -> usize {
        self.definitions.iter().map(|g| g.references.len()).sum()
    }
}

impl UnitStore for ReferenceIndex {
    type Snapshot = ReferenceSnapshot;

    fn create(unit: UnitId) -> Self {
        ReferenceIndex::new(unit)
    }

    fn restore(unit: UnitId, snapshot: ReferenceSnapshot) -> Self {
        let index = ReferenceIndex::new(unit);
        {
            let mut set = index.references.write();
            for group in snapshot.definitions {
                let definition = Arc::new(group.definition);
                for record in group.references {
                    set.insert(Reference::from_record(record, Arc::clone(&definition)));
                }
            }
        }
        index
    }

    fn unit(&self) -> &UnitId {
        &self.unit
    }

    fn invalidate(&self, artifact: &ArtifactPath) -> usize {
        let mut set = self.references.write();
        let before = set.len();
        set.retain(|r| r.definition.file != *artifact);
        before - set.len()
    }

    fn snapshot(&self) -> ReferenceSnapshot {
        let set = self.references.read();
        let mut groups: IndexMap<&Definition, Vec<ReferenceRecord>> = IndexMap::new();
        for reference in set.iter() {
            groups
                .entry(reference.definition.as_ref())
                .or_default()
                .push(reference.to_record());
        }
        ReferenceSnapshot {
            definitions: groups
                .into_iter()
                .map(|(definition, references)| DefinitionGroup {
                    definition: definition.clone(),
                    references,
                })
                .collect(),
        }
    }

    fn len(&self) -> usize {
        self.references.read().len()
    }
}

// ============================================================================
// Tests
// ============================================================================
