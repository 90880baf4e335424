//! Bean metadata cache.
//!
//! Same architecture as the reference index, keyed by bean identifier instead
//! of reference identity. Each [`BeanMetadataHolder`] carries the type-level
//! and method-level annotation facts and the bean properties contributed by
//! the metadata providers, plus the time it was last rebuilt.
//!
//! Nothing evicts holders by age. [`MetadataIndex::entries_older_than`]
//! exposes the timestamps for a pruning policy to use.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::adapter::{BeanContribution, MetadataProvider};
use crate::index::UnitStore;
use crate::registry::Registry;
use crate::scheduler::{CancelToken, RebuildTask};
use crate::types::{ArtifactPath, Member, UnitId};

/// The bean metadata registry.
pub type MetadataRegistry = Registry<MetadataIndex>;

// ============================================================================
// Facts
// ============================================================================

/// An annotation on the bean class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeFact {
    /// Qualified annotation type.
    pub annotation: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl TypeFact {
    pub fn new(annotation: impl Into<String>) -> Self {
        TypeFact {
            annotation: annotation.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// An annotation on a method of the bean class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodFact {
    pub method: Member,
    pub annotation: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl MethodFact {
    pub fn new(method: Member, annotation: impl Into<String>) -> Self {
        MethodFact {
            method,
            annotation: annotation.into(),
            attributes: BTreeMap::new(),
        }
    }
}

/// A bean property derived from annotations (e.g. an injected field).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BeanProperty {
    pub name: String,
    pub value: String,
}

impl BeanProperty {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        BeanProperty {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Everything known about one bean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeanMetadataHolder {
    pub bean_id: String,
    pub bean_file: ArtifactPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_file: Option<ArtifactPath>,
    #[serde(default)]
    pub type_facts: IndexSet<TypeFact>,
    #[serde(default)]
    pub method_facts: IndexSet<MethodFact>,
    #[serde(default)]
    pub properties: IndexSet<BeanProperty>,
    pub last_modified: DateTime<Utc>,
}

impl BeanMetadataHolder {
    pub fn new(bean_id: impl Into<String>, bean_file: impl Into<ArtifactPath>, last_modified: DateTime<Utc>) -> Self {
        BeanMetadataHolder {
            bean_id: bean_id.into(),
            bean_file: bean_file.into(),
            class_file: None,
            type_facts: IndexSet::new(),
            method_facts: IndexSet::new(),
            properties: IndexSet::new(),
            last_modified,
        }
    }

    /// Merge one provider's contribution.
    pub fn absorb(&mut self, contribution: BeanContribution) {
        if self.class_file.is_none() {
            self.class_file = contribution.class_file;
        }
        self.type_facts.extend(contribution.type_facts);
        self.method_facts.extend(contribution.method_facts);
        self.properties.extend(contribution.properties);
    }

    /// Derived from `artifact` (the bean's config file or its class file).
    pub fn touches(&self, artifact: &ArtifactPath) -> bool {
        self.bean_file == *artifact || self.class_file.as_ref() == Some(artifact)
    }

    pub fn is_empty(&self) -> bool {
        self.type_facts.is_empty() && self.method_facts.is_empty() && self.properties.is_empty()
    }
}

// ============================================================================
// Metadata Index
// ============================================================================

/// Per-unit bean metadata, keyed by bean identifier.
#[derive(Debug)]
pub struct MetadataIndex {
    unit: UnitId,
    holders: RwLock<IndexMap<String, BeanMetadataHolder>>,
}

impl MetadataIndex {
    pub fn new(unit: UnitId) -> Self {
        MetadataIndex {
            unit,
            holders: RwLock::new(IndexMap::new()),
        }
    }

    /// Store `holder`, replacing the bean's previous facts. An empty holder
    /// just clears the bean.
    pub fn set_holder(&self, holder: BeanMetadataHolder) {
        let mut holders = self.holders.write();
        if holder.is_empty() {
            holders.shift_remove(&holder.bean_id);
        } else {
            holders.insert(holder.bean_id.clone(), holder);
        }
    }

    /// Drop the holders derived from `artifact` and store `fresh` under one
    /// write lock. Empty holders are not stored.
    pub fn replace_artifact(&self, artifact: &ArtifactPath, fresh: Vec<BeanMetadataHolder>) -> usize {
        self.replace_artifacts(std::slice::from_ref(artifact), fresh)
    }

    /// [`MetadataIndex::replace_artifact`] for several artifacts at once.
    /// Every artifact is cleared before any fresh holder goes in.
    pub fn replace_artifacts(&self, artifacts: &[ArtifactPath], fresh: Vec<BeanMetadataHolder>) -> usize {
        let mut holders = self.holders.write();
        holders.retain(|_, h| !artifacts.iter().any(|a| h.touches(a)));
        let mut stored = 0;
        for holder in fresh.into_iter().filter(|h| !h.is_empty()) {
            holders.insert(holder.bean_id.clone(), holder);
            stored += 1;
        }
        stored
    }

    pub fn remove_bean(&self, bean_id: &str) -> bool {
        self.holders.write().shift_remove(bean_id).is_some()
    }

    pub fn holder(&self, bean_id: &str) -> Option<BeanMetadataHolder> {
        self.holders.read().get(bean_id).cloned()
    }

    pub fn holders(&self) -> Vec<BeanMetadataHolder> {
        self.holders.read().values().cloned().collect()
    }

    /// Beans whose facts were last rebuilt before `cutoff`.
    pub fn entries_older_than(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        self.holders
            .read()
            .values()
            .filter(|h| h.last_modified < cutoff)
            .map(|h| h.bean_id.clone())
            .collect()
    }
}

impl UnitStore for MetadataIndex {
    type Snapshot = Vec<BeanMetadataHolder>;

    fn create(unit: UnitId) -> Self {
        MetadataIndex::new(unit)
    }

    fn restore(unit: UnitId, snapshot: Vec<BeanMetadataHolder>) -> Self {
        let index = MetadataIndex::new(unit);
        {
            let mut holders = index.holders.write();
            for holder in snapshot.into_iter().filter(|h| !h.is_empty()) {
                holders.insert(holder.bean_id.clone(), holder);
            }
        }
        index
    }

    fn unit(&self) -> &UnitId {
        &self.unit
    }

    fn invalidate(&self, artifact: &ArtifactPath) -> usize {
        let mut holders = self.holders.write();
        let before = holders.len();
        holders.retain(|_, h| !h.touches(artifact));
        before - holders.len()
    }

    fn snapshot(&self) -> Vec<BeanMetadataHolder> {
        self.holders()
    }

    fn len(&self) -> usize {
        self.holders.read().len()
    }
}

impl Registry<MetadataIndex> {
    /// Holders for `bean_id` across all units.
    pub fn metadata_for_bean(&self, bean_id: &str) -> Vec<(UnitId, BeanMetadataHolder)> {
        self.stores()
            .iter()
            .filter_map(|index| index.holder(bean_id).map(|h| (index.unit().clone(), h)))
            .collect()
    }
}

// ============================================================================
// Rebuild
// ============================================================================

/// Recomputes bean metadata from every registered provider.
pub struct MetadataRebuild {
    registry: Arc<MetadataRegistry>,
    providers: Vec<Arc<dyn MetadataProvider>>,
}

impl MetadataRebuild {
    pub fn new(registry: Arc<MetadataRegistry>, providers: Vec<Arc<dyn MetadataProvider>>) -> Self {
        MetadataRebuild { registry, providers }
    }

    /// Run every provider for `artifact`; failing or panicking providers
    /// contribute nothing.
    fn collect(&self, unit: &UnitId, artifact: &ArtifactPath) -> Vec<BeanMetadataHolder> {
        let now = Utc::now();
        let mut merged: IndexMap<String, BeanMetadataHolder> = IndexMap::new();
        for provider in &self.providers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| provider.provide(unit, artifact)));
            let contributions = match outcome {
                Ok(Ok(contributions)) => contributions,
                Ok(Err(e)) => {
                    warn!(unit = %unit, artifact = %artifact, provider = provider.name(), error = %e, "metadata provider failed");
                    continue;
                }
                Err(_) => {
                    error!(unit = %unit, artifact = %artifact, provider = provider.name(), "metadata provider panicked");
                    continue;
                }
            };
            for contribution in contributions {
                merged
                    .entry(contribution.bean_id.clone())
                    .or_insert_with(|| {
                        BeanMetadataHolder::new(contribution.bean_id.clone(), contribution.bean_file.clone(), now)
                    })
                    .absorb(contribution);
            }
        }
        merged.into_values().collect()
    }
}

impl RebuildTask for MetadataRebuild {
    fn name(&self) -> &str {
        "metadata"
    }

    fn rebuild_unit(&self, unit: &UnitId, artifacts: &BTreeSet<ArtifactPath>, cancel: &CancelToken) {
        let seen = self.registry.get(unit);

        let mut cleared = Vec::with_capacity(artifacts.len());
        let mut fresh = Vec::new();
        for artifact in artifacts {
            if cancel.is_cancelled() {
                debug!(unit = %unit, artifact = %artifact, "metadata rebuild cancelled");
                break;
            }
            fresh.extend(self.collect(unit, artifact));
            cleared.push(artifact.clone());
        }

        if cleared.is_empty() {
            return;
        }
        let Some(index) = self.registry.commit_target(unit, seen.as_ref()) else {
            debug!(unit = %unit, "unit removed during metadata rebuild, discarding");
            return;
        };
        let stored = index.replace_artifacts(&cleared, fresh);
        debug!(unit = %unit, artifacts = cleared.len(), beans = stored, "metadata rebuilt");
        self.registry.notify_changed();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AnalyzerError;
    use crate::persistence::MemoryStateStore;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn holder(bean: &str, file: &str) -> BeanMetadataHolder {
        let mut h = BeanMetadataHolder::new(bean, file, Utc::now());
        h.type_facts.insert(TypeFact::new("org.springframework.stereotype.Service"));
        h
    }

    fn index() -> MetadataIndex {
        MetadataIndex::new(UnitId::new("petclinic"))
    }

    mod index_tests {
        use super::*;

        #[test]
        fn set_holder_replaces_and_empty_clears() {
            let idx = index();
            idx.set_holder(holder("orderService", "beans.xml"));
            let mut replacement = BeanMetadataHolder::new("orderService", "beans.xml", Utc::now());
            replacement.properties.insert(BeanProperty::new("repo", "orderRepository"));
            idx.set_holder(replacement);

            let stored = idx.holder("orderService").unwrap();
            assert!(stored.type_facts.is_empty());
            assert_eq!(stored.properties.len(), 1);

            idx.set_holder(BeanMetadataHolder::new("orderService", "beans.xml", Utc::now()));
            assert!(idx.holder("orderService").is_none());
        }

        #[test]
        fn invalidate_matches_config_and_class_files() {
            let idx = index();
            let mut with_class = holder("a", "beans.xml");
            with_class.class_file = Some(ArtifactPath::from("src/A.java"));
            idx.set_holder(with_class);
            idx.set_holder(holder("b", "other.xml"));

            assert_eq!(idx.invalidate(&ArtifactPath::from("src/A.java")), 1);
            assert_eq!(idx.len(), 1);
            assert_eq!(idx.invalidate(&ArtifactPath::from("other.xml")), 1);
            assert!(idx.is_empty());
        }

        #[test]
        fn entries_older_than_uses_last_modified() {
            let idx = index();
            let mut old = holder("old", "beans.xml");
            old.last_modified = Utc::now() - Duration::hours(2);
            idx.set_holder(old);
            idx.set_holder(holder("new", "beans.xml"));

            let stale = idx.entries_older_than(Utc::now() - Duration::hours(1));
            assert_eq!(stale, vec!["old".to_string()]);
        }

        #[test]
        fn snapshot_restore_round_trip() {
            let idx = index();
            idx.set_holder(holder("a", "beans.xml"));
            let restored = MetadataIndex::restore(idx.unit().clone(), idx.snapshot());
            assert_eq!(restored.holders(), idx.holders());
        }
    }

    mod rebuild_tests {
        use super::*;

        struct Stereotypes;

        impl MetadataProvider for Stereotypes {
            fn name(&self) -> &str {
                "stereotypes"
            }

            fn provide(&self, _unit: &UnitId, artifact: &ArtifactPath) -> Result<Vec<BeanContribution>, AnalyzerError> {
                Ok(vec![BeanContribution::new("orderService", "beans.xml")
                    .with_class_file(artifact.clone())
                    .with_type_fact(TypeFact::new("org.springframework.stereotype.Service"))])
            }
        }

        struct Injection;

        impl MetadataProvider for Injection {
            fn name(&self) -> &str {
                "injection"
            }

            fn provide(&self, _unit: &UnitId, _artifact: &ArtifactPath) -> Result<Vec<BeanContribution>, AnalyzerError> {
                Ok(vec![
                    BeanContribution::new("orderService", "beans.xml")
                        .with_property(BeanProperty::new("repository", "orderRepository")),
                    // Contributes nothing: must not be stored.
                    BeanContribution::new("emptyBean", "beans.xml"),
                ])
            }
        }

        struct Broken;

        impl MetadataProvider for Broken {
            fn name(&self) -> &str {
                "broken"
            }

            fn provide(&self, _unit: &UnitId, _artifact: &ArtifactPath) -> Result<Vec<BeanContribution>, AnalyzerError> {
                panic!("provider bug")
            }
        }

        fn registry() -> Arc<MetadataRegistry> {
            Arc::new(Registry::new("metadata", Box::new(MemoryStateStore::new())))
        }

        #[test]
        fn merges_providers_and_isolates_failures() {
            let reg = registry();
            let notified = Arc::new(AtomicUsize::new(0));
            let n = Arc::clone(&notified);
            reg.add_listener(Arc::new(move || {
                n.fetch_add(1, Ordering::SeqCst);
            }));

            let providers: Vec<Arc<dyn MetadataProvider>> =
                vec![Arc::new(Broken), Arc::new(Stereotypes), Arc::new(Injection)];
            let task = MetadataRebuild::new(Arc::clone(&reg), providers);
            let unit = UnitId::new("petclinic");
            let artifacts: BTreeSet<_> = [ArtifactPath::from("src/OrderService.java")].into();
            task.rebuild_unit(&unit, &artifacts, &CancelToken::new());

            let found = reg.metadata_for_bean("orderService");
            assert_eq!(found.len(), 1);
            let (_, holder) = &found[0];
            assert_eq!(holder.type_facts.len(), 1);
            assert_eq!(holder.properties.len(), 1);
            assert_eq!(holder.class_file, Some(ArtifactPath::from("src/OrderService.java")));
            assert!(reg.metadata_for_bean("emptyBean").is_empty());
            // One for unit creation, one for the rebuild.
            assert_eq!(notified.load(Ordering::SeqCst), 2);
        }

        #[test]
        fn removed_unit_discards_results() {
            let reg = registry();
            let unit = UnitId::new("petclinic");

            struct Remover(Arc<MetadataRegistry>);

            impl MetadataProvider for Remover {
                fn name(&self) -> &str {
                    "remover"
                }

                fn provide(&self, unit: &UnitId, artifact: &ArtifactPath) -> Result<Vec<BeanContribution>, AnalyzerError> {
                    self.0.retire(unit);
                    Stereotypes.provide(unit, artifact)
                }
            }

            let task = MetadataRebuild::new(Arc::clone(&reg), vec![Arc::new(Remover(Arc::clone(&reg)))]);
            let artifacts: BTreeSet<_> = [ArtifactPath::from("src/OrderService.java")].into();
            task.rebuild_unit(&unit, &artifacts, &CancelToken::new());

            assert!(!reg.contains(&unit));
            assert!(reg.metadata_for_bean("orderService").is_empty());
        }

        /// Reports `serviceBean` only while reading the config file, with
        /// the class file as its second source.
        struct ConfigDeclared;

        impl MetadataProvider for ConfigDeclared {
            fn name(&self) -> &str {
                "config"
            }

            fn provide(&self, _unit: &UnitId, artifact: &ArtifactPath) -> Result<Vec<BeanContribution>, AnalyzerError> {
                if artifact.as_str() != "beans.xml" {
                    return Ok(Vec::new());
                }
                Ok(vec![BeanContribution::new("serviceBean", "beans.xml")
                    .with_class_file(ArtifactPath::from("src/Service.java"))
                    .with_type_fact(TypeFact::new("org.springframework.stereotype.Service"))])
            }
        }

        #[test]
        fn multi_artifact_job_keeps_holders_touching_both_files() {
            let reg = registry();
            let task = MetadataRebuild::new(Arc::clone(&reg), vec![Arc::new(ConfigDeclared)]);
            let unit = UnitId::new("petclinic");

            let config_only: BTreeSet<_> = [ArtifactPath::from("beans.xml")].into();
            task.rebuild_unit(&unit, &config_only, &CancelToken::new());
            assert_eq!(reg.metadata_for_bean("serviceBean").len(), 1);

            let both: BTreeSet<_> = [ArtifactPath::from("beans.xml"), ArtifactPath::from("src/Service.java")].into();
            task.rebuild_unit(&unit, &both, &CancelToken::new());
            assert_eq!(reg.metadata_for_bean("serviceBean").len(), 1);

            // The class file alone still clears what it fed.
            let class_only: BTreeSet<_> = [ArtifactPath::from("src/Service.java")].into();
            task.rebuild_unit(&unit, &class_only, &CancelToken::new());
            assert!(reg.metadata_for_bean("serviceBean").is_empty());
        }

        #[test]
        fn cancelled_before_start_touches_nothing() {
            let reg = registry();
            let notified = Arc::new(AtomicUsize::new(0));
            let n = Arc::clone(&notified);
            reg.add_listener(Arc::new(move || {
                n.fetch_add(1, Ordering::SeqCst);
            }));

            let task = MetadataRebuild::new(Arc::clone(&reg), vec![Arc::new(Stereotypes)]);
            let cancel = CancelToken::new();
            cancel.cancel();
            let unit = UnitId::new("petclinic");
            let artifacts: BTreeSet<_> = [ArtifactPath::from("src/OrderService.java")].into();
            task.rebuild_unit(&unit, &artifacts, &cancel);

            assert!(!reg.contains(&unit));
            assert_eq!(notified.load(Ordering::SeqCst), 0);
        }
    }
}
