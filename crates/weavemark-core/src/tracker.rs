//! The weaving tracker: registries, schedulers, and the workspace subscription
//! wired together behind an explicit start/shutdown lifecycle.
//!
//! ```text
//! ChangeSource --event--> Dispatch --AffectedSet--> Scheduler --> RebuildTask
//!                                                                     |
//!                             views <--changed()-- Registry <--writes-+
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::adapter::{AspectAnalyzer, MetadataProvider};
use crate::config::TrackerConfig;
use crate::error::WeaveResult;
use crate::index::ReferenceSnapshot;
use crate::metadata::{BeanMetadataHolder, MetadataRebuild, MetadataRegistry};
use crate::persistence::{FileStateStore, StateStore};
use crate::rebuild::ReferenceRebuild;
use crate::registry::{ReferenceRegistry, Registry};
use crate::scheduler::{AffectedSet, JobHandle, Scheduler};
use crate::workspace::{ChangeEvent, ChangeSink, ChangeSource, SubscriptionId};

/// Jobs submitted for one change event.
#[derive(Debug, Clone)]
pub struct SubmittedJobs {
    pub references: JobHandle,
    pub metadata: JobHandle,
}

struct Dispatch {
    references: Arc<ReferenceRegistry>,
    metadata: Arc<MetadataRegistry>,
    reference_jobs: Scheduler,
    metadata_jobs: Scheduler,
}

impl Dispatch {
    fn handle(&self, event: &ChangeEvent) -> Option<SubmittedJobs> {
        match event {
            ChangeEvent::ArtifactsChanged { unit, artifacts } => {
                if artifacts.is_empty() {
                    return None;
                }
                self.references.revive(unit);
                self.metadata.revive(unit);
                let affected = AffectedSet::for_unit(unit.clone(), artifacts.iter().cloned());
                debug!(unit = %unit, artifacts = artifacts.len(), "scheduling rebuild");
                Some(SubmittedJobs {
                    references: self.reference_jobs.submit(affected.clone()),
                    metadata: self.metadata_jobs.submit(affected),
                })
            }
            ChangeEvent::UnitRemoved { unit } => {
                // Retire before cancelling so a job already past its
                // cancellation check still cannot recreate the unit.
                self.references.retire(unit);
                self.metadata.retire(unit);
                let cancelled = self.reference_jobs.cancel_unit(unit) + self.metadata_jobs.cancel_unit(unit);
                debug!(unit = %unit, cancelled, "unit removed");
                None
            }
        }
    }
}

impl ChangeSink for Dispatch {
    fn on_change(&self, event: &ChangeEvent) {
        self.handle(event);
    }
}

/// Owned advice-reference and bean-metadata tracking service.
pub struct WeavingTracker {
    config: TrackerConfig,
    dispatch: Arc<Dispatch>,
    source: Arc<dyn ChangeSource>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl WeavingTracker {
    pub fn builder(config: TrackerConfig, analyzer: Arc<dyn AspectAnalyzer>) -> TrackerBuilder {
        TrackerBuilder {
            config,
            analyzer,
            providers: Vec::new(),
            source: None,
            reference_store: None,
            metadata_store: None,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn references(&self) -> &Arc<ReferenceRegistry> {
        &self.dispatch.references
    }

    pub fn metadata(&self) -> &Arc<MetadataRegistry> {
        &self.dispatch.metadata
    }

    pub fn reference_scheduler(&self) -> &Scheduler {
        &self.dispatch.reference_jobs
    }

    pub fn metadata_scheduler(&self) -> &Scheduler {
        &self.dispatch.metadata_jobs
    }

    pub fn is_started(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Load persisted state and subscribe to the change source. Idempotent.
    pub fn start(&self) {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            return;
        }
        self.dispatch.references.start();
        self.dispatch.metadata.start();
        let sink: Arc<dyn ChangeSink> = self.dispatch.clone();
        *subscription = Some(self.source.subscribe(sink));
        info!(state_dir = %self.config.state_dir.value.display(), "weaving tracker started");
    }

    /// Unsubscribe, stop the schedulers, persist, and clear. Idempotent.
    pub fn shutdown(&self) {
        let Some(id) = self.subscription.lock().take() else {
            return;
        };
        self.source.unsubscribe(id);
        self.dispatch.reference_jobs.shutdown();
        self.dispatch.metadata_jobs.shutdown();
        self.dispatch.references.shutdown();
        self.dispatch.metadata.shutdown();
        info!("weaving tracker shut down");
    }

    /// Handle an event directly (the subscription routes here too).
    pub fn handle(&self, event: &ChangeEvent) -> Option<SubmittedJobs> {
        self.dispatch.handle(event)
    }

    /// Block until both schedulers are idle.
    pub fn wait_idle(&self) {
        self.dispatch.reference_jobs.wait_idle();
        self.dispatch.metadata_jobs.wait_idle();
    }
}

/// Builder for [`WeavingTracker`].
pub struct TrackerBuilder {
    config: TrackerConfig,
    analyzer: Arc<dyn AspectAnalyzer>,
    providers: Vec<Arc<dyn MetadataProvider>>,
    source: Option<Arc<dyn ChangeSource>>,
    reference_store: Option<Box<dyn StateStore<ReferenceSnapshot>>>,
    metadata_store: Option<Box<dyn StateStore<Vec<BeanMetadataHolder>>>>,
}

impl TrackerBuilder {
    pub fn provider(mut self, provider: Arc<dyn MetadataProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn change_source(mut self, source: Arc<dyn ChangeSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Replace the file-backed reference store.
    pub fn reference_store(mut self, store: Box<dyn StateStore<ReferenceSnapshot>>) -> Self {
        self.reference_store = Some(store);
        self
    }

    /// Replace the file-backed metadata store.
    pub fn metadata_store(mut self, store: Box<dyn StateStore<Vec<BeanMetadataHolder>>>) -> Self {
        self.metadata_store = Some(store);
        self
    }

    pub fn build(self) -> WeaveResult<WeavingTracker> {
        let persist = self.config.persist.value;
        let reference_store = self.reference_store.unwrap_or_else(|| {
            Box::new(FileStateStore::new(self.config.references_path()).with_persist(persist))
        });
        let metadata_store = self.metadata_store.unwrap_or_else(|| {
            Box::new(FileStateStore::new(self.config.metadata_path()).with_persist(persist))
        });

        let references: Arc<ReferenceRegistry> = Arc::new(Registry::new("references", reference_store));
        let metadata: Arc<MetadataRegistry> = Arc::new(Registry::new("metadata", metadata_store));

        let workers = self.config.workers.value;
        let reference_jobs = Scheduler::new(
            Arc::new(ReferenceRebuild::new(Arc::clone(&references), self.analyzer)),
            workers,
        )?;
        let metadata_jobs = Scheduler::new(
            Arc::new(MetadataRebuild::new(Arc::clone(&metadata), self.providers)),
            workers,
        )?;

        let source = self
            .source
            .unwrap_or_else(|| Arc::new(crate::workspace::ChangeHub::new()));

        Ok(WeavingTracker {
            config: self.config,
            dispatch: Arc::new(Dispatch {
                references,
                metadata,
                reference_jobs,
                metadata_jobs,
            }),
            source,
            subscription: Mutex::new(None),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
