//! Workspace change events.
//!
//! The host workspace reports changed artifacts and removed units through a
//! [`ChangeSource`]. [`ChangeHub`] is an in-process source the host publishes
//! into; it delivers each event synchronously to every subscriber in
//! subscription order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::types::{ArtifactPath, UnitId};

/// A change reported by the host workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// Artifacts of `unit` were added, modified, or deleted.
    ArtifactsChanged {
        unit: UnitId,
        artifacts: Vec<ArtifactPath>,
    },
    /// The unit was closed or deleted.
    UnitRemoved { unit: UnitId },
}

impl ChangeEvent {
    pub fn artifacts_changed<I, A>(unit: impl Into<UnitId>, artifacts: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<ArtifactPath>,
    {
        ChangeEvent::ArtifactsChanged {
            unit: unit.into(),
            artifacts: artifacts.into_iter().map(Into::into).collect(),
        }
    }

    pub fn unit(&self) -> &UnitId {
        match self {
            ChangeEvent::ArtifactsChanged { unit, .. } | ChangeEvent::UnitRemoved { unit } => unit,
        }
    }
}

/// Receives workspace change events.
pub trait ChangeSink: Send + Sync {
    fn on_change(&self, event: &ChangeEvent);
}

/// Handle returned by [`ChangeSource::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Something that emits workspace change events.
pub trait ChangeSource: Send + Sync {
    fn subscribe(&self, sink: Arc<dyn ChangeSink>) -> SubscriptionId;

    /// Returns `false` if `id` was not subscribed.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

/// In-process change source.
#[derive(Default)]
pub struct ChangeHub {
    sinks: RwLock<Vec<(SubscriptionId, Arc<dyn ChangeSink>)>>,
    next_id: AtomicU64,
}

impl ChangeHub {
    pub fn new() -> Self {
        ChangeHub::default()
    }

    /// Deliver `event` to every subscriber.
    pub fn publish(&self, event: ChangeEvent) {
        let sinks: Vec<_> = self.sinks.read().iter().map(|(_, s)| Arc::clone(s)).collect();
        trace!(unit = %event.unit(), subscribers = sinks.len(), "publishing change");
        for sink in sinks {
            sink.on_change(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.read().len()
    }
}

impl ChangeSource for ChangeHub {
    fn subscribe(&self, sink: Arc<dyn ChangeSink>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sinks.write().push((id, sink));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut sinks = self.sinks.write();
        let before = sinks.len();
        sinks.retain(|(existing, _)| *existing != id);
        sinks.len() != before
    }
}

// ============================================================================
// Tests
// ============================================================================
