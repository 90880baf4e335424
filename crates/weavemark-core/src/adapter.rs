//! Analyzer seams.
//!
//! The weaving engine and the annotation reader live outside this crate.
//! Rebuild tasks drive them through the traits defined here and treat every
//! call as possibly slow and possibly failing. No index lock is held while an
//! analyzer runs.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::definition::Definition;
use crate::metadata::{BeanProperty, MethodFact, TypeFact};
use crate::reference::{BeanResolver, Reference};
use crate::types::{ArtifactPath, BeanRef, UnitId};

// ============================================================================
// Errors
// ============================================================================

/// Failure reported by an analyzer or metadata provider.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    /// The artifact could not be analyzed (malformed source, bad config).
    #[error("analysis of {artifact} failed: {message}")]
    Failed {
        artifact: ArtifactPath,
        message: String,
    },

    /// A type named by the artifact could not be resolved.
    #[error("unresolved type '{type_name}' in {artifact}")]
    UnresolvedType {
        artifact: ArtifactPath,
        type_name: String,
    },

    /// Reading compiled facts failed.
    #[error("I/O error analyzing {artifact}: {source}")]
    Io {
        artifact: ArtifactPath,
        #[source]
        source: io::Error,
    },
}

impl AnalyzerError {
    pub fn failed(artifact: &ArtifactPath, message: impl Into<String>) -> Self {
        AnalyzerError::Failed {
            artifact: artifact.clone(),
            message: message.into(),
        }
    }

    pub fn artifact(&self) -> &ArtifactPath {
        match self {
            AnalyzerError::Failed { artifact, .. }
            | AnalyzerError::UnresolvedType { artifact, .. }
            | AnalyzerError::Io { artifact, .. } => artifact,
        }
    }
}

// ============================================================================
// Aspect Analysis
// ============================================================================

/// Definitions and references produced for one artifact.
#[derive(Debug, Clone, Default)]
pub struct AnalysisResult {
    pub definitions: Vec<Arc<Definition>>,
    pub references: Vec<Reference>,
}

impl AnalysisResult {
    pub fn new() -> Self {
        AnalysisResult::default()
    }

    /// Add a definition and return the shared handle references should own.
    pub fn define(&mut self, definition: Definition) -> Arc<Definition> {
        let definition = Arc::new(definition);
        self.definitions.push(Arc::clone(&definition));
        definition
    }

    pub fn push(&mut self, reference: Reference) {
        self.references.push(reference);
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty() && self.references.is_empty()
    }
}

/// The external weaving analyzer.
pub trait AspectAnalyzer: Send + Sync {
    /// Compute the definitions declared in, and references affecting,
    /// `artifact` of `unit`.
    fn analyze(&self, unit: &UnitId, artifact: &ArtifactPath) -> Result<AnalysisResult, AnalyzerError>;

    /// Resolve a bean identifier (name or alias) within `unit`.
    fn resolve_bean(&self, _unit: &UnitId, _bean_id: &str) -> Option<BeanRef> {
        None
    }
}

/// [`BeanResolver`] view of an analyzer bound to one unit.
///
/// Lookups are memoized, misses included, for the lifetime of the view
/// (one unit rebuild).
pub struct UnitBeans<'a> {
    analyzer: &'a dyn AspectAnalyzer,
    unit: &'a UnitId,
    resolved: Mutex<HashMap<String, Option<BeanRef>>>,
}

impl<'a> UnitBeans<'a> {
    pub fn new(analyzer: &'a dyn AspectAnalyzer, unit: &'a UnitId) -> Self {
        UnitBeans {
            analyzer,
            unit,
            resolved: Mutex::new(HashMap::new()),
        }
    }
}

impl BeanResolver for UnitBeans<'_> {
    fn resolve(&self, bean_id: &str) -> Option<BeanRef> {
        if let Some(cached) = self.resolved.lock().get(bean_id) {
            return cached.clone();
        }
        let bean = self.analyzer.resolve_bean(self.unit, bean_id);
        self.resolved.lock().insert(bean_id.to_string(), bean.clone());
        bean
    }
}

// ============================================================================
// Metadata Providers
// ============================================================================

/// Facts one provider found for one bean.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeanContribution {
    pub bean_id: String,
    /// Configuration file declaring the bean.
    pub bean_file: ArtifactPath,
    /// Source file of the bean class, when known.
    pub class_file: Option<ArtifactPath>,
    pub type_facts: Vec<TypeFact>,
    pub method_facts: Vec<MethodFact>,
    pub properties: Vec<BeanProperty>,
}

impl BeanContribution {
    pub fn new(bean_id: impl Into<String>, bean_file: impl Into<ArtifactPath>) -> Self {
        BeanContribution {
            bean_id: bean_id.into(),
            bean_file: bean_file.into(),
            class_file: None,
            type_facts: Vec::new(),
            method_facts: Vec::new(),
            properties: Vec::new(),
        }
    }

    pub fn with_class_file(mut self, file: impl Into<ArtifactPath>) -> Self {
        self.class_file = Some(file.into());
        self
    }

    pub fn with_type_fact(mut self, fact: TypeFact) -> Self {
        self.type_facts.push(fact);
        self
    }

    pub fn with_method_fact(mut self, fact: MethodFact) -> Self {
        self.method_facts.push(fact);
        self
    }

    pub fn with_property(mut self, property: BeanProperty) -> Self {
        self.properties.push(property);
        self
    }
}

/// An annotation metadata reader.
pub trait MetadataProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Facts for every bean affected by `artifact`.
    fn provide(&self, unit: &UnitId, artifact: &ArtifactPath) -> Result<Vec<BeanContribution>, AnalyzerError>;
}

// ============================================================================
// Tests
// ============================================================================
