//! Reference entity: one edge of the advice cross-reference graph.
//!
//! Two references are the same edge when they advise the same target from the
//! same source through a definition starting on the same line, and either
//! name the same bean or resolve to the same bean through different aliases.
//! The resolved bean is looked up lazily through a [`BeanResolver`] and cached
//! on the reference.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use crate::definition::{AdviceKind, Definition};
use crate::types::{ArtifactPath, BeanRef, Member};

/// Resolves a bean identifier (name or alias) to its canonical bean.
pub trait BeanResolver: Send + Sync {
    fn resolve(&self, bean_id: &str) -> Option<BeanRef>;
}

/// One advice-to-target edge.
#[derive(Debug, Clone)]
pub struct Reference {
    /// Advice kind of the owning definition.
    pub kind: AdviceKind,
    /// The advice method (or introduction field); `None` for most introductions.
    pub source: Option<Member>,
    /// The woven join point or introduced type.
    pub target: Member,
    /// Owning definition.
    pub definition: Arc<Definition>,
    /// File declaring the advised target.
    pub file: ArtifactPath,
    /// Identifier used to reach the target bean (name or alias).
    pub target_bean_id: String,
    /// File declaring the target bean.
    pub target_bean_file: ArtifactPath,
    /// Start line of the target bean declaration.
    pub target_bean_start_line: u32,
    bean: OnceLock<Option<BeanRef>>,
}

impl Reference {
    /// Create a reference with no source member and no target bean.
    pub fn new(definition: Arc<Definition>, target: Member, file: impl Into<ArtifactPath>) -> Self {
        let file = file.into();
        Reference {
            kind: definition.kind(),
            source: None,
            target,
            definition,
            target_bean_file: file.clone(),
            file,
            target_bean_id: String::new(),
            target_bean_start_line: 0,
            bean: OnceLock::new(),
        }
    }

    /// Create an introduction reference.
    ///
    /// When the introduction was declared on a field, that field becomes the
    /// source member.
    pub fn introduction(
        definition: Arc<Definition>,
        target: Member,
        file: impl Into<ArtifactPath>,
    ) -> Self {
        let source = definition
            .introduction()
            .and_then(|intro| intro.defining_field.as_deref())
            .map(|field| {
                Member::field(
                    definition.aspect_class.clone(),
                    field,
                    definition.file.clone(),
                )
            });
        let mut reference = Reference::new(definition, target, file);
        reference.source = source;
        reference
    }

    pub fn with_source(mut self, source: Member) -> Self {
        self.source = Some(source);
        self
    }

    /// Name the bean the target was reached through.
    pub fn with_target_bean(
        mut self,
        bean_id: impl Into<String>,
        file: impl Into<ArtifactPath>,
        start_line: u32,
    ) -> Self {
        self.target_bean_id = bean_id.into();
        self.target_bean_file = file.into();
        self.target_bean_start_line = start_line;
        self
    }

    /// Attach an already resolved bean (used when restoring persisted state).
    pub fn with_resolved_bean(self, bean: Option<BeanRef>) -> Self {
        let _ = self.bean.set(bean);
        self
    }

    /// Resolve the target bean once and cache the outcome, including a miss.
    pub fn resolve_bean(&self, resolver: &dyn BeanResolver) -> Option<&BeanRef> {
        self.bean
            .get_or_init(|| resolver.resolve(&self.target_bean_id))
            .as_ref()
    }

    /// The cached bean, if resolution already happened and succeeded.
    pub fn resolved_bean(&self) -> Option<&BeanRef> {
        self.bean.get().and_then(Option::as_ref)
    }

    pub fn is_bean_resolved(&self) -> bool {
        self.bean.get().is_some()
    }

    /// The reference touches `artifact` through its own file or its
    /// definition's file.
    pub fn touches(&self, artifact: &ArtifactPath) -> bool {
        self.file == *artifact || self.definition.file == *artifact
    }

    /// Wider match used by workspace queries: also the resolved bean's file
    /// and the files declaring the source and target members.
    pub fn touches_any(&self, artifact: &ArtifactPath) -> bool {
        self.touches(artifact)
            || self.resolved_bean().is_some_and(|b| b.file == *artifact)
            || self.source.as_ref().is_some_and(|s| s.file == *artifact)
            || self.target.file == *artifact
    }

    pub fn to_record(&self) -> ReferenceRecord {
        ReferenceRecord {
            kind: self.kind,
            source: self.source.clone(),
            target: self.target.clone(),
            file: self.file.clone(),
            target_bean_id: self.target_bean_id.clone(),
            target_bean_file: self.target_bean_file.clone(),
            target_bean_start_line: self.target_bean_start_line,
            bean: self.resolved_bean().cloned(),
        }
    }

    pub fn from_record(record: ReferenceRecord, definition: Arc<Definition>) -> Self {
        Reference {
            kind: record.kind,
            source: record.source,
            target: record.target,
            definition,
            file: record.file,
            target_bean_id: record.target_bean_id,
            target_bean_file: record.target_bean_file,
            target_bean_start_line: record.target_bean_start_line,
            bean: OnceLock::new(),
        }
        .with_resolved_bean_if(record.bean)
    }

    fn with_resolved_bean_if(self, bean: Option<BeanRef>) -> Self {
        match bean {
            Some(bean) => self.with_resolved_bean(Some(bean)),
            None => self,
        }
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        if self.target != other.target
            || self.source != other.source
            || self.definition.start_line != other.definition.start_line
        {
            return false;
        }
        if self.target_bean_id == other.target_bean_id {
            return true;
        }
        match (self.resolved_bean(), other.resolved_bean()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Reference {}

// Only fields that take part in every equality branch are hashed; the bean
// identifier may differ between equal references.
impl Hash for Reference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
        self.target.hash(state);
        self.definition.start_line.hash(state);
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{} -[{}]-> {}", source, self.kind, self.target)?,
            None => write!(f, "{} -[{}]-> {}", self.definition.aspect_class, self.kind, self.target)?,
        }
        if !self.target_bean_id.is_empty() {
            write!(f, " via bean '{}'", self.target_bean_id)?;
        }
        Ok(())
    }
}

/// Serializable form of a [`Reference`] without its definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceRecord {
    pub kind: AdviceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Member>,
    pub target: Member,
    pub file: ArtifactPath,
    #[serde(default)]
    pub target_bean_id: String,
    pub target_bean_file: ArtifactPath,
    #[serde(default)]
    pub target_bean_start_line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bean: Option<BeanRef>,
}

// ============================================================================
// Tests
// ============================================================================
