//! Definition model: one aspect/advice declaration discovered by an analyzer.
//!
//! A [`Definition`] is a value object. The only interior state it carries is
//! the memoized [`TypeMatcher`] of a declare-parents introduction, held in a
//! [`MatcherCell`] that takes no part in equality, hashing, or serialization.
//!
//! Definitions come from three discovery paths ([`DefinitionOrigin`]); two
//! definitions found through different paths compare equal when every
//! declared field matches, which lets the index collapse duplicates.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ArtifactPath;

/// Aspect name used when the declaration carries none.
pub const ANONYMOUS_ASPECT: &str = "anonymous aspect";

// ============================================================================
// Advice Kinds
// ============================================================================

/// Closed set of advice kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdviceKind {
    Before,
    After,
    AfterReturning,
    AfterThrowing,
    Around,
    /// Introduction: adds an interface implementation to matching classes.
    DeclareParents,
}

impl AdviceKind {
    /// Label used in display and JSON output.
    pub fn label(&self) -> &'static str {
        match self {
            AdviceKind::Before => "before",
            AdviceKind::After => "after",
            AdviceKind::AfterReturning => "after-returning",
            AdviceKind::AfterThrowing => "after-throwing",
            AdviceKind::Around => "around",
            AdviceKind::DeclareParents => "declare-parents",
        }
    }
}

impl fmt::Display for AdviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How a definition was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionOrigin {
    /// `<aop:config>` style XML declaration.
    Xml,
    /// `@Aspect` annotated class.
    Annotation,
    /// Programmatic `Advisor` bean.
    Advisor,
}

/// Kind-specific payload of a definition.
///
/// The variant is the advice kind; only the variants that use a field carry it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Advice {
    Before,
    After,
    AfterReturning {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        returning: Option<String>,
    },
    AfterThrowing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        throwing: Option<String>,
    },
    Around,
    DeclareParents(Introduction),
}

impl Advice {
    /// The advice kind tag.
    pub fn kind(&self) -> AdviceKind {
        match self {
            Advice::Before => AdviceKind::Before,
            Advice::After => AdviceKind::After,
            Advice::AfterReturning { .. } => AdviceKind::AfterReturning,
            Advice::AfterThrowing { .. } => AdviceKind::AfterThrowing,
            Advice::Around => AdviceKind::Around,
            Advice::DeclareParents(_) => AdviceKind::DeclareParents,
        }
    }
}

// ============================================================================
// Definition
// ============================================================================

/// One aspect/advice declaration.
///
/// Equality and hashing ignore `origin` and `proxy_target_class`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Definition {
    /// Discovery path.
    pub origin: DefinitionOrigin,
    /// Qualified name of the declaring aspect class.
    pub aspect_class: String,
    /// Human-readable aspect name (never blank).
    aspect_name: String,
    /// Advice method name (empty for introductions).
    pub advice_method: String,
    /// Advice method parameter type names, in order.
    #[serde(default)]
    pub parameter_types: Vec<String>,
    /// Advice argument binding names.
    #[serde(default)]
    pub arg_names: Vec<String>,
    /// Pointcut expression text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointcut: Option<String>,
    /// Whether proxies are class-based.
    #[serde(default)]
    pub proxy_target_class: bool,
    /// File declaring this definition.
    pub file: ArtifactPath,
    /// 1-indexed start line of the declaration (0 when unknown).
    pub start_line: u32,
    /// 1-indexed end line of the declaration (0 when unknown).
    pub end_line: u32,
    /// Kind-specific payload.
    pub advice: Advice,
}

impl Definition {
    /// Create a definition with an anonymous aspect name and no lines.
    pub fn new(
        origin: DefinitionOrigin,
        aspect_class: impl Into<String>,
        advice_method: impl Into<String>,
        file: impl Into<ArtifactPath>,
        advice: Advice,
    ) -> Self {
        Definition {
            origin,
            aspect_class: aspect_class.into(),
            aspect_name: ANONYMOUS_ASPECT.to_string(),
            advice_method: advice_method.into(),
            parameter_types: Vec::new(),
            arg_names: Vec::new(),
            pointcut: None,
            proxy_target_class: false,
            file: file.into(),
            start_line: 0,
            end_line: 0,
            advice,
        }
    }

    /// Set the aspect name; blank names fall back to [`ANONYMOUS_ASPECT`].
    pub fn with_aspect_name(mut self, name: impl Into<String>) -> Self {
        self.set_aspect_name(name);
        self
    }

    /// Set the declaration lines.
    pub fn with_lines(mut self, start_line: u32, end_line: u32) -> Self {
        self.start_line = start_line;
        self.end_line = end_line;
        self
    }

    /// Set the pointcut expression.
    pub fn with_pointcut(mut self, pointcut: impl Into<String>) -> Self {
        self.pointcut = Some(pointcut.into());
        self
    }

    /// Set the advice method parameter types.
    pub fn with_parameter_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameter_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Set the advice argument names.
    pub fn with_arg_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arg_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Mark proxies as class-based.
    pub fn with_proxy_target_class(mut self, proxy_target_class: bool) -> Self {
        self.proxy_target_class = proxy_target_class;
        self
    }

    pub fn set_aspect_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.aspect_name = if name.trim().is_empty() {
            ANONYMOUS_ASPECT.to_string()
        } else {
            name
        };
    }

    pub fn aspect_name(&self) -> &str {
        &self.aspect_name
    }

    pub fn kind(&self) -> AdviceKind {
        self.advice.kind()
    }

    /// Returning binding name (after-returning advice only).
    pub fn returning(&self) -> Option<&str> {
        match &self.advice {
            Advice::AfterReturning { returning } => returning.as_deref(),
            _ => None,
        }
    }

    /// Throwing binding name (after-throwing advice only).
    pub fn throwing(&self) -> Option<&str> {
        match &self.advice {
            Advice::AfterThrowing { throwing } => throwing.as_deref(),
            _ => None,
        }
    }

    /// Introduction payload (declare-parents only).
    pub fn introduction(&self) -> Option<&Introduction> {
        match &self.advice {
            Advice::DeclareParents(intro) => Some(intro),
            _ => None,
        }
    }

    pub fn introduction_mut(&mut self) -> Option<&mut Introduction> {
        match &mut self.advice {
            Advice::DeclareParents(intro) => Some(intro),
            _ => None,
        }
    }
}

impl PartialEq for Definition {
    fn eq(&self, other: &Self) -> bool {
        self.aspect_class == other.aspect_class
            && self.aspect_name == other.aspect_name
            && self.advice_method == other.advice_method
            && self.parameter_types == other.parameter_types
            && self.arg_names == other.arg_names
            && self.pointcut == other.pointcut
            && self.file == other.file
            && self.start_line == other.start_line
            && self.end_line == other.end_line
            && self.advice == other.advice
    }
}

impl Eq for Definition {}

impl Hash for Definition {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.aspect_class.hash(state);
        self.aspect_name.hash(state);
        self.advice_method.hash(state);
        self.parameter_types.hash(state);
        self.arg_names.hash(state);
        self.pointcut.hash(state);
        self.file.hash(state);
        self.start_line.hash(state);
        self.end_line.hash(state);
        self.advice.hash(state);
    }
}

impl fmt::Display for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Aspect definition [{}:{}] advise type [{}] advise [{}",
            self.file,
            self.start_line,
            self.kind(),
            self.aspect_class
        )?;
        if self.kind() != AdviceKind::DeclareParents {
            write!(f, ".{}", self.advice_method)?;
        }
        f.write_str("]")
    }
}

// ============================================================================
// Introductions
// ============================================================================

/// Declare-parents payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Introduction {
    /// Interface added to matching classes.
    pub introduced_interface: String,
    /// Class providing the default implementation.
    pub default_impl: String,
    /// AspectJ type pattern selecting the classes.
    type_pattern: String,
    /// Field carrying `@DeclareParents` (annotation-sourced introductions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defining_field: Option<String>,
    #[serde(skip)]
    matcher: MatcherCell,
}

impl Introduction {
    pub fn new(
        introduced_interface: impl Into<String>,
        default_impl: impl Into<String>,
        type_pattern: impl Into<String>,
    ) -> Self {
        Introduction {
            introduced_interface: introduced_interface.into(),
            default_impl: default_impl.into(),
            type_pattern: type_pattern.into(),
            defining_field: None,
            matcher: MatcherCell::default(),
        }
    }

    /// Record the `@DeclareParents` field.
    pub fn with_defining_field(mut self, field: impl Into<String>) -> Self {
        self.defining_field = Some(field.into());
        self
    }

    pub fn type_pattern(&self) -> &str {
        &self.type_pattern
    }

    /// Replace the type pattern.
    ///
    /// An already computed matcher keeps matching the old pattern until
    /// [`Introduction::invalidate_matcher`] is called.
    pub fn set_type_pattern(&mut self, pattern: impl Into<String>) {
        self.type_pattern = pattern.into();
    }

    /// The effective matcher, computed on first use and memoized.
    pub fn type_matcher(&self) -> Arc<TypeMatcher> {
        self.matcher
            .get_or_compute(|| TypeMatcher::new(&self.type_pattern, &self.introduced_interface))
    }

    /// Drop the memoized matcher so the next call recomputes it.
    pub fn invalidate_matcher(&self) {
        self.matcher.invalidate();
    }

    pub fn is_matcher_computed(&self) -> bool {
        self.matcher.is_computed()
    }
}

/// Compute-once, invalidate-on-demand holder for a [`TypeMatcher`].
///
/// Transparent to equality and hashing.
#[derive(Debug, Default)]
pub struct MatcherCell {
    slot: Mutex<Option<Arc<TypeMatcher>>>,
}

impl MatcherCell {
    /// Return the cached matcher or compute and cache it.
    pub fn get_or_compute(&self, compute: impl FnOnce() -> TypeMatcher) -> Arc<TypeMatcher> {
        let mut slot = self.slot.lock();
        match slot.as_ref() {
            Some(matcher) => Arc::clone(matcher),
            None => {
                let matcher = Arc::new(compute());
                *slot = Some(Arc::clone(&matcher));
                matcher
            }
        }
    }

    pub fn invalidate(&self) {
        *self.slot.lock() = None;
    }

    pub fn is_computed(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl Clone for MatcherCell {
    fn clone(&self) -> Self {
        MatcherCell {
            slot: Mutex::new(self.slot.lock().clone()),
        }
    }
}

impl PartialEq for MatcherCell {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl Eq for MatcherCell {}

impl Hash for MatcherCell {
    fn hash<H: Hasher>(&self, _state: &mut H) {}
}

// ============================================================================
// Type Matching
// ============================================================================

/// Supertype lookup supplied by the host's type model.
pub trait TypeHierarchy {
    /// Every transitive superclass and implemented interface of `class`.
    fn supertypes(&self, class: &str) -> Vec<String>;
}

/// Error compiling an AspectJ type pattern.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("empty type pattern")]
    Empty,

    #[error("invalid type pattern '{pattern}': {source}")]
    Invalid {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Compiled AspectJ type pattern (`*`, `..` and a trailing `+`).
#[derive(Debug, Clone)]
pub struct TypePattern {
    source: String,
    regex: Regex,
    include_subtypes: bool,
}

impl TypePattern {
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return Err(PatternError::Empty);
        }
        let (body, include_subtypes) = match trimmed.strip_suffix('+') {
            Some(body) => (body, true),
            None => (trimmed, false),
        };

        let mut expr = String::from("^");
        if body == "*" {
            expr.push_str(".*");
        } else {
            let mut rest = body;
            while !rest.is_empty() {
                if let Some(tail) = rest.strip_prefix("..") {
                    expr.push_str(r"\.(?:[^.]+\.)*");
                    rest = tail;
                } else if let Some(tail) = rest.strip_prefix('*') {
                    expr.push_str("[^.]*");
                    rest = tail;
                } else {
                    let ch = rest.chars().next().unwrap_or_default();
                    expr.push_str(&regex::escape(ch.encode_utf8(&mut [0; 4])));
                    rest = &rest[ch.len_utf8()..];
                }
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|source| PatternError::Invalid {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(TypePattern {
            source: trimmed.to_string(),
            regex,
            include_subtypes,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match on the class name alone (ignores `+`).
    pub fn matches_name(&self, class: &str) -> bool {
        self.regex.is_match(class)
    }

    pub fn includes_subtypes(&self) -> bool {
        self.include_subtypes
    }
}

/// "Matches the type pattern" AND "not already assignable to the introduced
/// interface".
#[derive(Debug, Clone)]
pub struct TypeMatcher {
    /// `None` when the pattern failed to compile; such a matcher matches nothing.
    pattern: Option<TypePattern>,
    introduced_interface: String,
}

impl TypeMatcher {
    pub fn new(type_pattern: &str, introduced_interface: &str) -> Self {
        let pattern = match TypePattern::compile(type_pattern) {
            Ok(pattern) => Some(pattern),
            Err(err) => {
                tracing::warn!(error = %err, "introduction type pattern does not compile");
                None
            }
        };
        TypeMatcher {
            pattern,
            introduced_interface: introduced_interface.to_string(),
        }
    }

    pub fn pattern(&self) -> Option<&TypePattern> {
        self.pattern.as_ref()
    }

    pub fn matches(&self, class: &str, hierarchy: &dyn TypeHierarchy) -> bool {
        let Some(pattern) = &self.pattern else {
            return false;
        };
        let supertypes = hierarchy.supertypes(class);

        let selected = pattern.matches_name(class)
            || (pattern.includes_subtypes()
                && supertypes.iter().any(|s| pattern.matches_name(s)));
        if !selected {
            return false;
        }

        let already_assignable = class == self.introduced_interface
            || supertypes.iter().any(|s| *s == self.introduced_interface);
        !already_assignable
    }
}

// ============================================================================
// Tests
// ============================================================================
