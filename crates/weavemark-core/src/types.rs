//! Handle types shared across the index, registry and persistence layers.
//!
//! The host workspace owns the real objects these handles name (projects,
//! files, Java members, bean definitions). The index only stores the handles
//! and compares them by value.

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Unit and Artifact Handles
// ============================================================================

/// An analyzed scope (typically one project) owning its own index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    /// Create a unit handle from its workspace name.
    pub fn new(name: impl Into<String>) -> Self {
        UnitId(name.into())
    }

    /// The unit name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitId {
    fn from(name: &str) -> Self {
        UnitId::new(name)
    }
}

/// A source or configuration file tracked for invalidation.
///
/// Paths are workspace-relative and compared textually; the host is
/// responsible for normalizing separators before handing them over.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactPath(String);

impl ArtifactPath {
    /// Create an artifact handle from a workspace-relative path.
    pub fn new(path: impl Into<String>) -> Self {
        ArtifactPath(path.into())
    }

    /// The workspace-relative path.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtifactPath {
    fn from(path: &str) -> Self {
        ArtifactPath::new(path)
    }
}

// ============================================================================
// Members
// ============================================================================

/// Kind of Java member a reference endpoint names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberKind {
    /// A class or interface (introduction targets).
    Type,
    /// A method (advice methods and woven join points).
    Method,
    /// A field (annotation-style introduction declarations).
    Field,
}

/// A Java member handle: the advice method, a woven join point, an
/// introduced type, or an introduction's defining field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    /// Member kind.
    pub kind: MemberKind,
    /// Fully qualified name of the declaring type.
    pub declaring_type: String,
    /// Member name (empty for [`MemberKind::Type`]).
    pub name: String,
    /// Parameter type names for methods, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameter_types: Vec<String>,
    /// File that declares this member.
    pub file: ArtifactPath,
}

impl Member {
    /// A method member without parameters.
    pub fn method(
        declaring_type: impl Into<String>,
        name: impl Into<String>,
        file: impl Into<ArtifactPath>,
    ) -> Self {
        Member {
            kind: MemberKind::Method,
            declaring_type: declaring_type.into(),
            name: name.into(),
            parameter_types: Vec::new(),
            file: file.into(),
        }
    }

    /// A type member.
    pub fn type_(declaring_type: impl Into<String>, file: impl Into<ArtifactPath>) -> Self {
        Member {
            kind: MemberKind::Type,
            declaring_type: declaring_type.into(),
            name: String::new(),
            parameter_types: Vec::new(),
            file: file.into(),
        }
    }

    /// A field member.
    pub fn field(
        declaring_type: impl Into<String>,
        name: impl Into<String>,
        file: impl Into<ArtifactPath>,
    ) -> Self {
        Member {
            kind: MemberKind::Field,
            declaring_type: declaring_type.into(),
            name: name.into(),
            parameter_types: Vec::new(),
            file: file.into(),
        }
    }

    /// Set the parameter types (methods only).
    pub fn with_parameter_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameter_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// `Type.member` form used in queries and output (`Type` for types).
    pub fn qualified_name(&self) -> String {
        match self.kind {
            MemberKind::Type => self.declaring_type.clone(),
            MemberKind::Method | MemberKind::Field => {
                format!("{}.{}", self.declaring_type, self.name)
            }
        }
    }
}

impl From<String> for ArtifactPath {
    fn from(path: String) -> Self {
        ArtifactPath(path)
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified_name())?;
        if self.kind == MemberKind::Method {
            write!(f, "({})", self.parameter_types.join(", "))?;
        }
        Ok(())
    }
}

// ============================================================================
// Bean Handles
// ============================================================================

/// The canonical bean a bean identifier (or any of its aliases) resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BeanRef {
    /// Canonical bean name.
    pub name: String,
    /// Configuration file declaring the bean.
    pub file: ArtifactPath,
    /// Start line of the bean declaration.
    pub start_line: u32,
}

impl BeanRef {
    /// Create a bean handle.
    pub fn new(name: impl Into<String>, file: impl Into<ArtifactPath>, start_line: u32) -> Self {
        BeanRef {
            name: name.into(),
            file: file.into(),
            start_line,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
