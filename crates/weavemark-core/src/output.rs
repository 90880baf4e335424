//! JSON output types for CLI responses.
//!
//! Every response has `status` first and carries `schema_version`. Arrays keep
//! registry order so the same state always renders the same bytes. Absent
//! optional fields are omitted, not `null`.

use std::io::{self, Write};

use serde::{Deserialize, Serialize};

use crate::error::{OutputErrorCode, WeaveError};
use crate::metadata::BeanMetadataHolder;
use crate::reference::Reference;
use crate::types::UnitId;

/// Current schema version for all responses.
pub const SCHEMA_VERSION: &str = "1";

// ============================================================================
// Carriers
// ============================================================================

/// One reference as rendered for output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceInfo {
    /// Advice kind label (`around`, `declare-parents`, ...).
    pub kind: String,
    pub aspect: String,
    pub aspect_class: String,
    /// Qualified advice member, absent for most introductions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advice: Option<String>,
    /// Qualified target member.
    pub target: String,
    pub file: String,
    pub definition_file: String,
    pub definition_line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bean: Option<String>,
    /// Canonical bean name when the bean resolved through an alias.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_bean: Option<String>,
}

impl ReferenceInfo {
    pub fn from_reference(reference: &Reference) -> Self {
        let definition = &reference.definition;
        ReferenceInfo {
            kind: reference.kind.label().to_string(),
            aspect: definition.aspect_name().to_string(),
            aspect_class: definition.aspect_class.clone(),
            advice: reference.source.as_ref().map(|s| s.qualified_name()),
            target: reference.target.qualified_name(),
            file: reference.file.to_string(),
            definition_file: definition.file.to_string(),
            definition_line: definition.start_line,
            bean: (!reference.target_bean_id.is_empty()).then(|| reference.target_bean_id.clone()),
            resolved_bean: reference
                .resolved_bean()
                .filter(|b| b.name != reference.target_bean_id)
                .map(|b| b.name.clone()),
        }
    }
}

/// Per-unit counts for the `units` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSummary {
    pub unit: String,
    pub references: usize,
    pub beans: usize,
}

/// Error information for JSON output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorInfo {
    pub fn from_error(err: &WeaveError) -> Self {
        let details = match err {
            WeaveError::InvalidArguments { details, .. } => details.clone(),
            WeaveError::Persistence { path: Some(path), .. } => Some(serde_json::json!({ "path": path })),
            WeaveError::Analysis { artifact, .. } => Some(serde_json::json!({ "artifact": artifact })),
            _ => None,
        };
        ErrorInfo {
            code: OutputErrorCode::from(err).code(),
            message: err.to_string(),
            details,
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitsResponse {
    pub status: String,
    pub schema_version: String,
    pub units: Vec<UnitSummary>,
}

impl UnitsResponse {
    pub fn new(units: Vec<UnitSummary>) -> Self {
        UnitsResponse {
            status: "ok".to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
            units,
        }
    }
}

/// Response for `references` and `touching`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferencesResponse {
    pub status: String,
    pub schema_version: String,
    /// Unit or file the query was scoped to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub count: usize,
    pub references: Vec<ReferenceInfo>,
}

impl ReferencesResponse {
    pub fn new(scope: Option<String>, references: &[Reference]) -> Self {
        let references: Vec<_> = references.iter().map(ReferenceInfo::from_reference).collect();
        ReferencesResponse {
            status: "ok".to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
            scope,
            count: references.len(),
            references,
        }
    }
}

/// Response for `advised` and `advice`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberResponse {
    pub status: String,
    pub schema_version: String,
    pub member: String,
    /// `advised` or `advice`.
    pub query: String,
    pub result: bool,
    pub references: Vec<ReferenceInfo>,
}

impl MemberResponse {
    pub fn new(member: impl Into<String>, query: impl Into<String>, references: &[Reference]) -> Self {
        MemberResponse {
            status: "ok".to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
            member: member.into(),
            query: query.into(),
            result: !references.is_empty(),
            references: references.iter().map(ReferenceInfo::from_reference).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub unit: UnitId,
    #[serde(flatten)]
    pub holder: BeanMetadataHolder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataResponse {
    pub status: String,
    pub schema_version: String,
    pub bean: String,
    pub entries: Vec<MetadataEntry>,
}

impl MetadataResponse {
    pub fn new(bean: impl Into<String>, entries: Vec<(UnitId, BeanMetadataHolder)>) -> Self {
        MetadataResponse {
            status: "ok".to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
            bean: bean.into(),
            entries: entries
                .into_iter()
                .map(|(unit, holder)| MetadataEntry { unit, holder })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: String,
    pub schema_version: String,
    pub error: ErrorInfo,
}

impl ErrorResponse {
    pub fn from_error(err: &WeaveError) -> Self {
        ErrorResponse {
            status: "error".to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
            error: ErrorInfo::from_error(err),
        }
    }
}

// ============================================================================
// Emission
// ============================================================================

/// Emit a response as pretty JSON followed by a newline.
pub fn emit_response<T: Serialize>(response: &T, writer: &mut impl Write) -> io::Result<()> {
    let json = serde_json::to_string_pretty(response)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writeln!(writer, "{}", json)
}

/// Emit a response as single-line JSON.
pub fn emit_response_compact<T: Serialize>(response: &T, writer: &mut impl Write) -> io::Result<()> {
    let json = serde_json::to_string(response).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writeln!(writer, "{}", json)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Advice, Definition, DefinitionOrigin};
    use crate::reference::BeanResolver;
    use crate::types::{BeanRef, Member};
    use std::sync::Arc;

    struct Aliases;

    impl BeanResolver for Aliases {
        fn resolve(&self, _bean_id: &str) -> Option<BeanRef> {
            Some(BeanRef::new("serviceBean", "beans.xml", 3))
        }
    }

    fn reference(bean: &str) -> Reference {
        let def = Arc::new(
            Definition::new(DefinitionOrigin::Xml, "com.acme.LoggingAspect", "log", "aspects.xml", Advice::Around)
                .with_aspect_name("LoggingAspect")
                .with_lines(10, 12),
        );
        Reference::new(def, Member::method("com.acme.Service", "doWork", "src/Service.java"), "src/Service.java")
            .with_source(Member::method("com.acme.LoggingAspect", "log", "src/LoggingAspect.java"))
            .with_target_bean(bean, "beans.xml", 3)
    }

    #[test]
    fn reference_info_flattens_reference() {
        let info = ReferenceInfo::from_reference(&reference("serviceBean"));
        assert_eq!(info.kind, "around");
        assert_eq!(info.aspect, "LoggingAspect");
        assert_eq!(info.advice.as_deref(), Some("com.acme.LoggingAspect.log"));
        assert_eq!(info.target, "com.acme.Service.doWork");
        assert_eq!(info.definition_file, "aspects.xml");
        assert_eq!(info.definition_line, 10);
        assert_eq!(info.resolved_bean, None);
    }

    #[test]
    fn resolved_alias_is_reported() {
        let r = reference("serviceAlias");
        r.resolve_bean(&Aliases);
        let info = ReferenceInfo::from_reference(&r);
        assert_eq!(info.bean.as_deref(), Some("serviceAlias"));
        assert_eq!(info.resolved_bean.as_deref(), Some("serviceBean"));
    }

    #[test]
    fn status_comes_first() {
        let response = ReferencesResponse::new(Some("aspects.xml".to_string()), &[reference("serviceBean")]);
        let mut out = Vec::new();
        emit_response_compact(&response, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with(r#"{"status":"ok","schema_version":"1""#));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn error_response_carries_code_and_details() {
        let err = WeaveError::invalid_args_with_details("bad member", serde_json::json!({ "member": "x" }));
        let response = ErrorResponse::from_error(&err);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"]["code"], 2);
        assert_eq!(json["error"]["details"]["member"], "x");
    }

    #[test]
    fn member_response_reports_result() {
        let none = MemberResponse::new("com.acme.Service.other", "advised", &[]);
        assert!(!none.result);
        let some = MemberResponse::new("com.acme.Service.doWork", "advised", &[reference("serviceBean")]);
        assert!(some.result);
        let mut out = Vec::new();
        emit_response(&some, &mut out).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["references"].as_array().map(Vec::len), Some(1));
    }
}
