//! Error types and error code constants.
//!
//! `WeaveError` is the single error type rendered by the CLI. Subsystem
//! errors ([`PersistError`], [`ConfigError`], [`AnalyzerError`]) bridge into
//! it with `From`, and [`OutputErrorCode`] maps each variant to a stable
//! process exit code:
//!
//! - `2`: Invalid arguments (bad input from caller)
//! - `3`: Resolution errors (unknown unit, member, or bean)
//! - `4`: Persistence errors (unreadable or unwritable state)
//! - `10`: Internal errors (bugs, unexpected state)

use std::fmt;

use thiserror::Error;

use crate::adapter::AnalyzerError;
use crate::config::ConfigError;
use crate::persistence::PersistError;

// ============================================================================
// Output Error Codes
// ============================================================================

/// Error codes for JSON output and process exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OutputErrorCode {
    /// Invalid arguments from caller.
    InvalidArguments = 2,
    /// Unknown unit, member, or bean.
    ResolutionError = 3,
    /// Persisted state could not be read or written.
    PersistenceError = 4,
    /// Bugs and unexpected state.
    InternalError = 10,
}

impl OutputErrorCode {
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for OutputErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

// ============================================================================
// Unified Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum WeaveError {
    #[error("invalid arguments: {message}")]
    InvalidArguments {
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("unit not found: {unit}")]
    UnitNotFound { unit: String },

    #[error("bean not found: {bean}")]
    BeanNotFound { bean: String },

    #[error("persistence error: {message}")]
    Persistence { message: String, path: Option<String> },

    #[error("analysis error: {message}")]
    Analysis { message: String, artifact: String },

    #[error("internal error: {message}")]
    InternalError { message: String },
}

impl From<&WeaveError> for OutputErrorCode {
    fn from(err: &WeaveError) -> Self {
        match err {
            WeaveError::InvalidArguments { .. } => OutputErrorCode::InvalidArguments,
            WeaveError::UnitNotFound { .. } => OutputErrorCode::ResolutionError,
            WeaveError::BeanNotFound { .. } => OutputErrorCode::ResolutionError,
            WeaveError::Analysis { .. } => OutputErrorCode::ResolutionError,
            WeaveError::Persistence { .. } => OutputErrorCode::PersistenceError,
            WeaveError::InternalError { .. } => OutputErrorCode::InternalError,
        }
    }
}

impl From<WeaveError> for OutputErrorCode {
    fn from(err: WeaveError) -> Self {
        OutputErrorCode::from(&err)
    }
}

// ============================================================================
// Bridges
// ============================================================================

impl From<PersistError> for WeaveError {
    fn from(err: PersistError) -> Self {
        let path = match &err {
            PersistError::Io { path, .. } | PersistError::ChecksumMismatch { path } => {
                Some(path.display().to_string())
            }
            PersistError::Json(_) | PersistError::VersionMismatch { .. } => None,
        };
        WeaveError::Persistence {
            message: err.to_string(),
            path,
        }
    }
}

impl From<ConfigError> for WeaveError {
    fn from(err: ConfigError) -> Self {
        WeaveError::invalid_args(err.to_string())
    }
}

impl From<AnalyzerError> for WeaveError {
    fn from(err: AnalyzerError) -> Self {
        WeaveError::Analysis {
            artifact: err.artifact().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for WeaveError {
    fn from(err: std::io::Error) -> Self {
        WeaveError::internal(format!("IO error: {}", err))
    }
}

impl WeaveError {
    pub fn invalid_args(message: impl Into<String>) -> Self {
        WeaveError::InvalidArguments {
            message: message.into(),
            details: None,
        }
    }

    pub fn invalid_args_with_details(message: impl Into<String>, details: serde_json::Value) -> Self {
        WeaveError::InvalidArguments {
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn unit_not_found(unit: impl Into<String>) -> Self {
        WeaveError::UnitNotFound { unit: unit.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        WeaveError::InternalError {
            message: message.into(),
        }
    }

    pub fn error_code(&self) -> OutputErrorCode {
        OutputErrorCode::from(self)
    }
}

pub type WeaveResult<T> = Result<T, WeaveError>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ArtifactPath;
    use std::path::PathBuf;

    mod error_code_mapping {
        use super::*;

        #[test]
        fn invalid_arguments_maps_to_2() {
            let err = WeaveError::invalid_args("missing member");
            assert_eq!(err.error_code(), OutputErrorCode::InvalidArguments);
            assert_eq!(err.error_code().code(), 2);
        }

        #[test]
        fn unknown_unit_maps_to_resolution_error() {
            let err = WeaveError::unit_not_found("ghost");
            assert_eq!(err.error_code().code(), 3);
            assert_eq!(err.to_string(), "unit not found: ghost");
        }

        #[test]
        fn persist_error_bridges_to_4() {
            let err: WeaveError = PersistError::ChecksumMismatch {
                path: PathBuf::from("/state/aop-references.json"),
            }
            .into();
            assert_eq!(err.error_code(), OutputErrorCode::PersistenceError);
            match err {
                WeaveError::Persistence { path, .. } => {
                    assert_eq!(path.as_deref(), Some("/state/aop-references.json"))
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        #[test]
        fn config_error_is_invalid_arguments() {
            let err: WeaveError = ConfigError::InvalidValue {
                key: "workers",
                value: "0".to_string(),
                reason: "must be at least 1",
            }
            .into();
            assert_eq!(err.error_code(), OutputErrorCode::InvalidArguments);
        }

        #[test]
        fn analyzer_error_keeps_artifact() {
            let err: WeaveError = AnalyzerError::failed(&ArtifactPath::from("aspects.xml"), "bad xml").into();
            match &err {
                WeaveError::Analysis { artifact, .. } => assert_eq!(artifact, "aspects.xml"),
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(err.error_code().code(), 3);
        }

        #[test]
        fn io_error_is_internal() {
            let err: WeaveError = std::io::Error::other("disk on fire").into();
            assert_eq!(err.error_code().code(), 10);
        }
    }

    mod output_error_code {
        use super::*;

        #[test]
        fn display_shows_code() {
            assert_eq!(OutputErrorCode::InvalidArguments.to_string(), "2");
            assert_eq!(OutputErrorCode::PersistenceError.to_string(), "4");
            assert_eq!(OutputErrorCode::InternalError.to_string(), "10");
        }
    }
}
