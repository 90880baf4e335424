//! Binary entry point for the weave CLI.
//!
//! Queries the advice-reference and bean-metadata state persisted by a
//! weaving tracker. All output is JSON on stdout; logs go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! weave units
//! weave references --unit petclinic
//! weave touching src/main/resources/aspects.xml
//! weave advised com.acme.Service.doWork
//! weave metadata serviceBean
//! ```

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use weavemark::cli::{self, StateView};
use weavemark_core::config::{ConfigOverrides, TrackerConfig};
use weavemark_core::error::{OutputErrorCode, WeaveError};
use weavemark_core::output::{emit_response, emit_response_compact, ErrorResponse};

// ============================================================================
// CLI Structure
// ============================================================================

/// Query persisted AOP advice references and bean metadata.
#[derive(Parser, Debug)]
#[command(name = "weave", version, about = "Query persisted AOP advice references")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

/// Global arguments shared by all subcommands.
#[derive(Parser, Debug)]
struct GlobalArgs {
    /// State directory (default: $WEAVEMARK_STATE_DIR, else the platform data dir).
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Emit single-line JSON.
    #[arg(long, global = true)]
    compact: bool,

    /// Log level for tracing output.
    #[arg(long, global = true, value_enum, default_value = "warn")]
    log_level: LogLevel,
}

/// Log level for tracing output.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn to_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List tracked units with reference and bean counts.
    Units,
    /// List references, optionally for one unit.
    References {
        /// Restrict to this unit.
        #[arg(long)]
        unit: Option<String>,
    },
    /// List references affecting an artifact.
    Touching {
        /// Workspace-relative artifact path.
        file: String,
    },
    /// Report whether a member is advised (`Type.method`).
    Advised { member: String },
    /// Report whether a member is an advice method (`Type.method`).
    Advice { member: String },
    /// Show cached metadata for a bean.
    Metadata { bean: String },
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_tracing(cli.global.log_level);

    match execute(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let error_code = OutputErrorCode::from(&err);
            let response = ErrorResponse::from_error(&err);

            // Errors go to stdout as JSON too.
            let _ = emit(&response, cli.global.compact);
            let _ = io::stdout().flush();

            ExitCode::from(error_code.code())
        }
    }
}

/// Initialize tracing subscriber.
fn init_tracing(level: LogLevel) {
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_tracing_level().to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn execute(cli: &Cli) -> Result<(), WeaveError> {
    let overrides = ConfigOverrides {
        state_dir: cli.global.state_dir.clone(),
        ..ConfigOverrides::default()
    };
    let config = TrackerConfig::resolve(&overrides)?;
    let view = StateView::open(&config)?;
    let compact = cli.global.compact;

    match &cli.command {
        Command::Units => emit(&cli::units(&view), compact),
        Command::References { unit } => emit(&cli::references(&view, unit.as_deref())?, compact),
        Command::Touching { file } => emit(&cli::touching(&view, file)?, compact),
        Command::Advised { member } => emit(&cli::advised(&view, member)?, compact),
        Command::Advice { member } => emit(&cli::advice(&view, member)?, compact),
        Command::Metadata { bean } => emit(&cli::metadata(&view, bean)?, compact),
    }
}

fn emit<T: Serialize>(response: &T, compact: bool) -> Result<(), WeaveError> {
    let mut stdout = io::stdout();
    if compact {
        emit_response_compact(response, &mut stdout)?;
    } else {
        emit_response(response, &mut stdout)?;
    }
    stdout.flush()?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    mod cli_parsing {
        use super::*;

        #[test]
        fn parse_references_with_unit() {
            let cli = Cli::try_parse_from(["weave", "references", "--unit", "petclinic"]).unwrap();
            match cli.command {
                Command::References { unit } => assert_eq!(unit.as_deref(), Some("petclinic")),
                other => panic!("unexpected {other:?}"),
            }
        }

        #[test]
        fn parse_global_flags_after_subcommand() {
            let args = ["weave", "units", "--state-dir", "/tmp/wm", "--compact"];
            let cli = Cli::try_parse_from(args).unwrap();
            assert_eq!(cli.global.state_dir, Some(PathBuf::from("/tmp/wm")));
            assert!(cli.global.compact);
        }

        #[test]
        fn default_log_level_is_warn() {
            let cli = Cli::try_parse_from(["weave", "units"]).unwrap();
            assert!(matches!(cli.global.log_level, LogLevel::Warn));
        }

        #[test]
        fn advised_requires_member() {
            assert!(Cli::try_parse_from(["weave", "advised"]).is_err());
        }
    }

    mod log_level {
        use super::*;

        #[test]
        fn levels_map_to_tracing() {
            assert_eq!(LogLevel::Debug.to_tracing_level(), tracing::Level::DEBUG);
            assert_eq!(LogLevel::Error.to_tracing_level(), tracing::Level::ERROR);
        }
    }
}
