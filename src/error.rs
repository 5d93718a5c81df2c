//! Structured error types for parsing, expansion, and building.
//!
//! Every error that can escape the engine carries the makefile location that
//! produced it when one is known. Host-capability failures are wrapped as
//! sources rather than flattened into strings.

use camino::Utf8PathBuf;
use miette::Diagnostic;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Position within a makefile source, used for diagnostics.
///
/// `file` is `None` for text fed in programmatically (for example through the
/// `eval` function), in which case the display form uses `<eval>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceLocation {
    /// Makefile the construct came from, when read from disk.
    pub file: Option<Utf8PathBuf>,
    /// One-based line number.
    pub line: u32,
}

impl SourceLocation {
    /// Construct a location for line `line` of `file`.
    #[must_use]
    pub fn new(file: Option<Utf8PathBuf>, line: u32) -> Self {
        Self { file, line }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{file}:{}", self.line),
            None => write!(f, "<eval>:{}", self.line),
        }
    }
}

/// Errors raised while loading or running a build.
///
/// The enum is `Clone` (I/O causes are shared through `Arc`) because a
/// failed build outcome is delivered to every waiter of the same target.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum MakeError {
    /// Malformed directive, assignment, or rule. Fatal to parsing.
    #[error("{location}: {message}")]
    #[diagnostic(code(kumade::parse))]
    Parse {
        /// Where the offending line lives.
        location: SourceLocation,
        /// Human-readable description of the problem.
        message: String,
    },

    /// A function call inside `$(...)` failed.
    #[error("expansion failed: {message}")]
    #[diagnostic(code(kumade::expand))]
    Expand {
        /// Description of the failing call.
        message: String,
    },

    /// The makefile invoked `$(error ...)`.
    #[error("{message}")]
    #[diagnostic(code(kumade::user_error))]
    User {
        /// The expanded argument of the `error` call.
        message: String,
    },

    /// No rule produces the target and the file does not exist.
    #[error("no rule to make target '{target}'{}", needed_by.as_ref().map(|n| format!(", needed by '{n}'")).unwrap_or_default())]
    #[diagnostic(code(kumade::no_rule))]
    NoRule {
        /// The unbuildable target.
        target: String,
        /// The dependent that demanded it, when reached indirectly.
        needed_by: Option<String>,
    },

    /// A recipe line exited non-zero without the ignore flag.
    #[error("recipe for target '{target}' failed with exit code {code}")]
    #[diagnostic(code(kumade::recipe))]
    Recipe {
        /// Target whose recipe failed.
        target: String,
        /// Exit code reported by the shell.
        code: i32,
    },

    /// A mandatory `include` could not be satisfied.
    #[error("{location}: cannot read makefile '{path}'")]
    #[diagnostic(code(kumade::include))]
    Include {
        /// Where the `include` directive appeared.
        location: SourceLocation,
        /// The requested include path.
        path: String,
        /// Underlying I/O failure.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The shell interpreter could not be launched at all.
    #[error("failed to spawn shell for target '{target}'")]
    #[diagnostic(code(kumade::spawn))]
    Spawn {
        /// Target whose recipe was being executed.
        target: String,
        /// Underlying spawn failure.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// An I/O operation requested by the makefile (the `file` function)
    /// failed.
    #[error("file operation '{op}' on '{path}' failed")]
    #[diagnostic(code(kumade::file_io))]
    FileIo {
        /// The operator word (`>`, `>>`, or `<`).
        op: String,
        /// Path the operation addressed.
        path: String,
        /// Underlying I/O failure.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// One or more goals failed while `keep_going` was set.
    #[error("build finished with {} failed target(s): {}", failed.len(), failed.join(", "))]
    #[diagnostic(code(kumade::keep_going))]
    KeepGoing {
        /// Targets whose builds failed.
        failed: Vec<String>,
    },
}

impl MakeError {
    /// Shorthand for a parse error at `location`.
    pub(crate) fn parse(location: SourceLocation, message: impl Into<String>) -> Self {
        Self::Parse {
            location,
            message: message.into(),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, MakeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_location_display_names_eval_when_fileless() {
        let loc = SourceLocation::new(None, 3);
        assert_eq!(loc.to_string(), "<eval>:3");
        let loc = SourceLocation::new(Some("dir/Makefile".into()), 12);
        assert_eq!(loc.to_string(), "dir/Makefile:12");
    }

    #[test]
    fn no_rule_error_mentions_dependent() {
        let err = MakeError::NoRule {
            target: "foo.o".into(),
            needed_by: Some("app".into()),
        };
        assert_eq!(
            err.to_string(),
            "no rule to make target 'foo.o', needed by 'app'"
        );
    }
}
