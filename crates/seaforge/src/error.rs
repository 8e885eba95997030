//! Error types for seaforge operations.
//!
//! This module defines the [`enum@Error`] enum covering every failure in the
//! compile pipeline, from option validation through blob generation to the
//! executable patching engine.
//!
//! # See Also
//!
//! - [`crate::Result`] - Convenience type alias using this error
//! - [`Stage`] - The pipeline stage attached to errors raised by [`crate::compile`]

use std::fmt;
use thiserror::Error;

/// Error type for seaforge operations.
///
/// All public functions in this crate return [`crate::Result<T>`], which uses this error type.
/// Errors raised inside [`crate::compile`] are wrapped in [`Error::Stage`] so the
/// caller can tell which step of the pipeline failed; use [`Error::root`] to get at
/// the underlying cause.
///
/// # Examples
///
/// ```no_run
/// use seaforge::{compile, CompileOptions, Error};
///
/// match compile("console.log('hi')", "hello", CompileOptions::new()) {
///     Ok(artifact) => println!("Wrote {}", artifact.output_path.display()),
///     Err(e) => match e.root() {
///         Error::SentinelNotFound(msg) => eprintln!("Host cannot be injected: {msg}"),
///         other => eprintln!("Failed: {other}"),
///     },
/// }
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed.
    ///
    /// Occurs when writing workspace files, copying the host executable, or
    /// writing the patched output.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serializing the build-config document failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A caller-supplied argument or option is invalid.
    #[error("Invalid input: {0}")]
    InputValidation(String),

    /// The external blob build step failed, timed out, or produced no blob.
    ///
    /// Captured output of the child process is kept for diagnostics.
    #[error("Failed building blob file: {message}")]
    BlobGeneration {
        message: String,
        stdout: String,
        stderr: String,
    },

    /// The image is not a PE, ELF, or Mach-O executable we can patch.
    #[error("Executable must be a supported format: {0}")]
    UnsupportedFormat(String),

    /// The image is truncated or one of its headers points outside the file.
    #[error("Malformed executable: {0}")]
    MalformedImage(String),

    /// The host binary was not built with injection support.
    #[error("Sentinel not found: {0}")]
    SentinelNotFound(String),

    /// A resource with the same name was already injected.
    #[error("Resource already present: {0}")]
    DuplicateResource(String),

    /// The image has no room for the extra header entries injection needs.
    #[error("Insufficient header space: {0}")]
    InsufficientSpace(String),

    /// The pre-injection hook reported a failure.
    #[error("Pre-injection hook failed: {0}")]
    Hook(String),

    /// A pipeline stage failed.
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap this error with the pipeline stage it originated from.
    pub fn at(self, stage: Stage) -> Self {
        match self {
            Error::Stage { .. } => self,
            other => Error::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Stage the error was raised in, if it came out of the pipeline.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The underlying error with any stage wrapper removed.
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Steps of the compile pipeline, in execution order.
///
/// Optional steps (`Stripped`, `HookRun`) are skipped when not configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Init,
    WorkspaceReady,
    BlobReady,
    HostResolved,
    Stripped,
    HookRun,
    Injected,
    Cleaned,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::WorkspaceReady => "workspace",
            Stage::BlobReady => "blob generation",
            Stage::HostResolved => "host resolution",
            Stage::Stripped => "signature removal",
            Stage::HookRun => "pre-injection hook",
            Stage::Injected => "injection",
            Stage::Cleaned => "cleanup",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_does_not_double_wrap() {
        let err = Error::Hook("boom".into())
            .at(Stage::HookRun)
            .at(Stage::Injected);
        assert_eq!(err.stage(), Some(Stage::HookRun));
        assert!(matches!(err.root(), Error::Hook(msg) if msg == "boom"));
    }

    #[test]
    fn test_stage_display_in_message() {
        let err = Error::SentinelNotFound("no fuse".into()).at(Stage::Injected);
        assert_eq!(
            err.to_string(),
            "injection stage failed: Sentinel not found: no fuse"
        );
    }

    #[test]
    fn test_unwrapped_error_has_no_stage() {
        let err = Error::MalformedImage("short".into());
        assert_eq!(err.stage(), None);
        assert!(matches!(err.root(), Error::MalformedImage(_)));
    }
}
