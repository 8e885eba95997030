//! Compile options builder
//!
//! Every knob of a compile call lives in [`CompileOptions`]. Defaults match
//! the runtime's own tooling; the builder methods override them one at a time.

use crate::blob::DEFAULT_TIMEOUT;
use crate::logger::LogLevel;
use crate::pipeline::PreInjectHook;
use crate::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Runtime looked up on `PATH` when none is configured.
pub const DEFAULT_RUNTIME: &str = "node";

/// Options for [`crate::compile`].
///
/// # Example
///
/// ```no_run
/// use seaforge::{compile, CompileOptions, LogLevel};
///
/// let options = CompileOptions::new()
///     .log_level(LogLevel::Debug)
///     .disable_warning(true)
///     .host("/opt/node-22/bin/node");
/// compile("console.log('Basic example!')", "dist/app", options)?;
/// # Ok::<(), seaforge::Error>(())
/// ```
#[derive(Clone)]
pub struct CompileOptions {
    pub(crate) log_level: LogLevel,
    pub(crate) disable_warning: bool,
    pub(crate) use_snapshot: bool,
    pub(crate) use_code_cache: bool,
    pub(crate) host: Option<PathBuf>,
    pub(crate) sign_output: bool,
    pub(crate) pre_inject: Option<Arc<dyn PreInjectHook>>,
    pub(crate) runtime: PathBuf,
    pub(crate) timeout: Duration,
}

impl CompileOptions {
    /// Create options with every default applied.
    pub fn new() -> Self {
        Self {
            log_level: LogLevel::default(),
            disable_warning: false,
            use_snapshot: false,
            use_code_cache: false,
            host: None,
            sign_output: false,
            pre_inject: None,
            runtime: PathBuf::from(DEFAULT_RUNTIME),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set log verbosity (default: warn).
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Suppress the runtime's experimental-feature warning at startup.
    pub fn disable_warning(mut self, disable: bool) -> Self {
        self.disable_warning = disable;
        self
    }

    /// Build the blob with a startup snapshot.
    pub fn use_snapshot(mut self, enable: bool) -> Self {
        self.use_snapshot = enable;
        self
    }

    /// Include a code cache in the blob.
    pub fn use_code_cache(mut self, enable: bool) -> Self {
        self.use_code_cache = enable;
        self
    }

    /// Copy the output from this binary instead of the runtime.
    ///
    /// A path that does not exist falls back to the runtime with a warning.
    pub fn host(mut self, path: impl AsRef<Path>) -> Self {
        self.host = Some(path.as_ref().to_path_buf());
        self
    }

    /// Keep the host's code signature instead of stripping it.
    ///
    /// The signature no longer matches after injection; use this only when
    /// the output is re-signed afterwards.
    pub fn sign_output(mut self, keep: bool) -> Self {
        self.sign_output = keep;
        self
    }

    /// Run `hook` on the output path right before the blob is injected.
    pub fn pre_inject(mut self, hook: impl PreInjectHook + 'static) -> Self {
        self.pre_inject = Some(Arc::new(hook));
        self
    }

    /// Runtime that builds the blob (default: `node` on `PATH`).
    pub fn runtime(mut self, path: impl AsRef<Path>) -> Self {
        self.runtime = path.as_ref().to_path_buf();
        self
    }

    /// Bound on the blob build step (default: 120 s).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn get_log_level(&self) -> LogLevel {
        self.log_level
    }

    pub fn get_host(&self) -> Option<&Path> {
        self.host.as_deref()
    }

    pub fn get_runtime(&self) -> &Path {
        &self.runtime
    }

    pub fn get_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn keeps_signature(&self) -> bool {
        self.sign_output
    }

    /// Validate the option set.
    ///
    /// Returns an error if:
    /// - The runtime path is empty
    /// - The timeout is zero
    pub fn validate(&self) -> Result<()> {
        if self.runtime.as_os_str().is_empty() {
            return Err(Error::InputValidation("runtime path must not be empty".into()));
        }
        if self.timeout.is_zero() {
            return Err(Error::InputValidation("timeout must be greater than zero".into()));
        }
        Ok(())
    }
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompileOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileOptions")
            .field("log_level", &self.log_level)
            .field("disable_warning", &self.disable_warning)
            .field("use_snapshot", &self.use_snapshot)
            .field("use_code_cache", &self.use_code_cache)
            .field("host", &self.host)
            .field("sign_output", &self.sign_output)
            .field("pre_inject", &self.pre_inject.as_ref().map(|_| "<hook>"))
            .field("runtime", &self.runtime)
            .field("timeout", &self.timeout)
            .finish()
    }
}
