//! The compile pipeline.
//!
//! ```text
//! Init -> WorkspaceReady -> BlobReady -> HostResolved -> (Stripped) -> (HookRun) -> Injected -> Cleaned
//! ```
//!
//! Each step runs once. A failing step is reported as [`Error::Stage`] naming
//! the step, and the workspace is removed whether the call succeeds or not.

use crate::blob::{BlobConfig, BlobGenerator, NodeBlobGenerator};
use crate::builder::CompileOptions;
use crate::constants::RESOURCE_NAME;
use crate::error::Stage;
use crate::host::{resolve_host, resolve_runtime};
use crate::image::ExecutableImage;
use crate::inject::{inject, ResourceRecord};
use crate::logger::Logger;
use crate::strip::strip_signature;
use crate::workspace::Workspace;
use crate::{Error, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Callback run on the output file after signature handling, before injection.
///
/// Implemented for any `Fn(&Path) -> Result<(), E>` where `E: Display`.
pub trait PreInjectHook: Send + Sync {
    fn before_inject(&self, output: &Path) -> Result<()>;
}

impl<F, E> PreInjectHook for F
where
    F: Fn(&Path) -> std::result::Result<(), E> + Send + Sync,
    E: fmt::Display,
{
    fn before_inject(&self, output: &Path) -> Result<()> {
        self(output).map_err(|e| Error::Hook(e.to_string()))
    }
}

/// Result of a successful compile.
#[derive(Debug, Clone)]
pub struct CompiledArtifact {
    /// The script that was embedded.
    pub input: String,
    pub output_path: PathBuf,
    /// Binary the output was copied from.
    pub host_path: PathBuf,
    /// Scratch directory used for the call; already removed.
    pub workspace_path: PathBuf,
    pub resource: ResourceRecord,
    pub signature_removed: bool,
}

/// Compile `input` into a standalone executable at `output`.
///
/// The blob is built by the configured runtime (default `node` on `PATH`),
/// which is also the default host binary.
pub fn compile(
    input: &str,
    output: impl AsRef<Path>,
    options: CompileOptions,
) -> Result<CompiledArtifact> {
    options.validate().map_err(|e| e.at(Stage::Init))?;
    let generator = NodeBlobGenerator::new(resolve_runtime(&options.runtime), options.timeout);
    compile_with(input, output, options, &generator)
}

/// Like [`compile`], with a caller-supplied blob generator.
pub fn compile_with(
    input: &str,
    output: impl AsRef<Path>,
    options: CompileOptions,
    generator: &dyn BlobGenerator,
) -> Result<CompiledArtifact> {
    options.validate().map_err(|e| e.at(Stage::Init))?;
    let logger = Logger::new(options.log_level);

    let output = prepare_output(output.as_ref()).map_err(|e| e.at(Stage::Init))?;
    logger.debug(format_args!("Output set to \"{}\"", output.display()));

    let workspace = Workspace::acquire(logger).map_err(|e| e.at(Stage::WorkspaceReady))?;
    logger.debug(format_args!(
        "Working directory set to \"{}\"",
        workspace.path().display()
    ));

    let result = Pipeline {
        input,
        output: &output,
        options: &options,
        generator,
        workspace: &workspace,
        logger,
    }
    .run();

    logger.debug("Cleaning up working directory");
    workspace.release();
    result
}

/// Resolve the output to an absolute path, create its parent, and remove any stale file.
fn prepare_output(output: &Path) -> Result<PathBuf> {
    if output.as_os_str().is_empty() {
        return Err(Error::InputValidation("output path must not be empty".into()));
    }
    let output = if output.is_absolute() {
        output.to_path_buf()
    } else {
        std::env::current_dir()?.join(output)
    };

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    if output.is_dir() {
        return Err(Error::InputValidation(format!(
            "output path {} is a directory",
            output.display()
        )));
    }
    if output.exists() {
        fs::remove_file(&output)?;
    }
    Ok(output)
}

struct Pipeline<'a> {
    input: &'a str,
    output: &'a Path,
    options: &'a CompileOptions,
    generator: &'a dyn BlobGenerator,
    workspace: &'a Workspace,
    logger: Logger,
}

impl Pipeline<'_> {
    fn run(&self) -> Result<CompiledArtifact> {
        let blob = self.build_blob().map_err(|e| e.at(Stage::BlobReady))?;
        let host_path = self.copy_host().map_err(|e| e.at(Stage::HostResolved))?;

        let signature_removed = if self.options.sign_output {
            self.logger.debug("Keeping the host signature");
            false
        } else {
            self.strip().map_err(|e| e.at(Stage::Stripped))?
        };

        if let Some(hook) = &self.options.pre_inject {
            self.logger.debug("Calling preInject hook");
            hook.before_inject(self.output)
                .map_err(|e| e.at(Stage::HookRun))?;
        }

        let resource = self.inject(&blob).map_err(|e| e.at(Stage::Injected))?;

        Ok(CompiledArtifact {
            input: self.input.to_string(),
            output_path: self.output.to_path_buf(),
            host_path,
            workspace_path: self.workspace.path().to_path_buf(),
            resource,
            signature_removed,
        })
    }

    fn build_blob(&self) -> Result<Vec<u8>> {
        let input_path = self.workspace.input_path();
        self.logger
            .debug(format_args!("Writing input file into \"{}\"", input_path.display()));
        fs::write(&input_path, self.input)?;

        let config = BlobConfig {
            main: input_path,
            output: self.workspace.blob_path(),
            disable_experimental_sea_warning: self.options.disable_warning,
            use_snapshot: self.options.use_snapshot,
            use_code_cache: self.options.use_code_cache,
        };
        let config_path = self.workspace.config_path();
        self.logger
            .debug(format_args!("Writing SEA Config into \"{}\"", config_path.display()));
        config.write(&config_path)?;

        self.logger.debug("Generating blob file");
        self.generator.generate(&config_path, &config)?;

        fs::read(&config.output).map_err(|e| Error::BlobGeneration {
            message: format!("cannot read blob {}: {}", config.output.display(), e),
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    fn copy_host(&self) -> Result<PathBuf> {
        let default = resolve_runtime(&self.options.runtime);
        let selection = resolve_host(self.options.host.as_deref(), &default);
        if selection.fell_back {
            self.logger.warn(format_args!(
                "Invalid host executable provided; falling back to \"{}\".",
                selection.path.display()
            ));
        }

        self.logger.debug(format_args!(
            "Copying host executable from \"{}\" into \"{}\"",
            selection.path.display(),
            self.output.display()
        ));
        fs::copy(&selection.path, self.output)?;

        // Reject hosts we cannot patch before anything is written to the copy
        ExecutableImage::open(self.output)?;
        Ok(selection.path)
    }

    fn strip(&self) -> Result<bool> {
        self.logger.debug("Removing original signature");
        let mut image = ExecutableImage::open(self.output)?;
        let removed = strip_signature(&mut image)?;
        if removed {
            self.logger.debug("Writing unsigned file");
            image.write(self.output)?;
        }
        Ok(removed)
    }

    fn inject(&self, blob: &[u8]) -> Result<ResourceRecord> {
        self.logger.debug("Injecting blob file into host executable");
        // The hook may have rewritten the file.
        let mut image = ExecutableImage::open(self.output)?;
        let record = inject(&mut image, RESOURCE_NAME, blob)?;
        image.write(self.output)?;
        self.logger.debug(format_args!(
            "Injected {} bytes at offset {:#x}",
            record.len, record.offset
        ));
        Ok(record)
    }
}
