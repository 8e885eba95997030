//! Compile a script into a standalone executable.
//!
//! A host runtime binary is copied, its code signature is removed, and a
//! startup blob built from the script is embedded as a named resource. The
//! sentinel fuse compiled into the runtime is then armed so that it loads
//! the blob at launch.
//!
//! The patching engine works on PE, ELF (32/64-bit, either byte order) and
//! Mach-O (64-bit, thin or universal) images and can be used on its own
//! through [`ExecutableImage`], [`strip_signature`] and [`inject`].

pub mod blob;
pub mod builder;
pub mod constants;
pub mod elf;
pub mod error;
pub mod host;
pub mod image;
pub mod inject;
pub mod logger;
pub mod macho;
pub mod pe;
pub mod pipeline;
pub mod sentinel;
pub mod strip;
pub mod workspace;

#[cfg(test)]
pub(crate) mod fixtures;

pub use blob::{BlobConfig, BlobGenerator, NodeBlobGenerator};
pub use builder::CompileOptions;
pub use error::{Error, Stage};
pub use host::{resolve_host, HostSelection};
pub use image::{ExecutableImage, Format};
pub use inject::{has_resource, has_signature, inject, read_resource, ResourceRecord};
pub use logger::{LogLevel, Logger};
pub use pipeline::{compile, compile_with, CompiledArtifact, PreInjectHook};
pub use sentinel::{sentinel_state, SentinelState};
pub use strip::strip_signature;
pub use workspace::Workspace;

pub type Result<T> = std::result::Result<T, Error>;
