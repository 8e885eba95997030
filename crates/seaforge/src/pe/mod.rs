//! Portable Executable support.
//!
//! - [`parser`]: header layout, section mapping, and checksum
//! - [`resource`]: in-memory model of the `.rsrc` directory tree
//! - [`writer`]: signature removal, resource injection, and read-back

pub mod parser;
pub mod resource;
pub mod writer;

pub use parser::PeLayout;
pub use writer::{has_resource, has_signature, inject_resource, read_resource, strip_signature};
