pub mod parser;
pub mod writer;

pub use parser::MachOFile;
pub use writer::{has_resource, has_signature, inject_resource, read_resource, strip_signature};
