//! Safetensors-style container handling.
//!
//! - [`codec`]: length-prefixed header parsing and serialization
//! - [`types`]: ordered header and tensor descriptors

pub mod codec;
mod types;

pub use codec::{parse, read_header, serialize, Container, ParsedHeader};
pub use types::{element_size, ContainerHeader, HeaderEntry, TensorDescriptor};
