//! Container header types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One tensor's entry in the header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorDescriptor {
    /// Element type tag (e.g. "F16", "BF16")
    pub dtype: String,
    /// Tensor dimensions
    pub shape: Vec<u64>,
    /// `[start, end)` byte range within the data region
    pub data_offsets: [u64; 2],
    /// Fields this crate does not interpret, kept so rewrites are lossless.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TensorDescriptor {
    pub fn new(dtype: impl Into<String>, shape: Vec<u64>, start: u64, end: u64) -> Self {
        Self {
            dtype: dtype.into(),
            shape,
            data_offsets: [start, end],
            extra: Map::new(),
        }
    }

    pub fn start(&self) -> u64 {
        self.data_offsets[0]
    }

    pub fn end(&self) -> u64 {
        self.data_offsets[1]
    }

    pub fn byte_len(&self) -> u64 {
        self.end().saturating_sub(self.start())
    }

    /// Expected byte length from dtype and shape, when the dtype is known.
    pub fn expected_byte_len(&self) -> Option<u64> {
        let element = element_size(&self.dtype)?;
        self.shape
            .iter()
            .try_fold(element, |acc, dim| acc.checked_mul(*dim))
    }
}

/// Size in bytes of one element of `dtype`, for the dtypes the format defines.
pub fn element_size(dtype: &str) -> Option<u64> {
    match dtype {
        "BOOL" | "U8" | "I8" | "F8_E4M3" | "F8_E5M2" => Some(1),
        "U16" | "I16" | "F16" | "BF16" => Some(2),
        "U32" | "I32" | "F32" => Some(4),
        "U64" | "I64" | "F64" => Some(8),
        _ => None,
    }
}

/// A header value: either a tensor descriptor or the reserved metadata block.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderEntry {
    Tensor(TensorDescriptor),
    Metadata(Map<String, Value>),
}

impl HeaderEntry {
    pub fn as_tensor(&self) -> Option<&TensorDescriptor> {
        match self {
            HeaderEntry::Tensor(t) => Some(t),
            HeaderEntry::Metadata(_) => None,
        }
    }
}

/// Ordered header mapping.
///
/// A header produced by the parser remembers its original bytes; any mutation
/// drops them, so an untouched header re-serializes byte-for-byte.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerHeader {
    entries: Vec<(String, HeaderEntry)>,
    raw: Option<Vec<u8>>,
}

impl ContainerHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_parsed(entries: Vec<(String, HeaderEntry)>, raw: Vec<u8>) -> Self {
        Self {
            entries,
            raw: Some(raw),
        }
    }

    /// Original header bytes, if the header is unmodified since parsing.
    pub fn raw_bytes(&self) -> Option<&[u8]> {
        self.raw.as_deref()
    }

    /// Append an entry, replacing an existing one with the same name in place.
    pub fn insert(&mut self, name: impl Into<String>, entry: HeaderEntry) {
        let name = name.into();
        self.raw = None;
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = entry,
            None => self.entries.push((name, entry)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<HeaderEntry> {
        let index = self.entries.iter().position(|(k, _)| k == name)?;
        self.raw = None;
        Some(self.entries.remove(index).1)
    }

    /// Rename an entry in place, keeping its position and value.
    ///
    /// Returns `false` if `from` is absent or `to` is already taken.
    pub fn rename(&mut self, from: &str, to: &str) -> bool {
        if from == to {
            return self.contains_key(from);
        }
        if self.contains_key(to) {
            return false;
        }
        match self.entries.iter_mut().find(|(k, _)| k == from) {
            Some(slot) => {
                slot.0 = to.to_string();
                self.raw = None;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&HeaderEntry> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Tensor entries in declaration order.
    pub fn tensors(&self) -> impl Iterator<Item = (&str, &TensorDescriptor)> {
        self.entries
            .iter()
            .filter_map(|(k, v)| v.as_tensor().map(|t| (k.as_str(), t)))
    }

    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.tensors().map(|(k, _)| k)
    }

    /// The reserved metadata block, if present.
    pub fn metadata(&self) -> Option<&Map<String, Value>> {
        self.entries.iter().find_map(|(_, v)| match v {
            HeaderEntry::Metadata(m) => Some(m),
            HeaderEntry::Tensor(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// JSON object view in declaration order.
    pub fn to_json(&self) -> serde_json::Result<Map<String, Value>> {
        self.entries
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    HeaderEntry::Tensor(t) => serde_json::to_value(t)?,
                    HeaderEntry::Metadata(m) => Value::Object(m.clone()),
                };
                Ok((k.clone(), value))
            })
            .collect()
    }
}
