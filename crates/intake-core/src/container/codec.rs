//! Container header codec.
//!
//! Layout:
//! - 0-7: header length `H` (u64, little-endian)
//! - 8..8+H: UTF-8 JSON header
//! - 8+H..: data region
//!
//! Parsing validates that tensor descriptors tile the data region exactly, so
//! any header this module hands out addresses every data byte once.

use super::types::{ContainerHeader, HeaderEntry, TensorDescriptor};
use crate::config::ContainerConfig;
use crate::{IntakeError, Result};
use serde_json::{Map, Value};
use std::io::Read;

/// Size of the length prefix.
pub const PREFIX_LEN: usize = 8;

/// A fully buffered container.
#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    /// Header length as declared by the prefix this container was parsed from
    pub header_length: u64,
    pub header: ContainerHeader,
    pub data: Vec<u8>,
}

impl Container {
    /// Re-encode this container.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serialize(&self.header, &self.data)
    }
}

/// Header read from a file without buffering the data region.
#[derive(Debug, Clone)]
pub struct ParsedHeader {
    pub header_length: u64,
    pub header: ContainerHeader,
    /// Length of the data region that follows the header
    pub data_len: u64,
}

impl ParsedHeader {
    /// Byte offset where the data region starts.
    pub fn data_start(&self) -> u64 {
        PREFIX_LEN as u64 + self.header_length
    }
}

fn malformed(message: impl Into<String>) -> IntakeError {
    IntakeError::MalformedContainer {
        message: message.into(),
        path: None,
    }
}

/// Parse a complete container from memory.
pub fn parse(bytes: &[u8]) -> Result<Container> {
    let header_length = read_prefix(bytes)?;
    let available = (bytes.len() - PREFIX_LEN) as u64;
    check_declared_length(header_length, available)?;

    let header_end = PREFIX_LEN + header_length as usize;
    let data = &bytes[header_end..];
    let header = decode_header(&bytes[PREFIX_LEN..header_end])?;
    validate_offsets(&header, data.len() as u64)?;

    Ok(Container {
        header_length,
        header,
        data: data.to_vec(),
    })
}

/// Read and validate only the prefix and header from `reader`.
///
/// `total_len` is the full container size; the data region length is derived
/// from it and checked against the descriptors.
pub fn read_header<R: Read>(reader: &mut R, total_len: u64) -> Result<ParsedHeader> {
    let mut prefix = [0u8; PREFIX_LEN];
    reader.read_exact(&mut prefix).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => malformed("file shorter than the 8-byte length prefix"),
        _ => IntakeError::from(e),
    })?;
    let header_length = u64::from_le_bytes(prefix);
    let available = total_len.saturating_sub(PREFIX_LEN as u64);
    check_declared_length(header_length, available)?;

    let mut raw = vec![0u8; header_length as usize];
    reader.read_exact(&mut raw)?;
    let header = decode_header(&raw)?;

    let data_len = available - header_length;
    validate_offsets(&header, data_len)?;

    Ok(ParsedHeader {
        header_length,
        header,
        data_len,
    })
}

/// Serialize `header` followed by `data`.
///
/// The length prefix is recomputed from the encoded header. Entry order is
/// preserved.
pub fn serialize(header: &ContainerHeader, data: &[u8]) -> Result<Vec<u8>> {
    let encoded = encode_header(header)?;
    let mut out = Vec::with_capacity(PREFIX_LEN + encoded.len() + data.len());
    out.extend_from_slice(&prefix_for(&encoded));
    out.extend_from_slice(&encoded);
    out.extend_from_slice(data);
    Ok(out)
}

/// Length prefix for an encoded header.
pub fn prefix_for(encoded_header: &[u8]) -> [u8; PREFIX_LEN] {
    (encoded_header.len() as u64).to_le_bytes()
}

/// Encode the header JSON. Unmodified parsed headers return their original
/// bytes; others are emitted compact, in entry order.
pub fn encode_header(header: &ContainerHeader) -> Result<Vec<u8>> {
    if let Some(raw) = header.raw_bytes() {
        return Ok(raw.to_vec());
    }
    Ok(serde_json::to_vec(&header.to_json()?)?)
}

fn read_prefix(bytes: &[u8]) -> Result<u64> {
    let prefix: [u8; PREFIX_LEN] = bytes
        .get(..PREFIX_LEN)
        .and_then(|p| p.try_into().ok())
        .ok_or_else(|| malformed("file shorter than the 8-byte length prefix"))?;
    Ok(u64::from_le_bytes(prefix))
}

fn check_declared_length(header_length: u64, available: u64) -> Result<()> {
    if header_length > ContainerConfig::MAX_HEADER_BYTES {
        return Err(malformed(format!(
            "declared header length {header_length} exceeds the {} byte limit",
            ContainerConfig::MAX_HEADER_BYTES
        )));
    }
    if header_length > available {
        return Err(malformed(format!(
            "declared header length {header_length} exceeds the {available} bytes after the prefix"
        )));
    }
    Ok(())
}

fn decode_header(raw: &[u8]) -> Result<ContainerHeader> {
    let text = std::str::from_utf8(raw).map_err(|e| malformed(format!("header is not UTF-8: {e}")))?;
    let object: Map<String, Value> = serde_json::from_str(text)
        .map_err(|e| malformed(format!("header is not a JSON object: {e}")))?;

    let mut entries = Vec::with_capacity(object.len());
    for (name, value) in object {
        let entry = if name == ContainerConfig::METADATA_KEY {
            match value {
                Value::Object(map) => HeaderEntry::Metadata(map),
                other => {
                    return Err(malformed(format!(
                        "{} must be an object, found {}",
                        ContainerConfig::METADATA_KEY,
                        json_kind(&other)
                    )))
                }
            }
        } else {
            let descriptor: TensorDescriptor = serde_json::from_value(value)
                .map_err(|e| malformed(format!("tensor {name:?} has an invalid descriptor: {e}")))?;
            HeaderEntry::Tensor(descriptor)
        };
        entries.push((name, entry));
    }

    Ok(ContainerHeader::from_parsed(entries, raw.to_vec()))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Check that descriptors tile `[0, data_len)` with no gaps or overlaps and
/// that known dtypes agree with their byte ranges.
pub fn validate_offsets(header: &ContainerHeader, data_len: u64) -> Result<()> {
    let mut ranges: Vec<(u64, u64, &str)> = Vec::new();
    for (name, tensor) in header.tensors() {
        let (start, end) = (tensor.start(), tensor.end());
        if start > end {
            return Err(malformed(format!("tensor {name:?} has start {start} after end {end}")));
        }
        if end > data_len {
            return Err(malformed(format!(
                "tensor {name:?} ends at {end}, past the {data_len} byte data region"
            )));
        }
        if let Some(expected) = tensor.expected_byte_len() {
            if expected != end - start {
                return Err(malformed(format!(
                    "tensor {name:?} spans {} bytes but {} {:?} needs {expected}",
                    end - start,
                    tensor.dtype,
                    tensor.shape
                )));
            }
        }
        ranges.push((start, end, name));
    }

    ranges.sort_unstable_by_key(|(start, end, _)| (*start, *end));
    let mut cursor = 0u64;
    for (start, end, name) in ranges {
        if start != cursor {
            let problem = if start > cursor { "gap before" } else { "overlap at" };
            return Err(malformed(format!(
                "{problem} tensor {name:?}: expected offset {cursor}, found {start}"
            )));
        }
        cursor = end;
    }
    if cursor != data_len {
        return Err(malformed(format!(
            "descriptors cover {cursor} bytes but the data region holds {data_len}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn container_bytes(header: &str, data: &[u8]) -> Vec<u8> {
        let mut out = (header.len() as u64).to_le_bytes().to_vec();
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(data);
        out
    }

    const TWO_TENSORS: &str = r#"{"__metadata__":{"format":"pt"},"b":{"dtype":"F32","shape":[1],"data_offsets":[4,8]},"a":{"dtype":"F16","shape":[2],"data_offsets":[0,4]}}"#;

    #[test]
    fn test_parse_preserves_declaration_order() {
        let bytes = container_bytes(TWO_TENSORS, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let container = parse(&bytes).unwrap();

        let names: Vec<_> = container.header.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["__metadata__", "b", "a"]);
        assert_eq!(container.header_length, TWO_TENSORS.len() as u64);
        assert_eq!(container.data, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(
            container.header.metadata().and_then(|m| m.get("format")),
            Some(&Value::String("pt".into()))
        );
    }

    #[test]
    fn test_round_trip_is_byte_identical() {
        // Padded header, as written by the reference serializer.
        let padded = format!("{TWO_TENSORS}      ");
        let bytes = container_bytes(&padded, &[9; 8]);
        let container = parse(&bytes).unwrap();
        assert_eq!(serialize(&container.header, &container.data).unwrap(), bytes);
    }

    #[test]
    fn test_modified_header_recomputes_prefix() {
        let bytes = container_bytes(TWO_TENSORS, &[0; 8]);
        let mut container = parse(&bytes).unwrap();
        container.header.remove("__metadata__");

        let out = container.to_bytes().unwrap();
        let declared = u64::from_le_bytes(out[..8].try_into().unwrap()) as usize;
        assert_eq!(declared, out.len() - 8 - 8);
        assert_eq!(
            std::str::from_utf8(&out[8..8 + declared]).unwrap(),
            r#"{"b":{"dtype":"F32","shape":[1],"data_offsets":[4,8]},"a":{"dtype":"F16","shape":[2],"data_offsets":[0,4]}}"#
        );
        assert_eq!(&out[8 + declared..], &[0; 8]);
    }

    #[test]
    fn test_unknown_descriptor_fields_survive_rewrite() {
        let header = r#"{"a":{"dtype":"F16","shape":[1],"data_offsets":[0,2],"quant":"none"}}"#;
        let mut container = parse(&container_bytes(header, &[0, 0])).unwrap();
        container.header.rename("a", "b");
        let out = container.to_bytes().unwrap();
        let reparsed = parse(&out).unwrap();
        let tensor = reparsed.header.get("b").and_then(|e| e.as_tensor()).unwrap();
        assert_eq!(tensor.extra.get("quant"), Some(&Value::String("none".into())));
    }

    #[test]
    fn test_rejects_short_prefix() {
        let err = parse(&[1, 2, 3]).unwrap_err();
        assert_eq!(err.kind(), "malformed_container");
    }

    #[test]
    fn test_rejects_declared_length_past_end() {
        let mut bytes = container_bytes("{}", &[]);
        bytes[..8].copy_from_slice(&1000u64.to_le_bytes());
        assert!(matches!(parse(&bytes), Err(IntakeError::MalformedContainer { .. })));
    }

    #[test]
    fn test_rejects_invalid_json() {
        let bytes = container_bytes("{\"a\":", &[]);
        assert!(matches!(parse(&bytes), Err(IntakeError::MalformedContainer { .. })));
    }

    #[test]
    fn test_rejects_offsets_past_data() {
        let header = r#"{"a":{"dtype":"U8","shape":[16],"data_offsets":[0,16]}}"#;
        assert!(parse(&container_bytes(header, &[0; 8])).is_err());
    }

    #[test]
    fn test_rejects_gaps_and_overlaps() {
        let gap = r#"{"a":{"dtype":"U8","shape":[2],"data_offsets":[0,2]},"b":{"dtype":"U8","shape":[2],"data_offsets":[4,6]}}"#;
        assert!(parse(&container_bytes(gap, &[0; 6])).is_err());

        let overlap = r#"{"a":{"dtype":"U8","shape":[4],"data_offsets":[0,4]},"b":{"dtype":"U8","shape":[4],"data_offsets":[2,6]}}"#;
        assert!(parse(&container_bytes(overlap, &[0; 6])).is_err());

        let trailing = r#"{"a":{"dtype":"U8","shape":[4],"data_offsets":[0,4]}}"#;
        assert!(parse(&container_bytes(trailing, &[0; 6])).is_err());
    }

    #[test]
    fn test_rejects_shape_mismatch() {
        let header = r#"{"a":{"dtype":"F32","shape":[2],"data_offsets":[0,4]}}"#;
        assert!(parse(&container_bytes(header, &[0; 4])).is_err());
    }

    #[test]
    fn test_zero_length_tensor_is_allowed() {
        let header = r#"{"empty":{"dtype":"F32","shape":[0],"data_offsets":[0,0]},"a":{"dtype":"U8","shape":[2],"data_offsets":[0,2]}}"#;
        assert!(parse(&container_bytes(header, &[7, 7])).is_ok());
    }

    #[test]
    fn test_read_header_streams_without_data() {
        let bytes = container_bytes(TWO_TENSORS, &[0; 8]);
        let mut cursor = Cursor::new(&bytes);
        let parsed = read_header(&mut cursor, bytes.len() as u64).unwrap();
        assert_eq!(parsed.data_len, 8);
        assert_eq!(parsed.data_start(), 8 + TWO_TENSORS.len() as u64);
        assert_eq!(cursor.position(), parsed.data_start());
    }
}
