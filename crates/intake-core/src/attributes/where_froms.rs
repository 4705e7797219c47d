//! `kMDItemWhereFroms` value encoding.
//!
//! Spotlight expects this attribute as a binary property list holding an
//! array of URL strings. Only that one shape is needed here, so the encoder
//! and decoder handle exactly: one top-level array of strings.

/// Binary plist magic and version.
const MAGIC: &[u8; 8] = b"bplist00";
/// Trailer length in bytes.
const TRAILER_LEN: usize = 32;

/// Encode `urls` as a binary plist array of strings.
pub fn encode(urls: &[&str]) -> Vec<u8> {
    // Object 0 is the array, objects 1..=n are the strings.
    let object_count = urls.len() + 1;
    let ref_size = min_int_size(object_count as u64);

    let mut out = MAGIC.to_vec();
    let mut offsets = Vec::with_capacity(object_count);

    offsets.push(out.len() as u64);
    write_marker(&mut out, 0xA0, urls.len());
    for index in 1..object_count {
        write_sized_int(&mut out, index as u64, ref_size);
    }

    for url in urls {
        offsets.push(out.len() as u64);
        if url.is_ascii() {
            write_marker(&mut out, 0x50, url.len());
            out.extend_from_slice(url.as_bytes());
        } else {
            let units: Vec<u16> = url.encode_utf16().collect();
            write_marker(&mut out, 0x60, units.len());
            for unit in units {
                out.extend_from_slice(&unit.to_be_bytes());
            }
        }
    }

    let offset_table_offset = out.len() as u64;
    let offset_size = min_int_size(offset_table_offset);
    for offset in &offsets {
        write_sized_int(&mut out, *offset, offset_size);
    }

    out.extend_from_slice(&[0u8; 6]);
    out.push(offset_size as u8);
    out.push(ref_size as u8);
    out.extend_from_slice(&(object_count as u64).to_be_bytes());
    out.extend_from_slice(&0u64.to_be_bytes());
    out.extend_from_slice(&offset_table_offset.to_be_bytes());
    out
}

/// Decode a binary plist produced by [`encode`] (or by macOS for the same
/// shape). Returns `None` for anything that is not an array of strings,
/// including offsets or lengths that point outside `bytes`.
pub fn decode(bytes: &[u8]) -> Option<Vec<String>> {
    if bytes.len() < MAGIC.len() + TRAILER_LEN || &bytes[..MAGIC.len()] != MAGIC {
        return None;
    }
    let trailer = &bytes[bytes.len() - TRAILER_LEN..];
    let offset_size = trailer[6] as usize;
    let ref_size = trailer[7] as usize;
    let object_count = u64::from_be_bytes(trailer[8..16].try_into().ok()?) as usize;
    let top_object = u64::from_be_bytes(trailer[16..24].try_into().ok()?) as usize;
    let table_offset = u64::from_be_bytes(trailer[24..32].try_into().ok()?) as usize;

    let object_offset = |index: usize| -> Option<usize> {
        let start = table_offset.checked_add(index.checked_mul(offset_size)?)?;
        read_sized_int(bytes.get(start..start.checked_add(offset_size)?)?).map(|v| v as usize)
    };
    if top_object >= object_count {
        return None;
    }

    let array_at = object_offset(top_object)?;
    let (marker, count, body) = read_marker(bytes, array_at)?;
    if marker != 0xA0 || count > object_count {
        return None;
    }

    let mut urls = Vec::with_capacity(count);
    for i in 0..count {
        let ref_at = body.checked_add(i.checked_mul(ref_size)?)?;
        let index = read_sized_int(bytes.get(ref_at..ref_at.checked_add(ref_size)?)?)? as usize;
        if index >= object_count {
            return None;
        }
        let (kind, len, start) = read_marker(bytes, object_offset(index)?)?;
        let url = match kind {
            0x50 => String::from_utf8(bytes.get(start..start.checked_add(len)?)?.to_vec()).ok()?,
            0x60 => {
                let raw = bytes.get(start..start.checked_add(len.checked_mul(2)?)?)?;
                let units: Vec<u16> = raw
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                String::from_utf16(&units).ok()?
            }
            _ => return None,
        };
        urls.push(url);
    }
    Some(urls)
}

fn min_int_size(value: u64) -> usize {
    match value {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFFFF_FFFF => 4,
        _ => 8,
    }
}

fn write_sized_int(out: &mut Vec<u8>, value: u64, size: usize) {
    out.extend_from_slice(&value.to_be_bytes()[8 - size..]);
}

fn read_sized_int(raw: &[u8]) -> Option<u64> {
    if raw.is_empty() || raw.len() > 8 {
        return None;
    }
    Some(raw.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

/// Object marker with a length nibble; lengths >= 15 spill into an int object.
fn write_marker(out: &mut Vec<u8>, kind: u8, len: usize) {
    if len < 15 {
        out.push(kind | len as u8);
    } else {
        out.push(kind | 0x0F);
        let size = min_int_size(len as u64);
        let exponent = size.trailing_zeros() as u8;
        out.push(0x10 | exponent);
        write_sized_int(out, len as u64, size);
    }
}

/// Returns `(kind, len, body_offset)`.
fn read_marker(bytes: &[u8], at: usize) -> Option<(u8, usize, usize)> {
    let marker = *bytes.get(at)?;
    let kind = marker & 0xF0;
    let nibble = (marker & 0x0F) as usize;
    if nibble < 15 {
        return Some((kind, nibble, at + 1));
    }
    let int_at = at.checked_add(1)?;
    let int_marker = *bytes.get(int_at)?;
    if int_marker & 0xF0 != 0x10 {
        return None;
    }
    let size = 1usize << (int_marker & 0x0F);
    let body = int_at.checked_add(1)?;
    let end = body.checked_add(size)?;
    let len = read_sized_int(bytes.get(body..end)?)? as usize;
    Some((kind, len, end))
}
