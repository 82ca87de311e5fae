//! A deliberately small QPACK (RFC 9204) subset.
//!
//! Encoding uses only literal field lines with literal names, no Huffman
//! coding and no dynamic table, so the required insert count and base are
//! always zero. Decoding additionally understands static-table references
//! because other stacks encode the CONNECT pseudo-headers that way.

/// A decoded field section: name/value pairs in field order.
pub type FieldSection = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QpackError {
    #[error("field section too short")]
    UnexpectedEnd,

    #[error("static table index {0} out of range")]
    BadStaticIndex(u64),

    #[error("dynamic table references are not supported")]
    DynamicTable,

    #[error("huffman-coded strings are not supported")]
    Huffman,

    #[error("unsupported field line encoding: {0:#04x}")]
    UnknownFieldLine(u8),

    #[error("field value is not valid UTF-8")]
    BadString,
}

/// The static-table rows (RFC 9204 appendix A) that extended-CONNECT
/// traffic actually references. Indexes not listed decode to an error,
/// which a conforming encoder for this protocol never produces.
fn static_table(index: u64) -> Option<(&'static str, &'static str)> {
    Some(match index {
        0 => (":authority", ""),
        1 => (":path", "/"),
        15 => (":method", "CONNECT"),
        16 => (":method", "DELETE"),
        17 => (":method", "GET"),
        18 => (":method", "HEAD"),
        19 => (":method", "OPTIONS"),
        20 => (":method", "POST"),
        21 => (":method", "PUT"),
        22 => (":scheme", "http"),
        23 => (":scheme", "https"),
        24 => (":status", "103"),
        25 => (":status", "200"),
        26 => (":status", "304"),
        27 => (":status", "404"),
        28 => (":status", "503"),
        63 => (":status", "100"),
        64 => (":status", "204"),
        65 => (":status", "206"),
        66 => (":status", "302"),
        67 => (":status", "400"),
        68 => (":status", "403"),
        69 => (":status", "421"),
        70 => (":status", "425"),
        71 => (":status", "500"),
        91 => ("origin", ""),
        _ => return None,
    })
}

/// Encode a field section with a zeroed section prefix.
pub fn encode_field_section(fields: &[(&str, &str)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    // Required insert count = 0, delta base = 0.
    buf.push(0x00);
    buf.push(0x00);
    for &(name, value) in fields {
        // Literal field line with literal name: 001 N=0 H=0, 3-bit prefix.
        encode_prefix_int(&mut buf, name.len() as u64, 3, 0x20);
        buf.extend_from_slice(name.as_bytes());
        // Value: H=0, 7-bit prefix.
        encode_prefix_int(&mut buf, value.len() as u64, 7, 0x00);
        buf.extend_from_slice(value.as_bytes());
    }
    buf
}

/// Decode a field section into name/value pairs.
pub fn decode_field_section(data: &[u8]) -> Result<FieldSection, QpackError> {
    let mut offset = 0;

    // Section prefix: required insert count (8-bit prefix int), then the
    // sign-and-delta-base (7-bit prefix int). Non-zero values would imply
    // dynamic-table state we do not keep.
    let (ric, n) = decode_prefix_int(data, offset, 8)?;
    offset += n;
    if ric != 0 {
        return Err(QpackError::DynamicTable);
    }
    let (_, n) = decode_prefix_int(data, offset, 7)?;
    offset += n;

    let mut fields = Vec::new();
    while offset < data.len() {
        let first = data[offset];
        if first & 0x80 != 0 {
            // Indexed field line: 1 T IIIIII.
            if first & 0x40 == 0 {
                return Err(QpackError::DynamicTable);
            }
            let (index, n) = decode_prefix_int(data, offset, 6)?;
            offset += n;
            let (name, value) =
                static_table(index).ok_or(QpackError::BadStaticIndex(index))?;
            fields.push((name.to_string(), value.to_string()));
        } else if first & 0xc0 == 0x40 {
            // Literal field line with name reference: 01 N T IIII.
            if first & 0x10 == 0 {
                return Err(QpackError::DynamicTable);
            }
            let (index, n) = decode_prefix_int(data, offset, 4)?;
            offset += n;
            let (name, _) =
                static_table(index).ok_or(QpackError::BadStaticIndex(index))?;
            let (value, n) = decode_string(data, offset, 7)?;
            offset += n;
            fields.push((name.to_string(), value));
        } else if first & 0xe0 == 0x20 {
            // Literal field line with literal name: 001 N H NNN.
            if first & 0x08 != 0 {
                return Err(QpackError::Huffman);
            }
            let (name, n) = decode_string(data, offset, 3)?;
            offset += n;
            let (value, n) = decode_string(data, offset, 7)?;
            offset += n;
            fields.push((name, value));
        } else {
            return Err(QpackError::UnknownFieldLine(first));
        }
    }
    Ok(fields)
}

fn encode_prefix_int(buf: &mut Vec<u8>, mut value: u64, prefix_bits: u8, pattern: u8) {
    let max_prefix = (1u64 << prefix_bits) - 1;
    if value < max_prefix {
        buf.push(pattern | value as u8);
        return;
    }
    buf.push(pattern | max_prefix as u8);
    value -= max_prefix;
    while value >= 0x80 {
        buf.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn decode_prefix_int(
    data: &[u8],
    offset: usize,
    prefix_bits: u8,
) -> Result<(u64, usize), QpackError> {
    let first = *data.get(offset).ok_or(QpackError::UnexpectedEnd)?;
    let max_prefix = (1u64 << prefix_bits) - 1;
    let mut value = (first as u64) & max_prefix;
    if value < max_prefix {
        return Ok((value, 1));
    }
    let mut consumed = 1;
    let mut shift = 0u32;
    loop {
        let byte = *data
            .get(offset + consumed)
            .ok_or(QpackError::UnexpectedEnd)?;
        consumed += 1;
        if shift > 56 {
            return Err(QpackError::UnexpectedEnd);
        }
        value = value
            .checked_add(((byte & 0x7f) as u64) << shift)
            .ok_or(QpackError::UnexpectedEnd)?;
        if byte & 0x80 == 0 {
            return Ok((value, consumed));
        }
        shift += 7;
    }
}

fn decode_string(
    data: &[u8],
    offset: usize,
    prefix_bits: u8,
) -> Result<(String, usize), QpackError> {
    let first = *data.get(offset).ok_or(QpackError::UnexpectedEnd)?;
    let huffman_bit = 1u8 << prefix_bits;
    if first & huffman_bit != 0 {
        return Err(QpackError::Huffman);
    }
    let (len, n) = decode_prefix_int(data, offset, prefix_bits)?;
    let start = offset + n;
    let end = start + len as usize;
    let bytes = data.get(start..end).ok_or(QpackError::UnexpectedEnd)?;
    let s = std::str::from_utf8(bytes)
        .map_err(|_| QpackError::BadString)?
        .to_string();
    Ok((s, n + len as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_roundtrip() {
        let fields = [
            (":method", "CONNECT"),
            (":protocol", "webtransport"),
            (":scheme", "https"),
            (":authority", "example.com:443"),
            (":path", "/chat"),
            ("sec-webtransport-http3-draft02", "1"),
        ];
        let buf = encode_field_section(&fields);
        let decoded = decode_field_section(&buf).unwrap();
        assert_eq!(decoded.len(), fields.len());
        for ((dn, dv), (n, v)) in decoded.iter().zip(fields) {
            assert_eq!((dn.as_str(), dv.as_str()), (n, v));
        }
    }

    #[test]
    fn decodes_static_references() {
        // 15 = :method CONNECT (indexed), then :authority via name ref.
        let buf = vec![
            0x00, 0x00, // section prefix
            0xc0 | 15, // indexed, static, index 15
            0x50, 0x03, b'f', b'o', b'o', // name ref static 0 (:authority), value "foo"
        ];
        let decoded = decode_field_section(&buf).unwrap();
        assert_eq!(decoded[0], (":method".into(), "CONNECT".into()));
        assert_eq!(decoded[1], (":authority".into(), "foo".into()));
    }

    #[test]
    fn rejects_dynamic_and_truncated() {
        assert_eq!(
            decode_field_section(&[0x00, 0x00, 0x80]),
            Err(QpackError::DynamicTable)
        );
        assert_eq!(decode_field_section(&[0x00]), Err(QpackError::UnexpectedEnd));
        assert_eq!(
            decode_field_section(&[0x00, 0x00, 0x27, 0x01]),
            Err(QpackError::UnexpectedEnd)
        );
    }

    #[test]
    fn long_values_use_continuation_bytes() {
        let long = "x".repeat(300);
        let buf = encode_field_section(&[("k", &long)]);
        let decoded = decode_field_section(&buf).unwrap();
        assert_eq!(decoded[0].1, long);
    }
}
