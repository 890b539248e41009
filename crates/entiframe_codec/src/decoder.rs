//! Canonical CBOR decoder.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;
use std::cmp::Ordering;

/// Decode a value from CBOR bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not canonical CBOR, use a map key that
/// is not text, or contain trailing data.
pub fn from_cbor(bytes: &[u8]) -> CodecResult<Value> {
    let mut decoder = CanonicalDecoder::new(bytes);
    let value = decoder.decode()?;
    if !decoder.is_empty() {
        return Err(CodecError::invalid_structure(format!(
            "{} trailing bytes after value",
            decoder.remaining().len()
        )));
    }
    Ok(value)
}

/// A canonical CBOR decoder.
pub struct CanonicalDecoder<'a> {
    data: &'a [u8],
    pos: usize,
}

/// Maximum allowed element count for arrays and maps.
const MAX_CONTAINER_ELEMENTS: u64 = 16 * 1024 * 1024;

/// Maximum allowed byte/string length.
const MAX_BYTES_LENGTH: u64 = 256 * 1024 * 1024;

impl<'a> CanonicalDecoder<'a> {
    /// Create a new decoder for the given bytes.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Decode the next value.
    #[allow(clippy::cast_possible_wrap)]
    pub fn decode(&mut self) -> CodecResult<Value> {
        let initial_byte = self.read_byte()?;
        let major_type = initial_byte >> 5;
        let additional_info = initial_byte & 0x1f;

        match major_type {
            0 => {
                let n = self.decode_unsigned(additional_info)?;
                i64::try_from(n)
                    .map(Value::Integer)
                    .map_err(|_| CodecError::IntegerOverflow)
            }
            1 => {
                let n = self.decode_unsigned(additional_info)?;
                i64::try_from(n)
                    .map(|n| Value::Integer(-n - 1))
                    .map_err(|_| CodecError::IntegerOverflow)
            }
            2 => {
                let len = self.decode_length(additional_info, MAX_BYTES_LENGTH)?;
                Ok(Value::Bytes(self.read_bytes(len)?.to_vec()))
            }
            3 => Ok(Value::Text(self.decode_text_body(additional_info)?)),
            4 => {
                let len = self.decode_length(additional_info, MAX_CONTAINER_ELEMENTS)?;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(self.decode()?);
                }
                Ok(Value::Array(items))
            }
            5 => self.decode_object(additional_info),
            6 => Err(CodecError::unsupported_type("tagged value")),
            7 => self.decode_simple(additional_info),
            _ => Err(CodecError::invalid_structure("invalid major type")),
        }
    }

    /// Check if all bytes have been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Get remaining bytes.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    #[inline]
    fn read_byte(&mut self) -> CodecResult<u8> {
        let byte = *self.data.get(self.pos).ok_or(CodecError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    #[inline]
    fn read_bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(CodecError::UnexpectedEof)?;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or(CodecError::UnexpectedEof)?;
        self.pos = end;
        Ok(bytes)
    }

    fn decode_unsigned(&mut self, additional_info: u8) -> CodecResult<u64> {
        let non_canonical =
            || CodecError::invalid_structure("non-canonical: value could be encoded in fewer bytes");
        match additional_info {
            0..=23 => Ok(u64::from(additional_info)),
            24 => {
                let byte = self.read_byte()?;
                if byte < 24 {
                    return Err(non_canonical());
                }
                Ok(u64::from(byte))
            }
            25 => {
                let bytes = self.read_bytes(2)?;
                let value = u16::from_be_bytes([bytes[0], bytes[1]]);
                if u8::try_from(value).is_ok() {
                    return Err(non_canonical());
                }
                Ok(u64::from(value))
            }
            26 => {
                let bytes = self.read_bytes(4)?;
                let value = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                if u16::try_from(value).is_ok() {
                    return Err(non_canonical());
                }
                Ok(u64::from(value))
            }
            27 => {
                let bytes = self.read_bytes(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                let value = u64::from_be_bytes(raw);
                if u32::try_from(value).is_ok() {
                    return Err(non_canonical());
                }
                Ok(value)
            }
            31 => Err(CodecError::IndefiniteLengthForbidden),
            _ => Err(CodecError::invalid_structure("reserved additional info")),
        }
    }

    fn decode_length(&mut self, additional_info: u8, max: u64) -> CodecResult<usize> {
        let claimed = self.decode_unsigned(additional_info)?;
        if claimed > max {
            return Err(CodecError::SizeLimitExceeded {
                claimed,
                max_allowed: max,
            });
        }
        usize::try_from(claimed).map_err(|_| CodecError::IntegerOverflow)
    }

    fn decode_text_body(&mut self, additional_info: u8) -> CodecResult<String> {
        let len = self.decode_length(additional_info, MAX_BYTES_LENGTH)?;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    fn decode_object(&mut self, additional_info: u8) -> CodecResult<Value> {
        let len = self.decode_length(additional_info, MAX_CONTAINER_ELEMENTS)?;
        let mut pairs = Vec::with_capacity(len.min(1024));
        let mut prev_key: Option<&'a [u8]> = None;

        for _ in 0..len {
            let key_start = self.pos;
            let initial = self.read_byte()?;
            if initial >> 5 != 3 {
                return Err(CodecError::unsupported_type("non-text object key"));
            }
            let key = self.decode_text_body(initial & 0x1f)?;
            let key_bytes = &self.data[key_start..self.pos];

            if let Some(prev) = prev_key {
                if compare_cbor_bytes(prev, key_bytes) != Ordering::Less {
                    return Err(CodecError::invalid_structure(
                        "non-canonical: object keys not in sorted order",
                    ));
                }
            }
            prev_key = Some(key_bytes);

            let value = self.decode()?;
            pairs.push((key, value));
        }

        Ok(Value::Object(pairs))
    }

    fn decode_simple(&mut self, additional_info: u8) -> CodecResult<Value> {
        match additional_info {
            20 => Ok(Value::Bool(false)),
            21 => Ok(Value::Bool(true)),
            22 | 23 => Ok(Value::Null),
            25 | 26 => Err(CodecError::invalid_structure(
                "non-canonical: floats must use the 64-bit form",
            )),
            27 => {
                let bytes = self.read_bytes(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                let value = f64::from_be_bytes(raw);
                if value.is_nan() {
                    return Err(CodecError::NaNForbidden);
                }
                Ok(Value::Float(value))
            }
            31 => Err(CodecError::invalid_structure("break without indefinite")),
            _ => Err(CodecError::unsupported_type(format!(
                "simple value {additional_info}"
            ))),
        }
    }
}

/// Compare two CBOR byte sequences for canonical ordering.
/// Uses length-first, then bytewise comparison.
pub(crate) fn compare_cbor_bytes(a: &[u8], b: &[u8]) -> Ordering {
    match a.len().cmp(&b.len()) {
        Ordering::Equal => a.cmp(b),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::to_canonical_cbor;

    #[test]
    fn decode_scalars() {
        assert_eq!(from_cbor(&[0xf6]).unwrap(), Value::Null);
        assert_eq!(from_cbor(&[0xf5]).unwrap(), Value::Bool(true));
        assert_eq!(from_cbor(&[0x19, 0x01, 0x00]).unwrap(), Value::Integer(256));
        assert_eq!(from_cbor(&[0x38, 99]).unwrap(), Value::Integer(-100));
    }

    #[test]
    fn decode_document() {
        let doc = Value::object([
            ("id", Value::from("c1")),
            ("Address", Value::object([("City", "Oslo")])),
            ("Score", Value::Float(4.25)),
        ]);
        let decoded = from_cbor(&to_canonical_cbor(&doc).unwrap()).unwrap();
        // canonical order: "id" (shortest) first
        assert_eq!(decoded.as_object().unwrap()[0].0, "id");
        assert_eq!(decoded.get_path(&["Address", "City"]), Some(&Value::from("Oslo")));
        assert_eq!(decoded.get("Score"), Some(&Value::Float(4.25)));
    }

    #[test]
    fn reject_short_floats() {
        assert!(matches!(
            from_cbor(&[0xf9, 0x00, 0x00]),
            Err(CodecError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn reject_non_text_keys() {
        // {1: 1}
        assert!(matches!(
            from_cbor(&[0xa1, 0x01, 0x01]),
            Err(CodecError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn reject_unsorted_keys() {
        assert!(matches!(
            from_cbor(&[0xa2, 0x61, b'b', 0x01, 0x61, b'a', 0x02]),
            Err(CodecError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn reject_trailing_bytes() {
        assert!(matches!(
            from_cbor(&[0x01, 0x02]),
            Err(CodecError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn reject_non_shortest_encoding() {
        assert!(matches!(
            from_cbor(&[0x18, 23]),
            Err(CodecError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn unexpected_eof() {
        assert!(matches!(from_cbor(&[]), Err(CodecError::UnexpectedEof)));
        assert!(matches!(
            from_cbor(&[0x19, 0x01]),
            Err(CodecError::UnexpectedEof)
        ));
    }
}
