use crate::common::date_time::Interval;
use crate::common::logical_type::LogicalType;
use crate::common::value::Value;
use crate::error::{DbError, DbResult};
use crate::types::{NodeOffset, PageIdx, INVALID_PAGE_IDX};

/// Inline payload capacity of a string descriptor.
pub const STRING_INLINE_LEN: usize = 12;
pub const DESCRIPTOR_SIZE: usize = 16;

/// 16-byte slot representation of a STRING value. Short strings are
/// stored inline; long strings keep a 4-byte prefix and point into the
/// overflow file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrDescriptor {
    pub len: u32,
    pub inline: [u8; STRING_INLINE_LEN],
    pub page_idx: PageIdx,
    pub offset_in_page: u32,
}

impl StrDescriptor {
    pub fn inline_from(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= STRING_INLINE_LEN);
        let mut inline = [0u8; STRING_INLINE_LEN];
        inline[..bytes.len()].copy_from_slice(bytes);
        Self {
            len: bytes.len() as u32,
            inline,
            page_idx: INVALID_PAGE_IDX,
            offset_in_page: 0,
        }
    }

    pub fn overflow_from(bytes: &[u8], page_idx: PageIdx, offset_in_page: u32) -> Self {
        let mut inline = [0u8; STRING_INLINE_LEN];
        inline[..4].copy_from_slice(&bytes[..4]);
        Self {
            len: bytes.len() as u32,
            inline,
            page_idx,
            offset_in_page,
        }
    }

    pub fn is_inline(&self) -> bool {
        self.len as usize <= STRING_INLINE_LEN
    }

    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut out = [0u8; DESCRIPTOR_SIZE];
        out[0..4].copy_from_slice(&self.len.to_le_bytes());
        if self.is_inline() {
            out[4..16].copy_from_slice(&self.inline);
        } else {
            out[4..8].copy_from_slice(&self.inline[..4]);
            out[8..12].copy_from_slice(&self.page_idx.to_le_bytes());
            out[12..16].copy_from_slice(&self.offset_in_page.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let mut inline = [0u8; STRING_INLINE_LEN];
        if len as usize <= STRING_INLINE_LEN {
            inline.copy_from_slice(&bytes[4..16]);
            Self {
                len,
                inline,
                page_idx: INVALID_PAGE_IDX,
                offset_in_page: 0,
            }
        } else {
            inline[..4].copy_from_slice(&bytes[4..8]);
            Self {
                len,
                inline,
                page_idx: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
                offset_in_page: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            }
        }
    }

    pub fn inline_str(&self) -> &[u8] {
        &self.inline[..self.len as usize]
    }
}

/// 16-byte slot representation of a VAR_LIST value; elements always
/// live in the overflow file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListDescriptor {
    pub num_elements: u64,
    pub page_idx: PageIdx,
    pub offset_in_page: u32,
}

impl ListDescriptor {
    pub fn empty() -> Self {
        Self {
            num_elements: 0,
            page_idx: INVALID_PAGE_IDX,
            offset_in_page: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut out = [0u8; DESCRIPTOR_SIZE];
        out[0..8].copy_from_slice(&self.num_elements.to_le_bytes());
        out[8..12].copy_from_slice(&self.page_idx.to_le_bytes());
        out[12..16].copy_from_slice(&self.offset_in_page.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            num_elements: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            page_idx: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            offset_in_page: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
        }
    }
}

/// Encode a value of a non-overflow type into its fixed-width slot
/// bytes. Strings and var lists go through the overflow writer instead.
pub fn encode_fixed_value(value: &Value, ty: &LogicalType) -> DbResult<Vec<u8>> {
    let mismatch = || {
        DbError::copy(format!(
            "value {:?} does not fit data type {}",
            value, ty
        ))
    };
    let bytes = match (value, ty) {
        (Value::Bool(v), LogicalType::Bool) => vec![*v as u8],
        (Value::Int16(v), LogicalType::Int16) => v.to_le_bytes().to_vec(),
        (Value::Int32(v), LogicalType::Int32) => v.to_le_bytes().to_vec(),
        (Value::Int64(v), LogicalType::Int64) | (Value::Int64(v), LogicalType::Serial) => {
            v.to_le_bytes().to_vec()
        }
        (Value::Float(v), LogicalType::Float) => v.to_le_bytes().to_vec(),
        (Value::Double(v), LogicalType::Double) => v.to_le_bytes().to_vec(),
        (Value::Date(v), LogicalType::Date) => v.to_le_bytes().to_vec(),
        (Value::Timestamp(v), LogicalType::Timestamp) => v.to_le_bytes().to_vec(),
        (Value::Interval(v), LogicalType::Interval) => {
            let mut out = Vec::with_capacity(16);
            out.extend_from_slice(&v.months.to_le_bytes());
            out.extend_from_slice(&v.days.to_le_bytes());
            out.extend_from_slice(&v.micros.to_le_bytes());
            out
        }
        (Value::InternalId(id), LogicalType::InternalId) => id.offset.to_le_bytes().to_vec(),
        (Value::FixedList(items), LogicalType::FixedList(child, n)) => {
            if items.len() != *n as usize {
                return Err(mismatch());
            }
            let mut out = Vec::with_capacity(ty.element_size());
            for item in items {
                out.extend_from_slice(&encode_fixed_value(item, child)?);
            }
            out
        }
        _ => return Err(mismatch()),
    };
    debug_assert_eq!(bytes.len(), ty.element_size());
    Ok(bytes)
}

/// Decode a fixed-width slot back into a value. The caller resolves
/// overflow-bearing types before calling this.
pub fn decode_fixed_value(bytes: &[u8], ty: &LogicalType) -> Value {
    match ty {
        LogicalType::Bool => Value::Bool(bytes[0] == 1),
        LogicalType::Int16 => Value::Int16(i16::from_le_bytes(bytes[..2].try_into().unwrap())),
        LogicalType::Int32 => Value::Int32(i32::from_le_bytes(bytes[..4].try_into().unwrap())),
        LogicalType::Int64 | LogicalType::Serial => {
            Value::Int64(i64::from_le_bytes(bytes[..8].try_into().unwrap()))
        }
        LogicalType::Float => Value::Float(f32::from_le_bytes(bytes[..4].try_into().unwrap())),
        LogicalType::Double => Value::Double(f64::from_le_bytes(bytes[..8].try_into().unwrap())),
        LogicalType::Date => Value::Date(i32::from_le_bytes(bytes[..4].try_into().unwrap())),
        LogicalType::Timestamp => {
            Value::Timestamp(i64::from_le_bytes(bytes[..8].try_into().unwrap()))
        }
        LogicalType::Interval => Value::Interval(Interval {
            months: i32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            days: i32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            micros: i64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        }),
        LogicalType::FixedList(child, n) => {
            let child_size = child.element_size();
            let mut items = Vec::with_capacity(*n as usize);
            for i in 0..*n as usize {
                items.push(decode_fixed_value(
                    &bytes[i * child_size..(i + 1) * child_size],
                    child,
                ));
            }
            Value::FixedList(items)
        }
        LogicalType::InternalId => {
            let offset = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as NodeOffset;
            Value::Int64(offset as i64)
        }
        other => panic!("decode_fixed_value called for {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_descriptor_inline_round_trip() {
        let d = StrDescriptor::inline_from(b"hi there");
        assert!(d.is_inline());
        let back = StrDescriptor::from_bytes(&d.to_bytes());
        assert_eq!(back.inline_str(), b"hi there");
    }

    #[test]
    fn string_descriptor_overflow_round_trip() {
        let d = StrDescriptor::overflow_from(b"a string that is long", 7, 123);
        assert!(!d.is_inline());
        let back = StrDescriptor::from_bytes(&d.to_bytes());
        assert_eq!(back.len, 21);
        assert_eq!(back.page_idx, 7);
        assert_eq!(back.offset_in_page, 123);
        assert_eq!(&back.inline[..4], b"a st");
    }

    #[test]
    fn fixed_value_round_trip() {
        let ty = LogicalType::FixedList(Box::new(LogicalType::Int32), 2);
        let v = Value::FixedList(vec![Value::Int32(5), Value::Int32(-9)]);
        let bytes = encode_fixed_value(&v, &ty).unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(decode_fixed_value(&bytes, &ty), v);
    }
}
