//! Schema-driven codec for fixed-layout binary records.
//!
//! A [`Schema`] is an ordered list of named fields with explicit widths and
//! byte orders. Decoding walks the fields sequentially from the start of the
//! buffer; encoding writes them back in the same order, zero-filling any
//! field the record does not set.
//!
//! ```
//! use vms_types::codec::{FieldType, Record, Schema};
//!
//! const ENTRY: Schema = Schema::new(&[
//!     ("bootable", FieldType::U8),
//!     ("start_lba", FieldType::U32Le),
//! ]);
//!
//! let mut record = Record::new();
//! record.set_uint("start_lba", 2048);
//! let bytes = ENTRY.encode(&record).unwrap();
//! assert_eq!(bytes, [0, 0x00, 0x08, 0, 0]);
//! assert_eq!(ENTRY.decode(&bytes).unwrap().uint("start_lba").unwrap(), 2048);
//! ```

use crate::{ParseError, ensure_slice, trim_nul_padded};

/// Width and interpretation of a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    U8,
    U16Le,
    U32Le,
    U64Le,
    U16Be,
    U32Be,
    U64Be,
    /// Opaque byte array of fixed length.
    Bytes(usize),
    /// NUL/space padded ASCII of fixed length.
    Ascii(usize),
}

impl FieldType {
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16Le | Self::U16Be => 2,
            Self::U32Le | Self::U32Be => 4,
            Self::U64Le | Self::U64Be => 8,
            Self::Bytes(n) | Self::Ascii(n) => n,
        }
    }

    const fn is_integer(self) -> bool {
        !matches!(self, Self::Bytes(_) | Self::Ascii(_))
    }
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Uint(u64),
    Bytes(Vec<u8>),
    Text(String),
}

/// Ordered field layout of a binary record.
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    fields: &'static [(&'static str, FieldType)],
}

impl Schema {
    #[must_use]
    pub const fn new(fields: &'static [(&'static str, FieldType)]) -> Self {
        Self { fields }
    }

    /// Encoded size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.fields.iter().map(|(_, ty)| ty.size()).sum()
    }

    /// Byte offset of `name` inside the record.
    #[must_use]
    pub fn offset_of(&self, name: &str) -> Option<usize> {
        let mut offset = 0;
        for (field, ty) in self.fields {
            if *field == name {
                return Some(offset);
            }
            offset += ty.size();
        }
        None
    }

    pub fn decode(&self, data: &[u8]) -> Result<Record, ParseError> {
        self.decode_at(data, 0)
    }

    /// Decode a record starting at `base` within `data`.
    pub fn decode_at(&self, data: &[u8], base: usize) -> Result<Record, ParseError> {
        let raw = ensure_slice(data, base, self.size())?;
        let mut offset = 0;
        let mut values = Vec::with_capacity(self.fields.len());
        for (name, ty) in self.fields {
            let bytes = &raw[offset..offset + ty.size()];
            let value = match *ty {
                FieldType::U8 => Value::Uint(u64::from(bytes[0])),
                FieldType::U16Le => Value::Uint(u64::from(u16::from_le_bytes([bytes[0], bytes[1]]))),
                FieldType::U16Be => Value::Uint(u64::from(u16::from_be_bytes([bytes[0], bytes[1]]))),
                FieldType::U32Le => Value::Uint(u64::from(u32::from_le_bytes([
                    bytes[0], bytes[1], bytes[2], bytes[3],
                ]))),
                FieldType::U32Be => Value::Uint(u64::from(u32::from_be_bytes([
                    bytes[0], bytes[1], bytes[2], bytes[3],
                ]))),
                FieldType::U64Le => Value::Uint(u64::from_le_bytes(to_array8(bytes))),
                FieldType::U64Be => Value::Uint(u64::from_be_bytes(to_array8(bytes))),
                FieldType::Bytes(_) => Value::Bytes(bytes.to_vec()),
                FieldType::Ascii(_) => Value::Text(trim_nul_padded(bytes)),
            };
            values.push((*name, value));
            offset += ty.size();
        }
        Ok(Record { values })
    }

    /// Encode `record` into a freshly allocated buffer of [`Self::size`] bytes.
    pub fn encode(&self, record: &Record) -> Result<Vec<u8>, ParseError> {
        let mut out = vec![0_u8; self.size()];
        self.encode_into(record, &mut out)?;
        Ok(out)
    }

    /// Encode `record` over the start of `out`.
    pub fn encode_into(&self, record: &Record, out: &mut [u8]) -> Result<(), ParseError> {
        if out.len() < self.size() {
            return Err(ParseError::InsufficientData {
                needed: self.size(),
                offset: 0,
                actual: out.len(),
            });
        }
        for (name, value) in &record.values {
            if !self.fields.iter().any(|(field, _)| field == name) {
                return Err(ParseError::InvalidField {
                    field: name,
                    reason: "not part of schema",
                });
            }
        }
        let mut offset = 0;
        for (name, ty) in self.fields {
            let dst = &mut out[offset..offset + ty.size()];
            if let Some(value) = record.get(name) {
                write_field(name, *ty, value, dst)?;
            } else {
                dst.fill(0);
            }
            offset += ty.size();
        }
        Ok(())
    }
}

fn to_array8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0_u8; 8];
    out.copy_from_slice(bytes);
    out
}

fn write_field(
    name: &'static str,
    ty: FieldType,
    value: &Value,
    dst: &mut [u8],
) -> Result<(), ParseError> {
    match (ty, value) {
        (ty, Value::Uint(v)) if ty.is_integer() => {
            let width_bits = ty.size() * 8;
            if width_bits < 64 && *v >> width_bits != 0 {
                return Err(ParseError::IntegerConversion { field: name });
            }
            match ty {
                FieldType::U8 | FieldType::U16Le | FieldType::U32Le | FieldType::U64Le => {
                    dst.copy_from_slice(&v.to_le_bytes()[..ty.size()]);
                }
                _ => dst.copy_from_slice(&v.to_be_bytes()[8 - ty.size()..]),
            }
            Ok(())
        }
        (FieldType::Bytes(n), Value::Bytes(bytes)) | (FieldType::Ascii(n), Value::Bytes(bytes)) => {
            copy_padded(name, n, bytes, dst)
        }
        (FieldType::Ascii(n), Value::Text(text)) => copy_padded(name, n, text.as_bytes(), dst),
        _ => Err(ParseError::InvalidField {
            field: name,
            reason: "value does not match field type",
        }),
    }
}

fn copy_padded(name: &'static str, n: usize, src: &[u8], dst: &mut [u8]) -> Result<(), ParseError> {
    if src.len() > n {
        return Err(ParseError::InvalidField {
            field: name,
            reason: "value longer than field",
        });
    }
    dst[..src.len()].copy_from_slice(src);
    dst[src.len()..].fill(0);
    Ok(())
}

/// Named field values, in schema order after decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    values: Vec<(&'static str, Value)>,
}

impl Record {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, value)| value)
    }

    pub fn set(&mut self, name: &'static str, value: Value) -> &mut Self {
        if let Some(slot) = self.values.iter_mut().find(|(field, _)| *field == name) {
            slot.1 = value;
        } else {
            self.values.push((name, value));
        }
        self
    }

    pub fn set_uint(&mut self, name: &'static str, value: u64) -> &mut Self {
        self.set(name, Value::Uint(value))
    }

    pub fn set_bytes(&mut self, name: &'static str, value: &[u8]) -> &mut Self {
        self.set(name, Value::Bytes(value.to_vec()))
    }

    pub fn uint(&self, name: &'static str) -> Result<u64, ParseError> {
        match self.get(name) {
            Some(Value::Uint(v)) => Ok(*v),
            Some(_) => Err(ParseError::InvalidField {
                field: name,
                reason: "not an integer field",
            }),
            None => Err(missing(name)),
        }
    }

    pub fn bytes(&self, name: &'static str) -> Result<&[u8], ParseError> {
        match self.get(name) {
            Some(Value::Bytes(v)) => Ok(v),
            Some(_) => Err(ParseError::InvalidField {
                field: name,
                reason: "not a byte field",
            }),
            None => Err(missing(name)),
        }
    }

    pub fn text(&self, name: &'static str) -> Result<&str, ParseError> {
        match self.get(name) {
            Some(Value::Text(v)) => Ok(v),
            Some(_) => Err(ParseError::InvalidField {
                field: name,
                reason: "not a text field",
            }),
            None => Err(missing(name)),
        }
    }
}

fn missing(name: &'static str) -> ParseError {
    ParseError::InvalidField {
        field: name,
        reason: "missing from record",
    }
}
