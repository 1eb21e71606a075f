//! Field types, flags and resolved field descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;
use std::sync::Arc;

use super::RecordDefinition;

/// Primitive type tag of a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    /// Bit-packed unsigned value; offset and count are in bits.
    BitField,
    /// 32-bit floating point
    Float,
    /// 64-bit floating point
    Double,
    /// Seconds (u32) followed by subseconds (u32, units of 2^-32 s)
    Time8,
    /// Fixed-length byte string, NUL padded
    String,
    /// Nested record of another registered type
    User,
}

impl FieldType {
    /// Returns the size in bytes of one element of this type.
    ///
    /// `BitField` and `User` are zero here; their extent comes from the bit
    /// count and the nested definition respectively.
    pub const fn size(&self) -> usize {
        match self {
            FieldType::Int8 | FieldType::UInt8 | FieldType::String => 1,
            FieldType::Int16 | FieldType::UInt16 => 2,
            FieldType::Int32 | FieldType::UInt32 | FieldType::Float => 4,
            FieldType::Int64 | FieldType::UInt64 | FieldType::Double | FieldType::Time8 => 8,
            FieldType::BitField | FieldType::User => 0,
        }
    }

    pub const fn is_integer(&self) -> bool {
        matches!(
            self,
            FieldType::Int8
                | FieldType::Int16
                | FieldType::Int32
                | FieldType::Int64
                | FieldType::UInt8
                | FieldType::UInt16
                | FieldType::UInt32
                | FieldType::UInt64
                | FieldType::BitField
        )
    }

    pub const fn is_real(&self) -> bool {
        matches!(self, FieldType::Float | FieldType::Double | FieldType::Time8)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Int8 => "INT8",
            FieldType::Int16 => "INT16",
            FieldType::Int32 => "INT32",
            FieldType::Int64 => "INT64",
            FieldType::UInt8 => "UINT8",
            FieldType::UInt16 => "UINT16",
            FieldType::UInt32 => "UINT32",
            FieldType::UInt64 => "UINT64",
            FieldType::BitField => "BITFIELD",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Time8 => "TIME8",
            FieldType::String => "STRING",
            FieldType::User => "USER",
        };
        f.write_str(name)
    }
}

impl FromStr for FieldType {
    type Err = crate::TracklineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INT8" => Ok(FieldType::Int8),
            "INT16" => Ok(FieldType::Int16),
            "INT32" => Ok(FieldType::Int32),
            "INT64" => Ok(FieldType::Int64),
            "UINT8" => Ok(FieldType::UInt8),
            "UINT16" => Ok(FieldType::UInt16),
            "UINT32" => Ok(FieldType::UInt32),
            "UINT64" => Ok(FieldType::UInt64),
            "BITFIELD" => Ok(FieldType::BitField),
            "FLOAT" => Ok(FieldType::Float),
            "DOUBLE" => Ok(FieldType::Double),
            "TIME8" => Ok(FieldType::Time8),
            "STRING" => Ok(FieldType::String),
            "USER" => Ok(FieldType::User),
            other => Err(crate::TracklineError::config(format!("unknown field type '{other}'"))),
        }
    }
}

/// Flag set attached to a field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldFlags(pub u16);

impl FieldFlags {
    pub const NONE: FieldFlags = FieldFlags(0);
    pub const BIGENDIAN: FieldFlags = FieldFlags(0x0001);
    /// Field holds an i32 byte offset (from the data start) to the real value.
    pub const POINTER: FieldFlags = FieldFlags(0x0002);
    pub const AUX: FieldFlags = FieldFlags(0x0004);
    /// Trailing array of records, one row per element when exported.
    pub const BATCH: FieldFlags = FieldFlags(0x0008);
    pub const X_COORD: FieldFlags = FieldFlags(0x0010);
    pub const Y_COORD: FieldFlags = FieldFlags(0x0020);
    pub const Z_COORD: FieldFlags = FieldFlags(0x0040);
    pub const TIME: FieldFlags = FieldFlags(0x0080);
    pub const INDEX: FieldFlags = FieldFlags(0x0100);

    /// Check if every bit of `flag` is set.
    pub const fn contains(&self, flag: FieldFlags) -> bool {
        (self.0 & flag.0) == flag.0
    }

    pub const fn without(self, flag: FieldFlags) -> FieldFlags {
        FieldFlags(self.0 & !flag.0)
    }
}

impl BitOr for FieldFlags {
    type Output = FieldFlags;

    fn bitor(self, rhs: FieldFlags) -> FieldFlags {
        FieldFlags(self.0 | rhs.0)
    }
}

/// A resolved field: where it lives in the record and how to interpret it.
///
/// Resolved fields are produced by [`RecordDefinition::resolve`] and carry an
/// absolute offset, so element indexing and nested paths are already applied.
#[derive(Debug, Clone)]
pub struct Field {
    pub field_type: FieldType,
    /// Byte offset from the data start (bit offset for `BitField`).
    pub offset: usize,
    /// Element count (bit length for `BitField`); 0 marks a variable-length array.
    pub count: usize,
    pub flags: FieldFlags,
    /// Definition of the nested record for `User` fields.
    pub subtype: Option<Arc<RecordDefinition>>,
}

impl Field {
    pub fn new(field_type: FieldType, offset: usize, count: usize) -> Self {
        Self { field_type, offset, count, flags: FieldFlags::NONE, subtype: None }
    }

    /// Size in bytes of a single element.
    pub fn element_size(&self) -> usize {
        match (&self.field_type, &self.subtype) {
            (FieldType::User, Some(def)) => def.size(),
            (t, _) => t.size(),
        }
    }

    /// Bytes occupied by the declared elements; 0 for variable-length fields.
    pub fn byte_len(&self) -> usize {
        match self.field_type {
            FieldType::BitField => (self.offset % 8 + self.count).div_ceil(8),
            _ => self.element_size() * self.count,
        }
    }

    pub fn is_variable_length(&self) -> bool {
        self.count == 0
    }

    pub fn is_big_endian(&self) -> bool {
        self.flags.contains(FieldFlags::BIGENDIAN)
    }

    /// Descriptor for `inner`, resolved against this field's subtype, inside
    /// element `index` of a nested-record array.
    pub fn member(&self, index: usize, inner: &Field) -> Field {
        let base = self.offset + index * self.element_size();
        let offset = match inner.field_type {
            FieldType::BitField => inner.offset + base * 8,
            _ => inner.offset + base,
        };
        Field { offset, ..inner.clone() }
    }

    /// Descriptor for element `index` of an array field.
    pub(crate) fn element(&self, index: usize) -> Field {
        match self.field_type {
            FieldType::BitField | FieldType::String => self.clone(),
            _ => Field {
                offset: self.offset + index * self.element_size(),
                count: 1,
                ..self.clone()
            },
        }
    }
}

/// Named field as declared in a definition.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub field: Field,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_sizes_match_wire_widths() {
        assert_eq!(FieldType::Int8.size(), 1);
        assert_eq!(FieldType::UInt16.size(), 2);
        assert_eq!(FieldType::Float.size(), 4);
        assert_eq!(FieldType::Time8.size(), 8);
        assert_eq!(FieldType::User.size(), 0);
    }

    #[test]
    fn type_names_parse_back() {
        for t in [FieldType::Int64, FieldType::BitField, FieldType::Double, FieldType::String] {
            assert_eq!(t.to_string().parse::<FieldType>().unwrap(), t);
        }
        assert!("COMPLEX".parse::<FieldType>().is_err());
    }

    #[test]
    fn flags_combine() {
        let flags = FieldFlags::X_COORD | FieldFlags::BIGENDIAN;
        assert!(flags.contains(FieldFlags::X_COORD));
        assert!(flags.contains(FieldFlags::BIGENDIAN));
        assert!(!flags.contains(FieldFlags::POINTER));
        assert!(!flags.without(FieldFlags::BIGENDIAN).contains(FieldFlags::BIGENDIAN));
    }

    #[test]
    fn member_offsets_into_array_elements() {
        let inner = crate::record::SchemaBuilder::new("pt")
            .field("x", FieldType::Double, 1)
            .field("y", FieldType::Float, 1)
            .build()
            .unwrap();
        let inner = Arc::new(inner);
        let y = inner.resolve("y").unwrap();
        let array = Field {
            field_type: FieldType::User,
            offset: 16,
            count: 0,
            flags: FieldFlags::NONE,
            subtype: Some(inner),
        };
        assert_eq!(array.member(0, &y).offset, 24);
        assert_eq!(array.member(3, &y).offset, 16 + 3 * 12 + 8);
        assert_eq!(array.member(3, &y).field_type, FieldType::Float);
    }

    #[test]
    fn bitfield_byte_len_covers_partial_bytes() {
        let f = Field::new(FieldType::BitField, 5, 11);
        assert_eq!(f.byte_len(), 2);
        let g = Field::new(FieldType::BitField, 0, 8);
        assert_eq!(g.byte_len(), 1);
    }
}
