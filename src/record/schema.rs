//! Record definitions and the typed schema builder.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use super::field::{Field, FieldDef, FieldFlags, FieldType};
use crate::TracklineError;

/// Reasons a definition is rejected at registration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("record definition '{name}' already registered")]
    Duplicate { name: String },

    #[error("field '{field}' lies outside record '{name}'")]
    FieldOutOfBounds { name: String, field: String },

    #[error("field '{field}' declared twice in record '{name}'")]
    DuplicateField { name: String, field: String },

    #[error("id field '{field}' not declared in record '{name}'")]
    IdFieldNotFound { name: String, field: String },

    #[error("invalid size {size} for record '{name}'")]
    SizeError { name: String, size: usize },
}

impl From<DefinitionError> for TracklineError {
    fn from(err: DefinitionError) -> Self {
        match err {
            DefinitionError::Duplicate { name } => TracklineError::DuplicateDefinition { name },
            DefinitionError::FieldOutOfBounds { ref name, .. }
            | DefinitionError::DuplicateField { ref name, .. }
            | DefinitionError::IdFieldNotFound { ref name, .. }
            | DefinitionError::SizeError { ref name, .. } => {
                TracklineError::invalid_definition(name.clone(), err.to_string())
            }
        }
    }
}

/// Framing convention of a record type on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// `type_name \0 data`
    Generic,
    /// CCSDS command packet; the primary header identifies the type.
    CcsdsCommand { apid: u16, function_code: u8 },
    /// CCSDS telemetry packet
    CcsdsTelemetry { apid: u16 },
}

impl RecordKind {
    pub fn is_ccsds(&self) -> bool {
        !matches!(self, RecordKind::Generic)
    }
}

/// Immutable layout of one record type.
#[derive(Debug)]
pub struct RecordDefinition {
    name: String,
    id_field: Option<String>,
    fields: Vec<FieldDef>,
    index: HashMap<String, usize>,
    size: usize,
    kind: RecordKind,
}

impl RecordDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id_field(&self) -> Option<&str> {
        self.id_field.as_deref()
    }

    /// Declared record size; excludes any variable-length trailing payload.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Declared fields in layout order.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Resolves a field path to an absolute descriptor.
    ///
    /// Accepts plain names, element indexing (`"h_mean[1]"`) and dotted paths
    /// into nested records (`"photons[3].height"`). An index past a fixed
    /// element count resolves to `None`; variable-length arrays are bounded
    /// later by the record's allocated buffer.
    pub fn resolve(&self, path: &str) -> Option<Field> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let (base, element) = parse_indexed(head)?;
        let def = self.fields.get(*self.index.get(base)?)?;
        let mut field = def.field.clone();

        if let Some(i) = element {
            if !field.is_variable_length()
                && field.field_type != FieldType::BitField
                && i >= field.count
            {
                return None;
            }
            field = field.element(i);
        }

        match rest {
            None => Some(field),
            Some(rest) => {
                let subtype = field.subtype.clone()?;
                let mut inner = subtype.resolve(rest)?;
                inner.offset += match inner.field_type {
                    FieldType::BitField => field.offset * 8,
                    _ => field.offset,
                };
                Some(inner)
            }
        }
    }
}

fn parse_indexed(head: &str) -> Option<(&str, Option<usize>)> {
    match head.split_once('[') {
        None => Some((head, None)),
        Some((base, tail)) => {
            let index = tail.strip_suffix(']')?.trim().parse().ok()?;
            Some((base, Some(index)))
        }
    }
}

/// Typed builder producing an immutable [`RecordDefinition`].
///
/// Offsets are laid out sequentially unless given explicitly.
///
/// ```rust
/// use trackline::record::{FieldType, SchemaBuilder};
///
/// let def = SchemaBuilder::new("sample")
///     .field("id", FieldType::UInt32, 1)
///     .field("values", FieldType::Float, 4)
///     .id_field("id")
///     .build()
///     .unwrap();
/// assert_eq!(def.size(), 20);
/// ```
#[derive(Debug)]
pub struct SchemaBuilder {
    name: String,
    id_field: Option<String>,
    fields: Vec<FieldDef>,
    size: Option<usize>,
    cursor: usize,
    kind: RecordKind,
}

impl SchemaBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id_field: None,
            fields: Vec::new(),
            size: None,
            cursor: 0,
            kind: RecordKind::Generic,
        }
    }

    /// Adds a primitive field at the next free offset.
    pub fn field(self, name: impl Into<String>, field_type: FieldType, count: usize) -> Self {
        let offset = match field_type {
            FieldType::BitField => self.cursor * 8,
            _ => self.cursor,
        };
        self.field_at(name, field_type, offset, count)
    }

    /// Adds a primitive field at an explicit offset (bits for `BitField`).
    pub fn field_at(
        mut self,
        name: impl Into<String>,
        field_type: FieldType,
        offset: usize,
        count: usize,
    ) -> Self {
        let field = Field::new(field_type, offset, count);
        self.push(name.into(), field);
        self
    }

    /// Adds a nested record field; `count == 0` makes it a trailing array.
    pub fn user(
        mut self,
        name: impl Into<String>,
        subtype: &Arc<RecordDefinition>,
        count: usize,
    ) -> Self {
        let field = Field {
            field_type: FieldType::User,
            offset: self.cursor,
            count,
            flags: FieldFlags::NONE,
            subtype: Some(Arc::clone(subtype)),
        };
        self.push(name.into(), field);
        self
    }

    /// Adds a trailing batch array whose declared size covers one element.
    pub fn batch(self, name: impl Into<String>, subtype: &Arc<RecordDefinition>) -> Self {
        self.user(name, subtype, 0).flags(FieldFlags::BATCH)
    }

    /// Sets flags on the most recently added field.
    pub fn flags(mut self, flags: FieldFlags) -> Self {
        if let Some(last) = self.fields.last_mut() {
            last.field.flags = last.field.flags | flags;
        }
        self
    }

    pub fn id_field(mut self, name: impl Into<String>) -> Self {
        self.id_field = Some(name.into());
        self
    }

    /// Overrides the computed record size.
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub(crate) fn kind(mut self, kind: RecordKind) -> Self {
        self.kind = kind;
        self
    }

    fn push(&mut self, name: String, field: Field) {
        let end = match field.field_type {
            FieldType::BitField => (field.offset + field.count).div_ceil(8),
            FieldType::User if field.is_variable_length() => field.offset,
            _ => field.offset + field.byte_len(),
        };
        self.cursor = self.cursor.max(end);
        self.fields.push(FieldDef { name, field });
    }

    pub fn build(self) -> Result<RecordDefinition, DefinitionError> {
        let batch_end = self
            .fields
            .iter()
            .filter(|f| f.field.flags.contains(FieldFlags::BATCH))
            .map(|f| f.field.offset + f.field.element_size())
            .max()
            .unwrap_or(0);
        let size = self.size.unwrap_or(self.cursor.max(batch_end));
        if size == 0 {
            return Err(DefinitionError::SizeError { name: self.name, size });
        }

        let mut index = HashMap::with_capacity(self.fields.len());
        for (i, def) in self.fields.iter().enumerate() {
            if index.insert(def.name.clone(), i).is_some() {
                return Err(DefinitionError::DuplicateField {
                    name: self.name.clone(),
                    field: def.name.clone(),
                });
            }

            let f = &def.field;
            let fits = match f.field_type {
                FieldType::BitField => f.count > 0 && f.offset + f.count <= size * 8,
                _ if f.is_variable_length() => f.offset <= size,
                _ => f.offset + f.byte_len() <= size,
            };
            if !fits {
                return Err(DefinitionError::FieldOutOfBounds {
                    name: self.name.clone(),
                    field: def.name.clone(),
                });
            }
        }

        if let Some(id) = &self.id_field {
            if !index.contains_key(id) {
                return Err(DefinitionError::IdFieldNotFound {
                    name: self.name.clone(),
                    field: id.clone(),
                });
            }
        }

        Ok(RecordDefinition {
            name: self.name,
            id_field: self.id_field,
            fields: self.fields,
            index,
            size,
            kind: self.kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> Arc<RecordDefinition> {
        Arc::new(
            SchemaBuilder::new("point")
                .field("x", FieldType::Double, 1)
                .field("y", FieldType::Double, 1)
                .field("tag", FieldType::UInt8, 1)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn builder_lays_out_sequentially() {
        let def = point();
        assert_eq!(def.size(), 17);
        assert_eq!(def.resolve("y").unwrap().offset, 8);
        assert_eq!(def.resolve("tag").unwrap().offset, 16);
    }

    #[test]
    fn indexed_and_nested_paths_resolve() {
        let p = point();
        let def = SchemaBuilder::new("track")
            .field("id", FieldType::UInt32, 1)
            .field("h", FieldType::Float, 3)
            .user("points", &p, 0)
            .id_field("id")
            .build()
            .unwrap();

        let h2 = def.resolve("h[2]").unwrap();
        assert_eq!((h2.offset, h2.count), (12, 1));
        assert!(def.resolve("h[3]").is_none());

        let nested = def.resolve("points[2].tag").unwrap();
        assert_eq!(nested.offset, 16 + 2 * 17 + 16);
        assert_eq!(nested.field_type, FieldType::UInt8);

        assert!(def.resolve("points.z").is_none());
        assert!(def.resolve("h[x]").is_none());
    }

    #[test]
    fn batch_size_covers_one_element() {
        let p = point();
        let def = SchemaBuilder::new("points").batch("pts", &p).build().unwrap();
        assert_eq!(def.size(), 17);
        assert!(def.resolve("pts").unwrap().flags.contains(FieldFlags::BATCH));
    }

    #[test]
    fn invalid_definitions_are_rejected() {
        let out = SchemaBuilder::new("bad")
            .field("a", FieldType::UInt32, 1)
            .field_at("b", FieldType::Double, 4, 1)
            .size(8)
            .build();
        assert!(matches!(out, Err(DefinitionError::FieldOutOfBounds { .. })));

        let no_id = SchemaBuilder::new("bad").field("a", FieldType::UInt8, 1).id_field("b").build();
        assert!(matches!(no_id, Err(DefinitionError::IdFieldNotFound { .. })));

        let empty = SchemaBuilder::new("bad").build();
        assert!(matches!(empty, Err(DefinitionError::SizeError { .. })));

        let twice = SchemaBuilder::new("bad")
            .field("a", FieldType::UInt8, 1)
            .field("a", FieldType::UInt8, 1)
            .build();
        assert!(matches!(twice, Err(DefinitionError::DuplicateField { .. })));
    }

    #[test]
    fn definition_errors_convert() {
        let err: TracklineError = DefinitionError::Duplicate { name: "x".into() }.into();
        assert!(matches!(err, TracklineError::DuplicateDefinition { .. }));
        let err: TracklineError =
            DefinitionError::SizeError { name: "x".into(), size: 0 }.into();
        assert!(matches!(err, TracklineError::InvalidDefinition { .. }));
    }
}
