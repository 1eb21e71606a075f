//! Columnar export of records into Arrow tables, Parquet and CSV files.
//!
//! [`ArrowTableBuilder`] maps a record definition onto an Arrow schema and
//! accumulates rows from records of that type. A trailing nested-record array
//! (such as the `elevation` batch of "atl06rec") is flattened so each element
//! becomes one row with the element's fields as columns.

use std::path::Path;
use std::sync::Arc;

use arrow::array::{
    ArrayRef, Float32Array, Float64Array, Int8Array, Int16Array, Int32Array, Int64Array, ListArray, RecordBatch,
    StringArray, TimestampNanosecondArray, UInt8Array, UInt16Array, UInt32Array, UInt64Array,
};
use arrow::datatypes::{
    DataType, Field as ArrowField, Float32Type, Float64Type, Int8Type, Int16Type, Int32Type, Int64Type, Schema,
    SchemaRef, TimeUnit, UInt8Type, UInt16Type, UInt32Type, UInt64Type,
};
use serde_json::json;
use tracing::{debug, info};

use crate::icesat2::ATLAS_SDP_EPOCH_GPS;
use crate::record::{Field, FieldFlags, FieldType, RecordDefinition, RecordObject, RecordRegistry, Value};
use crate::{Result, TracklineError};

/// Seconds from the Unix epoch to the GPS epoch (1980-01-06).
const GPS_EPOCH_UNIX: i64 = 315_964_800;
/// GPS minus UTC since 2017-01-01.
const GPS_LEAP_SECONDS: i64 = 18;
const NANOS_PER_SECOND: f64 = 1.0e9;

/// Coordinate reference system of ICESat-2 geolocation (ITRF2014).
pub const CRS: &str = "EPSG:7912";

/// Unix nanoseconds of a GPS time in seconds.
pub fn gps_to_unix_nanos(gps_seconds: f64) -> i64 {
    ((gps_seconds + (GPS_EPOCH_UNIX - GPS_LEAP_SECONDS) as f64) * NANOS_PER_SECOND).round() as i64
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Shape {
    Scalar,
    /// Fixed number of elements
    List(usize),
    /// Elements up to the end of the record
    Trailing,
}

#[derive(Debug)]
enum Cells {
    Scalar(Vec<Value>),
    List(Vec<Vec<Value>>),
}

#[derive(Debug)]
struct Column {
    name: String,
    /// Descriptor relative to the row start
    field: Field,
    shape: Shape,
    /// Epoch offset applied when the column is a timestamp
    time_offset: Option<f64>,
    cells: Cells,
}

impl Column {
    fn new(name: String, field: Field) -> Self {
        let shape = match (field.field_type, field.count) {
            (FieldType::String | FieldType::BitField, _) | (_, 1) => Shape::Scalar,
            (_, 0) => Shape::Trailing,
            (_, n) => Shape::List(n),
        };
        let time_offset = match field.field_type {
            FieldType::Time8 if shape == Shape::Scalar => Some(0.0),
            FieldType::Float | FieldType::Double
                if shape == Shape::Scalar && field.flags.contains(FieldFlags::TIME) =>
            {
                Some(ATLAS_SDP_EPOCH_GPS as f64)
            }
            _ => None,
        };
        let cells = match shape {
            Shape::Scalar => Cells::Scalar(Vec::new()),
            _ => Cells::List(Vec::new()),
        };
        Self { name, field, shape, time_offset, cells }
    }

    fn element_type(&self) -> DataType {
        match self.field.field_type {
            FieldType::Int8 => DataType::Int8,
            FieldType::Int16 => DataType::Int16,
            FieldType::Int32 => DataType::Int32,
            FieldType::Int64 => DataType::Int64,
            FieldType::UInt8 => DataType::UInt8,
            FieldType::UInt16 => DataType::UInt16,
            FieldType::UInt32 => DataType::UInt32,
            FieldType::UInt64 | FieldType::BitField => DataType::UInt64,
            FieldType::Float => DataType::Float32,
            FieldType::Double | FieldType::Time8 => DataType::Float64,
            FieldType::String | FieldType::User => DataType::Utf8,
        }
    }

    fn data_type(&self) -> DataType {
        match (self.shape, self.time_offset) {
            (Shape::Scalar, Some(_)) => DataType::Timestamp(TimeUnit::Nanosecond, None),
            (Shape::Scalar, None) => self.element_type(),
            _ => DataType::List(Arc::new(ArrowField::new_list_field(self.element_type(), true))),
        }
    }

    fn arrow_field(&self) -> ArrowField {
        ArrowField::new(&self.name, self.data_type(), false)
    }

    fn push(&mut self, rec: &RecordObject, field: &Field) -> Result<()> {
        match &mut self.cells {
            Cells::Scalar(values) => values.push(rec.value_at(field, 0)?),
            Cells::List(rows) => {
                let count = match self.shape {
                    Shape::List(n) => n,
                    _ => rec.allocated_size().saturating_sub(field.offset) / field.element_size().max(1),
                };
                let row = (0..count).map(|k| rec.value_at(field, k)).collect::<Result<Vec<_>>>()?;
                rows.push(row);
            }
        }
        Ok(())
    }

    fn take_array(&mut self) -> ArrayRef {
        match &mut self.cells {
            Cells::Scalar(values) => {
                let values = std::mem::take(values);
                match self.time_offset {
                    Some(offset) => Arc::new(TimestampNanosecondArray::from_iter_values(
                        values.iter().map(|v| gps_to_unix_nanos(v.as_f64() + offset)),
                    )),
                    None => scalar_array(self.field.field_type, &values),
                }
            }
            Cells::List(rows) => list_array(self.field.field_type, &std::mem::take(rows)),
        }
    }
}

fn as_u64(value: &Value) -> u64 {
    match value {
        Value::UInt64(v) | Value::BitField(v) => *v,
        other => other.as_i64() as u64,
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::Text(s) => s.clone(),
        other => other.as_f64().to_string(),
    }
}

fn scalar_array(field_type: FieldType, values: &[Value]) -> ArrayRef {
    let ints = || values.iter().map(Value::as_i64);
    let reals = || values.iter().map(Value::as_f64);
    match field_type {
        FieldType::Int8 => Arc::new(Int8Array::from_iter_values(ints().map(|v| v as i8))),
        FieldType::Int16 => Arc::new(Int16Array::from_iter_values(ints().map(|v| v as i16))),
        FieldType::Int32 => Arc::new(Int32Array::from_iter_values(ints().map(|v| v as i32))),
        FieldType::Int64 => Arc::new(Int64Array::from_iter_values(ints())),
        FieldType::UInt8 => Arc::new(UInt8Array::from_iter_values(ints().map(|v| v as u8))),
        FieldType::UInt16 => Arc::new(UInt16Array::from_iter_values(ints().map(|v| v as u16))),
        FieldType::UInt32 => Arc::new(UInt32Array::from_iter_values(ints().map(|v| v as u32))),
        FieldType::UInt64 | FieldType::BitField => Arc::new(UInt64Array::from_iter_values(values.iter().map(as_u64))),
        FieldType::Float => Arc::new(Float32Array::from_iter_values(reals().map(|v| v as f32))),
        FieldType::Double | FieldType::Time8 => Arc::new(Float64Array::from_iter_values(reals())),
        FieldType::String | FieldType::User => Arc::new(StringArray::from_iter_values(values.iter().map(text))),
    }
}

macro_rules! primitive_list {
    ($arrow:ty, $rows:expr, $convert:expr) => {
        Arc::new(ListArray::from_iter_primitive::<$arrow, _, _>(
            $rows.iter().map(|row| Some(row.iter().map(|v| Some($convert(v))).collect::<Vec<_>>())),
        ))
    };
}

fn list_array(field_type: FieldType, rows: &[Vec<Value>]) -> ArrayRef {
    match field_type {
        FieldType::Int8 => primitive_list!(Int8Type, rows, |v: &Value| v.as_i64() as i8),
        FieldType::Int16 => primitive_list!(Int16Type, rows, |v: &Value| v.as_i64() as i16),
        FieldType::Int32 => primitive_list!(Int32Type, rows, |v: &Value| v.as_i64() as i32),
        FieldType::Int64 => primitive_list!(Int64Type, rows, |v: &Value| v.as_i64()),
        FieldType::UInt8 => primitive_list!(UInt8Type, rows, |v: &Value| v.as_i64() as u8),
        FieldType::UInt16 => primitive_list!(UInt16Type, rows, |v: &Value| v.as_i64() as u16),
        FieldType::UInt32 => primitive_list!(UInt32Type, rows, |v: &Value| v.as_i64() as u32),
        FieldType::UInt64 | FieldType::BitField => primitive_list!(UInt64Type, rows, as_u64),
        FieldType::Float => primitive_list!(Float32Type, rows, |v: &Value| v.as_f64() as f32),
        FieldType::Double | FieldType::Time8 | FieldType::String | FieldType::User => {
            primitive_list!(Float64Type, rows, |v: &Value| v.as_f64())
        }
    }
}

/// Leaf columns of `def`; nested records expand to `parent.child`.
fn collect_columns(def: &RecordDefinition, prefix: &str, base: &Field, columns: &mut Vec<Column>) {
    for fd in def.fields() {
        let name = format!("{prefix}{}", fd.name);
        let field = base.member(0, &fd.field);
        match (&field.field_type, &field.subtype) {
            (FieldType::User, Some(sub)) if field.count == 1 => {
                collect_columns(sub, &format!("{name}."), &field, columns);
            }
            (FieldType::User, _) => debug!(field = %name, "skipping nested record array"),
            _ => columns.push(Column::new(name, field)),
        }
    }
}

/// Trailing nested-record array that turns each element into a row.
fn batch_field(def: &RecordDefinition) -> Option<Field> {
    def.fields()
        .iter()
        .map(|fd| &fd.field)
        .find(|f| f.field_type == FieldType::User && f.is_variable_length() && f.subtype.is_some())
        .cloned()
}

/// Accumulates records of one type into an Arrow [`RecordBatch`].
#[derive(Debug)]
pub struct ArrowTableBuilder {
    record_type: String,
    batch: Option<Field>,
    columns: Vec<Column>,
    schema: SchemaRef,
    rows: usize,
}

impl ArrowTableBuilder {
    pub fn new(registry: &RecordRegistry, record_type: &str) -> Result<Self> {
        let def = registry.get(record_type)?;
        let batch = batch_field(&def);
        let origin = Field::new(FieldType::User, 0, 1);
        let mut columns = Vec::new();
        match batch.as_ref().and_then(|b| b.subtype.as_ref()) {
            Some(element) => collect_columns(element, "", &origin, &mut columns),
            None => collect_columns(&def, "", &origin, &mut columns),
        }
        if columns.is_empty() {
            return Err(TracklineError::invalid_data(
                "arrow schema",
                format!("record type '{record_type}' has no exportable fields"),
            ));
        }
        let schema = Arc::new(Schema::new(columns.iter().map(Column::arrow_field).collect::<Vec<_>>()));
        Ok(Self { record_type: record_type.to_string(), batch, columns, schema, rows: 0 })
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    /// Rows accumulated since the last [`finish`](Self::finish).
    pub fn num_rows(&self) -> usize {
        self.rows
    }

    /// Adds the rows carried by `rec`.
    pub fn append(&mut self, rec: &RecordObject) -> Result<()> {
        if !rec.is_type(&self.record_type) {
            return Err(TracklineError::invalid_data(
                "arrow append",
                format!("record type '{}' is not {}", rec.record_type(), self.record_type),
            ));
        }
        match &self.batch {
            Some(array) => {
                let stride = array.element_size().max(1);
                let count = rec.allocated_size().saturating_sub(array.offset) / stride;
                for i in 0..count {
                    for column in &mut self.columns {
                        column.push(rec, &array.member(i, &column.field))?;
                    }
                }
                self.rows += count;
            }
            None => {
                for column in &mut self.columns {
                    let field = column.field.clone();
                    column.push(rec, &field)?;
                }
                self.rows += 1;
            }
        }
        Ok(())
    }

    /// Builds a record batch from the accumulated rows and resets the builder.
    pub fn finish(&mut self) -> Result<RecordBatch> {
        let arrays: Vec<ArrayRef> = self.columns.iter_mut().map(Column::take_array).collect();
        self.rows = 0;
        RecordBatch::try_new(self.schema(), arrays).map_err(|e| TracklineError::arrow("building record batch", e))
    }

    fn name_with(&self, flag: FieldFlags) -> Option<&str> {
        self.columns.iter().find(|c| c.field.flags.contains(flag)).map(|c| c.name.as_str())
    }

    /// `geo` key: coordinate columns and their reference system.
    fn geo_metadata(&self) -> serde_json::Value {
        json!({
            "crs": CRS,
            "x": self.name_with(FieldFlags::X_COORD),
            "y": self.name_with(FieldFlags::Y_COORD),
            "z": self.name_with(FieldFlags::Z_COORD),
        })
    }

    /// `pandas` key: column layout with the time column as index.
    fn pandas_metadata(&self) -> serde_json::Value {
        let time = self.columns.iter().find(|c| c.time_offset.is_some()).map(|c| c.name.clone());
        let columns: Vec<serde_json::Value> = self
            .columns
            .iter()
            .map(|c| {
                let (pandas_type, numpy_type) = match c.data_type() {
                    DataType::Timestamp(..) => ("datetime".to_string(), "datetime64[ns]".to_string()),
                    DataType::Utf8 => ("unicode".to_string(), "object".to_string()),
                    DataType::List(_) => ("list".to_string(), "object".to_string()),
                    other => {
                        let name = other.to_string().to_lowercase();
                        (name.clone(), name)
                    }
                };
                json!({
                    "name": c.name,
                    "field_name": c.name,
                    "pandas_type": pandas_type,
                    "numpy_type": numpy_type,
                    "metadata": null,
                })
            })
            .collect();
        json!({
            "index_columns": time.into_iter().collect::<Vec<_>>(),
            "column_indexes": [],
            "columns": columns,
            "creator": { "library": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION") },
        })
    }

    /// Writes the accumulated rows to a Parquet file, embedding `geo`,
    /// `trackline` (the supplied provenance) and `pandas` metadata.
    #[cfg(feature = "parquet")]
    pub fn write_parquet(&mut self, path: &Path, provenance: &serde_json::Value) -> Result<usize> {
        use parquet::arrow::ArrowWriter;
        use parquet::basic::Compression;
        use parquet::file::metadata::KeyValue;
        use parquet::file::properties::WriterProperties;

        let metadata = vec![
            KeyValue::new("geo".to_string(), self.geo_metadata().to_string()),
            KeyValue::new("trackline".to_string(), provenance.to_string()),
            KeyValue::new("pandas".to_string(), self.pandas_metadata().to_string()),
        ];
        let batch = self.finish()?;
        let file = std::fs::File::create(path).map_err(|e| TracklineError::file_error(path.to_path_buf(), e))?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_key_value_metadata(Some(metadata))
            .build();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
            .map_err(|e| TracklineError::arrow("opening parquet writer", e))?;
        writer.write(&batch).map_err(|e| TracklineError::arrow("writing parquet", e))?;
        writer.close().map_err(|e| TracklineError::arrow("closing parquet", e))?;
        info!(path = %path.display(), rows = batch.num_rows(), record_type = %self.record_type, "wrote parquet");
        Ok(batch.num_rows())
    }

    /// Writes the accumulated rows as CSV with a header line.
    pub fn write_csv(&mut self, path: &Path) -> Result<usize> {
        let batch = self.finish()?;
        let file = std::fs::File::create(path).map_err(|e| TracklineError::file_error(path.to_path_buf(), e))?;
        let mut writer = arrow::csv::Writer::new(file);
        writer.write(&batch).map_err(|e| TracklineError::arrow("writing csv", e))?;
        info!(path = %path.display(), rows = batch.num_rows(), record_type = %self.record_type, "wrote csv");
        Ok(batch.num_rows())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SchemaBuilder;
    use arrow::array::Array;
    use arrow::datatypes::DataType;

    fn registry() -> RecordRegistry {
        let registry = RecordRegistry::new();
        let point = registry
            .define_with(
                SchemaBuilder::new("test.point")
                    .field("x", FieldType::Double, 1)
                    .flags(FieldFlags::X_COORD)
                    .field("y", FieldType::Double, 1)
                    .flags(FieldFlags::Y_COORD),
            )
            .unwrap();
        registry
            .define_with(
                SchemaBuilder::new("test.sample")
                    .field("id", FieldType::UInt32, 1)
                    .field("label", FieldType::String, 8)
                    .field("values", FieldType::Float, 3)
                    .field("delta_time", FieldType::Double, 1)
                    .flags(FieldFlags::TIME)
                    .user("loc", &point, 1),
            )
            .unwrap();
        let item = registry
            .define_with(SchemaBuilder::new("test.item").field("a", FieldType::UInt16, 1).field("b", FieldType::Double, 1))
            .unwrap();
        registry.define_with(SchemaBuilder::new("test.items").batch("items", &item)).unwrap();
        registry
    }

    fn sample(registry: &RecordRegistry, id: i64) -> RecordObject {
        let mut rec = RecordObject::new(registry, "test.sample").unwrap();
        rec.set_integer("id", 0, id).unwrap();
        rec.set_text("label", 0, "gt1l").unwrap();
        for k in 0..3 {
            rec.set_real("values", k, id as f64 + k as f64 / 2.0).unwrap();
        }
        rec.set_real("delta_time", 0, 0.0).unwrap();
        rec.set_real("loc.x", 0, -105.0).unwrap();
        rec.set_real("loc.y", 0, 40.0).unwrap();
        rec
    }

    #[test]
    fn schema_maps_field_types() {
        let builder = ArrowTableBuilder::new(&registry(), "test.sample").unwrap();
        let schema = builder.schema();
        let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, ["id", "label", "values", "delta_time", "loc.x", "loc.y"]);
        assert_eq!(schema.field(0).data_type(), &DataType::UInt32);
        assert_eq!(schema.field(1).data_type(), &DataType::Utf8);
        assert!(matches!(schema.field(2).data_type(), DataType::List(_)));
        assert_eq!(schema.field(3).data_type(), &DataType::Timestamp(TimeUnit::Nanosecond, None));
        assert_eq!(schema.field(4).data_type(), &DataType::Float64);
    }

    #[test]
    fn rows_accumulate_until_finish() {
        let registry = registry();
        let mut builder = ArrowTableBuilder::new(&registry, "test.sample").unwrap();
        builder.append(&sample(&registry, 1)).unwrap();
        builder.append(&sample(&registry, 2)).unwrap();
        assert_eq!(builder.num_rows(), 2);

        let batch = builder.finish().unwrap();
        assert_eq!(batch.num_rows(), 2);
        let ids = batch.column(0).as_any().downcast_ref::<UInt32Array>().unwrap();
        assert_eq!(ids.values(), &[1, 2]);
        let labels = batch.column(1).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(labels.value(1), "gt1l");
        let values = batch.column(2).as_any().downcast_ref::<ListArray>().unwrap();
        let second = values.value(1);
        let second = second.as_any().downcast_ref::<Float32Array>().unwrap();
        assert_eq!(second.values(), &[2.0, 2.5, 3.0]);
        let times = batch.column(3).as_any().downcast_ref::<TimestampNanosecondArray>().unwrap();
        // ATLAS SDP epoch, 2018-01-01T00:00:00Z
        assert_eq!(times.value(0), 1_514_764_800_000_000_000);

        assert_eq!(builder.num_rows(), 0);
        assert_eq!(builder.finish().unwrap().num_rows(), 0);
    }

    #[test]
    fn batch_elements_become_rows() {
        let registry = registry();
        let def = registry.get("test.items").unwrap();
        let array = def.resolve("items").unwrap();
        let size = array.offset + 3 * array.element_size();
        let mut rec = RecordObject::with_size(&registry, "test.items", size).unwrap();
        for i in 0..3 {
            rec.set_integer(&format!("items[{i}].a"), 0, 10 + i as i64).unwrap();
            rec.set_real(&format!("items[{i}].b"), 0, i as f64 * 0.25).unwrap();
        }

        let mut builder = ArrowTableBuilder::new(&registry, "test.items").unwrap();
        builder.append(&rec).unwrap();
        let batch = builder.finish().unwrap();
        assert_eq!(batch.num_rows(), 3);
        let a = batch.column(0).as_any().downcast_ref::<UInt16Array>().unwrap();
        assert_eq!(a.values(), &[10, 11, 12]);
        let b = batch.column(1).as_any().downcast_ref::<Float64Array>().unwrap();
        assert_eq!(b.value(2), 0.5);
    }

    #[test]
    fn other_record_types_are_rejected() {
        let registry = registry();
        let mut builder = ArrowTableBuilder::new(&registry, "test.items").unwrap();
        assert!(builder.append(&sample(&registry, 1)).is_err());
        assert!(ArrowTableBuilder::new(&registry, "test.missing").is_err());
    }

    #[test]
    fn csv_has_header_and_rows() {
        let registry = registry();
        let mut builder = ArrowTableBuilder::new(&registry, "test.sample").unwrap();
        builder.append(&sample(&registry, 7)).unwrap();
        // lists are not representable in csv
        builder.columns.retain(|c| c.shape == Shape::Scalar);
        builder.schema = Arc::new(Schema::new(builder.columns.iter().map(Column::arrow_field).collect::<Vec<_>>()));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.csv");
        assert_eq!(builder.write_csv(&path).unwrap(), 1);
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("id,label,delta_time,loc.x,loc.y"));
        assert!(lines.next().unwrap().starts_with("7,gt1l,2018-01-01T00:00:00"));
    }

    #[cfg(feature = "parquet")]
    #[test]
    fn parquet_carries_metadata() {
        use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

        let registry = registry();
        let mut builder = ArrowTableBuilder::new(&registry, "test.sample").unwrap();
        for id in 0..5 {
            builder.append(&sample(&registry, id)).unwrap();
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.parquet");
        let provenance = json!({ "cnf": 4, "ats": 20.0 });
        assert_eq!(builder.write_parquet(&path, &provenance).unwrap(), 5);

        let reader = ParquetRecordBatchReaderBuilder::try_new(std::fs::File::open(&path).unwrap()).unwrap();
        let kv = reader.metadata().file_metadata().key_value_metadata().unwrap().clone();
        let lookup = |key: &str| kv.iter().find(|k| k.key == key).and_then(|k| k.value.clone());
        let geo: serde_json::Value = serde_json::from_str(&lookup("geo").unwrap()).unwrap();
        assert_eq!(geo["crs"], CRS);
        assert_eq!(geo["x"], "loc.x");
        assert_eq!(geo["y"], "loc.y");
        let trackline: serde_json::Value = serde_json::from_str(&lookup("trackline").unwrap()).unwrap();
        assert_eq!(trackline, provenance);
        let pandas: serde_json::Value = serde_json::from_str(&lookup("pandas").unwrap()).unwrap();
        assert_eq!(pandas["index_columns"][0], "delta_time");

        let rows: usize = reader.build().unwrap().map(|b| b.unwrap().num_rows()).sum();
        assert_eq!(rows, 5);
    }
}
