//! # Structured Log Sink
//!
//! Typed, schema-checked log output. A [`LogWriter`] is initialized once
//! with a named stream and its field schema, then receives rows whose
//! values must match that schema positionally. An unset field (`None`)
//! is distinct from an empty value and serializes as `null`, never as
//! `""` or `0`.
//!
//! Two writers are provided: [`MemoryWriter`] for tests and in-process
//! inspection, and [`JsonWriter`] producing one JSON object per row on
//! any `io::Write`.

use std::io;

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::conn::ConnRecord;
use crate::event::{EventRecord, FieldValue};

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Semantic type of one log field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Int,
    Count,
    Port,
    Addr,
    Subnet,
    Time,
    Interval,
    Double,
    Str,
    Enum,
    Vector,
}

impl FieldKind {
    /// Kind of a concrete value.
    pub fn of(value: &FieldValue) -> Self {
        match value {
            FieldValue::Bool(_) => FieldKind::Bool,
            FieldValue::Int(_) => FieldKind::Int,
            FieldValue::Count(_) => FieldKind::Count,
            FieldValue::Port(_) => FieldKind::Port,
            FieldValue::Addr(_) => FieldKind::Addr,
            FieldValue::Subnet { .. } => FieldKind::Subnet,
            FieldValue::Time(_) => FieldKind::Time,
            FieldValue::Interval(_) => FieldKind::Interval,
            FieldValue::Double(_) => FieldKind::Double,
            FieldValue::Str(_) => FieldKind::Str,
            FieldValue::Enum(_) => FieldKind::Enum,
            FieldValue::Vector(_) => FieldKind::Vector,
        }
    }
}

/// One column of a log stream: name plus semantic type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogField {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl LogField {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind }
    }
}

/// Log output failure.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("writer received a row before init")]
    NotInitialized,
    #[error("row has {got} values, schema has {expected}")]
    WidthMismatch { expected: usize, got: usize },
    #[error("field {field:?} expects {expected:?}, got {got:?}")]
    TypeMismatch {
        field: &'static str,
        expected: FieldKind,
        got: FieldKind,
    },
    #[error("log output failed: {0}")]
    Io(#[from] io::Error),
}

/// Check one row against a schema: width, then per-field kind. Unset
/// values pass any kind.
fn check_row(schema: &[LogField], row: &[Option<FieldValue>]) -> Result<(), LogError> {
    if row.len() != schema.len() {
        return Err(LogError::WidthMismatch {
            expected: schema.len(),
            got: row.len(),
        });
    }
    for (field, value) in schema.iter().zip(row) {
        if let Some(value) = value {
            let got = FieldKind::of(value);
            if got != field.kind {
                return Err(LogError::TypeMismatch {
                    field: field.name,
                    expected: field.kind,
                    got,
                });
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Writer contract
// ---------------------------------------------------------------------------

/// Destination for one log stream. `init` runs exactly once before any
/// `write`; rows are validated against the schema handed to `init`.
pub trait LogWriter: Send {
    /// Bind this writer to a named stream with its field schema.
    fn init(&mut self, stream: &'static str, schema: &[LogField]) -> Result<(), LogError>;

    /// Emit one row. Values are positional against the init schema;
    /// `None` means unset.
    fn write(&mut self, row: &[Option<FieldValue>]) -> Result<(), LogError>;
}

// ---------------------------------------------------------------------------
// Memory writer
// ---------------------------------------------------------------------------

/// In-memory writer retaining every row, for tests and inspection.
#[derive(Default)]
pub struct MemoryWriter {
    stream: Option<&'static str>,
    schema: Vec<LogField>,
    rows: Vec<Vec<Option<FieldValue>>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows written so far.
    pub fn rows(&self) -> &[Vec<Option<FieldValue>>] {
        &self.rows
    }

    /// Stream name bound at init, if any.
    pub fn stream(&self) -> Option<&'static str> {
        self.stream
    }
}

impl LogWriter for MemoryWriter {
    fn init(&mut self, stream: &'static str, schema: &[LogField]) -> Result<(), LogError> {
        self.stream = Some(stream);
        self.schema = schema.to_vec();
        Ok(())
    }

    fn write(&mut self, row: &[Option<FieldValue>]) -> Result<(), LogError> {
        if self.stream.is_none() {
            return Err(LogError::NotInitialized);
        }
        check_row(&self.schema, row)?;
        self.rows.push(row.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON writer
// ---------------------------------------------------------------------------

/// Writer emitting one JSON object per row, newline-terminated.
pub struct JsonWriter<W: io::Write + Send> {
    out: W,
    stream: Option<&'static str>,
    schema: Vec<LogField>,
}

impl<W: io::Write + Send> JsonWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            stream: None,
            schema: Vec::new(),
        }
    }

    /// Take back the underlying output.
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: io::Write + Send> LogWriter for JsonWriter<W> {
    fn init(&mut self, stream: &'static str, schema: &[LogField]) -> Result<(), LogError> {
        self.stream = Some(stream);
        self.schema = schema.to_vec();
        Ok(())
    }

    fn write(&mut self, row: &[Option<FieldValue>]) -> Result<(), LogError> {
        let stream = self.stream.ok_or(LogError::NotInitialized)?;
        check_row(&self.schema, row)?;
        let mut obj = Map::new();
        obj.insert("_stream".into(), Value::String(stream.into()));
        for (field, value) in self.schema.iter().zip(row) {
            obj.insert(field.name.into(), value_to_json(value.as_ref()));
        }
        serde_json::to_writer(&mut self.out, &Value::Object(obj))
            .map_err(|e| LogError::Io(e.into()))?;
        self.out.write_all(b"\n")?;
        Ok(())
    }
}

/// JSON rendering of one field value; unset becomes `null`.
fn value_to_json(value: Option<&FieldValue>) -> Value {
    let value = match value {
        Some(v) => v,
        None => return Value::Null,
    };
    match value {
        FieldValue::Bool(b) => json!(b),
        FieldValue::Int(i) => json!(i),
        FieldValue::Count(c) => json!(c),
        FieldValue::Port(p) => json!(p),
        FieldValue::Addr(a) => json!(a.to_string()),
        FieldValue::Subnet { addr, prefix } => json!(format!("{addr}/{prefix}")),
        FieldValue::Time(t) => json!(t),
        FieldValue::Interval(i) => json!(i),
        FieldValue::Double(d) => json!(d),
        FieldValue::Str(s) => json!(s),
        FieldValue::Enum(e) => json!(e),
        FieldValue::Vector(vs) => Value::Array(vs.iter().map(|v| value_to_json(Some(v))).collect()),
    }
}

// ---------------------------------------------------------------------------
// Connection log stream
// ---------------------------------------------------------------------------

/// Schema of the connection summary stream.
pub fn conn_schema() -> Vec<LogField> {
    vec![
        LogField::new("uid", FieldKind::Str),
        LogField::new("orig_addr", FieldKind::Addr),
        LogField::new("orig_port", FieldKind::Port),
        LogField::new("resp_addr", FieldKind::Addr),
        LogField::new("resp_port", FieldKind::Port),
        LogField::new("service", FieldKind::Enum),
        LogField::new("ts", FieldKind::Time),
        LogField::new("duration", FieldKind::Interval),
        LogField::new("orig_bytes", FieldKind::Count),
        LogField::new("resp_bytes", FieldKind::Count),
        LogField::new("orig_chunks", FieldKind::Count),
        LogField::new("resp_chunks", FieldKind::Count),
        LogField::new("orig_gap_bytes", FieldKind::Count),
        LogField::new("resp_gap_bytes", FieldKind::Count),
    ]
}

/// Row for one connection summary, positional against [`conn_schema`].
/// The service field of an unidentified connection is unset.
pub fn conn_row(record: &ConnRecord) -> Vec<Option<FieldValue>> {
    record.record().fields.into_iter().map(|(_, v)| v).collect()
}

/// Generic row from any event record (schema inferred from the record's
/// own field order).
pub fn record_row(record: &EventRecord) -> Vec<Option<FieldValue>> {
    record.fields.iter().map(|(_, v)| v.clone()).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ConnTuple;
    use crate::conn::{Chain, Connection};

    fn sample_record(service: Option<&str>) -> ConnRecord {
        let tuple = ConnTuple::tcp(
            "192.168.1.10".parse().unwrap(),
            49152,
            "192.168.1.20".parse().unwrap(),
            502,
        );
        let mut rec = Connection::new(tuple, 100.0, Chain::Unidentified).to_record();
        rec.service = service.map(str::to_string);
        rec
    }

    #[test]
    fn test_conn_row_matches_conn_schema() {
        let schema = conn_schema();
        let row = conn_row(&sample_record(Some("modbus")));
        assert!(check_row(&schema, &row).is_ok());
        // Unset service still matches the schema.
        let row = conn_row(&sample_record(None));
        assert!(check_row(&schema, &row).is_ok());
    }

    #[test]
    fn test_memory_writer_rejects_bad_rows() {
        let mut w = MemoryWriter::new();
        assert!(matches!(
            w.write(&[Some(FieldValue::Bool(true))]),
            Err(LogError::NotInitialized)
        ));

        w.init("conn", &conn_schema()).unwrap();
        assert!(matches!(
            w.write(&[Some(FieldValue::Bool(true))]),
            Err(LogError::WidthMismatch { .. })
        ));

        let mut row = conn_row(&sample_record(None));
        row[0] = Some(FieldValue::Count(7)); // uid must be Str
        assert!(matches!(
            w.write(&row),
            Err(LogError::TypeMismatch { field: "uid", .. })
        ));

        w.write(&conn_row(&sample_record(Some("socks")))).unwrap();
        assert_eq!(w.rows().len(), 1);
    }

    #[test]
    fn test_json_writer_unset_is_null_not_empty() {
        let mut w = JsonWriter::new(Vec::new());
        w.init("conn", &conn_schema()).unwrap();
        w.write(&conn_row(&sample_record(None))).unwrap();
        let out = w.into_inner();
        let line: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(line["_stream"], "conn");
        assert_eq!(line["service"], Value::Null);
        assert_eq!(line["orig_addr"], "192.168.1.10");
        assert_eq!(line["resp_port"], 502);
    }

    #[test]
    fn test_json_writer_identified_service() {
        let mut w = JsonWriter::new(Vec::new());
        w.init("conn", &conn_schema()).unwrap();
        w.write(&conn_row(&sample_record(Some("modbus")))).unwrap();
        let line: Value = serde_json::from_slice(&w.into_inner()).unwrap();
        assert_eq!(line["service"], "modbus");
    }
}
