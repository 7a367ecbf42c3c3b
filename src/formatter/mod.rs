//! Artifact serialization.
//!
//! Every artifact starts with a boolean marker record. `false` is followed by
//! exactly one record holding the whole value. `true` is followed by one
//! record per element of a lazy sequence, written as the sequence drains and
//! read back one at a time until the input runs out.

pub mod json;
pub mod msgpack;

use std::fmt;
use std::io::{self, BufRead, Write};
use std::iter;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{CacheError, CacheResult};
use crate::storage::OpenMode;

pub use json::JsonFormatter;
pub use msgpack::MessagePackFormatter;

pub trait Formatter: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn read_mode(&self) -> OpenMode;

    fn write_mode(&self) -> OpenMode;

    fn write_record(&self, out: &mut dyn Write, record: &Value) -> CacheResult<()>;

    /// `Ok(None)` once `input` is exhausted.
    fn read_record(&self, input: &mut dyn BufRead) -> CacheResult<Option<Value>>;
}

/// Resolves a formatter from its configuration name.
pub fn by_name(name: &str) -> CacheResult<Arc<dyn Formatter>> {
    match name.to_ascii_lowercase().as_str() {
        "json" => Ok(Arc::new(JsonFormatter)),
        "msgpack" | "messagepack" => Ok(Arc::new(MessagePackFormatter)),
        other => Err(CacheError::config(format!(
            "unknown formatter `{other}` (expected `json` or `msgpack`)"
        ))),
    }
}

/// Classifies a failed read or write on a record stream: bytes that cannot
/// be decoded are a serialization problem, anything else is I/O.
pub(crate) fn stream_error(err: io::Error) -> CacheError {
    match err.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => CacheError::serialization(err),
        _ => CacheError::stream(err),
    }
}

/// A result about to be stored.
pub enum Artifact<'a> {
    Value(Value),
    Sequence(Box<dyn Iterator<Item = CacheResult<Value>> + 'a>),
}

impl fmt::Debug for Artifact<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Sequence(_) => f.write_str("Sequence(..)"),
        }
    }
}

/// Writes `artifact` with its marker and returns how many records followed
/// the marker.
pub fn write(
    formatter: &dyn Formatter,
    out: &mut dyn Write,
    artifact: Artifact<'_>,
) -> CacheResult<usize> {
    match artifact {
        Artifact::Value(value) => {
            formatter.write_record(out, &Value::Bool(false))?;
            formatter.write_record(out, &value)?;
            Ok(1)
        }
        Artifact::Sequence(items) => {
            formatter.write_record(out, &Value::Bool(true))?;
            let mut written = 0;
            for item in items {
                formatter.write_record(out, &item?)?;
                written += 1;
            }
            Ok(written)
        }
    }
}

/// Reads the marker of a stored artifact. Sequences stay lazy.
pub fn read(formatter: Arc<dyn Formatter>, mut input: Box<dyn BufRead + Send>) -> CacheResult<Stored> {
    match formatter.read_record(&mut *input)? {
        Some(Value::Bool(true)) => Ok(Stored::Sequence(RecordIter {
            formatter,
            input: Some(input),
        })),
        Some(Value::Bool(false)) => formatter
            .read_record(&mut *input)?
            .map(Stored::Value)
            .ok_or_else(|| CacheError::serialization("artifact ends before its value")),
        Some(_) => Err(CacheError::serialization(
            "artifact does not start with a sequence marker",
        )),
        None => Err(CacheError::serialization("artifact is empty")),
    }
}

#[derive(Debug)]
pub enum Stored {
    Value(Value),
    Sequence(RecordIter),
}

impl Stored {
    /// The whole artifact as one value; sequences are collected into an array.
    pub fn into_value(self) -> CacheResult<Value> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Sequence(records) => records.collect::<CacheResult<Vec<_>>>().map(Value::Array),
        }
    }

    /// The artifact as a sequence of records; a stored array counts as one.
    pub fn into_records(self) -> CacheResult<Records> {
        match self {
            Self::Sequence(records) => Ok(Records::Streamed(records)),
            Self::Value(Value::Array(items)) => Ok(Records::Buffered(items.into_iter())),
            Self::Value(_) => Err(CacheError::serialization(
                "stored artifact is a single value, not a sequence",
            )),
        }
    }
}

#[derive(Debug)]
pub enum Records {
    Streamed(RecordIter),
    Buffered(std::vec::IntoIter<Value>),
}

impl Iterator for Records {
    type Item = CacheResult<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Streamed(records) => records.next(),
            Self::Buffered(items) => items.next().map(Ok),
        }
    }
}

/// Re-parses a stored sequence one record at a time.
pub struct RecordIter {
    formatter: Arc<dyn Formatter>,
    input: Option<Box<dyn BufRead + Send>>,
}

impl Iterator for RecordIter {
    type Item = CacheResult<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        let input = self.input.as_mut()?;
        match self.formatter.read_record(&mut **input) {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.input = None;
                None
            }
            Err(err) => {
                self.input = None;
                Some(Err(err))
            }
        }
    }
}

impl iter::FusedIterator for RecordIter {}

impl fmt::Debug for RecordIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordIter")
            .field("formatter", &self.formatter.name())
            .field("exhausted", &self.input.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use serde_json::json;

    use super::*;

    fn stored(formatter: Arc<dyn Formatter>, artifact: Artifact<'_>) -> CacheResult<Stored> {
        let mut bytes = Vec::new();
        write(formatter.as_ref(), &mut bytes, artifact)?;
        read(formatter, Box::new(Cursor::new(bytes)))
    }

    #[test]
    fn scalar_and_sequence_markers_survive_both_formatters() -> CacheResult<()> {
        for formatter in [by_name("json")?, by_name("msgpack")?] {
            let value = stored(formatter.clone(), Artifact::Value(json!({"a": [1, 2]})))?;
            assert_eq!(value.into_value()?, json!({"a": [1, 2]}));

            let items = (0..3).map(|n| Ok(json!(n)));
            let sequence = stored(formatter, Artifact::Sequence(Box::new(items)))?;
            assert!(matches!(sequence, Stored::Sequence(_)));
            let replayed = sequence.into_records()?.collect::<CacheResult<Vec<_>>>()?;
            assert_eq!(replayed, vec![json!(0), json!(1), json!(2)]);
        }
        Ok(())
    }

    #[test]
    fn artifact_without_marker_is_rejected() {
        let input = Box::new(Cursor::new(b"42\n".to_vec()));
        let err = read(Arc::new(JsonFormatter), input).unwrap_err();
        assert!(matches!(err, CacheError::Serialization { .. }));
    }

    /// Accepts nothing.
    struct Refusing;

    impl Write for Refusing {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failing_sinks_surface_as_io_errors() -> CacheResult<()> {
        for formatter in [by_name("json")?, by_name("msgpack")?] {
            let err = write(formatter.as_ref(), &mut Refusing, Artifact::Value(json!([1, 2])))
                .unwrap_err();
            assert!(matches!(err, CacheError::Io { .. }), "{}: {err:?}", formatter.name());
        }
        Ok(())
    }

    #[test]
    fn truncated_records_are_serialization_errors() {
        let mut bytes = Vec::new();
        write(&MessagePackFormatter, &mut bytes, Artifact::Value(json!("a long string value")))
            .unwrap();
        bytes.truncate(bytes.len() - 3);
        let err = read(Arc::new(MessagePackFormatter), Box::new(Cursor::new(bytes)))
            .and_then(Stored::into_value)
            .unwrap_err();
        assert!(matches!(err, CacheError::Serialization { .. }), "{err:?}");
    }

    #[test]
    fn unknown_formatter_name_is_a_config_error() {
        assert!(matches!(by_name("pickle"), Err(CacheError::Config { .. })));
    }
}
