use std::io::{BufRead, Write};

use serde_json::Value;

use super::{Formatter, stream_error};
use crate::error::{CacheError, CacheResult};
use crate::storage::OpenMode;

/// Back-to-back MessagePack documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessagePackFormatter;

impl Formatter for MessagePackFormatter {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn read_mode(&self) -> OpenMode {
        OpenMode::READ_BINARY
    }

    fn write_mode(&self) -> OpenMode {
        OpenMode::WRITE_BINARY
    }

    fn write_record(&self, out: &mut dyn Write, record: &Value) -> CacheResult<()> {
        let bytes = rmp_serde::to_vec(record).map_err(CacheError::serialization)?;
        out.write_all(&bytes).map_err(stream_error)
    }

    fn read_record(&self, input: &mut dyn BufRead) -> CacheResult<Option<Value>> {
        let exhausted = input.fill_buf().map_err(stream_error)?.is_empty();
        if exhausted {
            return Ok(None);
        }
        rmp_serde::from_read(input).map(Some).map_err(|err| match err {
            rmp_serde::decode::Error::InvalidMarkerRead(err)
            | rmp_serde::decode::Error::InvalidDataRead(err) => stream_error(err),
            other => CacheError::serialization(other),
        })
    }
}
