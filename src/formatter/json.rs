use std::io::{BufRead, Write};

use serde_json::Value;

use super::{Formatter, stream_error};
use crate::error::{CacheError, CacheResult};
use crate::storage::OpenMode;

/// One compact JSON document per line.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn name(&self) -> &'static str {
        "json"
    }

    fn read_mode(&self) -> OpenMode {
        OpenMode::READ_TEXT
    }

    fn write_mode(&self) -> OpenMode {
        OpenMode::WRITE_TEXT
    }

    fn write_record(&self, out: &mut dyn Write, record: &Value) -> CacheResult<()> {
        serde_json::to_writer(&mut *out, record).map_err(|err| {
            if err.is_io() {
                stream_error(err.into())
            } else {
                CacheError::serialization(err)
            }
        })?;
        out.write_all(b"\n").map_err(stream_error)
    }

    fn read_record(&self, input: &mut dyn BufRead) -> CacheResult<Option<Value>> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = input.read_line(&mut line).map_err(stream_error)?;
            if read == 0 {
                return Ok(None);
            }
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(&line)
                .map(Some)
                .map_err(CacheError::serialization);
        }
    }
}
