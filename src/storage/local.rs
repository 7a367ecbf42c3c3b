use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::lock::FileLock;
use super::{Access, ArtifactWriter, Handle, OpenMode, Storage, validate_key};
use crate::error::{CacheError, CacheResult};

pub const DEFAULT_STALE_LOCK_AFTER: Duration = Duration::from_secs(10 * 60);

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

impl FromStr for Compression {
    type Err = CacheError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "gzip" | "gz" => Ok(Self::Gzip),
            other => Err(CacheError::config(format!(
                "unknown compression `{other}` (expected `none` or `gzip`)"
            ))),
        }
    }
}

/// One file per key under a root directory.
///
/// Writes land in a hidden temp file next to their target and are renamed
/// into place on commit, so readers only ever see complete artifacts.
/// Compressed artifacts are recognised by their gzip header on read,
/// whatever the store's own compression setting.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
    compression: Compression,
    stale_lock_after: Duration,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            root: std::path::absolute(&root).unwrap_or(root),
            compression: Compression::None,
            stale_lock_after: DEFAULT_STALE_LOCK_AFTER,
        }
    }

    #[must_use]
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    #[must_use]
    pub fn with_stale_lock_after(mut self, stale_lock_after: Duration) -> Self {
        self.stale_lock_after = stale_lock_after;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.lock"))
    }

    fn open_reader(&self, key: &str) -> CacheResult<Box<dyn BufRead + Send>> {
        let path = self.path_for(key);
        let file = File::open(&path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => CacheError::NotFound {
                key: key.to_string(),
            },
            _ => CacheError::io(&path, err),
        })?;

        let mut reader = BufReader::new(file);
        let compressed = reader
            .fill_buf()
            .map_err(|err| CacheError::io(&path, err))?
            .starts_with(&GZIP_MAGIC);
        if compressed {
            Ok(Box::new(BufReader::new(MultiGzDecoder::new(reader))))
        } else {
            Ok(Box::new(reader))
        }
    }

    fn open_writer(&self, key: &str) -> CacheResult<LocalWriter> {
        fs::create_dir_all(&self.root).map_err(|err| CacheError::io(&self.root, err))?;
        let lock = FileLock::acquire(self.lock_path(key), self.stale_lock_after)?;

        let temp = tempfile::Builder::new()
            .prefix(&format!(".{key}."))
            .suffix(".tmp")
            .tempfile_in(&self.root)
            .map_err(|err| CacheError::io(&self.root, err))?;
        let buffered = BufWriter::new(temp);
        let sink = match self.compression {
            Compression::None => Sink::Plain(buffered),
            Compression::Gzip => {
                Sink::Gzip(GzEncoder::new(buffered, flate2::Compression::default()))
            }
        };

        Ok(LocalWriter {
            sink: Some(sink),
            target: self.path_for(key),
            lock,
        })
    }

    fn is_visible(name: &str) -> bool {
        !name.starts_with('.') && !name.ends_with(".lock")
    }
}

impl Storage for LocalStorage {
    fn open(&self, key: &str, mode: OpenMode) -> CacheResult<Handle> {
        validate_key(key)?;
        match mode.access {
            Access::Read => self.open_reader(key).map(Handle::Reader),
            Access::Write => Ok(Handle::Writer(Box::new(self.open_writer(key)?))),
        }
    }

    fn exists(&self, key: &str) -> bool {
        validate_key(key).is_ok() && self.path_for(key).is_file()
    }

    fn remove(&self, key: &str) -> CacheResult<()> {
        validate_key(key)?;
        let path = self.path_for(key);
        fs::remove_file(&path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => CacheError::NotFound {
                key: key.to_string(),
            },
            _ => CacheError::io(&path, err),
        })?;
        debug!(key, "entry removed");
        Ok(())
    }

    fn all(&self) -> CacheResult<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CacheError::io(&self.root, err)),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| CacheError::io(&self.root, err))?;
            let is_file = entry.file_type().is_ok_and(|kind| kind.is_file());
            if let (true, Some(name)) = (is_file, entry.file_name().to_str()) {
                if Self::is_visible(name) {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn filter(&self, prefix: &str) -> CacheResult<Vec<String>> {
        if prefix.contains(['/', '\\']) {
            return Err(CacheError::InvalidKey {
                key: prefix.to_string(),
            });
        }
        let pattern = format!(
            "{}/{}*",
            glob::Pattern::escape(&self.root.to_string_lossy()),
            glob::Pattern::escape(prefix)
        );
        let paths = glob::glob(&pattern).map_err(|_| CacheError::InvalidKey {
            key: prefix.to_string(),
        })?;

        let mut keys = Vec::new();
        for path in paths {
            let path = path.map_err(|err| {
                let path = err.path().to_path_buf();
                CacheError::io(path, err.into_error())
            })?;
            if !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
                if Self::is_visible(name) {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

enum Sink {
    Plain(BufWriter<NamedTempFile>),
    Gzip(GzEncoder<BufWriter<NamedTempFile>>),
}

/// Field order matters: the temp file is dropped before the lock.
struct LocalWriter {
    sink: Option<Sink>,
    target: PathBuf,
    lock: FileLock,
}

impl LocalWriter {
    fn sink(&mut self) -> io::Result<&mut dyn Write> {
        let writer: &mut dyn Write = match self.sink.as_mut() {
            Some(Sink::Plain(writer)) => writer,
            Some(Sink::Gzip(writer)) => writer,
            None => return Err(io::Error::other("artifact already committed")),
        };
        Ok(writer)
    }
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock.refresh();
        self.sink()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink()?.flush()
    }
}

impl ArtifactWriter for LocalWriter {
    fn commit(mut self: Box<Self>) -> CacheResult<()> {
        let Some(sink) = self.sink.take() else {
            return Ok(());
        };
        let target = self.target.clone();

        let buffered = match sink {
            Sink::Plain(writer) => writer,
            Sink::Gzip(encoder) => encoder.finish().map_err(|err| CacheError::io(&target, err))?,
        };
        let temp = buffered
            .into_inner()
            .map_err(|err| CacheError::io(&target, err.into_error()))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| CacheError::io(&target, err))?;
        temp.persist(&target)
            .map_err(|err| CacheError::io(&target, err.error))?;

        debug!(artifact = %target.display(), "artifact committed");
        Ok(())
    }
}

impl Drop for LocalWriter {
    fn drop(&mut self) {
        if self.sink.take().is_some() {
            warn!(artifact = %self.target.display(), "discarding uncommitted artifact");
        }
    }
}
