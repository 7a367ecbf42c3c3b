use std::fs;
use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use cachestore::storage::OpenMode;
use cachestore::{CacheError, Compression, LocalStorage, Storage};

fn temp_store_dir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("cachestore-storage")
        .tempdir()
        .expect("failed to create temp dir")
}

fn put(storage: &dyn Storage, key: &str, bytes: &[u8]) -> Result<()> {
    let mut writer = storage.open(key, OpenMode::WRITE_BINARY)?.into_writer(key)?;
    writer.write_all(bytes)?;
    writer.commit()?;
    Ok(())
}

fn get(storage: &dyn Storage, key: &str) -> Result<Vec<u8>> {
    let mut reader = storage.open(key, OpenMode::READ_BINARY)?.into_reader(key)?;
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    Ok(bytes)
}

#[test]
fn committed_artifacts_are_listed_and_readable() -> Result<()> {
    let dir = temp_store_dir();
    let storage = LocalStorage::new(dir.path().join("nested"));

    assert!(storage.all()?.is_empty());
    put(&storage, "fn1.exec2", b"second")?;
    put(&storage, "fn1.exec1", b"first")?;
    put(&storage, "metadata-fn1.exec1", b"meta")?;
    put(&storage, "fn2.exec1", b"other")?;

    assert_eq!(get(&storage, "fn1.exec1")?, b"first");
    assert!(storage.exists("fn1.exec2"));
    assert_eq!(
        storage.all()?,
        vec!["fn1.exec1", "fn1.exec2", "fn2.exec1", "metadata-fn1.exec1"]
    );
    assert_eq!(storage.filter("fn1.")?, vec!["fn1.exec1", "fn1.exec2"]);
    assert_eq!(storage.filter("metadata-")?, vec!["metadata-fn1.exec1"]);
    Ok(())
}

#[test]
fn removing_twice_reports_not_found() -> Result<()> {
    let dir = temp_store_dir();
    let storage = LocalStorage::new(dir.path());
    put(&storage, "key", b"value")?;

    storage.remove("key")?;
    assert!(!storage.exists("key"));
    assert!(matches!(storage.remove("key"), Err(CacheError::NotFound { .. })));
    assert!(matches!(
        storage.open("key", OpenMode::READ_TEXT),
        Err(CacheError::NotFound { .. })
    ));
    Ok(())
}

#[test]
fn uncommitted_writes_leave_nothing_behind() -> Result<()> {
    let dir = temp_store_dir();
    let storage = LocalStorage::new(dir.path());
    {
        let mut writer = storage.open("partial", OpenMode::WRITE_TEXT)?.into_writer("partial")?;
        writer.write_all(b"half an artifact")?;
    }

    assert!(!storage.exists("partial"));
    assert!(storage.all()?.is_empty());
    assert_eq!(fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

#[test]
fn gzip_artifacts_are_detected_on_read() -> Result<()> {
    let dir = temp_store_dir();
    let compressed = LocalStorage::new(dir.path()).with_compression(Compression::Gzip);
    put(&compressed, "payload", b"hello hello hello")?;

    let raw = fs::read(dir.path().join("payload"))?;
    assert_eq!(&raw[..2], &[0x1f, 0x8b]);

    let plain = LocalStorage::new(dir.path());
    assert_eq!(get(&plain, "payload")?, b"hello hello hello");
    Ok(())
}

#[test]
fn keys_cannot_escape_the_root() {
    let dir = temp_store_dir();
    let storage = LocalStorage::new(dir.path());
    for key in ["", ".hidden", "../escape", "a/b", "entry.lock"] {
        assert!(
            matches!(
                storage.open(key, OpenMode::WRITE_TEXT),
                Err(CacheError::InvalidKey { .. })
            ),
            "`{key}` should be rejected"
        );
    }
}

#[test]
fn handles_enforce_their_mode() -> Result<()> {
    let dir = temp_store_dir();
    let storage = LocalStorage::new(dir.path());
    put(&storage, "key", b"value")?;

    let reader = storage.open("key", OpenMode::READ_TEXT)?;
    assert!(matches!(
        reader.into_writer("key"),
        Err(CacheError::HandleMode { .. })
    ));
    Ok(())
}

#[test]
fn concurrent_writers_to_one_key_take_turns() -> Result<()> {
    let dir = temp_store_dir();
    let storage = Arc::new(LocalStorage::new(dir.path()));
    let mut first = storage.open("shared", OpenMode::WRITE_TEXT)?.into_writer("shared")?;
    first.write_all(b"first")?;

    let (opened_tx, opened_rx) = crossbeam_channel::bounded(1);
    let second = {
        let storage = Arc::clone(&storage);
        thread::spawn(move || -> Result<()> {
            let mut writer = storage.open("shared", OpenMode::WRITE_TEXT)?.into_writer("shared")?;
            opened_tx.send(())?;
            writer.write_all(b"second")?;
            writer.commit()?;
            Ok(())
        })
    };

    assert!(
        opened_rx.recv_timeout(Duration::from_millis(200)).is_err(),
        "second writer got in while the key was held"
    );
    first.commit()?;
    opened_rx.recv_timeout(Duration::from_secs(10))?;
    second.join().expect("second writer panicked")?;

    assert_eq!(get(storage.as_ref(), "shared")?, b"second");
    assert_eq!(storage.all()?, vec!["shared"]);
    Ok(())
}
