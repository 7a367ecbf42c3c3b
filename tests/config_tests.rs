#![cfg(feature = "toml-config")]

use std::fs;

use anyhow::Result;
use cachestore::{
    BoundArguments, Cache, CacheError, Computation, Config, FunctionDef, LocalStorage, Parameter,
    Signature, call_args,
};

fn temp_config_dir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("cachestore-config")
        .tempdir()
        .expect("failed to create temp dir")
}

#[test]
fn explicit_file_configures_the_named_cache() -> Result<()> {
    let dir = temp_config_dir();
    let store = dir.path().join("store");
    let path = dir.path().join("cachestore.toml");
    fs::write(
        &path,
        format!(
            r#"
            [caches.reports]
            root = "{}"
            compression = "gzip"
            formatter = "msgpack"
            "#,
            store.display()
        ),
    )?;

    let config = Config::load(Some(&path))?;
    let cache = Cache::builder("reports").config(config).disable(false).build()?;
    let def = FunctionDef::new("answer", "tests/config_tests.rs")
        .with_source("fn answer() -> i64 { 42 }");
    let answer = cache.wrap(Computation::new(def, |_: BoundArguments| -> Result<i64> {
        Ok(42)
    }))?;

    assert_eq!(answer.call::<i64>(call_args![])?, 42);
    let stored = LocalStorage::new(&store);
    let key = answer.key_for(&call_args![])?;
    let raw = fs::read(stored.path_for(&key.to_string()))?;
    assert_eq!(&raw[..2], &[0x1f, 0x8b]);
    Ok(())
}

#[test]
fn function_sections_apply_unless_code_overrides_them() -> Result<()> {
    let dir = temp_config_dir();
    let config = Config::parse(
        r#"
        [caches.default.functions."config_tests.fetch"]
        ignore = ["verbose"]
        expire = -1
        "#,
    )?;
    let cache = Cache::builder("default")
        .storage(LocalStorage::new(dir.path()))
        .config(config)
        .disable(false)
        .build()?;
    let def = FunctionDef::new("fetch", "tests/config_tests.rs")
        .with_source("fn fetch(id: u64, verbose: bool) -> u64 { id }")
        .with_signature(
            Signature::new()
                .param(Parameter::positional("id"))
                .param(Parameter::positional("verbose")),
        );
    let fetch = cache.wrap(Computation::new(def, |args: BoundArguments| -> Result<u64> {
        Ok(args.get("id")?)
    }))?;

    assert!(fetch.expired_at().is_some());
    assert_eq!(
        fetch.key_for(&call_args![1, true])?,
        fetch.key_for(&call_args![1, false])?
    );
    Ok(())
}

#[test]
fn missing_explicit_file_is_an_error() {
    let dir = temp_config_dir();
    let err = Config::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
    assert!(matches!(err, CacheError::Io { .. }));
}

#[test]
fn invalid_values_surface_when_the_cache_is_built() -> Result<()> {
    let config = Config::parse("[caches.default]\nformatter = \"pickle\"\n")?;
    let err = Cache::builder("default").config(config).build().unwrap_err();
    assert!(matches!(err, CacheError::Config { .. }));
    Ok(())
}
