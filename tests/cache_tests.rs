use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use cachestore::{
    BoundArguments, Cache, CacheError, CacheRegistry, Compression, Computation, Config, Expire,
    FunctionDef, LocalStorage, MessagePackFormatter, Parameter, Signature, Storage, WrapOptions,
    call_args, computation,
};
use futures::StreamExt;

fn temp_cache_dir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("cachestore-test")
        .tempdir()
        .expect("failed to create temp dir")
}

fn cache_in(root: &Path) -> Result<Cache> {
    Ok(Cache::builder("default")
        .storage(LocalStorage::new(root))
        .config(Config::default())
        .disable(false)
        .build()?)
}

fn square_def(source: &str) -> FunctionDef {
    FunctionDef::new("square", "tests/cache_tests.rs")
        .with_source(source)
        .with_signature(Signature::new().param(Parameter::positional("x")))
}

type Body = Box<dyn Fn(BoundArguments) -> Result<i64> + Send + Sync>;

/// `square` with an execution counter.
fn counted_square(source: &str) -> (Computation<Body>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let body: Body = Box::new(move |args| {
        counter.fetch_add(1, Ordering::SeqCst);
        let x: i64 = args.get("x")?;
        Ok(x * x)
    });
    (Computation::new(square_def(source), body), calls)
}

#[test]
fn repeated_calls_execute_once() -> Result<()> {
    let dir = temp_cache_dir();
    let cache = cache_in(dir.path())?;
    let (computation, calls) = counted_square("fn square(x: i64) -> i64 { x * x }");
    let square = cache.wrap(computation)?;

    assert_eq!(square.call::<i64>(call_args![2])?, 4);
    assert_eq!(square.call::<i64>(call_args![2])?, 4);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(square.call::<i64>(call_args![3])?, 9);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn call_shape_does_not_change_the_key() -> Result<()> {
    let dir = temp_cache_dir();
    let cache = cache_in(dir.path())?;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let def = FunctionDef::new("scale", "tests/cache_tests.rs")
        .with_source("fn scale(a: i64, b: i64) -> i64 { a * b }")
        .with_signature(
            Signature::new()
                .param(Parameter::positional("a"))
                .param(Parameter::positional("b").with_default(2)),
        );
    let scale = cache.wrap(Computation::new(def, move |args: BoundArguments| -> Result<i64> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(args.get::<i64>("a")? * args.get::<i64>("b")?)
    }))?;

    let shapes = [
        call_args![5],
        call_args![5, 2],
        call_args![; a = 5],
        call_args![5; b = 2],
        call_args![; b = 2, a = 5],
    ];
    let key = scale.key_for(&shapes[0])?;
    for shape in shapes {
        assert_eq!(scale.key_for(&shape)?, key);
        assert_eq!(scale.call::<i64>(shape)?, 10);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn renaming_locals_keeps_stored_entries() -> Result<()> {
    let dir = temp_cache_dir();
    let cache = cache_in(dir.path())?;
    let signature = Signature::new().param(Parameter::positional("values"));
    let total = |args: BoundArguments| -> Result<i64> {
        Ok(args.get::<Vec<i64>>("values")?.iter().sum())
    };

    let before = FunctionDef::new("total", "tests/cache_tests.rs")
        .with_source("fn total(values: Vec<i64>) -> i64 { let mut sum = 0; for v in values { sum += v; } sum }")
        .with_signature(signature.clone());
    let after = FunctionDef::new("total", "tests/cache_tests.rs")
        .with_source(
            "fn total(values: Vec<i64>) -> i64 {\n    // running total\n    let mut acc = 0;\n    for item in values {\n        acc += item;\n    }\n    acc\n}",
        )
        .with_signature(signature);

    let first = cache.wrap(Computation::new(before, total))?;
    let second = cache.wrap(Computation::new(after, |_: BoundArguments| -> Result<i64> {
        Err(anyhow!("served from the store, never executed"))
    }))?;

    assert_eq!(first.function_hash(), second.function_hash());
    assert_eq!(first.call::<i64>(call_args![vec![1, 2, 3]])?, 6);
    assert_eq!(second.call::<i64>(call_args![vec![1, 2, 3]])?, 6);
    Ok(())
}

#[test]
fn editing_logic_invalidates_entries() -> Result<()> {
    let dir = temp_cache_dir();
    let cache = cache_in(dir.path())?;
    let (original, original_calls) = counted_square("fn square(x: i64) -> i64 { x * x }");
    let (edited, edited_calls) = counted_square("fn square(x: i64) -> i64 { x * x * 1 }");

    let original = cache.wrap(original)?;
    original.call::<i64>(call_args![4])?;
    let edited = cache.wrap(edited)?;
    edited.call::<i64>(call_args![4])?;

    assert_ne!(original.function_hash(), edited.function_hash());
    assert_eq!(original_calls.load(Ordering::SeqCst), 1);
    assert_eq!(edited_calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn ignored_parameters_share_entries() -> Result<()> {
    let dir = temp_cache_dir();
    let cache = cache_in(dir.path())?;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let def = FunctionDef::new("load", "tests/cache_tests.rs")
        .with_source("fn load(x: i64, verbose: bool) -> i64 { x }")
        .with_signature(
            Signature::new()
                .param(Parameter::positional("x"))
                .param(Parameter::positional("verbose").with_default(false)),
        );
    let load = cache.wrap_with(
        Computation::new(def, move |args: BoundArguments| -> Result<i64> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(args.get("x")?)
        }),
        WrapOptions::new().ignore(["verbose"]),
    )?;

    assert_eq!(load.call::<i64>(call_args![7, true])?, 7);
    assert_eq!(load.call::<i64>(call_args![7; verbose = false])?, 7);
    assert_eq!(load.call::<i64>(call_args![7])?, 7);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn expired_entries_are_recomputed() -> Result<()> {
    let dir = temp_cache_dir();
    let cache = cache_in(dir.path())?;
    let (computation, calls) = counted_square("fn square(x: i64) -> i64 { x * x }");
    let square = cache.wrap_with(computation, WrapOptions::new().expire(Expire::Days(-1)))?;

    square.call::<i64>(call_args![5])?;
    square.call::<i64>(call_args![5])?;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let records = cache.info(square.identity())?;
    assert_eq!(records.len(), 1);
    assert!(records[0].is_expired());
    assert!(!cache.exists(square.identity())?);
    Ok(())
}

#[test]
fn disabled_cache_never_touches_storage() -> Result<()> {
    let dir = temp_cache_dir();
    let cache = Cache::builder("default")
        .storage(LocalStorage::new(dir.path()))
        .config(Config::default())
        .disable(true)
        .build()?;
    let (computation, calls) = counted_square("fn square(x: i64) -> i64 { x * x }");
    let square = cache.wrap(computation)?;

    assert_eq!(square.call::<i64>(call_args![3])?, 9);
    assert_eq!(square.call::<i64>(call_args![3])?, 9);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(cache.storage().all()?.is_empty());
    Ok(())
}

#[test]
fn computation_errors_leave_no_entry() -> Result<()> {
    let dir = temp_cache_dir();
    let cache = cache_in(dir.path())?;
    let failing = cache.wrap(Computation::new(
        square_def("fn square(x: i64) -> i64 { panic!() }"),
        |_: BoundArguments| -> Result<i64> { Err(anyhow!("boom")) },
    ))?;

    match failing.call::<i64>(call_args![1]) {
        Err(CacheError::Computation(err)) => assert_eq!(err.to_string(), "boom"),
        other => panic!("expected the computation's error, got {other:?}"),
    }
    assert!(cache.storage().all()?.is_empty());
    Ok(())
}

#[test]
fn invalid_arguments_are_rejected_before_running() -> Result<()> {
    let dir = temp_cache_dir();
    let cache = cache_in(dir.path())?;
    let (computation, calls) = counted_square("fn square(x: i64) -> i64 { x * x }");
    let square = cache.wrap(computation)?;

    let err = square.call::<i64>(call_args![1, 2]).unwrap_err();
    assert!(matches!(err, CacheError::InvalidArguments { .. }));
    let message = err.to_string();
    assert!(message.contains("signature : (x)"), "{message}");
    assert!(message.contains("given args: args=[1, 2]"), "{message}");

    let err = square.call::<i64>(call_args![; y = 1]).unwrap_err();
    assert!(matches!(err, CacheError::InvalidArguments { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn lazy_sequences_replay_identically() -> Result<()> {
    for (compression, msgpack) in [
        (Compression::None, false),
        (Compression::Gzip, false),
        (Compression::Gzip, true),
    ] {
        let dir = temp_cache_dir();
        let mut builder = Cache::builder("default")
            .storage(LocalStorage::new(dir.path()).with_compression(compression))
            .config(Config::default())
            .disable(false);
        if msgpack {
            builder = builder.formatter(MessagePackFormatter);
        }
        let cache = builder.build()?;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let def = FunctionDef::new("range", "tests/cache_tests.rs")
            .with_source("fn range(n: u32) -> impl Iterator<Item = u32> { 0..n }")
            .with_signature(Signature::new().param(Parameter::positional("n")));
        let range = cache.wrap(Computation::new(def, move |args: BoundArguments| -> Result<Range<u32>> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(0..args.get::<u32>("n")?)
        }))?;

        for _ in 0..2 {
            let items = range
                .call_iter(call_args![5])?
                .collect::<Result<Vec<u32>, _>>()?;
            assert_eq!(items, vec![0, 1, 2, 3, 4]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
    Ok(())
}

#[test]
fn prune_drops_entries_of_unregistered_functions() -> Result<()> {
    let dir = temp_cache_dir();
    let cache = cache_in(dir.path())?;
    let (computation, square_calls) = counted_square("fn square(x: i64) -> i64 { x * x }");
    let square = cache.wrap(computation)?;
    let cube = cache.wrap(computation! {
        fn cube(x: i64) -> i64 {
            x * x * x
        }
    })?;

    square.call::<i64>(call_args![2])?;
    assert_eq!(cube.call::<i64>(call_args![2])?, 8);
    assert_eq!(cache.functions().len(), 2);
    assert!(cache.stale_keys()?.is_empty());

    assert!(cache.unregister(cube.identity()));
    let stale = cache.stale_keys()?;
    assert_eq!(stale.len(), 2);
    assert!(stale.iter().all(|key| key.contains(cube.function_hash())));

    assert_eq!(cache.prune()?, stale);
    assert!(!cache.exists(cube.identity())?);
    assert!(cache.exists(square.identity())?);

    square.call::<i64>(call_args![2])?;
    assert_eq!(square_calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn introspection_reports_and_removes_entries() -> Result<()> {
    let dir = temp_cache_dir();
    let cache = cache_in(dir.path())?;
    let (computation, calls) = counted_square("fn square(x: i64) -> i64 { x * x }");
    let square = cache.wrap(computation)?;

    assert!(!cache.exists(square.identity())?);
    square.call::<i64>(call_args![2])?;
    square.call::<i64>(call_args![3])?;
    assert!(cache.exists(square.identity())?);

    let records = cache.info(square.identity())?;
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|record| {
        record.function.qualified_name == "cache_tests.square" && record.expired_at.is_none()
    }));
    assert!(records
        .iter()
        .any(|record| record.parameters.get("x").map(String::as_str) == Some("2")));

    let key = square.key_for(&call_args![2])?;
    assert_eq!(
        cache.remove(square.identity(), Some(key.execution_hash()))?,
        2
    );
    assert_eq!(cache.info(square.identity())?.len(), 1);
    assert_eq!(cache.remove(square.identity(), None)?, 2);
    assert!(!cache.exists(square.identity())?);

    square.call::<i64>(call_args![2])?;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    Ok(())
}

#[test]
fn computation_macro_derives_identity_and_defaults() -> Result<()> {
    let dir = temp_cache_dir();
    let cache = cache_in(dir.path())?;
    let scale = cache.wrap(computation! {
        fn scale(value: i64, factor: i64 = 3) -> i64 {
            value * factor
        }
    })?;

    assert_eq!(scale.identity().qualified_name, "cache_tests.scale");
    assert_eq!(scale.call::<i64>(call_args![2])?, 6);
    assert_eq!(scale.call::<i64>(call_args![2; factor = 4])?, 8);
    Ok(())
}

#[test]
fn cache_names_are_unique_per_registry() -> Result<()> {
    let dir = temp_cache_dir();
    let registry = CacheRegistry::new();
    let first = cache_in(dir.path())?;
    let second = cache_in(dir.path())?;

    registry.register(&first)?;
    registry.register(&first)?;
    assert!(matches!(
        registry.register(&second),
        Err(CacheError::IdentityUnresolvable { .. })
    ));
    assert_eq!(registry.names(), vec!["default".to_string()]);
    assert!(registry.lookup("default").is_some());

    let unnamed = Cache::builder("  ").config(Config::default()).build();
    assert!(matches!(unnamed, Err(CacheError::IdentityUnresolvable { .. })));
    Ok(())
}

#[tokio::test]
async fn async_results_are_cached() -> Result<()> {
    let dir = temp_cache_dir();
    let cache = cache_in(dir.path())?;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let def = FunctionDef::new("fetch", "tests/cache_tests.rs")
        .with_source("async fn fetch(id: u64) -> String { format!(\"item-{id}\") }")
        .with_signature(Signature::new().param(Parameter::positional("id")));
    let fetch = cache.wrap(Computation::new(def, move |args: BoundArguments| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(format!("item-{}", args.get::<u64>("id")?))
        }
    }))?;

    assert_eq!(fetch.call_async::<_, String>(call_args![7]).await?, "item-7");
    assert_eq!(fetch.call_async::<_, String>(call_args![7]).await?, "item-7");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streams_are_stored_then_replayed() -> Result<()> {
    let dir = temp_cache_dir();
    let cache = Cache::builder("default")
        .storage(LocalStorage::new(dir.path()))
        .config(Config::default())
        .disable(false)
        .stream_capacity(2)
        .build()?;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let def = FunctionDef::new("ticks", "tests/cache_tests.rs")
        .with_source("async fn ticks(n: u32) -> impl Stream<Item = u32> { stream::iter(0..n) }")
        .with_signature(Signature::new().param(Parameter::positional("n")));
    let ticks = cache.wrap(Computation::new(def, move |args: BoundArguments| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(futures::stream::iter(0..args.get::<u32>("n")?))
        }
    }))?;

    for _ in 0..2 {
        let items: Vec<u32> = ticks
            .call_stream(call_args![10])
            .await?
            .map(|item| item.expect("stored record decodes"))
            .collect()
            .await;
        assert_eq!(items, (0..10).collect::<Vec<_>>());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn metadata_without_artifact_is_a_miss() -> Result<()> {
    let dir = temp_cache_dir();
    let cache = cache_in(dir.path())?;
    let (computation, calls) = counted_square("fn square(x: i64) -> i64 { x * x }");
    let square = cache.wrap(computation)?;

    assert_eq!(square.call::<i64>(call_args![4])?, 16);
    let key = square.key_for(&call_args![4])?;
    cache.storage().remove(&key.to_string())?;
    assert!(cache.storage().exists(&key.metadata_key()));
    assert!(!cache.exists(square.identity())?);

    assert_eq!(square.call::<i64>(call_args![4])?, 16);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(cache.storage().exists(&key.to_string()));
    Ok(())
}

#[test]
fn results_that_cannot_round_trip_are_returned_uncached() -> Result<()> {
    let dir = temp_cache_dir();
    let cache = cache_in(dir.path())?;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let def = FunctionDef::new("inverse", "tests/cache_tests.rs")
        .with_source("fn inverse(x: f64) -> f64 { 1.0 / x }")
        .with_signature(Signature::new().param(Parameter::positional("x")));
    let inverse = cache.wrap(Computation::new(def, move |args: BoundArguments| -> Result<f64> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(1.0 / args.get::<f64>("x")?)
    }))?;

    for _ in 0..2 {
        assert_eq!(inverse.call::<f64>(call_args![0.0])?, f64::INFINITY);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(cache.storage().all()?.is_empty());

    assert_eq!(inverse.call::<f64>(call_args![4.0])?, 0.25);
    assert_eq!(inverse.call::<f64>(call_args![4.0])?, 0.25);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(cache.storage().all()?.len(), 2);

    let def = FunctionDef::new("samples", "tests/cache_tests.rs")
        .with_source("fn samples(n: u32) -> Vec<f64> { vec![1.0, f64::NAN] }")
        .with_signature(Signature::new().param(Parameter::positional("n")));
    let samples = cache.wrap(Computation::new(def, |_: BoundArguments| -> Result<Vec<f64>> {
        Ok(vec![1.0, f64::NAN])
    }))?;
    assert!(matches!(
        samples.call_iter::<Vec<f64>, f64>(call_args![2]),
        Err(CacheError::Serialization { .. })
    ));
    assert_eq!(cache.storage().all()?.len(), 2);
    Ok(())
}
