//! Configuration layering

mod common;

use common::config_file;
use heapscope_core::{HeapscopeConfig, HeapscopeError};

#[test]
fn test_file_overrides_defaults() {
    let file = config_file(
        r#"
[sampler]
period_secs = 10
max_history = 60

[trace]
max_depth = 8
self_type_prefixes = ["heapscope", "agent::"]

[api]
addr = "0.0.0.0:9100"
"#,
    );

    let config = HeapscopeConfig::load_from(Some(file.path()), "HEAPSCOPE_TEST_FILE").unwrap();
    assert_eq!(config.sampler.period_secs, 10);
    assert_eq!(config.sampler.max_history, 60);
    assert_eq!(config.trace.max_depth, Some(8));
    assert_eq!(config.trace.self_type_prefixes.len(), 2);
    assert_eq!(config.api.addr.port(), 9100);
    // untouched keys keep their defaults
    assert_eq!(config.trace.tree_max_results, 1000);
    assert_eq!(config.api.event_capacity, 256);
}

#[test]
fn test_environment_overrides_file() {
    let file = config_file("[sampler]\nperiod_secs = 10\n");
    std::env::set_var("HEAPSCOPE_TEST_ENV__SAMPLER__PERIOD_SECS", "30");
    std::env::set_var("HEAPSCOPE_TEST_ENV__TRACE__REPR_LIMIT", "64");

    let config = HeapscopeConfig::load_from(Some(file.path()), "HEAPSCOPE_TEST_ENV").unwrap();
    assert_eq!(config.sampler.period_secs, 30);
    assert_eq!(config.trace.repr_limit, 64);
}

#[test]
fn test_invalid_values_are_rejected() {
    let file = config_file("[sampler]\nmax_history = 0\n");
    let result = HeapscopeConfig::load_from(Some(file.path()), "HEAPSCOPE_TEST_INVALID");
    assert!(matches!(result, Err(HeapscopeError::InvalidConfig(_))));
}

#[test]
fn test_missing_file_is_an_error() {
    let result = HeapscopeConfig::load_from(
        Some(std::path::Path::new("/nonexistent/heapscope.toml")),
        "HEAPSCOPE_TEST_MISSING",
    );
    assert!(matches!(result, Err(HeapscopeError::Config(_))));
}
