//! Fuzz target for statistics config parsing.
//!
//! Arbitrary TOML must either parse and validate or fail with a
//! `ConfigError`; building a catalog from anything that validates must not
//! panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

use model_stats::StatsConfig;
use model_stats::stats::SqliteBackend;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(config) = StatsConfig::from_toml_str(text) else {
        return;
    };
    let Ok(backend) = SqliteBackend::open_in_memory() else {
        return;
    };
    let _ = config.build_catalog(Arc::new(backend));
});
