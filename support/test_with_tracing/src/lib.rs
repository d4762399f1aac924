// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The [`test`] attribute: a `#[test]` that routes `tracing` output to the
//! test harness so it is shown for failing tests.

#[cfg(test)]
extern crate self as test_with_tracing;

pub use test_with_tracing_macro::test;
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

/// The filter used when `RUST_LOG` is unset or does not parse.
const DEFAULT_LEVEL: LevelFilter = LevelFilter::DEBUG;

fn targets() -> Targets {
    std::env::var("RUST_LOG")
        .ok()
        .and_then(|var| var.parse().ok())
        .unwrap_or_else(|| Targets::new().with_default(DEFAULT_LEVEL))
}

/// Installs the global subscriber. Called by the generated test wrapper.
#[doc(hidden)]
pub fn init() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        tracing_subscriber::fmt()
            .compact()
            .with_ansi(false)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .finish()
            .with(targets())
            .init();
    });
}
