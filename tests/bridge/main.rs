//! Integration tests for the bridge, organized by feature
//!
//! These tests load addons into the in-process host and drive them through
//! the public API.
//!
//! ## Aggressive Test Defaults
//!
//! Tests use aggressive defaults to catch bugs early:
//! - `GC_THRESHOLD=1` - collect at every scope close to catch rooting bugs
//!
//! Override via environment variables:
//!
//! ```bash
//! cargo test                           # Default: aggressive settings
//! GC_THRESHOLD=100 cargo test          # Less aggressive GC for faster runs
//! RUST_LOG=napi_bridge=trace cargo test -- --nocapture
//! ```

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

mod classes;
mod descriptors;
mod externals;
mod modules;
mod references;
mod scopes;
mod trampolines;

use napi_bridge::host::{HostConfig, HostRuntime};

/// Create a host runtime with aggressive defaults for testing:
/// - GC_THRESHOLD=1 (collect on every scope close) to catch rooting bugs
pub fn create_test_runtime() -> HostRuntime {
    init_tracing();

    // GC_THRESHOLD=0 cargo test    # Disable automatic GC
    let gc_threshold = std::env::var("GC_THRESHOLD")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1);
    HostRuntime::with_config(HostConfig {
        gc_threshold,
        ..HostConfig::default()
    })
    .unwrap()
}

/// Route `tracing` output through the test harness when `RUST_LOG` is set.
fn init_tracing() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
