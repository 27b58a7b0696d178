//! Common test utilities with tracing setup.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     // ... test code
//! }
//! ```
//!
//! # Configuration
//!
//! Environment variables:
//! - `RUST_LOG`: filter directives (e.g., `kiwi=debug,kiwi::store=trace`)
//! - `KIWI_LOG_CONSOLE`: set to "0" to disable console output
//!
//! Tracing output only exists when the crate is built with the `tracing`
//! feature; without it the subscriber simply has nothing to print.

#![allow(dead_code)]

use std::env;
use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Ensures tracing is only initialized once across all tests.
static INIT: Once = Once::new();

/// Initialize the tracing subscriber for tests.
///
/// Safe to call multiple times - only the first call takes effect.
pub fn init_tracing() {
    INIT.call_once(|| {
        if env::var("KIWI_LOG_CONSOLE").as_deref() == Ok("0") {
            return;
        }

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("kiwi=info"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
