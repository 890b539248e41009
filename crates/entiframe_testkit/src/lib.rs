//! # entiframe testkit
//!
//! Test utilities for entiframe.
//!
//! This crate provides:
//! - Fixture models: an animal hierarchy, customers and orders with owned
//!   types, and vehicles built from closed kind enums
//! - Sessions over in-memory document and relational stores
//! - Property-based test generators using proptest
//! - An integration harness that tracks what a test expects the store to hold
//!
//! ## Usage
//!
//! ```rust,ignore
//! use entiframe_testkit::prelude::*;
//!
//! #[test]
//! fn saves_a_customer() {
//!     let fixture = DocumentFixture::new(customers_model(StoreKind::Document));
//!     fixture.session.add("Customer", [("Id", "c1"), ("Name", "Ann")]).unwrap();
//!     fixture.session.save_changes().unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::init_tracing;
    pub use entiframe_core::{Session, StoreKind, Value};
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;

/// Installs a `tracing` subscriber filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
