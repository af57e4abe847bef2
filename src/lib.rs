//! Sediment - Revisioned Table Storage
//!
//! A schema-driven, multi-tenant table engine on top of a wide-column
//! store: time-UUID versioned rows, asynchronously maintained secondary
//! indexes, per-table revision retention, and online schema migrations.

pub mod config;
pub mod conv;
pub mod cql;
pub mod driver;
pub mod engine;
pub mod error;
pub mod ident;
pub mod schema;
pub mod types;

pub use config::EngineConfig;
pub use driver::{Consistency, CqlValue, Driver, ExecOptions, ResultPage, Row, Statement};
pub use engine::Engine;
pub use error::{Result, SedimentError};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
