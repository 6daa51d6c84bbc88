//! # rune-core
//!
//! Core contracts for the Rune backward-pass engine.
//!
//! Provides the foundational pieces the engine and graph crates share:
//! - The `Value` trait — the opaque gradient value the engine accumulates
//! - The `GraphError` taxonomy for failed traversals
//! - The crate-wide `Result` alias

pub mod error;
pub mod value;

pub use error::{GraphError, OpError};
pub use value::Value;

pub type Result<T> = std::result::Result<T, GraphError>;
