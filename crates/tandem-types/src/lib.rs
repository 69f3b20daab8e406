//! Core types for the tandem distributed call runtime.
//!
//! This crate defines the data shared by the dispatcher, the reference
//! registry and the transport: worker and reference identifiers, the value
//! representation carried by built-in calls, operator signatures, errors and
//! configuration. It contains no business logic.

pub mod config;
pub mod error;
pub mod ids;
pub mod schema;
pub mod value;
