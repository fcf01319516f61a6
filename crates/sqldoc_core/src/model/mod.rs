//! Persisted shapes and the traits user types implement.
//!
//! # Responsibility
//! - Define the physical `Document` row.
//! - Define how user entities and index values plug into the engine.
//!
//! # Invariants
//! - Every persisted object is exactly one `Document`.
//! - Index values are flat maps of scalar columns.

pub mod descriptor;
pub mod document;
pub mod entity;
pub mod index;
