//! Typed arena indices for the graph's entities.
//!
//! Nodes and edges of the context graph are "entities": newtype wrappers
//! around integers which represent an index into an array. Entities are never
//! deallocated while the graph is alive, so an index is a stable name for a
//! node or edge even as the graph is mutated.
//!
//! These types implement the [`EntityRef`] trait which allows them to be
//! converted to and from `usize`.
//!
//! This module provides type-safe and efficient data structures for working
//! with entities:
//!
//! - [`PrimaryMap<K, V>`] is used to keep track of a vector of entities,
//!   assigning a unique entity reference to each. It is implemented as a
//!   wrapper around a `Vec<V>` indexed by `K`.
//! - [`PackedOption<T>`] provides a compact representation of an `Option<T>`
//!   where `T` is an entity type by encoding `None` using the maximum integer
//!   value for the entity type.
//!
//! The design of these types is based on the `cranelift-entity` crate.

#[macro_use]
pub mod base;
pub mod iter;
pub mod packed_option;
pub mod primary_map;

pub use base::EntityRef;
pub use packed_option::{PackedOption, ReservedValue};
pub use primary_map::PrimaryMap;
