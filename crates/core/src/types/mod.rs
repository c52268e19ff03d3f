//! Core types for the cart sync engine.
//!
//! This module provides type-safe wrappers for cart domain concepts.

pub mod cart;
pub mod id;
pub mod role;
pub mod wire;

pub use cart::{CartItemMap, CartState, DirtyItems};
pub use id::*;
pub use role::UserRole;
pub use wire::*;
