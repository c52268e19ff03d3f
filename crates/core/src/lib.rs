//! Cart Sync Core - Shared types library.
//!
//! This crate provides the types shared by every cart sync component:
//! - `client` - The synchronization engine (store, scheduler, replicator, session)
//! - `cli` - Command-line tools for inspecting and driving a cart
//! - `integration-tests` - End-to-end scenarios against a mock server
//!
//! # Architecture
//!
//! The core crate contains only types - no I/O, no storage access,
//! no HTTP clients. This keeps it lightweight and allows it to be used anywhere.
//!
//! # Modules
//!
//! - [`types`] - Product/user/tab IDs, cart maps, cart state, and wire payloads

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
