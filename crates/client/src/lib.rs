//! Client-side cart synchronization engine.
//!
//! Keeps a shopping cart consistent between a tab, durable storage, other
//! tabs of the same profile and a remote cart service:
//!
//! - [`store`] applies mutations optimistically and tracks pending changes
//! - [`sync`] sends pending changes after a debounce, with backoff on failure
//! - [`unload`] flushes pending changes as a beacon on teardown
//! - [`replicator`] adopts cart writes made by other tabs
//! - [`session`] merges the guest cart on login and resets it on logout
//!
//! [`CartClient`] wires them together for one tab.

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod replicator;
pub mod session;
pub mod storage;
pub mod store;
pub mod sync;
pub mod unload;

pub use api::{ApiError, CartApi, HttpCartApi};
pub use config::{BackoffPolicy, CartSyncConfig, SessionTiming, SyncTiming};
pub use context::{CartClient, CartClientBuilder};
pub use error::{Error, Result};
pub use lifecycle::{Activity, ActivityMonitor, LifecycleEvent, PageLifecycle};
pub use session::{AuthUser, SessionHooks, SessionManager};
pub use storage::StorageArea;
pub use store::CartStore;
pub use sync::{IdleGate, SyncStatus};
