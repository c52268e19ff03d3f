//! Payloads exchanged with the remote cart endpoints and durable storage.

use serde::{Deserialize, Serialize};

use super::cart::{CartItemMap, DirtyItems};
use super::id::ProductId;

/// How the server applies a `/cart/sync` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Merge only the listed items into server state.
    Partial,
    /// Listed items are authoritative truth.
    Full,
}

/// Body of `POST /cart/sync`.
///
/// `items` may carry `0` tombstones for removals, so it uses the dirty map
/// type rather than [`CartItemMap`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub items: DirtyItems,
    pub mode: SyncMode,
}

impl SyncRequest {
    /// Debounced-path request carrying pending changes.
    #[must_use]
    pub const fn partial(items: DirtyItems) -> Self {
        Self {
            items,
            mode: SyncMode::Partial,
        }
    }

    /// Explicit resync carrying the whole cart.
    #[must_use]
    pub fn full(items: &CartItemMap) -> Self {
        Self {
            items: items.iter().map(|(id, qty)| (id.clone(), qty)).collect(),
            mode: SyncMode::Full,
        }
    }
}

/// Body of `POST /cart/merge`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub guest_items: CartItemMap,
}

/// One row of the server cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub item_id: ProductId,
    pub quantity: i64,
}

/// Body of `GET /cart`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartResponse {
    #[serde(default)]
    pub items: Vec<CartLine>,
}

/// Durable layout of the cart entry: `{ "state": { "items": { .. } } }`.
///
/// Only `items` is persisted. Dirty tracking and the lock are tab-session
/// concerns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCart {
    pub state: PersistedCartState,
}

/// Inner object of [`PersistedCart`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCartState {
    pub items: CartItemMap,
}

impl PersistedCart {
    /// Wrap an item map in the durable envelope.
    #[must_use]
    pub fn new(items: CartItemMap) -> Self {
        Self {
            state: PersistedCartState { items },
        }
    }

    /// Parse a durable value leniently.
    ///
    /// Returns `None` for malformed JSON or when `state.items` is missing;
    /// never panics.
    #[must_use]
    pub fn parse_items(raw: &str) -> Option<CartItemMap> {
        let value: serde_json::Value = serde_json::from_str(raw).ok()?;
        let items = value.get("state")?.get("items")?;
        if items.is_null() {
            return None;
        }
        serde_json::from_value(items.clone()).ok()
    }
}
