//! Cart item maps and the per-tab cart state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::id::ProductId;
use super::wire::CartLine;

/// Mapping from product to a strictly positive quantity.
///
/// An item whose quantity drops to zero or below is absent, never stored as
/// zero. Deserialization enforces the same rule, so a malformed durable or
/// remote payload cannot smuggle a zero or negative quantity in. Keys that
/// are not valid product IDs are dropped the same way.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, i64>")]
pub struct CartItemMap(BTreeMap<ProductId, u32>);

impl CartItemMap {
    /// Create an empty map.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Quantity of a product, or 0 if absent.
    #[must_use]
    pub fn get(&self, product: &ProductId) -> u32 {
        self.0.get(product).copied().unwrap_or(0)
    }

    /// Set a product's quantity. A quantity of 0 removes the product.
    pub fn set(&mut self, product: ProductId, quantity: u32) {
        if quantity == 0 {
            self.0.remove(&product);
        } else {
            self.0.insert(product, quantity);
        }
    }

    /// Remove a product, returning its previous quantity.
    pub fn remove(&mut self, product: &ProductId) -> Option<u32> {
        self.0.remove(product)
    }

    /// Whether the product is present.
    #[must_use]
    pub fn contains(&self, product: &ProductId) -> bool {
        self.0.contains_key(product)
    }

    /// Number of distinct products.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the cart holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(product, quantity)` pairs in product order.
    pub fn iter(&self) -> impl Iterator<Item = (&ProductId, u32)> {
        self.0.iter().map(|(id, qty)| (id, *qty))
    }

    /// Sum of all quantities (the cart badge count).
    #[must_use]
    pub fn total_quantity(&self) -> u64 {
        self.0.values().map(|qty| u64::from(*qty)).sum()
    }

    /// Build a map from the server's line list.
    ///
    /// Lines with a non-positive quantity are dropped. Duplicate lines for the
    /// same product keep the last one.
    #[must_use]
    pub fn from_lines(lines: &[CartLine]) -> Self {
        lines
            .iter()
            .map(|line| (line.item_id.clone(), line.quantity))
            .collect::<BTreeMap<_, _>>()
            .into()
    }
}

impl From<BTreeMap<ProductId, i64>> for CartItemMap {
    fn from(raw: BTreeMap<ProductId, i64>) -> Self {
        Self(
            raw.into_iter()
                .filter(|(_, qty)| *qty > 0)
                .map(|(id, qty)| (id, u32::try_from(qty).unwrap_or(u32::MAX)))
                .collect(),
        )
    }
}

impl From<BTreeMap<String, i64>> for CartItemMap {
    fn from(raw: BTreeMap<String, i64>) -> Self {
        raw.into_iter()
            .filter_map(|(id, qty)| Some((ProductId::parse(&id).ok()?, qty)))
            .collect::<BTreeMap<_, _>>()
            .into()
    }
}

impl FromIterator<(ProductId, u32)> for CartItemMap {
    fn from_iter<I: IntoIterator<Item = (ProductId, u32)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (id, qty) in iter {
            map.set(id, qty);
        }
        map
    }
}

/// Pending changes not yet confirmed by the server.
///
/// Holds the latest value per product. A value of `0` is a tombstone: the
/// product was removed and the removal still has to reach the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirtyItems(BTreeMap<ProductId, u32>);

impl DirtyItems {
    /// Create an empty set of pending changes.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Record the latest value for a product (0 = removal).
    pub fn record(&mut self, product: ProductId, quantity: u32) {
        self.0.insert(product, quantity);
    }

    /// Pending value for a product, if any.
    #[must_use]
    pub fn get(&self, product: &ProductId) -> Option<u32> {
        self.0.get(product).copied()
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Drop every pending entry.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Iterate over `(product, pending value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&ProductId, u32)> {
        self.0.iter().map(|(id, qty)| (id, *qty))
    }

    /// Drop the entries `acked` confirms, keeping any that changed since.
    ///
    /// An entry is confirmed when `acked` reports the same value for it.
    pub fn retain_unconfirmed(&mut self, acked: impl Fn(&ProductId) -> Option<u32>) {
        self.0.retain(|id, qty| acked(id) != Some(*qty));
    }
}

impl FromIterator<(ProductId, u32)> for DirtyItems {
    fn from_iter<I: IntoIterator<Item = (ProductId, u32)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Everything one tab knows about its cart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CartState {
    /// Authoritative local cart.
    pub items: CartItemMap,
    /// Pending changes not yet confirmed synced.
    pub dirty_items: DirtyItems,
    /// Set once the initial load (durable storage or server) completed.
    pub hydrated: bool,
    /// Set after an order is placed; blocks mutation and sync.
    pub locked: bool,
    /// Coarse mirror of `!dirty_items.is_empty()`.
    pub dirty: bool,
}

impl CartState {
    /// Whether there is anything to send to the server.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.dirty_items.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pid(s: &str) -> ProductId {
        ProductId::parse(s).unwrap()
    }

    #[test]
    fn test_set_zero_removes() {
        let mut items = CartItemMap::new();
        items.set(pid("P1"), 3);
        items.set(pid("P1"), 0);
        assert!(items.is_empty());
        assert_eq!(items.get(&pid("P1")), 0);
    }

    #[test]
    fn test_deserialize_drops_non_positive() {
        let items: CartItemMap = serde_json::from_str(r#"{"P1":2,"P2":0,"P3":-4}"#).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items.get(&pid("P1")), 2);
    }

    #[test]
    fn test_deserialize_drops_invalid_ids() {
        let long = "x".repeat(ProductId::MAX_LENGTH + 1);
        let raw = format!(r#"{{"":2,"  ":1,"{long}":5,"P1":3}}"#);
        let items: CartItemMap = serde_json::from_str(&raw).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items.get(&pid("P1")), 3);
    }

    #[test]
    fn test_deserialize_saturates_huge_quantities() {
        let items: CartItemMap = serde_json::from_str(r#"{"P1":99999999999}"#).unwrap();
        assert_eq!(items.get(&pid("P1")), u32::MAX);
    }

    #[test]
    fn test_serialize_is_plain_map() {
        let items: CartItemMap = [(pid("P2"), 1), (pid("P1"), 2)].into_iter().collect();
        assert_eq!(serde_json::to_string(&items).unwrap(), r#"{"P1":2,"P2":1}"#);
    }

    #[test]
    fn test_total_quantity() {
        let items: CartItemMap = [(pid("A"), 2), (pid("B"), 5)].into_iter().collect();
        assert_eq!(items.total_quantity(), 7);
    }

    #[test]
    fn test_from_lines() {
        let lines = vec![
            CartLine {
                item_id: pid("P1"),
                quantity: 2,
            },
            CartLine {
                item_id: pid("P2"),
                quantity: 0,
            },
        ];
        let items = CartItemMap::from_lines(&lines);
        assert_eq!(items.len(), 1);
        assert_eq!(items.get(&pid("P1")), 2);
    }

    #[test]
    fn test_dirty_tombstone_serializes_as_zero() {
        let mut dirty = DirtyItems::new();
        dirty.record(pid("P1"), 0);
        assert_eq!(serde_json::to_string(&dirty).unwrap(), r#"{"P1":0}"#);
    }

    #[test]
    fn test_retain_unconfirmed_keeps_newer_values() {
        let mut dirty: DirtyItems = [(pid("A"), 1), (pid("B"), 3)].into_iter().collect();
        let sent: DirtyItems = [(pid("A"), 1), (pid("B"), 2)].into_iter().collect();
        dirty.retain_unconfirmed(|id| sent.get(id));
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty.get(&pid("B")), Some(3));
    }
}
