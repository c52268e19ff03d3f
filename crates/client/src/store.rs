//! Persistent cart store and dirty tracker.
//!
//! `CartStore` owns this tab's [`CartState`]. Every operation is synchronous
//! and applied atomically; observers (the sync scheduler, UIs) subscribe to a
//! `watch` channel and see each committed state.
//!
//! Every change to `items` is mirrored into durable storage under
//! [`CART_KEY`]. Dirty tracking and the lock are tab-session state and are not
//! part of that entry; the pending marker is optionally kept under its own key
//! so unsynced changes survive a reload.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use cart_sync_core::{CartItemMap, CartState, DirtyItems, PersistedCart, ProductId, TabId};

use crate::storage::{CART_KEY, PENDING_KEY, TabStorage};

/// This tab's cart.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct CartStore {
    inner: Arc<CartStoreInner>,
}

struct CartStoreInner {
    state: watch::Sender<CartState>,
    storage: TabStorage,
    persist_pending: bool,
}

impl CartStore {
    /// Create an empty, unhydrated store writing through `storage`.
    ///
    /// Call [`CartStore::rehydrate`] to load the durable copy.
    #[must_use]
    pub fn new(storage: TabStorage, persist_pending: bool) -> Self {
        let (state, _) = watch::channel(CartState::default());
        Self {
            inner: Arc::new(CartStoreInner {
                state,
                storage,
                persist_pending,
            }),
        }
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Load `items` from durable storage and mark the store hydrated.
    ///
    /// A missing or unparsable entry yields an empty cart; startup never
    /// fails here. When pending persistence is on, unsynced changes from the
    /// previous session are restored as dirty.
    pub fn rehydrate(&self) {
        let items = match self.inner.storage.get_item(CART_KEY) {
            None => CartItemMap::new(),
            Some(raw) => PersistedCart::parse_items(&raw).unwrap_or_else(|| {
                warn!("Durable cart is malformed, starting empty");
                CartItemMap::new()
            }),
        };

        let pending = if self.inner.persist_pending {
            self.inner
                .storage
                .get_json::<DirtyItems>(PENDING_KEY)
                .unwrap_or_default()
        } else {
            DirtyItems::new()
        };

        debug!(
            items = items.len(),
            pending = pending.len(),
            "Rehydrated cart from durable storage"
        );

        self.inner.state.send_modify(|state| {
            state.items = items;
            state.hydrated = true;
            state.dirty = !pending.is_empty();
            state.dirty_items = pending;
        });
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Add `delta` (may be negative) to a product's quantity.
    ///
    /// A result of zero or below removes the product and records a removal
    /// tombstone. No-op while locked.
    pub fn add_item(&self, product: &ProductId, delta: i64) {
        self.update(|state| {
            if state.locked {
                debug!(%product, "Cart locked, ignoring add");
                return false;
            }

            let next = i64::from(state.items.get(product)).saturating_add(delta);
            let next = if next <= 0 {
                0
            } else {
                u32::try_from(next).unwrap_or(u32::MAX)
            };

            state.items.set(product.clone(), next);
            state.dirty_items.record(product.clone(), next);
            state.dirty = true;
            debug!(%product, delta, quantity = next, "Cart item updated");
            true
        });
    }

    /// Remove a product entirely. No-op while locked.
    pub fn remove_item(&self, product: &ProductId) {
        self.update(|state| {
            if state.locked {
                debug!(%product, "Cart locked, ignoring remove");
                return false;
            }

            state.items.remove(product);
            state.dirty_items.record(product.clone(), 0);
            state.dirty = true;
            debug!(%product, "Cart item removed");
            true
        });
    }

    /// Empty the cart.
    ///
    /// Marks the store hydrated and dirty. The lock is left as it is: only a
    /// new session lifts it.
    pub fn clear(&self) {
        self.update(|state| {
            state.items = CartItemMap::new();
            state.dirty_items.clear();
            state.hydrated = true;
            state.dirty = true;
            true
        });
    }

    /// Replace `items` with known-synced truth and drop pending changes.
    ///
    /// The only way to introduce items without marking them dirty.
    pub fn hydrate(&self, items: CartItemMap) {
        self.update(|state| {
            state.items = items;
            state.hydrated = true;
            state.dirty = false;
            state.dirty_items.clear();
            true
        });
    }

    /// Return to an empty, unhydrated, unlocked guest cart.
    pub fn reset_to_guest(&self) {
        self.update(|state| {
            *state = CartState::default();
            true
        });
    }

    /// Order placed: lock, empty the cart, and drop the dirty flag.
    pub fn complete_checkout(&self) {
        self.update(|state| {
            state.locked = true;
            state.items = CartItemMap::new();
            state.dirty_items.clear();
            state.hydrated = true;
            state.dirty = false;
            true
        });
    }

    /// Freeze all mutation and sync.
    pub fn lock(&self) {
        self.update(|state| !std::mem::replace(&mut state.locked, true));
    }

    /// Lift the lock.
    pub fn unlock(&self) {
        self.update(|state| std::mem::replace(&mut state.locked, false));
    }

    // =========================================================================
    // Dirty Tracking
    // =========================================================================

    /// Raise the coarse dirty flag.
    pub fn mark_dirty(&self) {
        self.update(|state| !std::mem::replace(&mut state.dirty, true));
    }

    /// Lower the coarse dirty flag.
    pub fn clear_dirty(&self) {
        self.update(|state| std::mem::replace(&mut state.dirty, false));
    }

    /// Drop every pending change.
    pub fn clear_dirty_items(&self) {
        self.update(|state| {
            if state.dirty_items.is_empty() {
                return false;
            }
            state.dirty_items.clear();
            true
        });
    }

    /// Record that the server confirmed `sent`.
    ///
    /// Entries that changed after `sent` was taken stay dirty. Returns `true`
    /// if nothing remains pending.
    pub fn acknowledge_synced(&self, sent: &DirtyItems) -> bool {
        let mut settled = false;
        self.update(|state| {
            let before = (state.dirty_items.len(), state.dirty);
            state.dirty_items.retain_unconfirmed(|id| sent.get(id));
            state.dirty = !state.dirty_items.is_empty();
            settled = !state.dirty;
            (state.dirty_items.len(), state.dirty) != before
        });
        settled
    }

    // =========================================================================
    // Replication
    // =========================================================================

    /// Adopt `items` written by another tab.
    ///
    /// Pending changes, flags, and durable storage are left alone: the writer
    /// owns syncing what it wrote, and the value already is in storage.
    pub fn apply_remote_items(&self, items: CartItemMap) {
        self.inner.state.send_if_modified(|state| {
            if state.items == items {
                return false;
            }
            state.items = items;
            true
        });
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Copy of the whole state.
    #[must_use]
    pub fn snapshot(&self) -> CartState {
        self.inner.state.borrow().clone()
    }

    /// Copy of the current items.
    #[must_use]
    pub fn items(&self) -> CartItemMap {
        self.inner.state.borrow().items.clone()
    }

    /// Copy of the pending changes.
    #[must_use]
    pub fn dirty_items(&self) -> DirtyItems {
        self.inner.state.borrow().dirty_items.clone()
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.state.borrow().locked
    }

    #[must_use]
    pub fn is_hydrated(&self) -> bool {
        self.inner.state.borrow().hydrated
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.inner.state.borrow().dirty
    }

    /// Watch committed states.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CartState> {
        self.inner.state.subscribe()
    }

    /// The tab this store belongs to.
    #[must_use]
    pub fn tab_id(&self) -> TabId {
        self.inner.storage.tab_id()
    }

    /// Durable storage handle of this tab.
    #[must_use]
    pub fn storage(&self) -> &TabStorage {
        &self.inner.storage
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn update(&self, apply: impl FnOnce(&mut CartState) -> bool) {
        if self.inner.state.send_if_modified(apply) {
            self.persist();
        }
    }

    /// Mirror the committed state into durable storage.
    ///
    /// Failures are logged; the in-memory state stays authoritative.
    fn persist(&self) {
        let (items, pending) = {
            let state = self.inner.state.borrow();
            (state.items.clone(), state.dirty_items.clone())
        };

        let storage = &self.inner.storage;
        if let Err(e) = storage.set_json(CART_KEY, &PersistedCart::new(items)) {
            warn!(error = %e, "Failed to persist cart");
        }

        if self.inner.persist_pending {
            let result = if pending.is_empty() {
                storage.remove_item(PENDING_KEY)
            } else {
                storage.set_json(PENDING_KEY, &pending)
            };
            if let Err(e) = result {
                warn!(error = %e, "Failed to persist pending cart changes");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::StorageArea;

    fn pid(s: &str) -> ProductId {
        ProductId::parse(s).unwrap()
    }

    fn store() -> CartStore {
        let store = CartStore::new(StorageArea::in_memory().tab(TabId::new()), false);
        store.rehydrate();
        store
    }

    #[test]
    fn test_quantity_is_sum_of_deltas() {
        let store = store();
        let p = pid("P1");
        let deltas = [3, -1, 4, -2, 1];
        for delta in deltas {
            store.add_item(&p, delta);
        }
        assert_eq!(store.items().get(&p), 5);
    }

    #[test]
    fn test_add_item_saturates() {
        let store = store();
        let p = pid("P1");
        store.add_item(&p, 1);
        store.add_item(&p, i64::MAX);
        assert_eq!(store.items().get(&p), u32::MAX);
        assert_eq!(store.dirty_items().get(&p), Some(u32::MAX));

        store.add_item(&p, i64::MIN);
        assert!(!store.items().contains(&p));
        assert_eq!(store.dirty_items().get(&p), Some(0));
    }

    #[test]
    fn test_non_positive_total_removes_key() {
        let store = store();
        let p = pid("P1");
        store.add_item(&p, 2);
        store.add_item(&p, -5);
        assert!(!store.items().contains(&p));
        assert_eq!(store.dirty_items().get(&p), Some(0));

        // Further negative deltas stay absent rather than going negative.
        store.add_item(&p, -1);
        store.add_item(&p, 1);
        assert_eq!(store.items().get(&p), 1);
    }

    #[test]
    fn test_rapid_adds_coalesce() {
        let store = store();
        let p = pid("P1");
        store.add_item(&p, 1);
        store.add_item(&p, 1);
        store.add_item(&p, 1);

        let dirty = store.dirty_items();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty.get(&p), Some(3));
        assert!(store.is_dirty());
    }

    #[test]
    fn test_remove_records_tombstone() {
        let store = store();
        let p = pid("P1");
        store.add_item(&p, 2);
        store.remove_item(&p);
        assert!(store.items().is_empty());
        assert_eq!(store.dirty_items().get(&p), Some(0));
    }

    #[test]
    fn test_hydrate_is_idempotent() {
        let store = store();
        store.add_item(&pid("OLD"), 1);
        let items: CartItemMap = [(pid("P1"), 2), (pid("P2"), 4)].into_iter().collect();

        store.hydrate(items.clone());
        assert_eq!(store.items(), items);
        assert!(store.dirty_items().is_empty());

        store.hydrate(items.clone());
        assert_eq!(store.items(), items);
        assert!(store.dirty_items().is_empty());
        assert!(!store.is_dirty());
        assert!(store.is_hydrated());
    }

    #[test]
    fn test_locked_mutations_are_noops() {
        let store = store();
        store.add_item(&pid("P1"), 2);
        store.lock();
        let before = store.snapshot();

        store.add_item(&pid("P1"), 1);
        store.add_item(&pid("P2"), 1);
        store.remove_item(&pid("P1"));

        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn test_clear_keeps_lock() {
        let store = store();
        store.add_item(&pid("P1"), 1);
        store.lock();
        store.clear();

        let state = store.snapshot();
        assert!(state.items.is_empty());
        assert!(state.dirty_items.is_empty());
        assert!(state.hydrated);
        assert!(state.dirty);
        assert!(state.locked);
    }

    #[test]
    fn test_complete_checkout() {
        let store = store();
        store.add_item(&pid("P1"), 1);
        store.complete_checkout();

        let state = store.snapshot();
        assert!(state.locked);
        assert!(state.items.is_empty());
        assert!(!state.has_pending());

        store.add_item(&pid("P1"), 1);
        assert!(store.items().is_empty());
    }

    #[test]
    fn test_reset_to_guest() {
        let store = store();
        store.add_item(&pid("P1"), 1);
        store.lock();
        store.reset_to_guest();
        assert_eq!(store.snapshot(), CartState::default());
    }

    #[test]
    fn test_dirty_flag_operations() {
        let store = store();
        store.mark_dirty();
        assert!(store.is_dirty());
        store.clear_dirty();
        assert!(!store.is_dirty());

        store.add_item(&pid("P1"), 1);
        store.clear_dirty_items();
        assert!(store.dirty_items().is_empty());
        assert_eq!(store.items().get(&pid("P1")), 1);
    }

    #[test]
    fn test_acknowledge_keeps_changes_made_in_flight() {
        let store = store();
        store.add_item(&pid("A"), 1);
        store.add_item(&pid("B"), 1);
        let sent = store.dirty_items();

        store.add_item(&pid("B"), 1);
        assert!(!store.acknowledge_synced(&sent));
        assert_eq!(store.dirty_items().get(&pid("A")), None);
        assert_eq!(store.dirty_items().get(&pid("B")), Some(2));
        assert!(store.is_dirty());

        let sent = store.dirty_items();
        assert!(store.acknowledge_synced(&sent));
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_items_are_persisted_in_envelope() {
        let store = store();
        store.add_item(&pid("P1"), 2);
        let raw = store.storage().get_item(CART_KEY).unwrap();
        assert_eq!(raw, r#"{"state":{"items":{"P1":2}}}"#);
    }

    #[test]
    fn test_rehydrate_reads_durable_copy() {
        let area = StorageArea::in_memory();
        let first = CartStore::new(area.tab(TabId::new()), false);
        first.rehydrate();
        first.add_item(&pid("P1"), 2);

        let second = CartStore::new(area.tab(TabId::new()), false);
        assert!(!second.is_hydrated());
        second.rehydrate();
        assert_eq!(second.items().get(&pid("P1")), 2);
        assert!(second.is_hydrated());
        assert!(second.dirty_items().is_empty());
    }

    #[test]
    fn test_rehydrate_survives_garbage() {
        let area = StorageArea::in_memory();
        let tab = area.tab(TabId::new());
        tab.set_item(CART_KEY, "{{{").unwrap();

        let store = CartStore::new(tab, false);
        store.rehydrate();
        assert!(store.items().is_empty());
        assert!(store.is_hydrated());
    }

    #[test]
    fn test_pending_marker_survives_reload() {
        let area = StorageArea::in_memory();
        let first = CartStore::new(area.tab(TabId::new()), true);
        first.rehydrate();
        first.add_item(&pid("P1"), 1);
        first.remove_item(&pid("P2"));

        let second = CartStore::new(area.tab(TabId::new()), true);
        second.rehydrate();
        assert_eq!(second.dirty_items().get(&pid("P1")), Some(1));
        assert_eq!(second.dirty_items().get(&pid("P2")), Some(0));
        assert!(second.is_dirty());

        second.acknowledge_synced(&second.dirty_items());
        assert!(area.tab(TabId::new()).get_item(PENDING_KEY).is_none());
    }

    #[test]
    fn test_remote_items_leave_dirty_and_storage_alone() {
        let store = store();
        store.add_item(&pid("MINE"), 1);
        let dirty_before = store.dirty_items();
        let stored_before = store.storage().get_item(CART_KEY);

        let incoming: CartItemMap = [(pid("P4"), 1)].into_iter().collect();
        store.apply_remote_items(incoming.clone());

        assert_eq!(store.items(), incoming);
        assert_eq!(store.dirty_items(), dirty_before);
        assert_eq!(store.storage().get_item(CART_KEY), stored_before);
    }

    #[test]
    fn test_subscribers_see_mutations() {
        let store = store();
        let mut rx = store.subscribe();
        rx.borrow_and_update();

        store.add_item(&pid("P1"), 1);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().items.get(&pid("P1")), 1);

        store.lock();
        store.add_item(&pid("P1"), 1);
        rx.borrow_and_update();
        store.add_item(&pid("P1"), 1);
        assert!(!rx.has_changed().unwrap());
    }
}
