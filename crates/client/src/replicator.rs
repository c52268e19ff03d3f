//! Cross-tab replication of the cart.
//!
//! Each tab listens for writes other tabs make to [`CART_KEY`] and adopts the
//! new `items` without syncing them: the tab that made the change owns that.

use tokio::task::JoinHandle;
use tracing::{debug, trace};

use cart_sync_core::PersistedCart;

use crate::storage::{CART_KEY, StorageEvent, StorageSubscription};
use crate::store::CartStore;

/// Apply one storage notification to `store`. Returns whether it was adopted.
///
/// Removals and malformed values are ignored.
pub fn apply_storage_event(store: &CartStore, event: &StorageEvent) -> bool {
    if event.key != CART_KEY {
        return false;
    }
    let Some(raw) = event.new_value.as_deref() else {
        trace!(origin = %event.origin, "Cart entry removed by another tab");
        return false;
    };
    let Some(items) = PersistedCart::parse_items(raw) else {
        debug!(origin = %event.origin, "Ignoring malformed cart notification");
        return false;
    };

    trace!(origin = %event.origin, items = items.len(), "Adopting cart from another tab");
    store.apply_remote_items(items);
    true
}

/// Feed `events` into `store` until the storage area goes away.
///
/// Subscribe before the store is rehydrated so no write falls in between.
pub fn spawn_replicator(store: CartStore, mut events: StorageSubscription) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            apply_storage_event(&store, &event);
        }
        debug!("Storage notifications closed, replicator stopped");
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use cart_sync_core::{ProductId, TabId};

    use super::*;
    use crate::storage::{AUTH_KEY, StorageArea};

    fn pid(s: &str) -> ProductId {
        ProductId::parse(s).unwrap()
    }

    fn event(key: &str, value: Option<&str>) -> StorageEvent {
        StorageEvent {
            key: key.to_string(),
            new_value: value.map(String::from),
            origin: TabId::new(),
        }
    }

    fn store() -> CartStore {
        let area = StorageArea::in_memory();
        let store = CartStore::new(area.tab(TabId::new()), false);
        store.rehydrate();
        store
    }

    #[test]
    fn test_adopts_items_without_dirtying() {
        let store = store();
        let adopted = apply_storage_event(
            &store,
            &event(CART_KEY, Some(r#"{"state":{"items":{"p1":3}}}"#)),
        );

        assert!(adopted);
        assert_eq!(store.items().get(&pid("p1")), 3);
        assert!(store.dirty_items().is_empty());
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_ignores_other_keys_removals_and_garbage() {
        let store = store();
        store.add_item(&pid("p1"), 1);

        assert!(!apply_storage_event(&store, &event(AUTH_KEY, Some("{}"))));
        assert!(!apply_storage_event(&store, &event(CART_KEY, None)));
        assert!(!apply_storage_event(&store, &event(CART_KEY, Some("not json"))));
        assert!(!apply_storage_event(&store, &event(CART_KEY, Some(r#"{"items":{}}"#))));

        assert_eq!(store.items().get(&pid("p1")), 1);
    }

    #[tokio::test]
    async fn test_replicator_follows_other_tab() {
        let area = StorageArea::in_memory();
        let a = CartStore::new(area.tab(TabId::new()), false);
        let b = CartStore::new(area.tab(TabId::new()), false);
        let handle = spawn_replicator(b.clone(), b.storage().subscribe());
        a.rehydrate();
        b.rehydrate();

        let mut observed = b.subscribe();
        a.add_item(&pid("p1"), 2);
        observed
            .wait_for(|state| state.items.get(&pid("p1")) == 2)
            .await
            .unwrap();

        assert!(b.dirty_items().is_empty());
        handle.abort();
    }
}
