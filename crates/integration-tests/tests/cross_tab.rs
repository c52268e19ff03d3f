//! Replication of the cart between tabs sharing one storage area.

#![allow(clippy::unwrap_used)]

use cart_sync_client::StorageArea;
use cart_sync_client::storage::CART_KEY;
use cart_sync_core::TabId;
use cart_sync_integration_tests::{MockCartApi, advance_ms, open_tab, pid, settle, user};

#[tokio::test(start_paused = true)]
async fn test_other_tab_adopts_items_without_dirtying() {
    let area = StorageArea::in_memory();
    let api = MockCartApi::new();
    let a = open_tab(&area, &api);
    let b = open_tab(&area, &api);

    a.store().add_item(&pid("P1"), 2);
    settle().await;

    assert_eq!(b.store().items().get(&pid("P1")), 2);
    assert!(b.store().dirty_items().is_empty());
    assert!(!b.store().is_dirty());
    assert_eq!(a.store().dirty_items().get(&pid("P1")), Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_and_removed_entries_are_ignored() {
    let area = StorageArea::in_memory();
    let api = MockCartApi::new();
    let a = open_tab(&area, &api);
    a.store().add_item(&pid("P1"), 2);
    settle().await;

    let writer = area.tab(TabId::new());
    writer.set_item(CART_KEY, "{not json").unwrap();
    settle().await;
    assert_eq!(a.store().items().get(&pid("P1")), 2);

    writer.set_item(CART_KEY, r#"{"state":{}}"#).unwrap();
    settle().await;
    assert_eq!(a.store().items().get(&pid("P1")), 2);

    writer.remove_item(CART_KEY).unwrap();
    settle().await;
    assert_eq!(a.store().items().get(&pid("P1")), 2);
}

#[tokio::test(start_paused = true)]
async fn test_only_the_writing_tab_syncs() {
    let area = StorageArea::in_memory();
    let api = MockCartApi::new();
    let a = open_tab(&area, &api);
    a.login(user("u1")).await.unwrap();
    let b = open_tab(&area, &api);
    assert!(b.session().is_authenticated());

    a.store().add_item(&pid("P1"), 1);
    settle().await;
    advance_ms(2_000).await;
    b.store().add_item(&pid("P2"), 1);
    settle().await;

    // Adopting B's items does not touch A's pending changes or its timer.
    advance_ms(2_100).await;
    let syncs = api.syncs();
    assert_eq!(syncs.len(), 1);
    assert_eq!(syncs.first().map(|s| s.items.len()), Some(1));
    assert_eq!(a.store().items().get(&pid("P2")), 1);

    advance_ms(2_000).await;
    assert_eq!(api.sync_count(), 2);
    assert_eq!(api.server_cart().len(), 2);

    advance_ms(30_000).await;
    assert_eq!(api.sync_count(), 2);
}
