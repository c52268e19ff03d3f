//! The post-checkout lock freezes mutation and sync until the next session.

#![allow(clippy::unwrap_used)]

use cart_sync_client::StorageArea;
use cart_sync_integration_tests::{MockCartApi, advance_ms, open_tab, pid, user};

#[tokio::test(start_paused = true)]
async fn test_checkout_freezes_cart_until_logout() {
    let area = StorageArea::in_memory();
    let api = MockCartApi::new();
    let tab = open_tab(&area, &api);
    tab.login(user("u1")).await.unwrap();

    tab.store().add_item(&pid("P1"), 1);
    tab.store().complete_checkout();

    advance_ms(30_000).await;
    assert_eq!(api.sync_count(), 0);

    tab.store().add_item(&pid("P2"), 1);
    tab.store().remove_item(&pid("P1"));
    assert!(tab.store().items().is_empty());
    assert!(tab.store().is_locked());
    assert!(!tab.store().is_dirty());

    advance_ms(30_000).await;
    assert_eq!(api.sync_count(), 0);

    tab.logout();
    assert!(!tab.store().is_locked());
    assert!(tab.store().items().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_lock_cancels_scheduled_sync() {
    let area = StorageArea::in_memory();
    let api = MockCartApi::new();
    let tab = open_tab(&area, &api);
    tab.login(user("u1")).await.unwrap();

    tab.store().add_item(&pid("P1"), 1);
    advance_ms(2_000).await;
    tab.store().lock();
    advance_ms(10_000).await;
    assert_eq!(api.sync_count(), 0);

    // Clearing a locked cart does not lift the lock.
    tab.store().clear();
    assert!(tab.store().is_locked());
}

#[tokio::test(start_paused = true)]
async fn test_locked_tab_sends_no_beacon() {
    let area = StorageArea::in_memory();
    let api = MockCartApi::new();
    let tab = open_tab(&area, &api);
    tab.login(user("u1")).await.unwrap();
    tab.store().add_item(&pid("P1"), 1);
    tab.store().lock();

    tab.lifecycle()
        .emit(cart_sync_client::LifecycleEvent::PageHide);

    assert!(api.beacons().is_empty());
}
