//! Idle and token-expiry logout.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use cart_sync_client::storage::AUTH_KEY;
use cart_sync_client::{Activity, AuthUser, CartClient, SessionHooks, StorageArea};
use cart_sync_core::{TabId, UserId, UserRole};
use cart_sync_integration_tests::{MockCartApi, advance_ms, config, jwt, open_tab, user};

const MINUTE_MS: u64 = 60_000;

#[tokio::test(start_paused = true)]
async fn test_idle_session_logs_out() {
    let area = StorageArea::in_memory();
    let api = MockCartApi::new();
    api.set_server_cart(&[("P1", 1)]);
    let tab = open_tab(&area, &api);
    tab.login(user("u1")).await.unwrap();

    advance_ms(20 * MINUTE_MS - 1_000).await;
    assert!(tab.session().is_authenticated());

    advance_ms(2_000).await;
    assert!(!tab.session().is_authenticated());
    assert!(tab.store().items().is_empty());
    assert!(area.tab(TabId::new()).get_item(AUTH_KEY).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_activity_postpones_idle_logout() {
    let area = StorageArea::in_memory();
    let api = MockCartApi::new();
    let tab = open_tab(&area, &api);
    tab.login(user("u1")).await.unwrap();

    advance_ms(15 * MINUTE_MS).await;
    tab.activity().record(Activity::MouseMove);

    advance_ms(10 * MINUTE_MS).await;
    assert!(tab.session().is_authenticated());

    advance_ms(11 * MINUTE_MS).await;
    assert!(!tab.session().is_authenticated());
}

#[tokio::test(start_paused = true)]
async fn test_idle_window_starts_at_login() {
    let area = StorageArea::in_memory();
    let api = MockCartApi::new();
    let tab = open_tab(&area, &api);

    // A long quiet stretch as a guest does not count against the session.
    advance_ms(30 * MINUTE_MS).await;
    tab.login(user("u1")).await.unwrap();
    advance_ms(MINUTE_MS).await;
    assert!(tab.session().is_authenticated());
}

#[tokio::test(start_paused = true)]
async fn test_expired_token_logs_out_on_next_check() {
    let area = StorageArea::in_memory();
    let api = MockCartApi::new();
    let tab = open_tab(&area, &api);
    let stale = AuthUser::new(
        UserId::parse("u1").unwrap(),
        UserRole::User,
        jwt(chrono::Duration::seconds(-1)),
    );
    tab.login(stale).await.unwrap();

    advance_ms(59_000).await;
    assert!(tab.session().is_authenticated());

    advance_ms(2_000).await;
    assert!(!tab.session().is_authenticated());
}

#[derive(Clone, Default)]
struct CountingHooks {
    logins: Arc<AtomicUsize>,
    logouts: Arc<AtomicUsize>,
}

impl SessionHooks for CountingHooks {
    fn on_login(&self, _user: &AuthUser) {
        self.logins.fetch_add(1, Ordering::SeqCst);
    }

    fn on_logout(&self) {
        self.logouts.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn test_hooks_see_every_transition() {
    let area = StorageArea::in_memory();
    let api = MockCartApi::new();
    let hooks = CountingHooks::default();
    let tab = CartClient::builder(config(), area, api)
        .hooks(hooks.clone())
        .start();

    tab.login(user("u1")).await.unwrap();
    tab.logout();
    tab.login(user("u1")).await.unwrap();
    advance_ms(21 * MINUTE_MS).await;

    assert_eq!(hooks.logins.load(Ordering::SeqCst), 2);
    assert_eq!(hooks.logouts.load(Ordering::SeqCst), 2);
}
