//! Integration tests for the cart sync engine.
//!
//! The tests run whole tabs against [`MockCartApi`], an in-process stand-in
//! for the remote cart service, with Tokio's clock paused so debounce and
//! backoff timing is deterministic.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p cart-sync-integration-tests
//! ```

#![cfg_attr(not(test), forbid(unsafe_code))]
#![allow(clippy::missing_panics_doc)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Notify;

use cart_sync_client::{
    ApiError, AuthUser, CartApi, CartClient, CartSyncConfig, IdleGate, StorageArea,
};
use cart_sync_core::{
    CartLine, CartResponse, MergeRequest, ProductId, SyncMode, SyncRequest, UserId, UserRole,
};

/// Recorded state of [`MockCartApi`].
#[derive(Default)]
struct MockState {
    server_cart: BTreeMap<ProductId, i64>,
    syncs: Vec<SyncRequest>,
    merges: Vec<MergeRequest>,
    fetches: usize,
    beacons: Vec<SyncRequest>,
    tokens: Vec<String>,
}

/// In-process cart service.
///
/// Merges add guest quantities to the server cart; partial syncs overwrite
/// the listed products (0 deletes); full syncs replace the cart.
#[derive(Clone, Default)]
pub struct MockCartApi {
    state: Arc<Mutex<MockState>>,
    failing_syncs: Arc<AtomicU32>,
    fail_merge: Arc<AtomicBool>,
    fail_fetch: Arc<AtomicBool>,
    hold_fetch: Arc<AtomicBool>,
    fetch_gate: Arc<Notify>,
}

impl MockCartApi {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Seed the server-side cart.
    pub fn set_server_cart(&self, items: &[(&str, i64)]) {
        self.with_state(|s| {
            s.server_cart = items.iter().map(|(id, q)| (pid(id), *q)).collect();
        });
    }

    #[must_use]
    pub fn server_cart(&self) -> BTreeMap<ProductId, i64> {
        self.with_state(|s| s.server_cart.clone())
    }

    /// Fail the next `n` sync calls with a 500.
    pub fn fail_next_syncs(&self, n: u32) {
        self.failing_syncs.store(n, Ordering::SeqCst);
    }

    pub fn fail_merge(&self, fail: bool) {
        self.fail_merge.store(fail, Ordering::SeqCst);
    }

    pub fn fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    /// Make `fetch_cart` wait for [`Self::release_fetch`] before answering.
    pub fn hold_fetch(&self) {
        self.hold_fetch.store(true, Ordering::SeqCst);
    }

    /// Let a held `fetch_cart` answer.
    pub fn release_fetch(&self) {
        self.hold_fetch.store(false, Ordering::SeqCst);
        self.fetch_gate.notify_one();
    }

    /// Every sync request received, including failed ones.
    #[must_use]
    pub fn syncs(&self) -> Vec<SyncRequest> {
        self.with_state(|s| s.syncs.clone())
    }

    #[must_use]
    pub fn sync_count(&self) -> usize {
        self.with_state(|s| s.syncs.len())
    }

    #[must_use]
    pub fn merges(&self) -> Vec<MergeRequest> {
        self.with_state(|s| s.merges.clone())
    }

    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.with_state(|s| s.fetches)
    }

    #[must_use]
    pub fn beacons(&self) -> Vec<SyncRequest> {
        self.with_state(|s| s.beacons.clone())
    }

    /// Bearer tokens seen, in call order.
    #[must_use]
    pub fn tokens(&self) -> Vec<String> {
        self.with_state(|s| s.tokens.clone())
    }

    fn apply_sync(state: &mut MockState, request: &SyncRequest) {
        if request.mode == SyncMode::Full {
            state.server_cart.clear();
        }
        for (id, quantity) in request.items.iter() {
            if quantity == 0 {
                state.server_cart.remove(id);
            } else {
                state.server_cart.insert(id.clone(), i64::from(quantity));
            }
        }
    }
}

impl CartApi for MockCartApi {
    async fn sync(&self, token: &SecretString, request: &SyncRequest) -> Result<(), ApiError> {
        let fail = self
            .failing_syncs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        self.with_state(|s| {
            s.tokens.push(token.expose_secret().to_owned());
            s.syncs.push(request.clone());
            if fail {
                return Err(ApiError::Status {
                    status: 500,
                    message: "Something went wrong".to_string(),
                });
            }
            Self::apply_sync(s, request);
            Ok(())
        })
    }

    async fn merge(&self, token: &SecretString, request: &MergeRequest) -> Result<(), ApiError> {
        let fail = self.fail_merge.load(Ordering::SeqCst);
        self.with_state(|s| {
            s.tokens.push(token.expose_secret().to_owned());
            s.merges.push(request.clone());
            if fail {
                return Err(ApiError::Status {
                    status: 502,
                    message: "Merge failed".to_string(),
                });
            }
            for (id, quantity) in request.guest_items.iter() {
                *s.server_cart.entry(id.clone()).or_insert(0) += i64::from(quantity);
            }
            Ok(())
        })
    }

    async fn fetch_cart(&self, token: &SecretString) -> Result<CartResponse, ApiError> {
        if self.hold_fetch.load(Ordering::SeqCst) {
            self.fetch_gate.notified().await;
        }
        let fail = self.fail_fetch.load(Ordering::SeqCst);
        self.with_state(|s| {
            s.tokens.push(token.expose_secret().to_owned());
            s.fetches += 1;
            if fail {
                return Err(ApiError::Unauthorized);
            }
            Ok(CartResponse {
                items: s
                    .server_cart
                    .iter()
                    .map(|(id, quantity)| CartLine {
                        item_id: id.clone(),
                        quantity: *quantity,
                    })
                    .collect(),
            })
        })
    }

    fn send_beacon(&self, token: &SecretString, request: &SyncRequest) -> bool {
        self.with_state(|s| {
            s.tokens.push(token.expose_secret().to_owned());
            s.beacons.push(request.clone());
            Self::apply_sync(s, request);
        });
        true
    }
}

/// Parse a product ID, panicking on invalid input.
#[must_use]
pub fn pid(s: &str) -> ProductId {
    ProductId::parse(s).unwrap_or_else(|e| panic!("invalid product id {s:?}: {e}"))
}

/// A JWT whose `exp` is `valid_for` from now. Negative values are in the past.
#[must_use]
pub fn jwt(valid_for: chrono::Duration) -> String {
    let exp = (chrono::Utc::now() + valid_for).timestamp();
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"user-1","exp":{exp}}}"#));
    format!("eyJhbGciOiJIUzI1NiJ9.{payload}.c2lnbmF0dXJl")
}

/// A user with a token valid for an hour.
#[must_use]
pub fn user(id: &str) -> AuthUser {
    AuthUser::new(
        UserId::parse(id).unwrap_or_else(|e| panic!("invalid user id {id:?}: {e}")),
        UserRole::User,
        jwt(chrono::Duration::hours(1)),
    )
}

/// Default test configuration.
#[must_use]
pub fn config() -> CartSyncConfig {
    CartSyncConfig::default_for("https://cart.test/api/")
        .unwrap_or_else(|e| panic!("invalid test config: {e}"))
}

/// Start a tab on `area` that syncs without waiting for idle slots.
#[must_use]
pub fn open_tab(area: &StorageArea, api: &MockCartApi) -> CartClient<MockCartApi> {
    CartClient::builder(config(), area.clone(), api.clone())
        .idle_gate(IdleGate::Immediate)
        .start()
}

/// Advance the paused clock by `ms` and let spawned tasks run.
pub async fn advance_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    settle().await;
}

/// Let every ready task run to its next await point.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
