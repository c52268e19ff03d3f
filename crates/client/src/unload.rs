//! Best-effort flush of pending changes when the page is torn down.
//!
//! The listener runs synchronously inside [`PageLifecycle::emit`] and only
//! queues a fire-and-forget beacon, so it never waits on the network.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use cart_sync_core::SyncRequest;

use crate::api::CartApi;
use crate::lifecycle::{LifecycleEvent, ListenerGuard, PageLifecycle};
use crate::session::AuthUser;
use crate::store::CartStore;
use crate::sync::SyncHandle;

/// Sends the pending changes as a beacon on teardown.
pub struct UnloadFlush<A> {
    store: CartStore,
    user: watch::Receiver<Option<AuthUser>>,
    sync: SyncHandle,
    api: Arc<A>,
}

impl<A: CartApi> UnloadFlush<A> {
    #[must_use]
    pub const fn new(
        store: CartStore,
        user: watch::Receiver<Option<AuthUser>>,
        sync: SyncHandle,
        api: Arc<A>,
    ) -> Self {
        Self {
            store,
            user,
            sync,
            api,
        }
    }

    /// Register on `lifecycle` for as long as the returned guard lives.
    #[must_use = "dropping the guard unregisters the flush"]
    pub fn register(self, lifecycle: &PageLifecycle) -> ListenerGuard {
        lifecycle.add_listener(move |event| {
            self.flush(event);
        })
    }

    /// Queue a beacon with the pending changes, if there are any to send.
    ///
    /// Cancels the scheduled debounced sync so the same changes are not sent
    /// twice. Returns whether a beacon was queued. Pending changes stay
    /// pending: delivery is never confirmed.
    pub fn flush(&self, event: LifecycleEvent) -> bool {
        let Some(token) = self.user.borrow().as_ref().map(|u| u.token.clone()) else {
            return false;
        };

        let state = self.store.snapshot();
        if !state.hydrated || state.locked || state.dirty_items.is_empty() {
            return false;
        }

        self.sync.cancel_pending();
        let items = state.dirty_items.len();
        let queued = self
            .api
            .send_beacon(&token, &SyncRequest::partial(state.dirty_items));
        debug!(?event, items, queued, "Unload flush");
        queued
    }
}
