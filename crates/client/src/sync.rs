//! Debounced background sync with exponential backoff.
//!
//! The scheduler is a single task that watches the cart and the session. It
//! is armed while the tab is authenticated, hydrated, unlocked and has pending
//! changes. Any change to those inputs restarts the debounce window; when the
//! window elapses without a change it sends the pending changes as a partial
//! sync.
//!
//! ```text
//! Idle --(armed)--> Scheduled(delay_for(retry))
//!   Scheduled --(input changed)--> Scheduled(restarted)
//!   Scheduled --(cancel)--> Idle until inputs change
//!   Scheduled --(deadline)--> Syncing
//!   Syncing --(ok)--> retry = 0, Idle
//!   Syncing --(err)--> retry += 1, Scheduled(longer delay)
//! ```
//!
//! Background sync never surfaces errors to the user. Failures are logged,
//! left as a breadcrumb, and retried.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use secrecy::SecretString;
use tokio::sync::{Notify, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument};

use cart_sync_core::{CartState, DirtyItems, SyncRequest};

use crate::api::CartApi;
use crate::config::SyncTiming;
use crate::error::{Error, Result, add_breadcrumb};
use crate::lifecycle::ActivityMonitor;
use crate::session::AuthUser;
use crate::store::CartStore;

/// Quiet period that counts as an idle slot.
pub const IDLE_QUIET_WINDOW: Duration = Duration::from_millis(250);

/// Where the scheduler is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Nothing to send, or waiting for inputs to change after a cancel.
    Idle,
    /// A sync will fire after `delay` unless the inputs change first.
    Scheduled { retry: u32, delay: Duration },
    /// Waiting for an idle slot or for the server.
    Syncing,
}

/// How the scheduler waits for a moment when the host is not busy.
#[derive(Clone)]
pub enum IdleGate {
    /// Send as soon as the debounce window elapses.
    Immediate,
    /// Wait for `quiet` without user activity, bounded by the idle timeout.
    Activity {
        monitor: ActivityMonitor,
        quiet: Duration,
    },
}

impl IdleGate {
    async fn wait(&self, ceiling: Duration) {
        let Self::Activity { monitor, quiet } = self else {
            return;
        };
        if tokio::time::timeout(ceiling, monitor.wait_quiet(*quiet))
            .await
            .is_err()
        {
            debug!(ceiling_ms = ceiling.as_millis(), "No idle slot, syncing anyway");
        }
    }
}

/// Handle to a running scheduler.
#[derive(Clone)]
pub struct SyncHandle {
    cancel: Arc<Notify>,
    status: watch::Receiver<SyncStatus>,
    retry: Arc<AtomicU32>,
    task: AbortHandle,
}

impl SyncHandle {
    /// Drop a scheduled sync. It is re-armed the next time the inputs change.
    pub fn cancel_pending(&self) {
        self.cancel.notify_waiters();
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    /// Observe status transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Consecutive failed attempts since the last success.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry.load(Ordering::SeqCst)
    }

    /// Stop the scheduler task.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

/// The inputs the scheduler reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Trigger {
    authenticated: bool,
    hydrated: bool,
    locked: bool,
    dirty_items: DirtyItems,
}

impl Trigger {
    fn read(
        cart: &mut watch::Receiver<CartState>,
        user: &mut watch::Receiver<Option<AuthUser>>,
    ) -> Self {
        let authenticated = user.borrow_and_update().is_some();
        let state = cart.borrow_and_update();
        Self {
            authenticated,
            hydrated: state.hydrated,
            locked: state.locked,
            dirty_items: state.dirty_items.clone(),
        }
    }

    fn armed(&self) -> bool {
        self.authenticated && self.hydrated && !self.locked && !self.dirty_items.is_empty()
    }
}

enum Wake {
    Deadline,
    Cancelled,
    Changed(bool),
}

/// Spawns and drives the scheduler task.
pub struct SyncScheduler<A> {
    store: CartStore,
    user: watch::Receiver<Option<AuthUser>>,
    api: Arc<A>,
    timing: SyncTiming,
    idle: IdleGate,
    cancel: Arc<Notify>,
    status: watch::Sender<SyncStatus>,
    retry: Arc<AtomicU32>,
}

impl<A: CartApi> SyncScheduler<A> {
    /// Start the scheduler for `store`, authenticated by `user`.
    pub fn spawn(
        store: CartStore,
        user: watch::Receiver<Option<AuthUser>>,
        api: Arc<A>,
        timing: SyncTiming,
        idle: IdleGate,
    ) -> SyncHandle {
        let cancel = Arc::new(Notify::new());
        let retry = Arc::new(AtomicU32::new(0));
        let (status, status_rx) = watch::channel(SyncStatus::Idle);

        let scheduler = Self {
            store,
            user,
            api,
            timing,
            idle,
            cancel: Arc::clone(&cancel),
            status,
            retry: Arc::clone(&retry),
        };
        let task = tokio::spawn(scheduler.run()).abort_handle();

        SyncHandle {
            cancel,
            status: status_rx,
            retry,
            task,
        }
    }

    async fn run(mut self) {
        let mut cart = self.store.subscribe();
        let mut trigger = Trigger::read(&mut cart, &mut self.user);

        loop {
            if !trigger.armed() {
                self.set_status(SyncStatus::Idle);
                match self.next_change(&mut cart, &trigger).await {
                    Some(next) => trigger = next,
                    None => return,
                }
                continue;
            }

            let retry = self.retry.load(Ordering::SeqCst);
            let delay = self.timing.backoff.delay_for(retry);
            self.set_status(SyncStatus::Scheduled { retry, delay });
            let deadline = Instant::now() + delay;

            let cancel = Arc::clone(&self.cancel);
            let cancelled = cancel.notified();
            tokio::pin!(cancelled);

            let wake = loop {
                let wake = tokio::select! {
                    () = tokio::time::sleep_until(deadline) => Wake::Deadline,
                    () = &mut cancelled => Wake::Cancelled,
                    changed = wait_either(&mut cart, &mut self.user) => Wake::Changed(changed),
                };
                if matches!(wake, Wake::Changed(true)) {
                    // Only a change to the inputs restarts the window.
                    let next = Trigger::read(&mut cart, &mut self.user);
                    if next == trigger {
                        continue;
                    }
                    trigger = next;
                }
                break wake;
            };

            match wake {
                Wake::Deadline => {
                    self.attempt(&mut cart).await;
                    trigger = Trigger::read(&mut cart, &mut self.user);
                }
                Wake::Cancelled => {
                    debug!("Scheduled sync cancelled");
                    self.set_status(SyncStatus::Idle);
                    match self.next_change(&mut cart, &trigger).await {
                        Some(next) => trigger = next,
                        None => return,
                    }
                }
                Wake::Changed(false) => return,
                Wake::Changed(true) => {}
            }
        }
    }

    /// Wait until the inputs differ from `current`. `None` once the store or
    /// session is gone.
    async fn next_change(
        &mut self,
        cart: &mut watch::Receiver<CartState>,
        current: &Trigger,
    ) -> Option<Trigger> {
        loop {
            if !wait_either(cart, &mut self.user).await {
                return None;
            }
            let next = Trigger::read(cart, &mut self.user);
            if next != *current {
                return Some(next);
            }
        }
    }

    /// One sync attempt with whatever is pending once an idle slot comes up.
    #[instrument(skip_all, fields(retry = self.retry.load(Ordering::SeqCst)))]
    async fn attempt(&mut self, cart: &mut watch::Receiver<CartState>) {
        self.set_status(SyncStatus::Syncing);
        self.idle.wait(self.timing.idle_timeout).await;

        let trigger = Trigger::read(cart, &mut self.user);
        if !trigger.armed() {
            debug!("Nothing to sync after idle wait");
            return;
        }
        let Some(token) = self.current_token() else {
            return;
        };

        let request = SyncRequest::partial(trigger.dirty_items);
        match self.api.sync(&token, &request).await {
            Ok(()) => {
                self.retry.store(0, Ordering::SeqCst);
                let settled = self.store.acknowledge_synced(&request.items);
                info!(items = request.items.len(), settled, "Cart synced");
            }
            Err(e) => {
                let retry = self.retry.fetch_add(1, Ordering::SeqCst).saturating_add(1);
                let next_delay = self.timing.backoff.delay_for(retry);
                error!(
                    error = %e,
                    retry,
                    next_delay_ms = next_delay.as_millis(),
                    "Cart sync failed"
                );
                let retry = retry.to_string();
                add_breadcrumb(
                    "cart.sync",
                    "Partial sync failed",
                    Some(&[("retry", retry.as_str())]),
                );
            }
        }
    }

    fn current_token(&self) -> Option<SecretString> {
        self.user.borrow().as_ref().map(|u| u.token.clone())
    }

    fn set_status(&self, status: SyncStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

/// Resolve when either input changes. `false` once either sender is gone.
async fn wait_either(
    cart: &mut watch::Receiver<CartState>,
    user: &mut watch::Receiver<Option<AuthUser>>,
) -> bool {
    tokio::select! {
        changed = cart.changed() => changed.is_ok(),
        changed = user.changed() => changed.is_ok(),
    }
}

/// Send the entire cart as a full sync, right now.
///
/// Used by explicit user actions. Unlike the background path, errors are
/// returned to the caller; on success the sent changes are acknowledged.
///
/// # Errors
///
/// Returns `Error::Locked` while the cart is locked, `Error::NotLoggedIn`
/// without a token, and `Error::Api` if the request fails.
#[instrument(skip_all)]
pub async fn force_full_sync<A: CartApi>(
    store: &CartStore,
    token: Option<&SecretString>,
    api: &A,
) -> Result<()> {
    if store.is_locked() {
        return Err(Error::Locked);
    }
    let token = token.ok_or(Error::NotLoggedIn)?;

    let items = store.items();
    let request = SyncRequest::full(&items);
    api.sync(token, &request).await?;

    store.acknowledge_synced(&request.items);
    info!(items = request.items.len(), "Full cart sync complete");
    Ok(())
}
