//! Identity transitions: login, logout, and the session watchdogs.
//!
//! Login is the only place a guest cart becomes a user cart. The sequence is
//! strictly ordered:
//!
//! 1. persist the identity under [`AUTH_KEY`]
//! 2. merge the guest cart into the server cart (skipped when empty)
//! 3. wipe the local cart
//! 4. fetch the server cart and hydrate from it
//!
//! Only after step 4 does the session become authenticated, so the sync
//! scheduler never sees the guest cart as pending user changes.
//!
//! Logout has exactly one code path, [`SessionManager::logout`], shared by
//! explicit logout, the idle watchdog and the token-expiry watchdog.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use cart_sync_core::{CartItemMap, MergeRequest, UserId, UserRole};

use crate::api::{ApiError, CartApi};
use crate::config::SessionTiming;
use crate::error::{add_breadcrumb, clear_sentry_user, set_sentry_user};
use crate::lifecycle::ActivityMonitor;
use crate::storage::{AUTH_KEY, CART_KEY, StorageError, TabStorage};
use crate::store::CartStore;

/// Errors from identity transitions.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Merge or fetch against the cart API failed.
    #[error("Cart API error: {0}")]
    Api(#[from] ApiError),

    /// The identity could not be persisted.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The token is not a decodable JWT.
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// A logout happened while the login was in flight.
    #[error("Login superseded by logout")]
    Superseded,
}

/// The authenticated identity.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: UserId,
    pub role: UserRole,
    pub token: SecretString,
}

impl AuthUser {
    #[must_use]
    pub fn new(user_id: UserId, role: UserRole, token: impl Into<String>) -> Self {
        Self {
            user_id,
            role,
            token: SecretString::from(token.into()),
        }
    }
}

/// Durable form of [`AuthUser`].
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredAuth {
    user_id: UserId,
    role: UserRole,
    token: String,
}

impl From<&AuthUser> for StoredAuth {
    fn from(user: &AuthUser) -> Self {
        Self {
            user_id: user.user_id.clone(),
            role: user.role,
            token: user.token.expose_secret().to_owned(),
        }
    }
}

impl From<StoredAuth> for AuthUser {
    fn from(stored: StoredAuth) -> Self {
        Self::new(stored.user_id, stored.role, stored.token)
    }
}

#[derive(Deserialize)]
struct Claims {
    exp: i64,
}

/// Read the `exp` claim of a JWT without verifying its signature.
///
/// # Errors
///
/// Returns `SessionError::InvalidToken` if the token has no payload segment,
/// the payload is not base64url JSON, or `exp` is missing or out of range.
pub fn token_expiry(token: &str) -> Result<DateTime<Utc>, SessionError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| SessionError::InvalidToken("missing payload segment".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| SessionError::InvalidToken(e.to_string()))?;
    let claims: Claims =
        serde_json::from_slice(&bytes).map_err(|e| SessionError::InvalidToken(e.to_string()))?;
    DateTime::from_timestamp(claims.exp, 0)
        .ok_or_else(|| SessionError::InvalidToken(format!("exp out of range: {}", claims.exp)))
}

/// Whether `token` is expired at `now`. Undecodable tokens count as expired.
#[must_use]
pub fn is_expired(token: &str, now: DateTime<Utc>) -> bool {
    !token_expiry(token).is_ok_and(|exp| exp > now)
}

/// Collaborators notified of identity changes.
///
/// Called synchronously at the end of each transition. Implementations that
/// need to do async work should spawn it.
pub trait SessionHooks: Send + Sync + 'static {
    /// A login completed and the cart is hydrated from the server.
    fn on_login(&self, _user: &AuthUser) {}

    /// The session ended.
    fn on_logout(&self) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl SessionHooks for NoopHooks {}

/// Owns the current identity and performs login/logout.
pub struct SessionManager<A> {
    inner: Arc<SessionInner<A>>,
}

impl<A> Clone for SessionManager<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct SessionInner<A> {
    api: Arc<A>,
    store: CartStore,
    storage: TabStorage,
    user: watch::Sender<Option<AuthUser>>,
    hooks: Arc<dyn SessionHooks>,
    /// Serializes logins.
    transition: Mutex<()>,
    /// Bumped by every logout; a login that observes a change aborts.
    epoch: AtomicU64,
}

impl<A: CartApi> SessionManager<A> {
    /// Create a logged-out session manager.
    #[must_use]
    pub fn new(
        api: Arc<A>,
        store: CartStore,
        storage: TabStorage,
        hooks: Arc<dyn SessionHooks>,
    ) -> Self {
        let (user, _) = watch::channel(None);
        Self {
            inner: Arc::new(SessionInner {
                api,
                store,
                storage,
                user,
                hooks,
                transition: Mutex::new(()),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Restore a persisted identity, if one is present and still valid.
    ///
    /// Malformed or expired entries are removed. Returns whether the session
    /// is now authenticated.
    pub fn restore(&self) -> bool {
        let Some(raw) = self.inner.storage.get_item(AUTH_KEY) else {
            return false;
        };

        let user = match serde_json::from_str::<StoredAuth>(&raw) {
            Ok(stored) => AuthUser::from(stored),
            Err(e) => {
                warn!(error = %e, "Discarding malformed persisted identity");
                self.forget_persisted_identity();
                return false;
            }
        };

        if is_expired(user.token.expose_secret(), Utc::now()) {
            info!(user_id = %user.user_id, "Persisted identity expired");
            self.forget_persisted_identity();
            return false;
        }

        info!(user_id = %user.user_id, role = %user.role, "Restored session");
        set_sentry_user(&user.user_id);
        self.inner.user.send_replace(Some(user));
        true
    }

    /// Log in, carrying the guest cart over to the user's server cart.
    ///
    /// Logging in while already authenticated logs the current user out
    /// first, so their cart is never merged a second time as guest items.
    ///
    /// On failure the persisted identity is removed and the session stays
    /// logged out. If the local cart had already been wiped, the store is
    /// reset to an empty guest cart; otherwise the guest cart is untouched.
    /// A logout while the login is in flight leaves the store alone once it
    /// has reset it.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Storage` if the identity cannot be persisted,
    /// `SessionError::Api` if the merge or fetch fails, and
    /// `SessionError::Superseded` if a logout ran concurrently.
    #[instrument(skip_all, fields(user_id = %user.user_id))]
    pub async fn login(&self, user: AuthUser) -> Result<(), SessionError> {
        let _transition = self.inner.transition.lock().await;
        if self.is_authenticated() {
            info!("Switching identity, ending current session");
            self.logout();
        }
        let epoch = self.inner.epoch.load(Ordering::SeqCst);

        self.inner
            .storage
            .set_json(AUTH_KEY, &StoredAuth::from(&user))?;

        let mut cleared = false;
        let result = self
            .transfer_cart(&user.token, epoch, &mut cleared)
            .await
            .map_err(|e| match self.ensure_current(epoch) {
                Ok(()) => e,
                Err(superseded) => superseded,
            });

        if let Err(e) = result {
            warn!(error = %e, "Login failed, rolling back");
            let reason = e.to_string();
            add_breadcrumb("cart.session", "Login failed", Some(&[("error", reason.as_str())]));
            if !matches!(e, SessionError::Superseded) {
                self.forget_persisted_identity();
                if cleared {
                    self.inner.store.reset_to_guest();
                }
            }
            return Err(e);
        }

        info!(role = %user.role, "Logged in");
        set_sentry_user(&user.user_id);
        self.inner.hooks.on_login(&user);
        self.inner.user.send_replace(Some(user));
        Ok(())
    }

    /// Steps 2 to 4 of the login sequence.
    ///
    /// The store is only touched while `epoch` is current; each await is
    /// followed by a check.
    async fn transfer_cart(
        &self,
        token: &SecretString,
        epoch: u64,
        cleared: &mut bool,
    ) -> Result<(), SessionError> {
        let store = &self.inner.store;

        let guest_items = store.items();
        if guest_items.is_empty() {
            debug!("Guest cart empty, skipping merge");
        } else {
            let items = guest_items.len();
            self.inner
                .api
                .merge(token, &MergeRequest { guest_items })
                .await?;
            self.ensure_current(epoch)?;
            info!(items, "Merged guest cart");
        }

        store.clear();
        if let Err(e) = self.inner.storage.remove_item(CART_KEY) {
            warn!(error = %e, "Failed to remove guest cart entry");
        }
        *cleared = true;

        let response = self.inner.api.fetch_cart(token).await?;
        self.ensure_current(epoch)?;
        let items = CartItemMap::from_lines(&response.items);
        debug!(items = items.len(), "Fetched server cart");
        store.hydrate(items);
        Ok(())
    }

    /// End the session.
    ///
    /// Removes the persisted identity, resets the cart to an empty guest cart
    /// and lifts the checkout lock.
    pub fn logout(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.forget_persisted_identity();
        let previous = self.inner.user.send_replace(None);
        self.inner.store.reset_to_guest();
        self.inner.store.unlock();
        self.inner.hooks.on_logout();
        clear_sentry_user();
        match previous {
            Some(user) => info!(user_id = %user.user_id, "Logged out"),
            None => debug!("Logout while already logged out"),
        }
    }

    fn ensure_current(&self, epoch: u64) -> Result<(), SessionError> {
        if self.inner.epoch.load(Ordering::SeqCst) == epoch {
            Ok(())
        } else {
            Err(SessionError::Superseded)
        }
    }

    fn forget_persisted_identity(&self) {
        if let Err(e) = self.inner.storage.remove_item(AUTH_KEY) {
            warn!(error = %e, "Failed to remove persisted identity");
        }
    }

    /// The current identity.
    #[must_use]
    pub fn current_user(&self) -> Option<AuthUser> {
        self.inner.user.borrow().clone()
    }

    /// The current bearer token.
    #[must_use]
    pub fn token(&self) -> Option<SecretString> {
        self.inner.user.borrow().as_ref().map(|u| u.token.clone())
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.inner.user.borrow().is_some()
    }

    /// Observe identity changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<AuthUser>> {
        self.inner.user.subscribe()
    }

    /// Spawn the idle and token-expiry watchdogs.
    ///
    /// They run only while a user is logged in and restart on every login.
    /// Either one firing calls [`SessionManager::logout`].
    pub fn spawn_watchdogs(&self, activity: ActivityMonitor, timing: SessionTiming) -> JoinHandle<()> {
        let session = self.clone();
        let mut user = self.subscribe();
        tokio::spawn(async move {
            loop {
                let token = user.borrow_and_update().as_ref().map(|u| u.token.clone());
                let Some(token) = token else {
                    if user.changed().await.is_err() {
                        return;
                    }
                    continue;
                };

                let started = Instant::now();
                tokio::select! {
                    () = activity.wait_quiet_after(Some(started), timing.idle_logout) => {
                        info!(idle_secs = timing.idle_logout.as_secs(), "Logging out after inactivity");
                        session.logout();
                    }
                    () = wait_for_expiry(&token, timing.token_check_interval) => {
                        info!("Logging out, token expired");
                        session.logout();
                    }
                    changed = user.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        })
    }
}

/// Check the token on every tick; resolve once it is expired.
async fn wait_for_expiry(token: &SecretString, every: std::time::Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if is_expired(token.expose_secret(), Utc::now()) {
            return;
        }
    }
}
