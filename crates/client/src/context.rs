//! One tab's running cart engine.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use cart_sync_core::TabId;

use crate::api::CartApi;
use crate::config::CartSyncConfig;
use crate::error::Result;
use crate::lifecycle::{ActivityMonitor, ListenerGuard, PageLifecycle};
use crate::replicator::spawn_replicator;
use crate::session::{AuthUser, NoopHooks, SessionHooks, SessionManager};
use crate::storage::StorageArea;
use crate::store::CartStore;
use crate::sync::{IDLE_QUIET_WINDOW, IdleGate, SyncHandle, SyncScheduler, force_full_sync};
use crate::unload::UnloadFlush;

/// The cart engine for one tab.
///
/// Owns the store, session, and the background tasks (scheduler, replicator,
/// session watchdogs). Cheap to clone; the tasks stop when the last clone is
/// dropped or [`CartClient::shutdown`] is called.
pub struct CartClient<A> {
    inner: Arc<CartClientInner<A>>,
}

impl<A> Clone for CartClient<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct CartClientInner<A> {
    config: CartSyncConfig,
    api: Arc<A>,
    store: CartStore,
    session: SessionManager<A>,
    sync: SyncHandle,
    lifecycle: PageLifecycle,
    activity: ActivityMonitor,
    tasks: Vec<JoinHandle<()>>,
    _unload: ListenerGuard,
}

impl<A> Drop for CartClientInner<A> {
    fn drop(&mut self) {
        self.sync.shutdown();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Configures a [`CartClient`] before starting it.
pub struct CartClientBuilder<A> {
    config: CartSyncConfig,
    area: StorageArea,
    api: A,
    hooks: Arc<dyn SessionHooks>,
    lifecycle: PageLifecycle,
    activity: ActivityMonitor,
    idle: Option<IdleGate>,
}

impl<A: CartApi> CartClientBuilder<A> {
    /// Notify `hooks` of logins and logouts.
    #[must_use]
    pub fn hooks(mut self, hooks: impl SessionHooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Listen for teardown on `lifecycle` instead of a private registry.
    #[must_use]
    pub fn lifecycle(mut self, lifecycle: PageLifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Track user activity through `activity`.
    #[must_use]
    pub fn activity(mut self, activity: ActivityMonitor) -> Self {
        self.activity = activity;
        self
    }

    /// Override how the scheduler waits for an idle slot.
    ///
    /// Defaults to waiting for a short quiet period on the activity monitor.
    #[must_use]
    pub fn idle_gate(mut self, idle: IdleGate) -> Self {
        self.idle = Some(idle);
        self
    }

    /// Open this tab's view of storage, restore state and start the
    /// background tasks. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn start(self) -> CartClient<A> {
        let Self {
            config,
            area,
            api,
            hooks,
            lifecycle,
            activity,
            idle,
        } = self;

        let api = Arc::new(api);
        let storage = area.tab(TabId::new());
        let tab_id = storage.tab_id();

        // Subscribe before reading so no other tab's write falls in between.
        let events = storage.subscribe();
        let store = CartStore::new(storage.clone(), config.persist_pending);
        store.rehydrate();
        let replicator = spawn_replicator(store.clone(), events);

        let session = SessionManager::new(Arc::clone(&api), store.clone(), storage, hooks);
        let restored = session.restore();

        let idle = idle.unwrap_or_else(|| IdleGate::Activity {
            monitor: activity.clone(),
            quiet: IDLE_QUIET_WINDOW,
        });
        let sync = SyncScheduler::spawn(
            store.clone(),
            session.subscribe(),
            Arc::clone(&api),
            config.sync,
            idle,
        );
        let watchdogs = session.spawn_watchdogs(activity.clone(), config.session);

        let unload = UnloadFlush::new(
            store.clone(),
            session.subscribe(),
            sync.clone(),
            Arc::clone(&api),
        )
        .register(&lifecycle);

        info!(
            %tab_id,
            restored,
            items = store.items().len(),
            "Cart engine started"
        );

        CartClient {
            inner: Arc::new(CartClientInner {
                config,
                api,
                store,
                session,
                sync,
                lifecycle,
                activity,
                tasks: vec![replicator, watchdogs],
                _unload: unload,
            }),
        }
    }
}

impl<A: CartApi> CartClient<A> {
    /// Start configuring a client for a new tab on `area`.
    #[must_use]
    pub fn builder(config: CartSyncConfig, area: StorageArea, api: A) -> CartClientBuilder<A> {
        CartClientBuilder {
            config,
            area,
            api,
            hooks: Arc::new(NoopHooks),
            lifecycle: PageLifecycle::new(),
            activity: ActivityMonitor::new(),
            idle: None,
        }
    }

    /// Log in and carry the guest cart over.
    ///
    /// # Errors
    ///
    /// Returns `Error::Session` if the login sequence fails; the session is
    /// then still logged out.
    pub async fn login(&self, user: AuthUser) -> Result<()> {
        self.inner.session.login(user).await?;
        Ok(())
    }

    /// End the session and reset to an empty guest cart.
    pub fn logout(&self) {
        self.inner.session.logout();
    }

    /// Push the whole cart to the server now.
    ///
    /// # Errors
    ///
    /// Returns `Error::Locked`, `Error::NotLoggedIn`, or `Error::Api`.
    pub async fn force_full_sync(&self) -> Result<()> {
        let token = self.inner.session.token();
        force_full_sync(&self.inner.store, token.as_ref(), self.inner.api.as_ref()).await
    }

    /// Stop the background tasks. The store stays usable.
    pub fn shutdown(&self) {
        self.inner.sync.shutdown();
        for task in &self.inner.tasks {
            task.abort();
        }
    }

    #[must_use]
    pub fn store(&self) -> &CartStore {
        &self.inner.store
    }

    #[must_use]
    pub fn session(&self) -> &SessionManager<A> {
        &self.inner.session
    }

    #[must_use]
    pub fn sync(&self) -> &SyncHandle {
        &self.inner.sync
    }

    #[must_use]
    pub fn lifecycle(&self) -> &PageLifecycle {
        &self.inner.lifecycle
    }

    #[must_use]
    pub fn activity(&self) -> &ActivityMonitor {
        &self.inner.activity
    }

    #[must_use]
    pub fn api(&self) -> &A {
        &self.inner.api
    }

    #[must_use]
    pub fn config(&self) -> &CartSyncConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn tab_id(&self) -> TabId {
        self.inner.store.tab_id()
    }
}
