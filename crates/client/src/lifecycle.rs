//! Page lifecycle and user-activity signals.
//!
//! These are inputs the engine reacts to but does not own: whoever hosts the
//! engine (a browser shim, the CLI's signal handler, a test) emits them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Teardown signals that trigger the unload flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// The page is being hidden (navigation, tab close, bfcache).
    PageHide,
    /// The page is about to unload.
    BeforeUnload,
}

type Listener = Arc<dyn Fn(LifecycleEvent) + Send + Sync>;

/// Registry of synchronous lifecycle listeners.
///
/// Listeners run in-line inside [`PageLifecycle::emit`]: by the time a
/// teardown signal has been emitted, every listener has finished, so nothing
/// depends on the runtime surviving the teardown.
#[derive(Clone, Default)]
pub struct PageLifecycle {
    inner: Arc<LifecycleInner>,
}

#[derive(Default)]
struct LifecycleInner {
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

impl PageLifecycle {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. It stays registered until the guard is dropped.
    #[must_use = "dropping the guard unregisters the listener"]
    pub fn add_listener(
        &self,
        listener: impl Fn(LifecycleEvent) + Send + Sync + 'static,
    ) -> ListenerGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        ListenerGuard {
            lifecycle: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Deliver an event to every registered listener, in registration order.
    pub fn emit(&self, event: LifecycleEvent) {
        // Snapshot first so a listener may (un)register without deadlocking.
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        tracing::debug!(?event, listeners = listeners.len(), "Lifecycle event");
        for listener in listeners {
            listener(event);
        }
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Unregisters its listener when dropped.
pub struct ListenerGuard {
    lifecycle: std::sync::Weak<LifecycleInner>,
    id: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.lifecycle.upgrade() {
            inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}

/// Kinds of user input that count as activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activity {
    MouseMove,
    KeyDown,
    Click,
    Scroll,
}

/// Tracks when the user last interacted.
///
/// Feeds both the idle-logout watchdog and the idle-slot deferral of the
/// sync scheduler.
#[derive(Clone)]
pub struct ActivityMonitor {
    last: Arc<watch::Sender<Instant>>,
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityMonitor {
    /// Start tracking; creation counts as activity.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Instant::now());
        Self { last: Arc::new(tx) }
    }

    /// Record one input event.
    pub fn record(&self, activity: Activity) {
        tracing::trace!(?activity, "User activity");
        self.last.send_replace(Instant::now());
    }

    /// When the user last interacted.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *self.last.borrow()
    }

    /// Resolve once no activity has been recorded for `window`.
    pub async fn wait_quiet(&self, window: Duration) {
        self.wait_quiet_after(None, window).await;
    }

    /// Like [`ActivityMonitor::wait_quiet`], but the quiet period cannot start
    /// before `floor`.
    pub async fn wait_quiet_after(&self, floor: Option<Instant>, window: Duration) {
        let mut rx = self.last.subscribe();
        loop {
            let last = *rx.borrow_and_update();
            let deadline = floor.map_or(last, |floor| floor.max(last)) + window;
            if Instant::now() >= deadline {
                return;
            }
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {}
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn test_emit_reaches_listeners() {
        let lifecycle = PageLifecycle::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _guard = lifecycle.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        lifecycle.emit(LifecycleEvent::PageHide);
        lifecycle.emit(LifecycleEvent::BeforeUnload);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_guard_drop_unregisters() {
        let lifecycle = PageLifecycle::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let guard = lifecycle.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(lifecycle.listener_count(), 1);

        drop(guard);
        lifecycle.emit(LifecycleEvent::PageHide);
        assert_eq!(lifecycle.listener_count(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_quiet_extends_on_activity() {
        let monitor = ActivityMonitor::new();
        let start = Instant::now();

        let waiter = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.wait_quiet(Duration::from_secs(10)).await })
        };

        tokio::time::sleep(Duration::from_secs(6)).await;
        monitor.record(Activity::KeyDown);
        waiter.await.ok();

        assert!(Instant::now() - start >= Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_quiet_after_floor() {
        let monitor = ActivityMonitor::new();
        tokio::time::sleep(Duration::from_secs(30)).await;

        let floor = Instant::now();
        monitor.wait_quiet_after(Some(floor), Duration::from_secs(10)).await;
        assert_eq!(Instant::now() - floor, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_quiet_returns_when_already_quiet() {
        let monitor = ActivityMonitor::new();
        tokio::time::sleep(Duration::from_secs(5)).await;
        let before = Instant::now();
        monitor.wait_quiet(Duration::from_secs(1)).await;
        assert_eq!(Instant::now(), before);
    }
}
