//! Online/offline state with flap suppression.
//!
//! Raw signals (browser events, a health probe, tests) go in through
//! [`ConnectivityMonitor::report`]. A change is committed only after the raw
//! state has held for the stability window, so a flaky link does not start a
//! sync storm. Subscribers see committed transitions only.

use crate::remote::Remote;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Debounced connectivity state.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    raw: watch::Sender<bool>,
    committed: watch::Receiver<bool>,
    debounce: JoinHandle<()>,
}

impl ConnectivityMonitor {
    /// Start a monitor in state `initial`. Must be called inside a tokio
    /// runtime.
    pub fn spawn(initial: bool, stability_window: Duration) -> Arc<Self> {
        let (raw, raw_rx) = watch::channel(initial);
        let (committed_tx, committed) = watch::channel(initial);
        let debounce = tokio::spawn(debounce(raw_rx, committed_tx, stability_window));

        Arc::new(Self {
            raw,
            committed,
            debounce,
        })
    }

    /// Current committed state.
    pub fn is_online(&self) -> bool {
        *self.committed.borrow()
    }

    /// Feed a raw observation. Repeating the current raw state is a no-op.
    pub fn report(&self, online: bool) {
        self.raw.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    /// A receiver of committed state changes.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.committed.clone()
    }

    /// Call `callback` on every committed transition until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    pub fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let mut rx = self.watch();
        let _ = rx.borrow_and_update();

        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                callback(online);
            }
        });
        Subscription { handle }
    }

    /// Poll `remote.ping()` every `interval` and report the result as raw
    /// input. Any answer from the remote counts as online, even an error
    /// status; only transport failures and timeouts count as offline.
    ///
    /// The probe holds only a weak reference and stops with the monitor.
    pub fn spawn_probe(self: &Arc<Self>, remote: Arc<dyn Remote>, interval: Duration) -> Subscription {
        let monitor: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let reachable = match tokio::time::timeout(interval, remote.ping()).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => !e.is_retryable(),
                    Err(_) => false,
                };

                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                tracing::trace!(reachable, "connectivity probe");
                monitor.report(reachable);
            }
        });
        Subscription { handle }
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.debounce.abort();
    }
}

async fn debounce(
    mut raw: watch::Receiver<bool>,
    committed: watch::Sender<bool>,
    window: Duration,
) {
    while raw.changed().await.is_ok() {
        // Restart the window on every raw change until the state holds.
        loop {
            let candidate = *raw.borrow_and_update();
            match tokio::time::timeout(window, raw.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return,
                Err(_) => {
                    let changed = committed.send_if_modified(|current| {
                        if *current == candidate {
                            false
                        } else {
                            *current = candidate;
                            true
                        }
                    });
                    if changed {
                        tracing::info!(online = candidate, "connectivity changed");
                    }
                    break;
                }
            }
        }
    }
}

/// A background listener; stops when dropped.
#[derive(Debug)]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const WINDOW: Duration = Duration::from_secs(2);

    async fn settle(by: Duration) {
        tokio::time::sleep(by).await;
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn commits_after_stability_window() {
        let monitor = ConnectivityMonitor::spawn(false, WINDOW);
        monitor.report(true);

        settle(Duration::from_millis(1_900)).await;
        assert!(!monitor.is_online());

        settle(Duration::from_millis(200)).await;
        assert!(monitor.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn flaps_inside_window_are_suppressed() {
        let monitor = ConnectivityMonitor::spawn(true, WINDOW);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let _sub = monitor.on_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for online in [false, true, false, true] {
            monitor.report(online);
            settle(Duration::from_millis(500)).await;
        }
        settle(WINDOW * 2).await;

        assert!(monitor.is_online());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn callbacks_fire_on_transitions_until_unsubscribed() {
        let monitor = ConnectivityMonitor::spawn(true, WINDOW);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = monitor.on_change(move |online| sink.lock().unwrap().push(online));

        monitor.report(false);
        settle(WINDOW * 2).await;
        monitor.report(true);
        settle(WINDOW * 2).await;
        assert_eq!(*seen.lock().unwrap(), vec![false, true]);

        sub.unsubscribe();
        monitor.report(false);
        settle(WINDOW * 2).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert!(!monitor.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_window_commits_immediately() {
        let monitor = ConnectivityMonitor::spawn(false, Duration::ZERO);
        let mut rx = monitor.watch();

        monitor.report(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
