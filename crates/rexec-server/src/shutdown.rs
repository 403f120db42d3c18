//! Server run state and stop requests.
//!
//! A stop can come from inside the process ([`ShutdownCoordinator::request_stop`])
//! or from the pluggable [`StopSignal`] polled on every accept-loop tick.
//! Either path moves `Running` to `Stopping` once; repeated requests are
//! no-ops.

use rexec_core::{RexecError, RexecResult, StopSignal};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;

/// Lifecycle of a server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Holds the running flag and the external stop signal.
pub struct ShutdownCoordinator {
    state: Mutex<RunState>,
    stopping: watch::Sender<bool>,
    signal: Arc<dyn StopSignal>,
}

impl ShutdownCoordinator {
    pub fn new(signal: Arc<dyn StopSignal>) -> Self {
        let (stopping, _) = watch::channel(false);
        Self {
            state: Mutex::new(RunState::Idle),
            stopping,
            signal,
        }
    }

    fn state_guard(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> RunState {
        *self.state_guard()
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    /// Describe the external stop signal.
    pub fn signal_description(&self) -> String {
        self.signal.describe()
    }

    /// Enter `Running`. Clears a stale stop request first.
    ///
    /// Returns whether a stale request was cleared.
    pub fn start(&self) -> RexecResult<bool> {
        if matches!(self.state(), RunState::Running | RunState::Stopping) {
            return Err(RexecError::Other("server is already running".into()));
        }
        // Signal backends may touch the filesystem; keep that off the lock.
        let cleared = self.signal.clear()?;
        let mut state = self.state_guard();
        if matches!(*state, RunState::Running | RunState::Stopping) {
            return Err(RexecError::Other("server is already running".into()));
        }
        *state = RunState::Running;
        self.stopping.send_replace(false);
        debug!("run state: running");
        Ok(cleared)
    }

    /// In-process stop request. Returns `true` only on the transition.
    pub fn request_stop(&self) -> bool {
        let mut state = self.state_guard();
        if *state != RunState::Running {
            return false;
        }
        *state = RunState::Stopping;
        self.stopping.send_replace(true);
        debug!("run state: stopping (requested)");
        true
    }

    /// Check the external signal. Returns `true` only when it triggers the
    /// transition; once stopping or stopped this never does anything.
    pub fn poll_signal(&self) -> bool {
        if !self.is_running() || !self.signal.is_raised() {
            return false;
        }
        let mut state = self.state_guard();
        if *state != RunState::Running {
            return false;
        }
        *state = RunState::Stopping;
        self.stopping.send_replace(true);
        debug!("run state: stopping (signal)");
        true
    }

    /// Final transition once the listener is closed and clients are gone.
    pub fn mark_stopped(&self) {
        *self.state_guard() = RunState::Stopped;
        self.stopping.send_replace(true);
        debug!("run state: stopped");
    }

    /// Receiver that flips to `true` when a stop begins.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.stopping.subscribe()
    }

    /// Resolve once a stop has been requested.
    pub async fn stopping(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|stopping| *stopping).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rexec_core::{FileStopSignal, ManualStopSignal, NeverStop};
    use std::time::Duration;

    #[test]
    fn request_stop_is_idempotent() {
        let coordinator = ShutdownCoordinator::new(Arc::new(NeverStop));
        assert!(!coordinator.request_stop());
        coordinator.start().unwrap();
        assert!(coordinator.request_stop());
        assert!(!coordinator.request_stop());
        assert_eq!(coordinator.state(), RunState::Stopping);
        coordinator.mark_stopped();
        assert!(!coordinator.request_stop());
        assert_eq!(coordinator.state(), RunState::Stopped);
    }

    #[test]
    fn signal_triggers_once() {
        let signal = Arc::new(ManualStopSignal::new());
        let coordinator = ShutdownCoordinator::new(signal.clone());
        coordinator.start().unwrap();
        assert!(!coordinator.poll_signal());

        signal.raise();
        assert!(coordinator.poll_signal());
        assert!(!coordinator.poll_signal());
        coordinator.mark_stopped();
        assert!(!coordinator.poll_signal());
    }

    #[test]
    fn start_clears_stale_flag_file() {
        let dir = tempfile::tempdir().unwrap();
        let signal = FileStopSignal::new(dir.path().join("stop.flag"));
        signal.raise().unwrap();

        let coordinator = ShutdownCoordinator::new(Arc::new(signal.clone()));
        assert!(coordinator.start().unwrap());
        assert!(!signal.is_raised());
        assert!(!coordinator.poll_signal());
        assert!(coordinator.start().is_err());
    }

    #[test]
    fn restart_after_stop() {
        let coordinator = ShutdownCoordinator::new(Arc::new(NeverStop));
        coordinator.start().unwrap();
        coordinator.request_stop();
        coordinator.mark_stopped();
        assert!(!coordinator.start().unwrap());
        assert!(coordinator.is_running());
        assert!(!*coordinator.subscribe().borrow());
    }

    /// Records whether the coordinator's state lock was free whenever the
    /// signal was consulted.
    #[derive(Default)]
    struct LockWatcher {
        coordinator: std::sync::OnceLock<std::sync::Weak<ShutdownCoordinator>>,
        raised: std::sync::atomic::AtomicBool,
        lock_free: Mutex<Vec<bool>>,
    }

    impl LockWatcher {
        fn record(&self) {
            if let Some(coordinator) = self.coordinator.get().and_then(|c| c.upgrade()) {
                let free = coordinator.state.try_lock().is_ok();
                self.lock_free.lock().unwrap().push(free);
            }
        }
    }

    impl StopSignal for LockWatcher {
        fn is_raised(&self) -> bool {
            self.record();
            self.raised.load(std::sync::atomic::Ordering::SeqCst)
        }

        fn clear(&self) -> RexecResult<bool> {
            self.record();
            Ok(false)
        }

        fn describe(&self) -> String {
            "lock check".into()
        }
    }

    #[test]
    fn signal_is_consulted_outside_the_state_lock() {
        let signal = Arc::new(LockWatcher::default());
        let coordinator = Arc::new(ShutdownCoordinator::new(signal.clone()));
        signal
            .coordinator
            .set(Arc::downgrade(&coordinator))
            .unwrap();

        coordinator.start().unwrap();
        assert!(!coordinator.poll_signal());
        signal.raised.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(coordinator.poll_signal());

        let seen = signal.lock_free.lock().unwrap().clone();
        assert_eq!(seen, vec![true, true, true]);
    }

    #[tokio::test]
    async fn stopping_future_resolves_on_request() {
        let coordinator = Arc::new(ShutdownCoordinator::new(Arc::new(NeverStop)));
        coordinator.start().unwrap();
        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.stopping().await })
        };
        coordinator.request_stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
