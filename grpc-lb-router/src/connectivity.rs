//! Connectivity states and the tracker used to observe them.

use crate::{completion::Completion, error::SharedError};
use std::fmt;

/// The connectivity state of a connection, a policy or a whole router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectivityState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// Combine the states of several connections into one.
///
/// Any READY wins, then CONNECTING, then IDLE. Otherwise (including when
/// there is nothing to aggregate) the result is TRANSIENT_FAILURE.
pub fn aggregate<I>(states: I) -> ConnectivityState
where
    I: IntoIterator<Item = ConnectivityState>,
{
    let (mut connecting, mut idle) = (false, false);
    for state in states {
        match state {
            ConnectivityState::Ready => return ConnectivityState::Ready,
            ConnectivityState::Connecting => connecting = true,
            ConnectivityState::Idle => idle = true,
            ConnectivityState::TransientFailure | ConnectivityState::Shutdown => {}
        }
    }
    if connecting {
        ConnectivityState::Connecting
    } else if idle {
        ConnectivityState::Idle
    } else {
        ConnectivityState::TransientFailure
    }
}

/// Watch callback: fires once with the state that differs from the one the
/// watcher subscribed with.
pub type StateWatcher = Completion<ConnectivityState>;

/// Tracks a connectivity state and notifies one-shot watchers on change.
///
/// Watchers are never re-armed automatically, callers subscribe again after
/// each notification if they are still interested.
pub struct ConnectivityStateTracker {
    name: &'static str,
    state: ConnectivityState,
    error: Option<SharedError>,
    watchers: Vec<StateWatcher>,
}

impl ConnectivityStateTracker {
    pub fn new(name: &'static str, state: ConnectivityState) -> Self {
        Self {
            name,
            state,
            error: None,
            watchers: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    /// The error that caused the current TRANSIENT_FAILURE or SHUTDOWN, if any.
    pub fn error(&self) -> Option<&SharedError> {
        self.error.as_ref()
    }

    /// Move to `state`, notifying every watcher if it actually changed.
    pub fn set(&mut self, state: ConnectivityState, error: Option<SharedError>, reason: &str) {
        self.error = error;
        if self.state == state {
            return;
        }
        tracing::debug!(
            tracker = self.name,
            from = %self.state,
            to = %state,
            reason,
            "connectivity state changed"
        );
        self.state = state;
        for watcher in self.watchers.drain(..) {
            watcher.complete(state);
        }
    }

    /// Register `watcher` to fire once the state differs from `current`.
    ///
    /// Fires immediately if it already does.
    pub fn notify_on_state_change(&mut self, current: ConnectivityState, watcher: StateWatcher) {
        if current != self.state {
            watcher.complete(self.state);
        } else if self.state == ConnectivityState::Shutdown {
            // Nothing will ever change again.
            watcher.complete(ConnectivityState::Shutdown);
        } else {
            self.watchers.push(watcher);
        }
    }
}

impl fmt::Debug for ConnectivityStateTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityStateTracker")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("watchers", &self.watchers.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};
    use ConnectivityState::*;

    #[test]
    fn aggregation_prefers_ready_then_connecting_then_idle() {
        assert_eq!(aggregate([TransientFailure, Ready, Idle]), Ready);
        assert_eq!(aggregate([TransientFailure, Idle, Connecting]), Connecting);
        assert_eq!(aggregate([TransientFailure, Idle]), Idle);
        assert_eq!(aggregate([TransientFailure, TransientFailure]), TransientFailure);
        assert_eq!(aggregate(Vec::new()), TransientFailure);
    }

    fn watcher(log: &Arc<Mutex<Vec<ConnectivityState>>>) -> StateWatcher {
        let log = Arc::clone(log);
        Completion::new(move |state| log.lock().unwrap().push(state), || Shutdown)
    }

    #[test]
    fn watchers_fire_once_per_subscription() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tracker = ConnectivityStateTracker::new("test", Idle);

        tracker.notify_on_state_change(Idle, watcher(&log));
        tracker.set(Idle, None, "no-op");
        assert!(log.lock().unwrap().is_empty());

        tracker.set(Connecting, None, "connect");
        tracker.set(Ready, None, "connected");
        assert_eq!(*log.lock().unwrap(), vec![Connecting]);
    }

    #[test]
    fn stale_subscription_fires_immediately() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tracker = ConnectivityStateTracker::new("test", Ready);
        tracker.notify_on_state_change(Idle, watcher(&log));
        assert_eq!(*log.lock().unwrap(), vec![Ready]);
    }

    #[test]
    fn dropping_tracker_reports_shutdown() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tracker = ConnectivityStateTracker::new("test", Idle);
        tracker.notify_on_state_change(Idle, watcher(&log));
        drop(tracker);
        assert_eq!(*log.lock().unwrap(), vec![Shutdown]);
    }
}
