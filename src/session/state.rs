use std::time::SystemTime;

use crate::error::BridgeError;
use crate::events::{ListenerHandle, Listeners};

/// Connection lifecycle state for one browser session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

impl ConnectionState {
    /// Lowercase name used in errors and responses.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted for every observed state change.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub timestamp: SystemTime,
}

/// The connection state machine.
///
/// Allowed transitions:
///
/// ```text
/// idle          -> connecting                (launch / connect)
/// connecting    -> connected | failed        (success / error / timeout)
/// connected     -> disconnecting | failed    (shutdown / unexpected disconnect)
/// disconnecting -> idle
/// failed        -> connecting                (retry)
/// ```
///
/// Anything else fails with `invalid_state` carrying the current state and
/// the attempted operation. Every successful transition emits exactly one
/// [`StateChange`] to the registered listeners, outside any internal lock.
pub struct StateMachine {
    current: ConnectionState,
    listeners: Listeners<StateChange>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// A machine starting in `idle`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: ConnectionState::Idle,
            listeners: Listeners::new(),
        }
    }

    /// The current state.
    #[must_use]
    pub fn current(&self) -> ConnectionState {
        self.current
    }

    /// Register a state-change listener.
    pub fn subscribe<F>(&self, listener: F) -> ListenerHandle<StateChange>
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Whether a transition is allowed by the table above.
    #[must_use]
    pub fn allows(from: ConnectionState, to: ConnectionState) -> bool {
        use ConnectionState::{Connected, Connecting, Disconnecting, Failed, Idle};
        matches!(
            (from, to),
            (Idle | Failed, Connecting)
                | (Connecting, Connected | Failed)
                | (Connected, Disconnecting | Failed)
                | (Disconnecting, Idle)
        )
    }

    /// Transition to `to` on behalf of `operation`.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::InvalidState` when the transition is not in the
    /// table; the state is left unchanged and no event is emitted.
    pub fn transition(
        &mut self,
        to: ConnectionState,
        operation: &str,
    ) -> Result<(), BridgeError> {
        if !Self::allows(self.current, to) {
            return Err(BridgeError::InvalidState {
                current: self.current.as_str().to_owned(),
                operation: operation.to_owned(),
            });
        }
        let change = StateChange {
            previous: self.current,
            current: to,
            timestamp: SystemTime::now(),
        };
        self.current = to;
        self.listeners.emit(&change);
        Ok(())
    }

    /// Fail the check unless the machine is in `expected`.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::InvalidState` naming the operation.
    pub fn require(
        &self,
        expected: ConnectionState,
        operation: &str,
    ) -> Result<(), BridgeError> {
        if self.current == expected {
            return Ok(());
        }
        Err(BridgeError::InvalidState {
            current: self.current.as_str().to_owned(),
            operation: operation.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn starts_idle() {
        assert_eq!(StateMachine::new().current(), ConnectionState::Idle);
    }

    #[test]
    fn happy_path_transitions() {
        let mut sm = StateMachine::new();
        sm.transition(ConnectionState::Connecting, "launch").unwrap();
        sm.transition(ConnectionState::Connected, "launch").unwrap();
        sm.transition(ConnectionState::Disconnecting, "shutdown")
            .unwrap();
        sm.transition(ConnectionState::Idle, "shutdown").unwrap();
        assert_eq!(sm.current(), ConnectionState::Idle);
    }

    #[test]
    fn failure_path_is_reentrant() {
        let mut sm = StateMachine::new();
        sm.transition(ConnectionState::Connecting, "connect").unwrap();
        sm.transition(ConnectionState::Failed, "connect").unwrap();
        // Retry from failed is allowed.
        sm.transition(ConnectionState::Connecting, "connect").unwrap();
        assert_eq!(sm.current(), ConnectionState::Connecting);
    }

    #[test]
    fn unexpected_disconnect_from_connected() {
        let mut sm = StateMachine::new();
        sm.transition(ConnectionState::Connecting, "connect").unwrap();
        sm.transition(ConnectionState::Connected, "connect").unwrap();
        sm.transition(ConnectionState::Failed, "disconnect-event")
            .unwrap();
        assert_eq!(sm.current(), ConnectionState::Failed);
    }

    #[test]
    fn invalid_transition_carries_state_and_operation() {
        let mut sm = StateMachine::new();
        let err = sm
            .transition(ConnectionState::Connected, "teleport")
            .unwrap_err();
        match err {
            BridgeError::InvalidState { current, operation } => {
                assert_eq!(current, "idle");
                assert_eq!(operation, "teleport");
            }
            other => panic!("expected InvalidState, got {other:?}"),
        }
        assert_eq!(sm.current(), ConnectionState::Idle, "state unchanged");
    }

    #[test]
    fn no_skipping_intermediate_states() {
        // idle cannot jump straight to connected, disconnecting, or failed.
        assert!(!StateMachine::allows(
            ConnectionState::Idle,
            ConnectionState::Connected
        ));
        assert!(!StateMachine::allows(
            ConnectionState::Idle,
            ConnectionState::Disconnecting
        ));
        assert!(!StateMachine::allows(
            ConnectionState::Idle,
            ConnectionState::Failed
        ));
        // connected cannot jump straight back to idle.
        assert!(!StateMachine::allows(
            ConnectionState::Connected,
            ConnectionState::Idle
        ));
    }

    #[test]
    fn each_transition_emits_exactly_one_event() {
        let mut sm = StateMachine::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let _handle = sm.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        sm.transition(ConnectionState::Connecting, "connect").unwrap();
        sm.transition(ConnectionState::Connected, "connect").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);

        // A rejected transition emits nothing.
        let _ = sm.transition(ConnectionState::Idle, "bogus");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn event_carries_previous_and_current() {
        let mut sm = StateMachine::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _handle = sm.subscribe(move |change: &StateChange| {
            s.lock().unwrap().push((change.previous, change.current));
        });

        sm.transition(ConnectionState::Connecting, "connect").unwrap();
        sm.transition(ConnectionState::Failed, "connect").unwrap();

        let events = seen.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                (ConnectionState::Idle, ConnectionState::Connecting),
                (ConnectionState::Connecting, ConnectionState::Failed),
            ]
        );
    }

    #[test]
    fn require_names_the_operation() {
        let sm = StateMachine::new();
        let err = sm
            .require(ConnectionState::Connected, "create_page")
            .unwrap_err();
        assert!(err.to_string().contains("create_page"));
    }
}
