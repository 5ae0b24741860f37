//! Channel boundary: the factory of calls.
//!
//! The core consumes channels through the [`Channel`] trait and ships one
//! concrete implementation, [`TransportChannel`], which binds a stream
//! connector to calls and carries a watch-based connectivity state. What a
//! channel does to produce transport streams (connection management, name
//! resolution, balancing) stays outside this crate.

use crate::call::{ActiveCall, CallConfig, Deadline};
use crate::filter::{FilterFactory, FilterStack};
use crate::status::Status;
use crate::transport::Connect;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Connectivity of the channel's underlying connection machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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
        write!(f, "{}", name)
    }
}

/// Factory of calls and observer of connectivity.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Start a call for the given configuration.
    fn create_call(&self, config: CallConfig) -> Result<ActiveCall, Status>;

    /// Current connectivity. `try_to_connect` asks an idle channel to start
    /// connecting; implementations without connection management may treat
    /// it as a hint.
    fn connectivity_state(&self, try_to_connect: bool) -> ConnectivityState;

    /// Wait for the state to move away from `current`. Resolves with the
    /// new state, or `DEADLINE_EXCEEDED` once the deadline elapses.
    async fn watch_connectivity_state(
        &self,
        current: ConnectivityState,
        deadline: Deadline,
    ) -> Result<ConnectivityState, Status>;

    /// Shut the channel down; subsequent `create_call` attempts fail.
    fn close(&self);

    fn target(&self) -> String;
}

/// Channel implementation over an injected stream connector.
///
/// Calls get a filter stack built from the registered factories, in
/// registration order, and a fresh transport stream from the connector.
/// Connectivity is a plain watch slot fed by whoever owns the connector.
pub struct TransportChannel {
    target: String,
    connector: Arc<dyn Connect>,
    filters: Vec<Arc<dyn FilterFactory>>,
    state: watch::Sender<ConnectivityState>,
}

impl TransportChannel {
    pub fn new(target: impl Into<String>, connector: Arc<dyn Connect>) -> Self {
        let (state, _) = watch::channel(ConnectivityState::Idle);
        Self {
            target: target.into(),
            connector,
            filters: Vec::new(),
            state,
        }
    }

    /// Register a filter factory. Registration order fixes the stack order
    /// for every call this channel creates.
    pub fn register_filter(mut self, factory: Arc<dyn FilterFactory>) -> Self {
        self.filters.push(factory);
        self
    }

    /// Update the connectivity state. Intended for the connection manager
    /// that owns the connector.
    pub fn set_connectivity_state(&self, state: ConnectivityState) {
        // Shutdown is terminal.
        if *self.state.borrow() == ConnectivityState::Shutdown {
            return;
        }
        // send_replace updates even while nobody is watching.
        self.state.send_replace(state);
    }
}

#[async_trait]
impl Channel for TransportChannel {
    fn create_call(&self, config: CallConfig) -> Result<ActiveCall, Status> {
        if *self.state.borrow() == ConnectivityState::Shutdown {
            return Err(Status::unavailable("The channel has been closed"));
        }
        tracing::debug!(target = %self.target, method = %config.method, "creating call");
        let filters = FilterStack::from_factories(&self.filters);
        Ok(ActiveCall::spawn(config, self.connector.clone(), filters))
    }

    fn connectivity_state(&self, _try_to_connect: bool) -> ConnectivityState {
        *self.state.borrow()
    }

    async fn watch_connectivity_state(
        &self,
        current: ConnectivityState,
        deadline: Deadline,
    ) -> Result<ConnectivityState, Status> {
        let mut rx = self.state.subscribe();
        let wait = async {
            loop {
                let observed = *rx.borrow_and_update();
                if observed != current {
                    return observed;
                }
                if rx.changed().await.is_err() {
                    return ConnectivityState::Shutdown;
                }
            }
        };
        match deadline {
            Deadline::Infinite => Ok(wait.await),
            Deadline::At(at) => tokio::select! {
                state = wait => Ok(state),
                _ = tokio::time::sleep_until(at) => {
                    Err(Status::deadline_exceeded("connectivity watch deadline elapsed"))
                }
            },
        }
    }

    fn close(&self) {
        tracing::debug!(target = %self.target, "channel closed");
        self.state.send_replace(ConnectivityState::Shutdown);
    }

    fn target(&self) -> String {
        self.target.clone()
    }
}
