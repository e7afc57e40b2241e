//! Connection state machine.
//!
//! The consuming side only accepts VERSION, then REGISTER, then waits for
//! an external ready signal before handling anything else. Messages that
//! arrive early are queued, never dropped, and replayed in arrival order.
//!
//! Synchronous waits form a stack. Only the innermost wait's predicate is
//! consulted; once it has matched, everything else queues until the wait
//! is popped.

use objsync_protocol::Message;
use std::collections::VecDeque;
use std::fmt;

/// Handshake progress of a consuming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Before VERSION.
    AwaitVersion,
    /// Before REGISTER.
    AwaitRegistration,
    /// Registered, waiting for the application to mark the connection ready.
    AwaitReady,
    /// Handling all traffic.
    Ready,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::AwaitVersion => "await-version",
            ConnectionState::AwaitRegistration => "await-registration",
            ConnectionState::AwaitReady => "await-ready",
            ConnectionState::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// What to do with an incoming message right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Deliver,
    Queue,
}

pub type Predicate = Box<dyn Fn(&Message) -> bool>;

struct WaitFrame {
    wait_type: &'static str,
    predicate: Predicate,
    result: Option<Message>,
}

/// Message admission, pending queue and wait stack of one connection.
pub struct StateMachine {
    state: ConnectionState,
    ready_requested: bool,
    pending: VecDeque<Message>,
    waits: Vec<WaitFrame>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::AwaitVersion,
            ready_requested: false,
            pending: VecDeque::new(),
            waits: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Decides whether `message` is handled now or queued.
    pub fn admit(&self, message: &Message) -> Admission {
        if let Some(wait) = self.waits.last() {
            if wait.result.is_some() {
                return Admission::Queue;
            }
        }

        let allowed = match (self.state, message) {
            (ConnectionState::Ready, _) => true,
            (ConnectionState::AwaitVersion, Message::Version { .. }) => true,
            (ConnectionState::AwaitRegistration, Message::Register { .. }) => true,
            _ => false,
        };
        if !allowed {
            return Admission::Queue;
        }

        match self.waits.last() {
            Some(wait) if !(wait.predicate)(message) => Admission::Queue,
            _ => Admission::Deliver,
        }
    }

    /// Records a delivered message as the innermost wait's result.
    pub fn delivered(&mut self, message: &Message) {
        if let Some(wait) = self.waits.last_mut() {
            tracing::debug!("Wait for {} satisfied by {}", wait.wait_type, message.command());
            wait.result = Some(message.clone());
        }
    }

    pub fn queue(&mut self, message: Message) {
        tracing::debug!("Queueing {} in state {}", message.command(), self.state);
        self.pending.push_back(message);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Takes the queued messages for replay.
    pub fn take_pending(&mut self) -> VecDeque<Message> {
        std::mem::take(&mut self.pending)
    }

    /// VERSION was handled.
    pub fn version_received(&mut self) {
        if self.state == ConnectionState::AwaitVersion {
            self.set_state(ConnectionState::AwaitRegistration);
        }
    }

    /// REGISTER was handled.
    pub fn registered(&mut self) {
        if self.state == ConnectionState::AwaitRegistration {
            if self.ready_requested {
                self.set_state(ConnectionState::Ready);
            } else {
                self.set_state(ConnectionState::AwaitReady);
            }
        }
    }

    /// Enters `Ready` now, or as soon as registration completes.
    pub fn mark_ready(&mut self) {
        self.ready_requested = true;
        if self.state == ConnectionState::AwaitReady {
            self.set_state(ConnectionState::Ready);
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        tracing::debug!("State {} -> {}", self.state, state);
        self.state = state;
    }

    /// Opens a wait for a message matching `predicate`.
    pub fn push_wait(&mut self, wait_type: &'static str, predicate: Predicate) {
        tracing::debug!("Waiting for {}", wait_type);
        self.waits.push(WaitFrame {
            wait_type,
            predicate,
            result: None,
        });
    }

    /// Whether the innermost wait has its message.
    pub fn wait_satisfied(&self) -> bool {
        self.waits.last().is_some_and(|w| w.result.is_some())
    }

    pub fn is_waiting(&self) -> bool {
        !self.waits.is_empty()
    }

    /// Closes the innermost wait, restoring the one below it.
    pub fn pop_wait(&mut self) -> Option<Message> {
        let wait = self.waits.pop()?;
        tracing::debug!("Finished waiting for {}", wait.wait_type);
        wait.result
    }
}
