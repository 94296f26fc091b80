use std::time::Duration;

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Closed,
    #[serde(rename = "error")]
    Errored,
    Stopped,
}

impl SessionState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
            Self::Errored => "error",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    /// The peer closed the connection cleanly.
    Closed,
    /// Connect refused, transport error, or the stream ended abruptly.
    Errored,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionAction {
    Connect,
    Subscribe,
    Disconnect,
    ArmReconnect(Duration),
    CancelReconnect,
    Publish(SessionState),
}

/// Connection lifecycle without any IO. Every transition returns the side
/// effects the driver has to perform, in order.
#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
    reconnect_delay: Duration,
    reconnect_armed: bool,
    stopped: bool,
}

impl SessionMachine {
    pub fn new(reconnect_delay: Duration) -> Self {
        Self {
            state: SessionState::Idle,
            reconnect_delay,
            reconnect_armed: false,
            stopped: false,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[cfg(test)]
    pub fn reconnect_armed(&self) -> bool {
        self.reconnect_armed
    }

    pub fn start(&mut self) -> Vec<SessionAction> {
        if matches!(self.state, SessionState::Connecting | SessionState::Connected) {
            return Vec::new();
        }
        self.stopped = false;
        let mut actions = self.cancel_reconnect();
        actions.extend(self.begin_connect());
        actions
    }

    pub fn on_open(&mut self) -> Vec<SessionAction> {
        if self.stopped {
            return vec![SessionAction::Disconnect];
        }
        self.state = SessionState::Connected;
        vec![
            SessionAction::Subscribe,
            SessionAction::Publish(SessionState::Connected),
        ]
    }

    pub fn on_failure(&mut self, failure: Failure) -> Vec<SessionAction> {
        if self.stopped {
            return Vec::new();
        }

        self.state = match failure {
            Failure::Closed => SessionState::Closed,
            Failure::Errored => SessionState::Errored,
        };
        let mut actions = vec![SessionAction::Publish(self.state)];
        if !self.reconnect_armed {
            self.reconnect_armed = true;
            actions.push(SessionAction::ArmReconnect(self.reconnect_delay));
        }
        actions
    }

    pub fn on_reconnect_timer(&mut self) -> Vec<SessionAction> {
        if !self.reconnect_armed {
            return Vec::new();
        }
        self.reconnect_armed = false;
        if self.stopped {
            return Vec::new();
        }
        self.begin_connect()
    }

    pub fn stop(&mut self) -> Vec<SessionAction> {
        self.stopped = true;
        let mut actions = self.cancel_reconnect();
        actions.push(SessionAction::Disconnect);
        if self.state != SessionState::Stopped {
            self.state = SessionState::Stopped;
            actions.push(SessionAction::Publish(SessionState::Stopped));
        }
        actions
    }

    /// User-triggered reconnect: skips the backoff delay.
    pub fn reconnect(&mut self) -> Vec<SessionAction> {
        self.stopped = false;
        let mut actions = self.cancel_reconnect();
        actions.push(SessionAction::Disconnect);
        actions.extend(self.begin_connect());
        actions
    }

    fn begin_connect(&mut self) -> Vec<SessionAction> {
        self.state = SessionState::Connecting;
        vec![
            SessionAction::Publish(SessionState::Connecting),
            SessionAction::Connect,
        ]
    }

    fn cancel_reconnect(&mut self) -> Vec<SessionAction> {
        if std::mem::take(&mut self.reconnect_armed) {
            vec![SessionAction::CancelReconnect]
        } else {
            Vec::new()
        }
    }
}
