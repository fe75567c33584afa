//! Mesh Messages
//!
//! Everything that travels between the coordinator and the workers, or
//! between two workers, is a [`Message`]. Each pair of parties shares one
//! duplex channel, built by [`duplex`]. Channels are FIFO per direction and
//! no ordering holds across different channels.
//!
//! ## Request/response
//!
//! Messages carrying `session: Some(n)` expect exactly one [`Message::Resp`]
//! with the same session back on the channel they arrived on. With
//! `session: None` the message is fire-and-forget and failures are only
//! logged by the receiver.

use kite_config::DriverOptions;
use kite_types::{Address, Target};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::RemoteError;

/// Request/response correlation number, unique per sender
pub type Session = u64;

/// The party on the other end of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Peer {
    Coordinator,
    Worker(usize),
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Peer::Coordinator => write!(f, "coordinator"),
            Peer::Worker(index) => write!(f, "worker-{index}"),
        }
    }
}

/// A message tagged with the channel it arrived on
#[derive(Debug)]
pub struct Inbound {
    pub from: Peer,
    pub message: Message,
}

/// One side of a duplex channel
#[derive(Debug)]
pub struct Endpoint {
    pub tx: mpsc::UnboundedSender<Message>,
    pub rx: mpsc::UnboundedReceiver<Message>,
}

/// Build a connected pair of endpoints
pub fn duplex() -> (Endpoint, Endpoint) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        Endpoint { tx: a_tx, rx: a_rx },
        Endpoint { tx: b_tx, rx: b_rx },
    )
}

/// Method invocation addressed to a kite
#[derive(Debug, Clone)]
pub struct Action {
    pub session: Option<Session>,
    /// Address of the calling kite, when the call came from one
    pub source: Option<Address>,
    pub target: Target,
    /// Raw route parameters, kept so router action rewrites can see them
    pub route: Option<Vec<Value>>,
    pub method: String,
    pub args: Vec<Value>,
}

/// Envelope for all mesh traffic
#[derive(Debug)]
pub enum Message {
    /// Coordinator hands a worker its end of the channel to worker `index`
    Connect { index: usize, endpoint: Endpoint },
    /// Mesh is wired, the worker may serve
    Start,
    Create {
        session: Option<Session>,
        target: Target,
        options: Value,
    },
    /// Like `Create`, but replies only once the kite tree has started
    CreateSync {
        session: Option<Session>,
        target: Target,
        options: Value,
    },
    CreateController {
        session: Option<Session>,
        target: Target,
        options: Value,
        driver: DriverOptions,
    },
    Destroy {
        session: Option<Session>,
        target: Target,
    },
    Action(Action),
    Resp {
        session: Session,
        result: Result<Value, RemoteError>,
    },
    /// A global kite now lives at `address`
    Regist { name: String, address: Address },
    Listen {
        target: Target,
        event: String,
        subscriber: Address,
        method: String,
    },
    Remove {
        target: Target,
        event: String,
        subscriber: Address,
        method: String,
    },
    Emit {
        target: Target,
        event: String,
        args: Vec<Value>,
    },
    /// Health probe, logged by the receiver
    Check,
    /// Ask a worker for a snapshot of its tables
    Stats { session: Session },
    /// Stop every kite and exit the worker loop
    Shutdown,
}

impl Message {
    /// Message kind for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Connect { .. } => "connect",
            Message::Start => "start",
            Message::Create { .. } => "create",
            Message::CreateSync { .. } => "createSync",
            Message::CreateController { .. } => "createController",
            Message::Destroy { .. } => "destroy",
            Message::Action(_) => "action",
            Message::Resp { .. } => "resp",
            Message::Regist { .. } => "regist",
            Message::Listen { .. } => "listen",
            Message::Remove { .. } => "remove",
            Message::Emit { .. } => "emit",
            Message::Check => "check",
            Message::Stats { .. } => "stats",
            Message::Shutdown => "shutdown",
        }
    }

    /// Session the sender is waiting on, if any
    pub fn session(&self) -> Option<Session> {
        match self {
            Message::Create { session, .. }
            | Message::CreateSync { session, .. }
            | Message::CreateController { session, .. }
            | Message::Destroy { session, .. } => *session,
            Message::Action(action) => action.session,
            Message::Resp { session, .. } | Message::Stats { session } => Some(*session),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplex_is_crossed() {
        let (a, mut b) = duplex();
        a.tx.send(Message::Check).unwrap();
        b.tx.send(Message::Start).unwrap();

        assert_eq!(b.rx.recv().await.unwrap().kind(), "check");
        let mut a = a;
        assert_eq!(a.rx.recv().await.unwrap().kind(), "start");
    }

    #[tokio::test]
    async fn test_channel_is_fifo() {
        let (a, mut b) = duplex();
        for session in 1..=3 {
            a.tx.send(Message::Stats { session }).unwrap();
        }
        for expected in 1..=3 {
            assert_eq!(b.rx.recv().await.unwrap().session(), Some(expected));
        }
    }

    #[test]
    fn test_session_of_fire_and_forget() {
        let msg = Message::Emit {
            target: Target::global("zone"),
            event: "tick".into(),
            args: vec![],
        };
        assert_eq!(msg.session(), None);
        assert_eq!(msg.kind(), "emit");
    }
}
