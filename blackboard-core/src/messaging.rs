//! Inter-agent directive messages and the transport contract
//!
//! The wire encoding belongs to the transport. The core only needs to
//! hand outbound messages over and to interpret the flags the transport
//! returns for inbound messages and acknowledgements.

use blackboard_types::MessageAddress;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use tracing::{debug, warn};

/// One instruction for a remote blackboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    pub verb: String,
    pub payload: serde_json::Value,
}

impl Directive {
    pub fn new(verb: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            verb: verb.into(),
            payload,
        }
    }
}

/// Directives batched for one destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectiveMessage {
    pub source: MessageAddress,
    pub destination: MessageAddress,
    /// Sender's incarnation; grows each time the sender restarts
    pub incarnation: u64,
    pub directives: Vec<Directive>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    pub source: MessageAddress,
    pub destination: MessageAddress,
    pub incarnation: u64,
}

/// Transport verdict on an inbound message or ack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReceiveFlags(u8);

impl ReceiveFlags {
    pub const NONE: Self = Self(0);
    /// The peer restarted since we last heard from it
    pub const RESTART: Self = Self(1);
    /// Drop the message
    pub const IGNORE: Self = Self(2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_restart(self) -> bool {
        self.contains(Self::RESTART)
    }

    pub fn should_ignore(self) -> bool {
        self.contains(Self::IGNORE)
    }
}

impl BitOr for ReceiveFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for ReceiveFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_restart(), self.should_ignore()) {
            (false, false) => write!(f, "none"),
            (true, false) => write!(f, "restart"),
            (false, true) => write!(f, "ignore"),
            (true, true) => write!(f, "restart|ignore"),
        }
    }
}

/// Opaque transport state carried through snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageManagerState(pub serde_json::Value);

/// Message-transport collaborator
pub trait MessageTransport: Send + Sync {
    fn send_messages(&self, messages: &mut dyn Iterator<Item = DirectiveMessage>);

    fn receive_message(&self, message: &DirectiveMessage) -> ReceiveFlags;

    fn receive_ack(&self, ack: &AckMessage) -> ReceiveFlags;

    fn state(&self) -> Option<MessageManagerState> {
        None
    }

    fn restore(&self, _state: MessageManagerState) {}
}

/// Transport that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

impl MessageTransport for NullTransport {
    fn send_messages(&self, messages: &mut dyn Iterator<Item = DirectiveMessage>) {
        let dropped = messages.count();
        if dropped > 0 {
            debug!(dropped, "no transport configured, messages dropped");
        }
    }

    fn receive_message(&self, _message: &DirectiveMessage) -> ReceiveFlags {
        ReceiveFlags::NONE
    }

    fn receive_ack(&self, _ack: &AckMessage) -> ReceiveFlags {
        ReceiveFlags::NONE
    }
}

/// In-process transport that records outbound messages
///
/// Inbound messages are judged by sender incarnation: a higher
/// incarnation than last seen flags a restart, a lower one is ignored.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    sent: Mutex<Vec<DirectiveMessage>>,
    incarnations: Mutex<HashMap<MessageAddress, u64>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages handed over so far, clearing the record
    pub fn take_sent(&self) -> Vec<DirectiveMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn known_incarnation(&self, peer: &MessageAddress) -> Option<u64> {
        self.incarnations.lock().get(peer).copied()
    }

    fn judge(&self, peer: &MessageAddress, incarnation: u64) -> ReceiveFlags {
        let mut known = self.incarnations.lock();
        match known.get(peer).copied() {
            None => {
                known.insert(peer.clone(), incarnation);
                ReceiveFlags::NONE
            }
            Some(seen) if incarnation > seen => {
                known.insert(peer.clone(), incarnation);
                ReceiveFlags::RESTART
            }
            Some(seen) if incarnation < seen => ReceiveFlags::IGNORE,
            Some(_) => ReceiveFlags::NONE,
        }
    }
}

impl MessageTransport for LoopbackTransport {
    fn send_messages(&self, messages: &mut dyn Iterator<Item = DirectiveMessage>) {
        self.sent.lock().extend(messages);
    }

    fn receive_message(&self, message: &DirectiveMessage) -> ReceiveFlags {
        self.judge(&message.source, message.incarnation)
    }

    fn receive_ack(&self, ack: &AckMessage) -> ReceiveFlags {
        self.judge(&ack.source, ack.incarnation)
    }

    fn state(&self) -> Option<MessageManagerState> {
        let known: HashMap<String, u64> = self
            .incarnations
            .lock()
            .iter()
            .map(|(peer, inc)| (peer.name().to_string(), *inc))
            .collect();
        serde_json::to_value(known).ok().map(MessageManagerState)
    }

    fn restore(&self, state: MessageManagerState) {
        match serde_json::from_value::<HashMap<String, u64>>(state.0) {
            Ok(known) => {
                let mut incarnations = self.incarnations.lock();
                for (peer, inc) in known {
                    incarnations.insert(MessageAddress::new(peer), inc);
                }
            }
            Err(err) => warn!(?err, "unreadable transport state, starting fresh"),
        }
    }
}
