//! Raw message channel and the streams built on top of it.
//!
//! A [`MessagePort`] is one end of an unordered, single-message channel
//! (the moral equivalent of `postMessage`). Every message carries a
//! `target` channel name and a `sender` identity stamped by the port that
//! posted it, so the receiving side can filter out traffic that is not
//! addressed to it.

pub mod mux;
pub mod stream;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{ExecutionError, Result};

pub use mux::{Multiplex, Substream, SubstreamWriter};
pub use stream::{StreamOptions, StreamWriter, TransportStream};

/// A single message on the raw channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Channel name the message is addressed to.
    pub target: String,
    /// Identity of the posting end. Stamped by the channel owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Anything a stream or correlator can write a JSON frame into.
pub trait FrameSink: Send + Sync {
    fn write(&self, value: Value) -> Result<()>;
}

/// Sending half of a [`MessagePort`].
///
/// Stamps every posted message with the port's identity; callers cannot
/// choose the `sender` field.
#[derive(Clone)]
pub struct PortSender {
    identity: Arc<str>,
    tx: mpsc::UnboundedSender<RawMessage>,
}

impl PortSender {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Posts `data` to the channel named `target`. Never blocks.
    pub fn post(&self, target: &str, data: Value) -> Result<()> {
        let message = RawMessage {
            target: target.to_string(),
            sender: Some(self.identity.to_string()),
            data: Some(data),
        };
        self.tx
            .send(message)
            .map_err(|_| ExecutionError::Transport("peer channel closed".into()))
    }
}

/// One end of a duplex raw message channel.
pub struct MessagePort {
    sender: PortSender,
    inbound: mpsc::UnboundedReceiver<RawMessage>,
}

impl MessagePort {
    pub fn new(
        identity: &str,
        outbound: mpsc::UnboundedSender<RawMessage>,
        inbound: mpsc::UnboundedReceiver<RawMessage>,
    ) -> Self {
        Self {
            sender: PortSender {
                identity: Arc::from(identity),
                tx: outbound,
            },
            inbound,
        }
    }

    pub fn identity(&self) -> &str {
        self.sender.identity()
    }

    pub fn split(self) -> (PortSender, mpsc::UnboundedReceiver<RawMessage>) {
        (self.sender, self.inbound)
    }
}

/// Creates two connected in-memory ports.
///
/// Messages posted on one end arrive, in order, on the other. Each end
/// stamps its own identity as `sender`.
pub fn channel_pair(a_identity: &str, b_identity: &str) -> (MessagePort, MessagePort) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        MessagePort::new(a_identity, a_tx, a_rx),
        MessagePort::new(b_identity, b_tx, b_rx),
    )
}
