//! Handshaking duplex stream over a raw message channel.
//!
//! Both ends post `SYN` on creation and buffer writes until the handshake
//! completes. Receiving a `SYN` is answered with `ACK`; receiving an `ACK`
//! initializes the end (answering with `ACK` if the peer's `SYN` was never
//! seen) and flushes the buffered writes in order. This makes the
//! handshake independent of which end comes up first.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{FrameSink, MessagePort, PortSender, RawMessage};
use crate::error::{ExecutionError, Result};
use crate::lock;

/// Frame carried in the `data` field of a raw message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "UPPERCASE")]
pub enum Frame {
    Syn,
    Ack,
    Data(Value),
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Our channel name. Inbound messages must target it.
    pub name: String,
    /// The peer's channel name. Outbound messages target it.
    pub target: String,
    /// When set, inbound messages from any other sender are dropped.
    pub expected_sender: Option<String>,
}

impl StreamOptions {
    pub fn new(name: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            expected_sender: None,
        }
    }

    pub fn with_expected_sender(mut self, sender: &str) -> Self {
        self.expected_sender = Some(sender.to_string());
        self
    }
}

#[derive(Default)]
struct StreamState {
    initialized: bool,
    have_syn: bool,
    destroyed: bool,
    buffered: VecDeque<Value>,
}

struct Shared {
    options: StreamOptions,
    port: PortSender,
    state: Mutex<StreamState>,
}

impl Shared {
    fn post(&self, frame: &Frame) -> Result<()> {
        let data = serde_json::to_value(frame)?;
        self.port.post(&self.options.target, data)
    }

    /// Runs one inbound raw message through the filter and the handshake.
    /// Returns the payload if the message carried data for the application.
    fn receive(&self, raw: RawMessage) -> Option<Value> {
        if raw.target != self.options.name {
            trace!(
                stream = %self.options.name,
                target = %raw.target,
                "dropping message for other channel"
            );
            return None;
        }
        if let Some(expected) = &self.options.expected_sender {
            if raw.sender.as_deref() != Some(expected.as_str()) {
                debug!(
                    stream = %self.options.name,
                    sender = ?raw.sender,
                    "dropping message from unexpected sender"
                );
                return None;
            }
        }
        let Some(data) = raw.data else {
            debug!(stream = %self.options.name, "dropping message without payload");
            return None;
        };
        let frame: Frame = match serde_json::from_value(data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(stream = %self.options.name, "dropping malformed frame: {e}");
                return None;
            }
        };

        let mut state = lock(&self.state);
        if state.destroyed {
            return None;
        }
        match frame {
            Frame::Data(Value::Null) => {
                debug!(stream = %self.options.name, "dropping empty data frame");
                None
            }
            Frame::Data(payload) if state.initialized => Some(payload),
            Frame::Data(_) => {
                debug!(stream = %self.options.name, "dropping data received before handshake");
                None
            }
            Frame::Syn | Frame::Ack if state.initialized => {
                trace!(stream = %self.options.name, "ignoring control frame after handshake");
                None
            }
            Frame::Syn => {
                state.have_syn = true;
                if let Err(e) = self.post(&Frame::Ack) {
                    debug!(stream = %self.options.name, "failed to answer SYN: {e}");
                }
                None
            }
            Frame::Ack => {
                state.initialized = true;
                if !state.have_syn {
                    if let Err(e) = self.post(&Frame::Ack) {
                        debug!(stream = %self.options.name, "failed to answer ACK: {e}");
                    }
                }
                debug!(
                    stream = %self.options.name,
                    buffered = state.buffered.len(),
                    "stream initialized"
                );
                while let Some(payload) = state.buffered.pop_front() {
                    if let Err(e) = self.post(&Frame::Data(payload)) {
                        debug!(stream = %self.options.name, "flush failed: {e}");
                        break;
                    }
                }
                None
            }
        }
    }
}

/// Cloneable write handle of a [`TransportStream`].
#[derive(Clone)]
pub struct StreamWriter {
    shared: Arc<Shared>,
}

impl StreamWriter {
    /// Writes a payload, buffering it until the handshake completes.
    pub fn write(&self, payload: Value) -> Result<()> {
        let mut state = lock(&self.shared.state);
        if state.destroyed {
            return Err(ExecutionError::Transport(format!(
                "stream '{}' destroyed",
                self.shared.options.name
            )));
        }
        if state.initialized {
            self.shared.post(&Frame::Data(payload))
        } else {
            state.buffered.push_back(payload);
            Ok(())
        }
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.shared.state).initialized
    }

    /// Destroys the stream. Buffered writes are discarded and later writes fail.
    pub fn destroy(&self) {
        let mut state = lock(&self.shared.state);
        state.destroyed = true;
        state.buffered.clear();
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.shared.state).destroyed
    }
}

impl FrameSink for StreamWriter {
    fn write(&self, value: Value) -> Result<()> {
        StreamWriter::write(self, value)
    }
}

/// Reading end of a handshaking stream. Owns the inbound raw channel.
pub struct TransportStream {
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedReceiver<RawMessage>,
}

impl TransportStream {
    /// Creates the stream and immediately posts `SYN`.
    pub fn new(port: MessagePort, options: StreamOptions) -> Self {
        let (sender, inbound) = port.split();
        let shared = Arc::new(Shared {
            options,
            port: sender,
            state: Mutex::new(StreamState::default()),
        });
        if let Err(e) = shared.post(&Frame::Syn) {
            debug!(stream = %shared.options.name, "initial SYN not delivered: {e}");
        }
        Self { shared, inbound }
    }

    pub fn name(&self) -> &str {
        &self.shared.options.name
    }

    pub fn writer(&self) -> StreamWriter {
        StreamWriter {
            shared: self.shared.clone(),
        }
    }

    /// Waits for the next application payload.
    ///
    /// Drives the handshake as a side effect. Returns `None` once the
    /// stream is destroyed or the raw channel closes.
    pub async fn next(&mut self) -> Option<Value> {
        loop {
            if lock(&self.shared.state).destroyed {
                return None;
            }
            let raw = self.inbound.recv().await?;
            if let Some(payload) = self.shared.receive(raw) {
                return Some(payload);
            }
        }
    }
}
