//! Named sub-streams over one [`TransportStream`].
//!
//! Payloads on the shared stream are `{ "name": <substream>, "data": <json> }`.
//! The job uses two sub-streams: `command` for host→sandbox commands and
//! `rpc` for sandbox→host endowment calls.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{FrameSink, StreamWriter, TransportStream};
use crate::error::Result;

pub const COMMAND_SUBSTREAM: &str = "command";
pub const RPC_SUBSTREAM: &str = "rpc";

#[derive(Debug, Serialize, Deserialize)]
struct MuxFrame {
    name: String,
    data: Value,
}

/// Write handle for one named sub-stream.
#[derive(Clone)]
pub struct SubstreamWriter {
    name: Arc<str>,
    stream: StreamWriter,
}

impl SubstreamWriter {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FrameSink for SubstreamWriter {
    fn write(&self, value: Value) -> Result<()> {
        let frame = MuxFrame {
            name: self.name.to_string(),
            data: value,
        };
        self.stream.write(serde_json::to_value(frame)?)
    }
}

pub struct Substream {
    pub writer: SubstreamWriter,
    pub inbound: mpsc::UnboundedReceiver<Value>,
}

pub struct Multiplex {
    stream: TransportStream,
    routes: HashMap<String, mpsc::UnboundedSender<Value>>,
}

impl Multiplex {
    pub fn new(stream: TransportStream) -> Self {
        Self {
            stream,
            routes: HashMap::new(),
        }
    }

    /// Registers a named sub-stream. Must be called before [`Multiplex::run`].
    pub fn substream(&mut self, name: &str) -> Substream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(name.to_string(), tx);
        Substream {
            writer: SubstreamWriter {
                name: Arc::from(name),
                stream: self.stream.writer(),
            },
            inbound: rx,
        }
    }

    pub fn writer(&self) -> StreamWriter {
        self.stream.writer()
    }

    /// Routes inbound payloads until the underlying stream ends.
    /// Dropping the routes on return closes every sub-stream.
    pub async fn run(mut self) {
        while let Some(payload) = self.stream.next().await {
            let frame: MuxFrame = match serde_json::from_value(payload) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(stream = %self.stream.name(), "dropping unframed payload: {e}");
                    continue;
                }
            };
            match self.routes.get(&frame.name) {
                Some(route) => {
                    if route.send(frame.data).is_err() {
                        debug!(substream = %frame.name, "substream reader gone, dropping payload");
                    }
                }
                None => warn!(substream = %frame.name, "dropping payload for unknown substream"),
            }
        }
        debug!(stream = %self.stream.name(), "multiplex stopped");
    }
}
