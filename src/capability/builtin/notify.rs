use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::NOTIFY;
use crate::capability::{Endowment, EndowmentContext};
use crate::error::{ExecutionError, Result};
use crate::snap::SnapId;

/// Maximum length of a native (OS-level) notification.
const MAX_NATIVE_LENGTH: usize = 50;

/// Maximum length of an in-app notification.
const MAX_IN_APP_LENGTH: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    InApp,
    Native,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub message: String,
}

/// Host hook receiving validated notifications.
pub type NotifySink = Arc<dyn Fn(&SnapId, Notification) -> Result<()> + Send + Sync>;

/// Default sink: notifications go to the log.
pub fn log_sink() -> NotifySink {
    Arc::new(|snap_id, notification| {
        info!(snap = %snap_id, kind = ?notification.kind, "notification: {}", notification.message);
        Ok(())
    })
}

pub struct NotifyEndowment {
    sink: NotifySink,
}

impl NotifyEndowment {
    pub fn new(sink: NotifySink) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Endowment for NotifyEndowment {
    fn name(&self) -> &str {
        NOTIFY
    }

    async fn invoke(&self, params: Value, context: &EndowmentContext) -> Result<Value> {
        let notification: Notification = serde_json::from_value(params)
            .map_err(|e| ExecutionError::InvalidParams(format!("{NOTIFY}: {e}")))?;

        let length = notification.message.chars().count();
        let max = match notification.kind {
            NotificationKind::Native => MAX_NATIVE_LENGTH,
            NotificationKind::InApp => MAX_IN_APP_LENGTH,
        };
        if length == 0 || length > max {
            return Err(ExecutionError::InvalidParams(format!(
                "message must be 1 to {max} characters, got {length}"
            )));
        }

        (self.sink)(&context.snap_id, notification)?;
        Ok(Value::Null)
    }
}
