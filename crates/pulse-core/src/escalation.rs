//! Escalation channels.
//!
//! `notify` is fire-and-forget: it returns immediately and delivery
//! failures are logged, never surfaced to the tick.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use pulse_state::{BuildId, RecoveryRule};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Advisory (stale build).
    Warning,
    /// Needs a human decision (R3, R4).
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationMessage {
    pub id: Uuid,
    pub build_id: BuildId,
    pub drop_id: Option<String>,
    pub rule: RecoveryRule,
    pub severity: Severity,
    pub summary: String,
    pub at: DateTime<Utc>,
}

impl EscalationMessage {
    pub fn new(
        build_id: BuildId,
        drop_id: Option<String>,
        rule: RecoveryRule,
        summary: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        let severity = match rule {
            RecoveryRule::R5 => Severity::Warning,
            _ => Severity::Critical,
        };
        Self {
            id: Uuid::new_v4(),
            build_id,
            drop_id,
            rule,
            severity,
            summary: summary.into(),
            at,
        }
    }
}

pub trait EscalationChannel: Send + Sync {
    fn notify(&self, message: EscalationMessage);
}

/// Writes escalations to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogChannel;

impl EscalationChannel for LogChannel {
    fn notify(&self, message: EscalationMessage) {
        match message.severity {
            Severity::Warning => warn!(
                event = "escalation",
                build_id = %message.build_id,
                rule = %message.rule,
                summary = %message.summary,
            ),
            Severity::Critical => error!(
                event = "escalation",
                build_id = %message.build_id,
                drop_id = ?message.drop_id,
                rule = %message.rule,
                summary = %message.summary,
            ),
        }
    }
}

/// POSTs each escalation as JSON on a background task.
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

impl EscalationChannel for WebhookChannel {
    fn notify(&self, message: EscalationMessage) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(url = %self.url, "no runtime; webhook escalation dropped");
            return;
        };
        let client = self.client.clone();
        let url = self.url.clone();
        handle.spawn(async move {
            match client.post(&url).json(&message).send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => warn!(url = %url, status = %resp.status(), "webhook rejected escalation"),
                Err(e) => warn!(url = %url, error = %e, "webhook delivery failed"),
            }
        });
    }
}

/// Fans out to several channels.
#[derive(Clone, Default)]
pub struct MultiChannel {
    channels: Vec<Arc<dyn EscalationChannel>>,
}

impl MultiChannel {
    pub fn new(channels: Vec<Arc<dyn EscalationChannel>>) -> Self {
        Self { channels }
    }
}

impl EscalationChannel for MultiChannel {
    fn notify(&self, message: EscalationMessage) {
        for channel in &self.channels {
            channel.notify(message.clone());
        }
    }
}

/// Keeps every message in memory.
#[derive(Debug, Default)]
pub struct CollectingChannel {
    messages: Mutex<Vec<EscalationMessage>>,
}

impl CollectingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<EscalationMessage> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

impl EscalationChannel for CollectingChannel {
    fn notify(&self, message: EscalationMessage) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_channel_fans_out() {
        let a = Arc::new(CollectingChannel::new());
        let b = Arc::new(CollectingChannel::new());
        let multi = MultiChannel::new(vec![a.clone(), b.clone(), Arc::new(LogChannel)]);
        multi.notify(EscalationMessage::new(
            BuildId::new("b"),
            Some("d1".into()),
            RecoveryRule::R3,
            "content failure",
            Utc::now(),
        ));
        assert_eq!(a.messages().len(), 1);
        assert_eq!(b.messages()[0].severity, Severity::Critical);
    }

    #[test]
    fn stale_is_a_warning() {
        let msg = EscalationMessage::new(BuildId::new("b"), None, RecoveryRule::R5, "stale", Utc::now());
        assert_eq!(msg.severity, Severity::Warning);
    }

    #[test]
    fn webhook_without_runtime_does_not_panic() {
        WebhookChannel::new("http://127.0.0.1:9/hook").notify(EscalationMessage::new(
            BuildId::new("b"),
            None,
            RecoveryRule::R4,
            "blocked",
            Utc::now(),
        ));
    }
}
