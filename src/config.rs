//! Subscription and notifier configuration.

use crate::error::{NotifyError, Result};
use crate::types::OperationMask;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Protocol of an out-of-process notification receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Mail,
    Server,
    Http,
}

impl Protocol {
    pub fn as_raw(self) -> u32 {
        match self {
            Protocol::Mail => 1,
            Protocol::Server => 2,
            Protocol::Http => 3,
        }
    }
}

/// How the server delivers notifications.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transport {
    /// Callback invoked on a client-library thread in this process.
    #[default]
    InProcess,
    /// Receiver outside this process, e.g. an HTTP endpoint.
    Remote { protocol: Protocol, endpoint: String },
}

impl Transport {
    pub fn http(endpoint: impl Into<String>) -> Self {
        Transport::Remote {
            protocol: Protocol::Http,
            endpoint: endpoint.into(),
        }
    }
}

/// Registration parameters of one subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionOptions {
    /// Operations to watch. Empty means every operation.
    pub operations: OperationMask,

    /// Ask the server for per-row identifiers.
    pub rowids: bool,

    /// Seconds until the server drops the registration. Zero never expires.
    pub timeout_secs: u32,

    pub transport: Transport,

    /// Optional registration name.
    pub name: Option<String>,

    /// Client port the server connects back to for in-process delivery.
    pub port: Option<u16>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            operations: OperationMask::empty(),
            rowids: false,
            timeout_secs: 0,
            transport: Transport::InProcess,
            name: None,
            port: None,
        }
    }
}

impl SubscriptionOptions {
    pub fn with_operations(mut self, operations: OperationMask) -> Self {
        self.operations = operations;
        self
    }

    pub fn with_rowids(mut self, rowids: bool) -> Self {
        self.rowids = rowids;
        self
    }

    /// Whole seconds; sub-second parts are dropped.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = u32::try_from(timeout.as_secs()).unwrap_or(u32::MAX);
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(u64::from(self.timeout_secs)))
    }

    /// Parse from JSON and validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if let Transport::Remote { endpoint, .. } = &self.transport {
            if endpoint.trim().is_empty() {
                return Err(NotifyError::Config(
                    "remote transport requires an endpoint".into(),
                ));
            }
        }
        if let Some(name) = &self.name {
            if name.is_empty() {
                return Err(NotifyError::Config("subscription name is empty".into()));
            }
        }
        Ok(())
    }
}

/// Settings of a [`crate::ChangeNotifier`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Capacity of channels handed out by `register_with_channel`.
    /// Default: 64
    pub channel_buffer: usize,

    /// Log notifications for unknown subscriptions at warn instead of debug.
    pub warn_on_late: bool,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            channel_buffer: 64,
            warn_on_late: true,
        }
    }
}

impl NotifierConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        if config.channel_buffer == 0 {
            return Err(NotifyError::Config("channel_buffer must be positive".into()));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = SubscriptionOptions::default();
        assert!(options.operations.is_empty());
        assert_eq!(options.operations.effective(), OperationMask::ALL);
        assert_eq!(options.timeout(), None);
        assert_eq!(options.transport, Transport::InProcess);
    }

    #[test]
    fn test_builder() {
        let options = SubscriptionOptions::default()
            .with_operations(OperationMask::UPDATE | OperationMask::DELETE)
            .with_rowids(true)
            .with_timeout(Duration::from_secs(1800))
            .with_name("hr-watch")
            .with_port(5000);
        assert_eq!(options.timeout_secs, 1800);
        assert_eq!(options.timeout(), Some(Duration::from_secs(1800)));
        assert_eq!(options.name.as_deref(), Some("hr-watch"));
        assert_eq!(options.port, Some(5000));
    }

    #[test]
    fn test_from_json() {
        let options = SubscriptionOptions::from_json(
            r#"{
                "operations": 12,
                "rowids": true,
                "timeout_secs": 1800,
                "transport": { "kind": "remote", "protocol": "http", "endpoint": "http://hooks/cqn" }
            }"#,
        )
        .unwrap();
        assert_eq!(options.operations, OperationMask::UPDATE | OperationMask::DELETE);
        assert!(options.rowids);
        assert_eq!(options.transport, Transport::http("http://hooks/cqn"));
    }

    #[test]
    fn test_from_json_rejects_empty_endpoint() {
        let result = SubscriptionOptions::from_json(
            r#"{ "transport": { "kind": "remote", "protocol": "http", "endpoint": " " } }"#,
        );
        assert!(matches!(result, Err(NotifyError::Config(_))));
    }

    #[test]
    fn test_notifier_config() {
        let config = NotifierConfig::from_json(r#"{ "channel_buffer": 8 }"#).unwrap();
        assert_eq!(config.channel_buffer, 8);
        assert!(config.warn_on_late);
        assert!(NotifierConfig::from_json(r#"{ "channel_buffer": 0 }"#).is_err());
        assert!(NotifierConfig::from_json("not json").is_err());
    }
}
