use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::record::Message;

/// Where a consumer group without a committed offset starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

/// Broker connection security, named the way Kafka clients name it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityProtocol {
    #[serde(rename = "PLAINTEXT")]
    Plaintext,
    #[serde(rename = "SSL")]
    Ssl,
    #[default]
    #[serde(rename = "SASL_PLAINTEXT")]
    SaslPlaintext,
    #[serde(rename = "SASL_SSL")]
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "PLAINTEXT",
            SecurityProtocol::Ssl => "SSL",
            SecurityProtocol::SaslPlaintext => "SASL_PLAINTEXT",
            SecurityProtocol::SaslSsl => "SASL_SSL",
        }
    }

    /// Whether SASL credentials are exchanged on connect.
    pub fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }

    /// Whether the connection must be wrapped in TLS.
    pub fn uses_tls(&self) -> bool {
        matches!(self, SecurityProtocol::Ssl | SecurityProtocol::SaslSsl)
    }
}

impl std::fmt::Display for SecurityProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SecurityProtocol {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PLAINTEXT" => Ok(SecurityProtocol::Plaintext),
            "SSL" => Ok(SecurityProtocol::Ssl),
            "SASL_PLAINTEXT" => Ok(SecurityProtocol::SaslPlaintext),
            "SASL_SSL" => Ok(SecurityProtocol::SaslSsl),
            other => Err(TransportError::config(format!(
                "unknown security protocol: '{other}'"
            ))),
        }
    }
}

/// Credentials and protocol used for every broker connection.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecuritySettings {
    #[serde(default)]
    pub protocol: SecurityProtocol,
    #[serde(default = "default_mechanism")]
    pub mechanism: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn default_mechanism() -> String {
    "PLAIN".to_string()
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            protocol: SecurityProtocol::default(),
            mechanism: default_mechanism(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl std::fmt::Debug for SecuritySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecuritySettings")
            .field("protocol", &self.protocol)
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .finish()
    }
}

/// Consumer-side settings handed to the transport on subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub group_id: String,
    pub auto_offset_reset: OffsetReset,
    pub enable_auto_commit: bool,
}

/// Inbound subscription: a lazy, non-restartable sequence of messages.
///
/// `recv` suspends until the next message is available. There is no timeout:
/// an idle topic keeps the caller parked at this call.
pub trait InboundStream: Send {
    /// Pull the next message. `None` = stream closed, nothing more will arrive.
    fn recv(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<Result<Message, TransportError>>> + Send + '_>>;

    /// Release the subscription. Called exactly once by the owner.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;
}

/// Outbound publishing handle shared by all destination topics.
pub trait OutboundPublisher: Send {
    /// Stage a payload for `topic`. Not acknowledged until `flush` returns.
    fn send(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    /// Block until every staged payload is acknowledged by the broker.
    fn flush(&mut self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    /// Release the handle. Called exactly once by the owner.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;
}

/// Messaging transport: opens subscriptions and publishing handles.
///
/// Connection management and authentication live behind this trait; the relay
/// only sees the two handles it gets back.
pub trait Transport: Send + Sync {
    /// Subscribe to `topic` as a member of the configured consumer group.
    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        settings: &'a ConsumerSettings,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn InboundStream>, TransportError>> + Send + 'a>>;

    /// Open a publishing handle.
    fn publisher(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn OutboundPublisher>, TransportError>> + Send + '_>>;
}
