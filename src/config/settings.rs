use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Covers the broker endpoint, broker-side tuning and client-side tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub client: ClientSettings,
}

/// Configuration settings for the broker endpoint.
///
/// The broker binary binds to this address; client sessions connect to it.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Broker-side operational parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    /// Maximum number of concurrently connected clients.
    pub max_connections: usize,
    /// Capacity of each client connection's outbound frame queue.
    pub queue_capacity: usize,
    /// Largest accepted message payload, in bytes.
    pub max_payload_bytes: usize,
    /// How long an un-acknowledged reliable message waits before a retry.
    pub ack_timeout_ms: u64,
    /// Delivery retries for a reliable message before giving up.
    pub max_retries: u8,
    /// Whether published messages are stored and replayed to new subscribers.
    pub retain_messages: bool,
    /// Time-to-live for retained messages, in seconds.
    pub message_ttl_secs: u64,
    /// Cap on retained messages kept per topic.
    pub max_messages_per_topic: usize,
}

/// Client-side operational parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientSettings {
    /// Capacity of the session's outbound send queue.
    pub send_queue_capacity: usize,
    /// Capacity of each subscription's delivery queue.
    pub dispatch_queue_capacity: usize,
    /// Overall budget a reliable publish waits for its delivery report.
    pub ack_wait_ms: u64,
    /// Initial reconnection backoff delay.
    pub reconnect_base_ms: u64,
    /// Reconnection backoff cap.
    pub reconnect_cap_ms: u64,
    /// Grace period for dispatch tasks to finish during teardown.
    pub shutdown_grace_ms: u64,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from
/// defaults.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub client: Option<PartialClientSettings>,
}

/// Partial server settings.
#[derive(Debug, Default, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Partial broker settings.
#[derive(Debug, Default, Deserialize)]
pub struct PartialBrokerSettings {
    pub max_connections: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub max_payload_bytes: Option<usize>,
    pub ack_timeout_ms: Option<u64>,
    pub max_retries: Option<u8>,
    pub retain_messages: Option<bool>,
    pub message_ttl_secs: Option<u64>,
    pub max_messages_per_topic: Option<usize>,
}

/// Partial client settings.
#[derive(Debug, Default, Deserialize)]
pub struct PartialClientSettings {
    pub send_queue_capacity: Option<usize>,
    pub dispatch_queue_capacity: Option<usize>,
    pub ack_wait_ms: Option<u64>,
    pub reconnect_base_ms: Option<u64>,
    pub reconnect_cap_ms: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
}

impl PartialServerSettings {
    pub fn merge(self, default: ServerSettings) -> ServerSettings {
        ServerSettings {
            host: self.host.unwrap_or(default.host),
            port: self.port.unwrap_or(default.port),
        }
    }
}

impl PartialBrokerSettings {
    pub fn merge(self, default: BrokerSettings) -> BrokerSettings {
        BrokerSettings {
            max_connections: self.max_connections.unwrap_or(default.max_connections),
            queue_capacity: self.queue_capacity.unwrap_or(default.queue_capacity),
            max_payload_bytes: self.max_payload_bytes.unwrap_or(default.max_payload_bytes),
            ack_timeout_ms: self.ack_timeout_ms.unwrap_or(default.ack_timeout_ms),
            max_retries: self.max_retries.unwrap_or(default.max_retries),
            retain_messages: self.retain_messages.unwrap_or(default.retain_messages),
            message_ttl_secs: self.message_ttl_secs.unwrap_or(default.message_ttl_secs),
            max_messages_per_topic: self
                .max_messages_per_topic
                .unwrap_or(default.max_messages_per_topic),
        }
    }
}

impl PartialClientSettings {
    pub fn merge(self, default: ClientSettings) -> ClientSettings {
        ClientSettings {
            send_queue_capacity: self.send_queue_capacity.unwrap_or(default.send_queue_capacity),
            dispatch_queue_capacity: self
                .dispatch_queue_capacity
                .unwrap_or(default.dispatch_queue_capacity),
            ack_wait_ms: self.ack_wait_ms.unwrap_or(default.ack_wait_ms),
            reconnect_base_ms: self.reconnect_base_ms.unwrap_or(default.reconnect_base_ms),
            reconnect_cap_ms: self.reconnect_cap_ms.unwrap_or(default.reconnect_cap_ms),
            shutdown_grace_ms: self.shutdown_grace_ms.unwrap_or(default.shutdown_grace_ms),
        }
    }
}

/// Provides default values for `Settings`.
///
/// The endpoint default matches the broker's stock address; the rest are
/// sized for a small deployment and can be overridden per process.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 5000,
            },
            broker: BrokerSettings {
                max_connections: 1000,
                queue_capacity: 256,
                max_payload_bytes: 1024 * 1024,
                ack_timeout_ms: 2000,
                max_retries: 3,
                retain_messages: false,
                message_ttl_secs: 3600,
                max_messages_per_topic: 1000,
            },
            client: ClientSettings {
                send_queue_capacity: 1024,
                dispatch_queue_capacity: 256,
                ack_wait_ms: 10_000,
                reconnect_base_ms: 100,
                reconnect_cap_ms: 5000,
                shutdown_grace_ms: 2000,
            },
        }
    }
}
