//! Engine configuration.
//!
//! [`EngineConfig`] carries every tunable the engine honours: the target
//! host, protocol preference, the discovery port pair, retry and timeout
//! budgets, concurrency limits, and the default subscription set replayed
//! on connect.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::error::ConnectError;
use crate::types::ProtocolVersion;

/// Configuration for one engine instance controlling one device.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address of the device. Discovery replies from any other source are
    /// ignored.
    pub host: IpAddr,

    /// Protocol version to request in the discovery ping.
    /// Default: 3.1
    pub protocol_pref: ProtocolVersion,

    /// Port the discovery ping is broadcast to.
    /// Default: 7000
    pub discover_request_port: u16,

    /// Local port bound to receive the transponder reply.
    /// Default: 7001
    pub discover_response_port: u16,

    /// Address the discovery ping is sent to.
    /// Default: 255.255.255.255
    pub broadcast_addr: IpAddr,

    /// Receive window for one acknowledgement or discovery attempt.
    /// Default: 2000 ms
    pub ack_timeout_ms: u64,

    /// Retransmissions after the first attempt.
    /// Default: 3
    pub max_retries: u32,

    /// Base delay of the exponential backoff schedule.
    /// Default: 100 ms
    pub retry_base_ms: u64,

    /// Clamp on a single backoff delay.
    /// Default: 2000 ms
    pub retry_max_ms: u64,

    /// Bound on outstanding control-channel requests.
    /// Default: 5
    pub max_concurrent_commands: usize,

    /// Deadline for a single callback invocation.
    /// Default: 5000 ms
    pub callback_timeout_ms: u64,

    /// Grace added to the device-advertised keepalive interval before the
    /// connection is considered lost.
    /// Default: 5000 ms
    pub keepalive_grace_ms: u64,

    /// Frames larger than this are rejected without parsing.
    /// Default: 65536
    pub max_xml_bytes: usize,

    /// Property names subscribed (best effort) right after connect and
    /// replayed after every reconnect.
    /// Default: empty
    pub default_subscriptions: HashSet<String>,

    /// Whether the engine reconnects on keepalive loss or goodbye.
    /// Default: true
    pub reconnect: bool,

    /// Clamp on the reconnection backoff delay.
    /// Default: 30000 ms
    pub reconnect_backoff_max_ms: u64,
}

impl EngineConfig {
    /// Configuration with defaults for the given device address.
    pub fn new(host: IpAddr) -> Self {
        Self {
            host,
            protocol_pref: ProtocolVersion::V3_1,
            discover_request_port: 7000,
            discover_response_port: 7001,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            ack_timeout_ms: 2000,
            max_retries: 3,
            retry_base_ms: 100,
            retry_max_ms: 2000,
            max_concurrent_commands: 5,
            callback_timeout_ms: 5000,
            keepalive_grace_ms: 5000,
            max_xml_bytes: 65_536,
            default_subscriptions: HashSet::new(),
            reconnect: true,
            reconnect_backoff_max_ms: 30_000,
        }
    }

    /// Validate the configuration and report the first problem found.
    pub fn validate(&self) -> Result<(), ConnectError> {
        if self.discover_request_port == 0 || self.discover_response_port == 0 {
            return Err(ConnectError::Configuration(
                "discovery ports must be non-zero".to_string(),
            ));
        }
        if self.ack_timeout_ms == 0 {
            return Err(ConnectError::Configuration(
                "ack timeout must be greater than 0".to_string(),
            ));
        }
        if self.retry_base_ms == 0 || self.retry_base_ms > self.retry_max_ms {
            return Err(ConnectError::Configuration(
                "retry base must be non-zero and no larger than retry max".to_string(),
            ));
        }
        if self.max_concurrent_commands == 0 {
            return Err(ConnectError::Configuration(
                "max concurrent commands must be greater than 0".to_string(),
            ));
        }
        if self.callback_timeout_ms == 0 {
            return Err(ConnectError::Configuration(
                "callback timeout must be greater than 0".to_string(),
            ));
        }
        if self.max_xml_bytes < 512 {
            return Err(ConnectError::Configuration(
                "max XML size must be at least 512 bytes".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_protocol(mut self, version: ProtocolVersion) -> Self {
        self.protocol_pref = version;
        self
    }

    pub fn with_discovery_ports(mut self, request: u16, response: u16) -> Self {
        self.discover_request_port = request;
        self.discover_response_port = response;
        self
    }

    pub fn with_broadcast_addr(mut self, addr: IpAddr) -> Self {
        self.broadcast_addr = addr;
        self
    }

    pub fn with_ack_timeout(mut self, ms: u64) -> Self {
        self.ack_timeout_ms = ms;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, base_ms: u64, max_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_base_ms = base_ms;
        self.retry_max_ms = max_ms;
        self
    }

    pub fn with_default_subscriptions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_subscriptions = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect = enabled;
        self
    }

    pub(crate) fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub(crate) fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub(crate) fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }

    pub(crate) fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }

    pub(crate) fn keepalive_grace(&self) -> Duration {
        Duration::from_millis(self.keepalive_grace_ms)
    }

    pub(crate) fn reconnect_backoff_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_max_ms)
    }
}
