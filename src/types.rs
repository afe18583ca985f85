//! Core data model shared across the engine.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Remote-control protocol versions spoken by XMC-series processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    V2_0,
    V3_0,
    V3_1,
}

impl ProtocolVersion {
    /// Wire representation used in `protocol="…"` attributes.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::V2_0 => "2.0",
            ProtocolVersion::V3_0 => "3.0",
            ProtocolVersion::V3_1 => "3.1",
        }
    }

    /// Parse a version string from a transponder reply.
    ///
    /// Unknown or partial strings fall back to the oldest supported version,
    /// matching how legacy firmware advertises itself.
    pub fn parse(s: &str) -> ProtocolVersion {
        match s.trim() {
            "3.1" => ProtocolVersion::V3_1,
            "3.0" => ProtocolVersion::V3_0,
            _ => ProtocolVersion::V2_0,
        }
    }

    /// Whether this version uses the `<property name=…/>` entry shape.
    pub(crate) fn uses_property_elements(&self) -> bool {
        !matches!(self, ProtocolVersion::V2_0)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device descriptor produced by discovery. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub model: String,
    pub revision: String,
    pub name: String,
    pub protocol_version: ProtocolVersion,
    pub control_port: u16,
    pub notify_port: u16,
    pub keepalive_interval_ms: u32,
}

/// The four UDP endpoints the engine owns while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointRole {
    DiscoverRequest,
    DiscoverResponse,
    Control,
    Notify,
}

impl EndpointRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointRole::DiscoverRequest => "discover_req",
            EndpointRole::DiscoverResponse => "discover_resp",
            EndpointRole::Control => "control",
            EndpointRole::Notify => "notify",
        }
    }
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single control command. The name is an opaque ASCII token; the value is
/// carried verbatim in the `value` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub value: String,
    pub ack_required: bool,
}

impl Command {
    /// Command that requests an acknowledgement frame.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Command {
        Command {
            name: name.into(),
            value: value.into(),
            ack_required: true,
        }
    }

    /// Command sent without waiting for an acknowledgement.
    pub fn fire_and_forget(name: impl Into<String>, value: impl Into<String>) -> Command {
        Command {
            ack_required: false,
            ..Command::new(name, value)
        }
    }
}

/// Returns true when `name` matches `[a-zA-Z_][a-zA-Z0-9_]*`.
pub(crate) fn is_valid_command_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Outcome of one acknowledged command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    Ack,
    Nak,
}

impl AckStatus {
    pub(crate) fn parse(s: &str) -> Option<AckStatus> {
        match s {
            "ack" => Some(AckStatus::Ack),
            "nak" => Some(AckStatus::Nak),
            _ => None,
        }
    }
}

/// One entry of an `emotivaAck` frame paired back to its command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckResult {
    pub name: String,
    pub status: AckStatus,
}

/// A property-change notification delivered to callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyEvent {
    pub name: String,
    pub value: String,
    pub visible: bool,
    /// Sequence number of the `emotivaNotify` frame this entry arrived in.
    pub seq: u32,
}

/// Per-name outcome of a subscribe or unsubscribe round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOutcome {
    pub status: AckStatus,
    /// Initial value reported by the device alongside the ack, when present.
    pub initial_value: Option<String>,
    pub visible: Option<bool>,
}

/// An `emotivaMenuNotify` or `emotivaBarNotify` frame passed through opaquely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    pub sequence: u32,
    /// The full frame as received, for host-side rendering.
    pub xml: String,
}

/// Engine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The device is believed unreachable; reconnection may be in progress.
    Degraded,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why the engine considers the device unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    /// No keepalive within the advertised interval plus grace.
    KeepaliveTimeout,
    /// The device announced it is going away.
    Goodbye,
}

/// Lifecycle events delivered to `on_connection` callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Established { descriptor: DeviceDescriptor },
    Lost { reason: LossReason },
    Restored { descriptor: DeviceDescriptor },
    Closed,
}

/// Snapshot of the engine's running counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub notifications_dropped: u64,
    pub sequence_gaps: u64,
    pub callback_timeouts: u64,
    pub callback_panics: u64,
    pub orphan_responses: u64,
    pub recv_queue_overflows: u64,
    pub legacy_frames: u64,
    pub unknown_roots: u64,
}

/// Shared counters behind the [`EngineStats`] snapshot.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub notifications_dropped: AtomicU64,
    pub sequence_gaps: AtomicU64,
    pub callback_timeouts: AtomicU64,
    pub callback_panics: AtomicU64,
    pub orphan_responses: AtomicU64,
    pub recv_queue_overflows: AtomicU64,
    pub legacy_frames: AtomicU64,
    pub unknown_roots: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> EngineStats {
        EngineStats {
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
            sequence_gaps: self.sequence_gaps.load(Ordering::Relaxed),
            callback_timeouts: self.callback_timeouts.load(Ordering::Relaxed),
            callback_panics: self.callback_panics.load(Ordering::Relaxed),
            orphan_responses: self.orphan_responses.load(Ordering::Relaxed),
            recv_queue_overflows: self.recv_queue_overflows.load(Ordering::Relaxed),
            legacy_frames: self.legacy_frames.load(Ordering::Relaxed),
            unknown_roots: self.unknown_roots.load(Ordering::Relaxed),
        }
    }
}

/// The authoritative set of acked subscription names.
pub type SubscriptionSet = HashSet<String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_version_parse() {
        assert_eq!(ProtocolVersion::parse("3.1"), ProtocolVersion::V3_1);
        assert_eq!(ProtocolVersion::parse("3.0"), ProtocolVersion::V3_0);
        assert_eq!(ProtocolVersion::parse("2.0"), ProtocolVersion::V2_0);
        // Anything unrecognised is treated as the legacy version
        assert_eq!(ProtocolVersion::parse("1.0"), ProtocolVersion::V2_0);
        assert_eq!(ProtocolVersion::parse(""), ProtocolVersion::V2_0);
        assert_eq!(ProtocolVersion::parse(" 3.1 "), ProtocolVersion::V3_1);
    }

    #[test]
    fn test_protocol_version_ordering() {
        assert!(ProtocolVersion::V2_0 < ProtocolVersion::V3_0);
        assert!(ProtocolVersion::V3_0 < ProtocolVersion::V3_1);
    }

    #[test]
    fn test_command_name_validation() {
        assert!(is_valid_command_name("power_on"));
        assert!(is_valid_command_name("_private"));
        assert!(is_valid_command_name("zone2_volume"));
        assert!(is_valid_command_name("volumeUp"));
        assert!(!is_valid_command_name(""));
        assert!(!is_valid_command_name("2fast"));
        assert!(!is_valid_command_name("has space"));
        assert!(!is_valid_command_name("has-dash"));
        assert!(!is_valid_command_name("ünïcode"));
    }

    #[test]
    fn test_command_constructors() {
        let acked = Command::new("power_on", "0");
        assert!(acked.ack_required);

        let silent = Command::fire_and_forget("volumeUp", "0");
        assert!(!silent.ack_required);
        assert_eq!(silent.name, "volumeUp");
    }

    #[test]
    fn test_ack_status_parse() {
        assert_eq!(AckStatus::parse("ack"), Some(AckStatus::Ack));
        assert_eq!(AckStatus::parse("nak"), Some(AckStatus::Nak));
        assert_eq!(AckStatus::parse("yes"), None);
    }

    #[test]
    fn test_endpoint_role_display() {
        assert_eq!(EndpointRole::DiscoverRequest.to_string(), "discover_req");
        assert_eq!(EndpointRole::Notify.to_string(), "notify");
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = Counters::default();
        counters.sequence_gaps.fetch_add(3, Ordering::Relaxed);
        counters.notifications_dropped.fetch_add(1, Ordering::Relaxed);

        let stats = counters.snapshot();
        assert_eq!(stats.sequence_gaps, 3);
        assert_eq!(stats.notifications_dropped, 1);
        assert_eq!(stats.callback_timeouts, 0);
    }
}
