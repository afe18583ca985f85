//! Error types for the engine, layered by subsystem.

use crate::types::EndpointRole;

/// Errors from the socket manager.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Binding one of the four endpoints failed. Fatal for the engine.
    #[error("failed to bind {role} endpoint on port {port}: {source}")]
    PortBindFailed {
        role: EndpointRole,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Writing a datagram failed.
    #[error("send failed on {role} endpoint: {source}")]
    SendFailed {
        role: EndpointRole,
        #[source]
        source: std::io::Error,
    },

    /// No datagram arrived within the receive window.
    #[error("receive timed out on {role} endpoint")]
    RecvTimeout { role: EndpointRole },

    /// The socket manager has not been started, or has been stopped.
    #[error("socket manager is not running")]
    NotRunning,
}

/// Errors from device discovery.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// No transponder reply after the final retry.
    #[error("no transponder response after {attempts} attempts")]
    Timeout { attempts: u32 },

    /// A reply arrived but could not be interpreted.
    #[error("malformed transponder response: {0}")]
    Malformed(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors from the protocol engine and the XML codec.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The raw frame exceeds the configured size bound. No parse is attempted.
    #[error("frame of {size} bytes exceeds the {max}-byte limit")]
    XmlTooLarge { size: usize, max: usize },

    /// The frame is not well-formed XML. Carries a payload prefix for diagnostics.
    #[error("malformed XML frame: {detail} (payload starts {snippet:?})")]
    XmlMalformed { detail: String, snippet: String },

    /// The root element is not part of the protocol.
    #[error("unrecognised root element <{0}>")]
    UnknownRoot(String),

    /// No acknowledgement for the named command after all retries.
    #[error("no acknowledgement for `{name}` after all retries")]
    AckTimeout { name: String },

    /// The device explicitly rejected the named command.
    #[error("device rejected `{name}`")]
    Nak { name: String },

    /// A response frame could not be paired with any outstanding request.
    #[error("response did not match any outstanding request: {0}")]
    UnexpectedResponse(String),

    /// The command name is not a valid protocol token.
    #[error("invalid command name `{0}`")]
    InvalidCommandName(String),

    /// The engine is not in the `Connected` state.
    #[error("engine is not connected")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors surfaced by `connect` and `close`.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// `connect` was called while a `close` is in progress or completed.
    #[error("engine is closing or closed")]
    ClosingInProgress,

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;
