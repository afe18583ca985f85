//! Device discovery over the ping/transponder exchange.
//!
//! Broadcasts `emotivaPing` on the discover-request port and waits for an
//! `emotivaTransponder` on the discover-response port, retrying with
//! exponential backoff. Only replies from the configured host are accepted;
//! the first match wins and later replies in the window are discarded.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::codec::{self, Frame, TransponderInfo};
use crate::config::EngineConfig;
use crate::error::{DiscoveryError, TransportError};
use crate::socket::SocketManager;
use crate::types::{DeviceDescriptor, EndpointRole, ProtocolVersion};

/// Fallback ports when old firmware omits the control block.
const DEFAULT_CONTROL_PORT: u16 = 7002;
const DEFAULT_NOTIFY_PORT: u16 = 7003;

/// Keepalive interval assumed when the transponder does not advertise one.
const DEFAULT_KEEPALIVE_MS: u32 = 10_000;

/// Run one discovery exchange and return the device descriptor.
pub(crate) async fn discover(
    sockets: &SocketManager,
    config: &EngineConfig,
) -> Result<DeviceDescriptor, DiscoveryError> {
    let ping = codec::ping_frame(config.protocol_pref);
    let backoff = Backoff::new(config.retry_base(), config.retry_max());
    let attempts = config.max_retries + 1;

    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(backoff.delay(attempt - 1)).await;
        }
        debug!(attempt = attempt + 1, attempts, "sending discovery ping");
        sockets
            .send(EndpointRole::DiscoverRequest, ping.as_bytes(), None)
            .await?;

        if let Some(info) = await_transponder(sockets, config).await? {
            let descriptor = into_descriptor(info);
            info!(
                model = %descriptor.model,
                protocol = %descriptor.protocol_version,
                control_port = descriptor.control_port,
                notify_port = descriptor.notify_port,
                "device discovered"
            );
            return Ok(descriptor);
        }
    }

    Err(DiscoveryError::Timeout { attempts })
}

/// Wait out one receive window for a transponder from the configured host.
async fn await_transponder(
    sockets: &SocketManager,
    config: &EngineConfig,
) -> Result<Option<TransponderInfo>, DiscoveryError> {
    let deadline = Instant::now() + config.ack_timeout();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        let datagram = match sockets
            .recv(EndpointRole::DiscoverResponse, remaining)
            .await
        {
            Ok(datagram) => datagram,
            Err(TransportError::RecvTimeout { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if datagram.source.ip() != config.host {
            warn!(source = %datagram.source, expected = %config.host,
                "ignoring transponder from unexpected host");
            continue;
        }

        match codec::parse_frame(&datagram.data, config.max_xml_bytes) {
            Ok(Frame::Transponder(info)) => return Ok(Some(info)),
            Ok(other) => {
                debug!(frame = ?frame_name(&other), "ignoring non-transponder discovery reply");
            }
            Err(e) => {
                warn!(error = %e, "discarding malformed discovery reply");
            }
        }
    }
}

fn frame_name(frame: &Frame) -> &'static str {
    match frame {
        Frame::Transponder(_) => "transponder",
        Frame::Ack(_) => "ack",
        Frame::Notify { .. } => "notify",
        Frame::Subscription(_) => "subscription",
        Frame::Unsubscribe(_) => "unsubscribe",
        Frame::Update(_) => "update",
        Frame::MenuNotify(_) => "menuNotify",
        Frame::BarNotify(_) => "barNotify",
        Frame::KeepAlive => "keepAlive",
        Frame::Goodbye => "goodbye",
    }
}

/// Apply the protocol defaults for fields old firmware omits.
fn into_descriptor(info: TransponderInfo) -> DeviceDescriptor {
    let protocol_version = info
        .version
        .as_deref()
        .map(ProtocolVersion::parse)
        .unwrap_or(ProtocolVersion::V2_0);
    DeviceDescriptor {
        model: info.model,
        revision: info.revision,
        name: info.name,
        protocol_version,
        control_port: info.control_port.unwrap_or(DEFAULT_CONTROL_PORT),
        notify_port: info.notify_port.unwrap_or(DEFAULT_NOTIFY_PORT),
        keepalive_interval_ms: info.keepalive_ms.unwrap_or(DEFAULT_KEEPALIVE_MS),
    }
}
