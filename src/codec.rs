//! XML codec for the wire protocol.
//!
//! Inbound frames are parsed permissively into [`Frame`] values; outbound
//! frames are produced as single-line XML strings with a leading declaration.
//! The parser enforces the configured size bound before touching the payload
//! and normalises the legacy v2.0 entry shape (property name as the element
//! tag) into the v3 `<property name=…/>` shape.

use std::borrow::Cow;

use xmltree::Element;

use crate::error::ProtocolError;
use crate::types::{AckStatus, Command, ProtocolVersion, RawNotification};

pub(crate) const XML_DECL: &str = "<?xml version=\"1.0\" encoding=\"utf-8\"?>";

/// How many payload bytes a malformed-XML error carries for diagnostics.
const SNIPPET_BYTES: usize = 200;

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Frame {
    Transponder(TransponderInfo),
    Ack(Vec<StatusProperty>),
    Notify {
        sequence: u32,
        properties: Vec<NotifyProperty>,
        /// True when the frame used the legacy v2.0 entry shape.
        legacy: bool,
    },
    Subscription(Vec<StatusProperty>),
    Unsubscribe(Vec<StatusProperty>),
    Update(Vec<StatusProperty>),
    MenuNotify(RawNotification),
    BarNotify(RawNotification),
    KeepAlive,
    Goodbye,
}

/// Raw transponder contents; defaults are applied by discovery.
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct TransponderInfo {
    pub model: String,
    pub revision: String,
    pub name: String,
    pub version: Option<String>,
    pub control_port: Option<u16>,
    pub notify_port: Option<u16>,
    pub keepalive_ms: Option<u32>,
}

/// One `<property>` entry of a notification frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NotifyProperty {
    pub name: String,
    pub value: String,
    pub visible: bool,
}

/// One entry of an ack, subscription, unsubscribe, or update response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StatusProperty {
    pub name: String,
    pub value: Option<String>,
    pub visible: Option<bool>,
    pub status: Option<AckStatus>,
}

/// Parse one datagram into a [`Frame`].
///
/// Frames over `max_bytes` are rejected before any parsing happens.
pub(crate) fn parse_frame(data: &[u8], max_bytes: usize) -> Result<Frame, ProtocolError> {
    if data.len() > max_bytes {
        return Err(ProtocolError::XmlTooLarge {
            size: data.len(),
            max: max_bytes,
        });
    }

    let root = Element::parse(data).map_err(|e| ProtocolError::XmlMalformed {
        detail: e.to_string(),
        snippet: snippet(data),
    })?;

    match root.name.as_str() {
        "emotivaTransponder" => Ok(Frame::Transponder(parse_transponder(&root))),
        "emotivaAck" => Ok(Frame::Ack(parse_ack(&root))),
        "emotivaNotify" => Ok(parse_notify(&root)),
        "emotivaSubscription" => Ok(Frame::Subscription(parse_status_list(&root))),
        "emotivaUnsubscribe" => Ok(Frame::Unsubscribe(parse_status_list(&root))),
        "emotivaUpdate" => Ok(Frame::Update(parse_status_list(&root))),
        "emotivaMenuNotify" => Ok(Frame::MenuNotify(raw_notification(&root, data))),
        "emotivaBarNotify" => Ok(Frame::BarNotify(raw_notification(&root, data))),
        "emotivaKeepAlive" | "keepAlive" => Ok(Frame::KeepAlive),
        "emotivaGoodbye" | "goodbye" => Ok(Frame::Goodbye),
        other => Err(ProtocolError::UnknownRoot(other.to_string())),
    }
}

fn snippet(data: &[u8]) -> String {
    let end = data.len().min(SNIPPET_BYTES);
    String::from_utf8_lossy(&data[..end]).into_owned()
}

fn child_elements(el: &Element) -> impl Iterator<Item = &Element> {
    el.children.iter().filter_map(|node| node.as_element())
}

fn child_text(el: &Element, name: &str) -> Option<String> {
    el.get_child(name)
        .and_then(|c| c.get_text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn parse_transponder(root: &Element) -> TransponderInfo {
    let control = root.get_child("control");
    TransponderInfo {
        model: child_text(root, "model").unwrap_or_default(),
        revision: child_text(root, "revision").unwrap_or_default(),
        name: child_text(root, "name").unwrap_or_default(),
        version: control
            .and_then(|c| child_text(c, "version"))
            .or_else(|| root.attributes.get("protocol").cloned()),
        control_port: control
            .and_then(|c| child_text(c, "controlPort"))
            .and_then(|t| t.parse().ok()),
        notify_port: control
            .and_then(|c| child_text(c, "notifyPort"))
            .and_then(|t| t.parse().ok()),
        keepalive_ms: control
            .and_then(|c| child_text(c, "keepAlive"))
            .and_then(|t| t.parse().ok()),
    }
}

fn parse_ack(root: &Element) -> Vec<StatusProperty> {
    // Ack children are named after the command itself: <power_on status="ack"/>
    child_elements(root)
        .map(|child| StatusProperty {
            name: child.name.clone(),
            value: child.attributes.get("value").cloned(),
            visible: child.attributes.get("visible").map(|v| v == "true"),
            status: child
                .attributes
                .get("status")
                .and_then(|s| AckStatus::parse(s)),
        })
        .collect()
}

fn parse_notify(root: &Element) -> Frame {
    let sequence = root
        .attributes
        .get("sequence")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let mut legacy = false;
    let mut properties = Vec::new();
    for child in child_elements(root) {
        let name = if child.name == "property" {
            match child.attributes.get("name") {
                Some(n) => n.clone(),
                None => continue,
            }
        } else {
            // v2.0: the element tag is the property name
            legacy = true;
            child.name.clone()
        };
        properties.push(NotifyProperty {
            name,
            value: child.attributes.get("value").cloned().unwrap_or_default(),
            visible: child
                .attributes
                .get("visible")
                .map(|v| v == "true")
                .unwrap_or(true),
        });
    }

    Frame::Notify {
        sequence,
        properties,
        legacy,
    }
}

fn parse_status_list(root: &Element) -> Vec<StatusProperty> {
    child_elements(root)
        .filter_map(|child| {
            let name = if child.name == "property" {
                child.attributes.get("name")?.clone()
            } else {
                child.name.clone()
            };
            Some(StatusProperty {
                name,
                value: child.attributes.get("value").cloned(),
                visible: child.attributes.get("visible").map(|v| v == "true"),
                status: child
                    .attributes
                    .get("status")
                    .and_then(|s| AckStatus::parse(s)),
            })
        })
        .collect()
}

fn raw_notification(root: &Element, data: &[u8]) -> RawNotification {
    RawNotification {
        sequence: root
            .attributes
            .get("sequence")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        xml: String::from_utf8_lossy(data).into_owned(),
    }
}

/// Discovery ping. v2.0 pings carry no protocol attribute.
pub(crate) fn ping_frame(version: ProtocolVersion) -> String {
    match version {
        ProtocolVersion::V2_0 => format!("{XML_DECL}<emotivaPing/>"),
        v => format!("{XML_DECL}<emotivaPing protocol=\"{v}\"/>"),
    }
}

/// Control frame grouping one or more commands.
pub(crate) fn control_frame(commands: &[Command]) -> String {
    let mut out = String::with_capacity(XML_DECL.len() + 64 * commands.len());
    out.push_str(XML_DECL);
    out.push_str("<emotivaControl>");
    for command in commands {
        let ack = if command.ack_required { "yes" } else { "no" };
        out.push_str(&format!(
            "<{} value=\"{}\" ack=\"{}\"/>",
            command.name,
            escape_attr(&command.value),
            ack
        ));
    }
    out.push_str("</emotivaControl>");
    out
}

pub(crate) fn subscription_frame(names: &[String], version: ProtocolVersion) -> String {
    name_list_frame("emotivaSubscription", names, version)
}

pub(crate) fn unsubscribe_frame(names: &[String], version: ProtocolVersion) -> String {
    name_list_frame("emotivaUnsubscribe", names, version)
}

pub(crate) fn update_frame(names: &[String], version: ProtocolVersion) -> String {
    name_list_frame("emotivaUpdate", names, version)
}

fn name_list_frame(root: &str, names: &[String], version: ProtocolVersion) -> String {
    let mut out = String::with_capacity(XML_DECL.len() + root.len() * 2 + 16 * names.len());
    out.push_str(XML_DECL);
    if version.uses_property_elements() {
        out.push_str(&format!("<{root} protocol=\"{version}\">"));
    } else {
        out.push_str(&format!("<{root}>"));
    }
    for name in names {
        out.push_str(&format!("<{name}/>"));
    }
    out.push_str(&format!("</{root}>"));
    out
}

fn escape_attr(value: &str) -> Cow<'_, str> {
    if !value.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(value);
    }
    let mut out = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}
