//! Shared test fixture: a scripted fake XMC device on loopback UDP.
//!
//! The fake binds its own discovery, control, and notify sockets on
//! ephemeral ports and answers ping, control, subscription, unsubscribe,
//! and update frames the way the real firmware does. Tests drive behaviour
//! through the knobs below (ack delays, dropped acks, naks, property values)
//! and push notifications at the engine through `send_notify` and friends.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use emotiva_control::EngineConfig;

pub struct Behavior {
    pub response_port: AtomicU32,
    pub keepalive_ms: u32,
    pub legacy: bool,
    pub ack_delay_ms: AtomicU64,
    pub drop_acks: AtomicU32,
    pub suppress_discovery: AtomicBool,
    pub pings: AtomicU32,
    pub control_frames: AtomicU32,
    pub subscription_frames: AtomicU32,
    pub unsubscribe_frames: AtomicU32,
    pub update_frames: AtomicU32,
    pub inflight: AtomicU32,
    pub max_inflight: AtomicU32,
    pub naks: Mutex<HashSet<String>>,
    pub values: Mutex<HashMap<String, String>>,
}

pub struct FakeDevice {
    pub discover_port: u16,
    pub control_port: u16,
    pub notify_port: u16,
    behavior: Arc<Behavior>,
    notify_socket: Arc<UdpSocket>,
    tasks: Vec<JoinHandle<()>>,
}

impl FakeDevice {
    pub async fn start(keepalive_ms: u32) -> FakeDevice {
        Self::start_with(keepalive_ms, false).await
    }

    /// A fake that answers discovery without a control block, like pre-v3
    /// firmware.
    pub async fn start_legacy() -> FakeDevice {
        Self::start_with(0, true).await
    }

    async fn start_with(keepalive_ms: u32, legacy: bool) -> FakeDevice {
        let discover = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let control = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let notify = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let discover_port = discover.local_addr().unwrap().port();
        let control_port = control.local_addr().unwrap().port();
        let notify_port = notify.local_addr().unwrap().port();

        let behavior = Arc::new(Behavior {
            response_port: AtomicU32::new(0),
            keepalive_ms,
            legacy,
            ack_delay_ms: AtomicU64::new(0),
            drop_acks: AtomicU32::new(0),
            suppress_discovery: AtomicBool::new(false),
            pings: AtomicU32::new(0),
            control_frames: AtomicU32::new(0),
            subscription_frames: AtomicU32::new(0),
            unsubscribe_frames: AtomicU32::new(0),
            update_frames: AtomicU32::new(0),
            inflight: AtomicU32::new(0),
            max_inflight: AtomicU32::new(0),
            naks: Mutex::new(HashSet::new()),
            values: Mutex::new(HashMap::new()),
        });

        let tasks = vec![
            tokio::spawn(discovery_loop(
                Arc::clone(&discover),
                Arc::clone(&behavior),
                control_port,
                notify_port,
            )),
            tokio::spawn(control_loop(Arc::clone(&control), Arc::clone(&behavior))),
        ];

        FakeDevice {
            discover_port,
            control_port,
            notify_port,
            behavior,
            notify_socket: notify,
            tasks,
        }
    }

    /// Engine config pointed at this fake, with test-friendly timeouts.
    pub async fn client_config(&self) -> EngineConfig {
        let response_port = free_udp_port().await;
        self.behavior
            .response_port
            .store(u32::from(response_port), Ordering::SeqCst);

        let host = "127.0.0.1".parse().unwrap();
        EngineConfig::new(host)
            .with_broadcast_addr(host)
            .with_discovery_ports(self.discover_port, response_port)
            .with_ack_timeout(200)
            .with_retries(3, 20, 100)
    }

    pub fn set_ack_delay(&self, delay: Duration) {
        self.behavior
            .ack_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Swallow the next `n` ack-required control frames without replying.
    pub fn drop_acks(&self, n: u32) {
        self.behavior.drop_acks.store(n, Ordering::SeqCst);
    }

    pub fn suppress_discovery(&self, on: bool) {
        self.behavior.suppress_discovery.store(on, Ordering::SeqCst);
    }

    pub fn nak(&self, name: &str) {
        self.behavior.naks.lock().unwrap().insert(name.to_string());
    }

    pub fn set_property(&self, name: &str, value: &str) {
        self.behavior
            .values
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
    }

    pub fn pings(&self) -> u32 {
        self.behavior.pings.load(Ordering::SeqCst)
    }

    pub fn control_frames(&self) -> u32 {
        self.behavior.control_frames.load(Ordering::SeqCst)
    }

    pub fn subscription_frames(&self) -> u32 {
        self.behavior.subscription_frames.load(Ordering::SeqCst)
    }

    pub fn update_frames(&self) -> u32 {
        self.behavior.update_frames.load(Ordering::SeqCst)
    }

    pub fn max_inflight(&self) -> u32 {
        self.behavior.max_inflight.load(Ordering::SeqCst)
    }

    pub async fn send_raw(&self, to: SocketAddr, xml: &str) {
        // Engine sockets bind the unspecified address; route to loopback
        let to = if to.ip().is_unspecified() {
            SocketAddr::new("127.0.0.1".parse().unwrap(), to.port())
        } else {
            to
        };
        self.notify_socket.send_to(xml.as_bytes(), to).await.unwrap();
    }

    pub async fn send_notify(&self, to: SocketAddr, seq: u32, props: &[(&str, &str)]) {
        let mut xml = format!("<?xml version=\"1.0\"?><emotivaNotify sequence=\"{seq}\">");
        for (name, value) in props {
            xml.push_str(&format!(
                "<property name=\"{name}\" value=\"{value}\" visible=\"true\"/>"
            ));
        }
        xml.push_str("</emotivaNotify>");
        self.send_raw(to, &xml).await;
    }

    pub async fn send_keepalive(&self, to: SocketAddr, seq: u32) {
        let xml = format!(
            "<?xml version=\"1.0\"?><emotivaNotify sequence=\"{seq}\">\
             <property name=\"keepAlive\" value=\"{}\" visible=\"true\"/></emotivaNotify>",
            self.behavior.keepalive_ms
        );
        self.send_raw(to, &xml).await;
    }

    pub async fn send_goodbye(&self, to: SocketAddr) {
        self.send_raw(to, "<?xml version=\"1.0\"?><emotivaGoodbye/>").await;
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub async fn free_udp_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap().port()
}

async fn discovery_loop(
    socket: Arc<UdpSocket>,
    behavior: Arc<Behavior>,
    control_port: u16,
    notify_port: u16,
) {
    let mut buf = vec![0u8; 65_536];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(_) => continue,
        };
        let xml = String::from_utf8_lossy(&buf[..len]);
        if !xml.contains("emotivaPing") {
            continue;
        }
        behavior.pings.fetch_add(1, Ordering::SeqCst);
        if behavior.suppress_discovery.load(Ordering::SeqCst) {
            continue;
        }
        let response_port = behavior.response_port.load(Ordering::SeqCst) as u16;
        if response_port == 0 {
            continue;
        }

        let reply = if behavior.legacy {
            "<?xml version=\"1.0\"?><emotivaTransponder>\
             <model>XMC-1</model><revision>1.1</revision><name>Den</name>\
             </emotivaTransponder>"
                .to_string()
        } else {
            format!(
                "<?xml version=\"1.0\"?><emotivaTransponder>\
                 <model>XMC-2</model><revision>3.1</revision><name>LR</name>\
                 <control><version>3.1</version><controlPort>{control_port}</controlPort>\
                 <notifyPort>{notify_port}</notifyPort><keepAlive>{}</keepAlive></control>\
                 </emotivaTransponder>",
                behavior.keepalive_ms
            )
        };
        let dest = SocketAddr::new(src.ip(), response_port);
        let _ = socket.send_to(reply.as_bytes(), dest).await;
    }
}

async fn control_loop(socket: Arc<UdpSocket>, behavior: Arc<Behavior>) {
    let mut buf = vec![0u8; 65_536];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(_) => continue,
        };
        let xml = String::from_utf8_lossy(&buf[..len]).into_owned();
        let socket = Arc::clone(&socket);
        let behavior = Arc::clone(&behavior);
        tokio::spawn(async move {
            handle_control_frame(socket, behavior, xml, src).await;
        });
    }
}

async fn handle_control_frame(
    socket: Arc<UdpSocket>,
    behavior: Arc<Behavior>,
    xml: String,
    src: SocketAddr,
) {
    if xml.contains("<emotivaControl>") {
        behavior.control_frames.fetch_add(1, Ordering::SeqCst);
        let current = behavior.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        behavior.max_inflight.fetch_max(current, Ordering::SeqCst);

        let delay = behavior.ack_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        behavior.inflight.fetch_sub(1, Ordering::SeqCst);

        if !xml.contains("ack=\"yes\"") {
            return;
        }
        if take_one(&behavior.drop_acks) {
            return;
        }

        let mut reply = String::from("<?xml version=\"1.0\"?><emotivaAck>");
        for name in child_names(&xml) {
            let status = if behavior.naks.lock().unwrap().contains(&name) {
                "nak"
            } else {
                "ack"
            };
            reply.push_str(&format!("<{name} status=\"{status}\"/>"));
        }
        reply.push_str("</emotivaAck>");
        let _ = socket.send_to(reply.as_bytes(), src).await;
    } else if xml.contains("<emotivaSubscription") {
        behavior.subscription_frames.fetch_add(1, Ordering::SeqCst);
        let reply = status_reply(&behavior, &xml, "emotivaSubscription");
        let _ = socket.send_to(reply.as_bytes(), src).await;
    } else if xml.contains("<emotivaUnsubscribe") {
        behavior.unsubscribe_frames.fetch_add(1, Ordering::SeqCst);
        let reply = status_reply(&behavior, &xml, "emotivaUnsubscribe");
        let _ = socket.send_to(reply.as_bytes(), src).await;
    } else if xml.contains("<emotivaUpdate") {
        behavior.update_frames.fetch_add(1, Ordering::SeqCst);
        let reply = status_reply(&behavior, &xml, "emotivaUpdate");
        let _ = socket.send_to(reply.as_bytes(), src).await;
    }
}

fn status_reply(behavior: &Behavior, request: &str, root: &str) -> String {
    let mut reply = format!("<?xml version=\"1.0\"?><{root} protocol=\"3.1\">");
    let naks = behavior.naks.lock().unwrap();
    let values = behavior.values.lock().unwrap();
    for name in child_names(request) {
        if naks.contains(&name) {
            reply.push_str(&format!("<property name=\"{name}\" status=\"nak\"/>"));
        } else {
            let value = values.get(&name).cloned().unwrap_or_else(|| "0".to_string());
            reply.push_str(&format!(
                "<property name=\"{name}\" value=\"{value}\" visible=\"true\" status=\"ack\"/>"
            ));
        }
    }
    reply.push_str(&format!("</{root}>"));
    reply
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Names of the child elements of a single-root frame, declaration skipped.
fn child_names(xml: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut seen_root = false;
    for segment in xml.split('<').skip(1) {
        if segment.starts_with('?') || segment.starts_with('/') {
            continue;
        }
        let token: String = segment
            .chars()
            .take_while(|c| !c.is_whitespace() && *c != '/' && *c != '>')
            .collect();
        if token.is_empty() {
            continue;
        }
        if !seen_root {
            seen_root = true;
            continue;
        }
        names.push(token);
    }
    names
}
