//! Presence - UDP advertisement of the ports a host serves
//!
//! The controller owns a `ServerHosts` map (hostname -> descriptor) and a
//! broadcaster that periodically sends it, JSON encoded, to the LAN
//! broadcast address. Listeners decode whatever arrives; they keep no state.

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Largest datagram a listener accepts
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// One advertised TCP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortEntry {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
}

impl PortEntry {
    pub fn app(port: u16, app: &str) -> Self {
        Self {
            port,
            name: None,
            app: Some(app.to_string()),
        }
    }

    pub fn named(port: u16, name: &str) -> Self {
        Self {
            port,
            name: Some(name.to_string()),
            app: None,
        }
    }
}

/// What one host advertises
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostDescriptor {
    pub name: String,
    /// `ip_address_<iface>` -> dotted quad
    #[serde(flatten)]
    pub addresses: BTreeMap<String, String>,
    pub ports: Vec<PortEntry>,
}

impl HostDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            addresses: BTreeMap::new(),
            ports: Vec::new(),
        }
    }

    pub fn add_address(&mut self, iface: &str, addr: Ipv4Addr) {
        self.addresses
            .insert(format!("ip_address_{}", iface), addr.to_string());
    }
}

pub type ServerHosts = BTreeMap<String, HostDescriptor>;
pub type SharedHosts = Arc<Mutex<ServerHosts>>;

/// Periodic sender of the `ServerHosts` snapshot
pub struct Broadcaster {
    socket: UdpSocket,
    target: SocketAddr,
    hosts: SharedHosts,
}

impl Broadcaster {
    pub fn bind(target: SocketAddr, hosts: SharedHosts) -> std::io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_broadcast(true)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Self {
            socket,
            target,
            hosts,
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Send the current snapshot once
    pub async fn send_once(&self) -> Result<usize> {
        let payload = {
            let hosts = self.hosts.lock();
            serde_json::to_vec(&*hosts)?
        };
        let sent = self.socket.send_to(&payload, self.target).await?;
        debug!(target = %self.target, bytes = sent, "presence sent");
        Ok(sent)
    }

    /// Send now, then every `period`. Send failures are logged and skipped.
    pub fn spawn(self, period: Duration) -> JoinHandle<()> {
        info!(
            "Broadcasting presence to {} every {:?}",
            self.target, period
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = self.send_once().await {
                    warn!(target = %self.target, "presence send failed: {}", e);
                }
            }
        })
    }
}

/// One received datagram
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Peer { descriptor: Value, source: SocketAddr },
    Raw { text: String, source: SocketAddr },
}

impl PresenceEvent {
    pub fn source(&self) -> SocketAddr {
        match self {
            PresenceEvent::Peer { source, .. } | PresenceEvent::Raw { source, .. } => *source,
        }
    }
}

pub fn decode_datagram(payload: &[u8], source: SocketAddr) -> PresenceEvent {
    match serde_json::from_slice(payload) {
        Ok(descriptor) => PresenceEvent::Peer { descriptor, source },
        Err(_) => PresenceEvent::Raw {
            text: String::from_utf8_lossy(payload).to_string(),
            source,
        },
    }
}

/// Receives presence datagrams on the broadcast port
pub struct PresenceListener {
    socket: UdpSocket,
}

impl PresenceListener {
    pub fn bind(port: u16) -> std::io::Result<Self> {
        Self::bind_addr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
    }

    /// Bind with SO_REUSEADDR (and SO_REUSEPORT on unix) so several
    /// listeners can share one host
    pub fn bind_addr(addr: SocketAddr) -> std::io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;

        Ok(Self {
            socket: UdpSocket::from_std(socket.into())?,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn recv(&self) -> std::io::Result<PresenceEvent> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, source) = self.socket.recv_from(&mut buf).await?;
        let event = decode_datagram(&buf[..len], source);
        if let PresenceEvent::Raw { text, .. } = &event {
            warn!(source = %source, "undecodable presence datagram: {}", text);
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hosts() -> SharedHosts {
        let mut desc = HostDescriptor::new("node-a");
        desc.add_address("eth0", Ipv4Addr::new(192, 168, 1, 4));
        desc.ports.push(PortEntry::app(5000, "dmcontroller"));
        let mut hosts = ServerHosts::new();
        hosts.insert("node-a".into(), desc);
        Arc::new(Mutex::new(hosts))
    }

    #[test]
    fn test_descriptor_wire_shape() {
        let hosts = hosts();
        let value = serde_json::to_value(&*hosts.lock()).unwrap();
        assert_eq!(
            value,
            json!({
                "node-a": {
                    "name": "node-a",
                    "ip_address_eth0": "192.168.1.4",
                    "ports": [{"port": 5000, "app": "dmcontroller"}]
                }
            })
        );

        let back: ServerHosts = serde_json::from_value(value).unwrap();
        assert_eq!(back, *hosts.lock());
    }

    #[test]
    fn test_decode_datagram() {
        let source: SocketAddr = "10.0.0.2:5001".parse().unwrap();
        assert_eq!(
            decode_datagram(br#"{"h":{"name":"h"}}"#, source),
            PresenceEvent::Peer {
                descriptor: json!({"h": {"name": "h"}}),
                source
            }
        );
        assert_eq!(
            decode_datagram(b"hello", source),
            PresenceEvent::Raw {
                text: "hello".into(),
                source
            }
        );
    }

    #[tokio::test]
    async fn test_broadcast_reaches_listener() {
        let listener = PresenceListener::bind_addr("127.0.0.1:0".parse().unwrap()).unwrap();
        let target = listener.local_addr().unwrap();

        let hosts = hosts();
        let broadcaster = Broadcaster::bind(target, Arc::clone(&hosts)).unwrap();
        broadcaster.spawn(Duration::from_secs(60));

        let event = tokio::time::timeout(Duration::from_secs(2), listener.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            PresenceEvent::Peer { descriptor, .. } => {
                assert_eq!(descriptor["node-a"]["ports"][0]["port"], 5000);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_snapshot_follows_updates() {
        let listener = PresenceListener::bind_addr("127.0.0.1:0".parse().unwrap()).unwrap();
        let hosts = hosts();
        let broadcaster =
            Broadcaster::bind(listener.local_addr().unwrap(), Arc::clone(&hosts)).unwrap();

        hosts
            .lock()
            .get_mut("node-a")
            .unwrap()
            .ports
            .push(PortEntry::named(5002, "dmserver"));
        broadcaster.send_once().await.unwrap();

        let PresenceEvent::Peer { descriptor, .. } = listener.recv().await.unwrap() else {
            panic!("expected a descriptor");
        };
        assert_eq!(
            descriptor["node-a"]["ports"][1],
            json!({"port": 5002, "name": "dmserver"})
        );
    }
}
