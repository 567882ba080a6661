//! Controller - the node's well-known endpoint
//!
//! Serves the data protocol on the controller port, advertises this host
//! over UDP, and starts extra in-process servers on request (`add`). Every
//! server it starts shares the controller's store.
//!
//! Port slots move `absent -> Starting -> Running`; a failed bind returns
//! the slot to absent.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use datamesh_core::protocol::decode_body_strict;
use datamesh_core::{build_mesh, AppStatus, Mesh, MeshError, NodeConfig, Reply};

use crate::dispatch::Handler;
use crate::netif::{self, Interface};
use crate::presence::{Broadcaster, HostDescriptor, PortEntry, ServerHosts, SharedHosts};
use crate::server::MeshServer;

pub const CONTROLLER_APP: &str = "dmcontroller";
pub const DEFAULT_SERVER_NAME: &str = "dmserver";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Starting,
    Running,
}

#[derive(Debug, Deserialize)]
struct AddRequest {
    port: u16,
    #[serde(default)]
    name: Option<String>,
}

pub struct Controller {
    config: NodeConfig,
    mesh: Mesh,
    hostname: String,
    hosts: SharedHosts,
    server_threads: Mutex<HashMap<u16, PortState>>,
    broadcast_target: SocketAddr,
}

impl Controller {
    pub fn new(
        config: NodeConfig,
        mesh: Mesh,
        hostname: String,
        interfaces: &[Interface],
    ) -> Arc<Self> {
        let mut descriptor = HostDescriptor::new(&hostname);
        for iface in interfaces {
            descriptor.add_address(&iface.name, iface.addr);
        }
        if let Some(primary) = interfaces.first() {
            info!(iface = %primary.name, addr = %primary.addr, "primary interface");
        }

        let mut hosts = ServerHosts::new();
        hosts.insert(hostname.clone(), descriptor);

        let broadcast_target = SocketAddr::from((
            netif::broadcast_target(&config, interfaces),
            config.broadcast_port,
        ));

        Arc::new(Self {
            config,
            mesh,
            hostname,
            hosts: Arc::new(Mutex::new(hosts)),
            server_threads: Mutex::new(HashMap::new()),
            broadcast_target,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn broadcast_target(&self) -> SocketAddr {
        self.broadcast_target
    }

    /// This host's current advertisement
    pub fn descriptor(&self) -> Option<HostDescriptor> {
        self.hosts.lock().get(&self.hostname).cloned()
    }

    pub fn port_state(&self, port: u16) -> Option<PortState> {
        self.server_threads.lock().get(&port).copied()
    }

    fn advertise(&self, entry: PortEntry) {
        if let Some(descriptor) = self.hosts.lock().get_mut(&self.hostname) {
            descriptor.ports.push(entry);
        }
    }

    /// Bind the controller endpoint itself. `add` is only served here.
    pub fn bind_control(self: &Arc<Self>, addr: SocketAddr) -> std::io::Result<MeshServer> {
        let handler = Handler::controller(
            self.mesh.clone(),
            Arc::clone(self),
            self.config.max_request_bytes,
        );
        let server = MeshServer::bind(addr, handler)?;
        let port = server.local_addr()?.port();

        self.server_threads.lock().insert(port, PortState::Running);
        self.advertise(PortEntry::app(port, CONTROLLER_APP));
        Ok(server)
    }

    pub fn start_broadcaster(&self) -> std::io::Result<JoinHandle<()>> {
        let broadcaster = Broadcaster::bind(self.broadcast_target, Arc::clone(&self.hosts))?;
        Ok(broadcaster.spawn(self.config.broadcast_interval()))
    }

    /// Start a sibling server on the requested port
    pub fn add(&self, body: Option<Value>) -> Reply {
        let request = match parse_add(body) {
            Ok(request) => request,
            Err(e) => {
                warn!("add rejected: {}", e);
                return Reply::from_error(&e);
            }
        };
        let port = request.port;
        let name = request
            .name
            .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string());

        {
            let mut slots = self.server_threads.lock();
            if slots.contains_key(&port) {
                info!(port, "add: already running");
                return Reply::app(AppStatus::AlreadyRunning, port);
            }
            slots.insert(port, PortState::Starting);
        }

        let handler = Handler::server(self.mesh.clone(), self.config.max_request_bytes);
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        match MeshServer::bind(addr, handler) {
            Ok(server) => {
                self.server_threads.lock().insert(port, PortState::Running);
                self.advertise(PortEntry::named(port, &name));
                tokio::spawn(server.run());
                info!(port, name = %name, "add: server running");
                Reply::app(AppStatus::Running, port)
            }
            Err(e) => {
                self.server_threads.lock().remove(&port);
                let err = MeshError::BindFailed {
                    port,
                    reason: e.to_string(),
                };
                warn!("add failed: {}", err);
                Reply::from_error(&err)
            }
        }
    }
}

fn parse_add(body: Option<Value>) -> datamesh_core::Result<AddRequest> {
    let body = body.ok_or_else(|| MeshError::Decode("add needs a body".into()))?;
    let request: AddRequest = serde_json::from_value(decode_body_strict(body)?)?;
    if request.port == 0 {
        return Err(MeshError::Decode("add needs a non-zero port".into()));
    }
    Ok(request)
}

/// Run a controller node until the process exits
pub async fn launch(config: NodeConfig) -> Result<()> {
    let mesh = build_mesh(&config);
    let interfaces = netif::discover(&config.interfaces);
    let controller = Controller::new(config.clone(), mesh, netif::hostname(), &interfaces);

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.controller_port));
    let server = controller
        .bind_control(addr)
        .with_context(|| format!("Failed to bind controller port {}", config.controller_port))?;

    controller
        .start_broadcaster()
        .context("Failed to open broadcast socket")?;

    info!(
        host = %controller.hostname(),
        "Controller ready on {}, presence to {}",
        addr,
        controller.broadcast_target()
    );
    server.run().await;
    Ok(())
}
