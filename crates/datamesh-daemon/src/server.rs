//! Mesh Server - one JSON request per TCP connection
//!
//! Each accepted client gets its own task: read until the bytes form one
//! JSON value, dispatch, write the reply, close.

use anyhow::Result;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use datamesh_core::protocol::frame_status;
use datamesh_core::{Frame, Reply};

use crate::dispatch::Handler;

const READ_CHUNK: usize = 4096;

/// Listening data-mesh endpoint
pub struct MeshServer {
    listener: TcpListener,
    handler: Arc<Handler>,
}

impl MeshServer {
    /// Bind with SO_REUSEADDR (and SO_REUSEPORT on unix)
    pub fn bind(addr: SocketAddr, handler: Handler) -> std::io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        socket.set_nonblocking(true)?;

        let listener = TcpListener::from_std(socket.into())?;
        Ok(Self {
            listener,
            handler: Arc::new(handler),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept forever
    pub async fn run(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!("Mesh server listening on {}", addr),
            Err(e) => error!("Mesh server has no local address: {}", e),
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let handler = Arc::clone(&self.handler);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(&handler, stream, peer).await {
                            error!(peer = %peer, "Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

/// Handle a single connection
async fn handle_connection(handler: &Handler, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    let reply = loop {
        let n = match stream.read(&mut chunk).await {
            Ok(n) => n,
            Err(e) if is_disconnect(&e) => {
                debug!(peer = %peer, "client went away mid-request: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            if buf.iter().all(u8::is_ascii_whitespace) {
                debug!(peer = %peer, "client closed before sending a request");
                return Ok(());
            }
            // closed mid-value
            break handler.handle_bytes(&buf);
        }

        buf.extend_from_slice(&chunk[..n]);
        match frame_status(&buf) {
            Frame::Complete => break handler.handle_bytes(&buf),
            Frame::Invalid => break Reply::json_error(),
            Frame::Incomplete if buf.len() >= handler.max_request_bytes() => {
                debug!(peer = %peer, "request exceeds {} bytes", handler.max_request_bytes());
                break Reply::json_error();
            }
            Frame::Incomplete => continue,
        }
    };

    let bytes = reply.encode()?;
    match send_reply(&mut stream, &bytes).await {
        Ok(()) => Ok(()),
        Err(e) if is_disconnect(&e) => {
            debug!(peer = %peer, "client closed before the reply: {}", e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn send_reply(stream: &mut TcpStream, bytes: &[u8]) -> std::io::Result<()> {
    stream.write_all(bytes).await?;
    stream.shutdown().await
}

/// Peer closed or reset the connection
fn is_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
    )
}
