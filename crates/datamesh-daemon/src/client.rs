//! Mesh Client - send one envelope, read the reply until the server closes

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

use datamesh_core::Request;

/// Send raw bytes as one request and return the reply text without its
/// trailing newline
pub async fn send_raw(addr: impl ToSocketAddrs, payload: &[u8]) -> Result<String> {
    let mut stream = TcpStream::connect(addr)
        .await
        .context("Failed to connect to mesh node")?;

    stream.write_all(payload).await?;
    stream.shutdown().await?;

    let mut reply = String::new();
    stream.read_to_string(&mut reply).await?;
    Ok(reply.trim_end().to_string())
}

pub async fn send_request(addr: impl ToSocketAddrs, request: &Request) -> Result<String> {
    let payload = serde_json::to_vec(request)?;
    send_raw(addr, &payload).await
}

/// Like [`send_request`], parsing the reply
pub async fn request_json(addr: impl ToSocketAddrs, request: &Request) -> Result<Value> {
    let text = send_request(addr, request).await?;
    serde_json::from_str(&text).with_context(|| format!("Reply is not JSON: {}", text))
}
