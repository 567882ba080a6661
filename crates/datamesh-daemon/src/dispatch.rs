//! Request dispatch - envelope to store op, worker spawn or controller op

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use datamesh_core::protocol::decode_request;
use datamesh_core::{Mesh, MeshError, Method, Reply, Request};

use crate::controller::Controller;

/// Serves requests for one listening endpoint
pub struct Handler {
    mesh: Mesh,
    controller: Option<Arc<Controller>>,
    max_request_bytes: usize,
}

impl Handler {
    /// Plain data node: `add` is refused
    pub fn server(mesh: Mesh, max_request_bytes: usize) -> Self {
        Self {
            mesh,
            controller: None,
            max_request_bytes,
        }
    }

    /// Controller endpoint: `add` starts sibling servers
    pub fn controller(mesh: Mesh, controller: Arc<Controller>, max_request_bytes: usize) -> Self {
        Self {
            mesh,
            controller: Some(controller),
            max_request_bytes,
        }
    }

    pub fn max_request_bytes(&self) -> usize {
        self.max_request_bytes
    }

    /// Decode raw request bytes and serve them
    pub fn handle_bytes(&self, raw: &[u8]) -> Reply {
        match decode_request(raw) {
            Ok(request) => self.handle(request),
            Err(e) => {
                debug!("Rejecting request: {}", e);
                Reply::from_error(&e)
            }
        }
    }

    pub fn handle(&self, request: Request) -> Reply {
        let seq = request.seq.clone();
        let reply = match request.method() {
            Ok(method) => {
                debug!(method = %method, uri = %request.uri, "request");
                self.dispatch(method, &request)
            }
            Err(e) => {
                debug!("{}", e);
                Reply::from_error(&e)
            }
        };
        reply.with_seq(seq)
    }

    fn dispatch(&self, method: Method, request: &Request) -> Reply {
        let store = self.mesh.store();
        let uri = request.uri.as_str();

        match method {
            Method::Get => Reply::Json(store.read(uri)),
            Method::Set => match self.merge(request) {
                Ok(value) => Reply::Json(value),
                Err(e) => Reply::from_error(&e),
            },
            Method::Run => self.run(request),
            Method::Show => {
                let value = store.read(uri);
                info!(uri = %uri, "show\n{}", pretty(&value));
                Reply::Pretty(value)
            }
            Method::ShowAll => {
                let value = store.snapshot();
                info!("showall\n{}", pretty(&value));
                Reply::Pretty(value)
            }
            Method::Add => match &self.controller {
                Some(controller) => controller.add(request.body.clone()),
                None => {
                    warn!("add refused: not a controller");
                    Reply::app_error()
                }
            },
            Method::Pub => {
                debug!(uri = %uri, "pub is reserved");
                Reply::message_error()
            }
        }
    }

    /// Merge the decoded body at the request URI; no body is a no-op
    fn merge(&self, request: &Request) -> Result<Value, MeshError> {
        let store = self.mesh.store();
        match request.decoded_body() {
            Some(body) => store.merge(&request.uri, body),
            None => Ok(store.read(&request.uri)),
        }
    }

    fn run(&self, request: &Request) -> Reply {
        let merged = match self.merge(request) {
            Ok(value) => value,
            Err(e) => return Reply::from_error(&e),
        };

        let Some(kind) = merged.get("type") else {
            return Reply::Json(merged);
        };
        let Some(kind) = kind.as_str() else {
            warn!(uri = %request.uri, "run: type is not a string");
            return Reply::app_error();
        };

        match self.mesh.start_worker(kind, &request.uri) {
            Ok(()) => Reply::Json(merged),
            Err(MeshError::WorkerRunning(uri)) => {
                warn!(uri = %uri, "run: worker already bound here");
                Reply::Json(merged)
            }
            Err(e) => {
                warn!(uri = %request.uri, "run failed: {}", e);
                Reply::from_error(&e)
            }
        }
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}
