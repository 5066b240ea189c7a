//! Administrative HTTP endpoints published through an injected registrar.
//!
//! The controller doesn't know which HTTP server hosts these routes. It hands
//! plain handler closures to whatever [`HttpRegistrar`] it was given.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{parse_listen_address, ConfigModified, ProxyConfig};

pub const STATUS_PATH: &str = "/control/proxy/status";
pub const CONFIG_PATH: &str = "/control/proxy/config";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Post => f.write_str("POST"),
        }
    }
}

/// Response produced by an admin handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl AdminResponse {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                content_type: "application/json",
                body,
            },
            Err(e) => Self::text(500, &format!("failed to encode response: {}", e)),
        }
    }

    fn text(status: u16, message: &str) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: message.as_bytes().to_vec(),
        }
    }
}

/// Handler invoked with the raw request body.
pub type AdminHandler = Arc<dyn Fn(&[u8]) -> AdminResponse + Send + Sync>;

/// Hook into the appliance's admin HTTP server.
pub trait HttpRegistrar: Send + Sync {
    fn register(&self, method: Method, path: &str, handler: AdminHandler);
}

/// Body of `GET /control/proxy/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub listen_address: String,
    pub running: bool,
}

/// Body of `POST /control/proxy/config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRequest {
    pub listen_address: String,
}

/// State shared between the controller and its admin handlers.
pub(crate) struct AdminState {
    listen_address: String,
    running: AtomicBool,
    requested: Mutex<Option<String>>,
    config_modified: Option<ConfigModified>,
}

impl AdminState {
    pub(crate) fn new(conf: &ProxyConfig) -> Self {
        Self {
            listen_address: conf.listen_address.clone(),
            running: AtomicBool::new(false),
            requested: Mutex::new(None),
            config_modified: conf.config_modified.clone(),
        }
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn requested(&self) -> Option<String> {
        self.requested
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn status(&self) -> StatusReport {
        StatusReport {
            listen_address: self.listen_address.clone(),
            running: self.is_running(),
        }
    }

    fn handle_config(&self, body: &[u8]) -> AdminResponse {
        let request: ConfigRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => return AdminResponse::text(400, &format!("invalid JSON: {}", e)),
        };

        if let Err(e) = parse_listen_address(&request.listen_address) {
            return AdminResponse::text(400, &e.to_string());
        }

        info!("proxy listen address change requested: {}", request.listen_address);
        *self.requested.lock().unwrap_or_else(|e| e.into_inner()) = Some(request.listen_address);

        if let Some(ref notify) = self.config_modified {
            notify();
        }
        AdminResponse::text(200, "OK")
    }
}

/// Publish the proxy's admin routes. Called once per controller.
pub(crate) fn register_routes(registrar: &dyn HttpRegistrar, state: &Arc<AdminState>) {
    let status_state = Arc::clone(state);
    registrar.register(
        Method::Get,
        STATUS_PATH,
        Arc::new(move |_body| AdminResponse::json(200, &status_state.status())),
    );

    let config_state = Arc::clone(state);
    registrar.register(
        Method::Post,
        CONFIG_PATH,
        Arc::new(move |body| config_state.handle_config(body)),
    );

    debug!("registered proxy admin routes");
}
