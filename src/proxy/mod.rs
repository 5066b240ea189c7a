//! Lifecycle of the filtering proxy.
//!
//! [`ProxyController`] turns a `host:port` string into a validated listen
//! address, owns one proxy instance built by a [`ProxyEngine`], and keeps a
//! copy of the configuration that was actually applied.

pub mod admin;
pub mod engine;
pub mod tunnel;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{NetkeeperError, Result};
use admin::AdminState;

pub use admin::{AdminHandler, AdminResponse, HttpRegistrar, Method};
pub use engine::{ProxyEngine, ProxyInstance};
pub use tunnel::{TunnelEngine, TunnelProxy};

/// Notification fired after the configuration was changed over the admin API.
pub type ConfigModified = Arc<dyn Fn() + Send + Sync>;

const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:8081";

/// Proxy settings as supplied by the caller and persisted to disk.
///
/// The two hooks are runtime-only and never serialized.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    #[serde(skip)]
    pub config_modified: Option<ConfigModified>,

    #[serde(skip)]
    pub http_register: Option<Arc<dyn HttpRegistrar>>,
}

fn default_listen_address() -> String {
    DEFAULT_LISTEN_ADDRESS.to_string()
}

impl ProxyConfig {
    pub fn new(listen_address: impl Into<String>) -> Self {
        Self {
            listen_address: listen_address.into(),
            config_modified: None,
            http_register: None,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::new(DEFAULT_LISTEN_ADDRESS)
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("listen_address", &self.listen_address)
            .field("config_modified", &self.config_modified.is_some())
            .field("http_register", &self.http_register.is_some())
            .finish()
    }
}

/// Validate a `host:port` listen address. The host must be an IP literal;
/// IPv6 hosts go in brackets (`[::1]:8080`). Port 0 is refused so the
/// applied address is always the one that was asked for.
pub fn parse_listen_address(address: &str) -> Result<SocketAddr> {
    let invalid = |reason: String| NetkeeperError::InvalidListenAddress {
        address: address.to_string(),
        reason,
    };

    let (host, port) =
        split_host_port(address).ok_or_else(|| invalid("expected host:port".to_string()))?;

    let ip: IpAddr = host
        .parse()
        .map_err(|_| invalid(format!("invalid IP: {}", host)))?;

    let port = port
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| invalid(format!("invalid port number: {}", port)))?;

    Ok(SocketAddr::new(ip, port))
}

fn split_host_port(address: &str) -> Option<(&str, &str)> {
    if let Some(rest) = address.strip_prefix('[') {
        let (host, port) = rest.split_once("]:")?;
        return Some((host, port));
    }

    let (host, port) = address.rsplit_once(':')?;
    // Unbracketed IPv6 is ambiguous
    if host.contains(':') {
        return None;
    }
    Some((host, port))
}

/// Owns one proxy instance and its applied configuration.
pub struct ProxyController<E: ProxyEngine = TunnelEngine> {
    conf: ProxyConfig,
    listen_addr: SocketAddr,
    instance: E::Instance,
    admin: Arc<AdminState>,
}

impl ProxyController {
    /// Build a controller backed by the built-in tunnelling engine.
    pub fn new(conf: ProxyConfig) -> Result<Self> {
        Self::with_engine(conf, &TunnelEngine::default())
    }
}

impl<E: ProxyEngine> ProxyController<E> {
    /// Validate `conf`, build the instance and publish admin routes.
    ///
    /// Any failure is logged and returned; no controller exists afterwards.
    pub fn with_engine(conf: ProxyConfig, engine: &E) -> Result<Self> {
        let listen_addr = parse_listen_address(&conf.listen_address).map_err(|e| {
            error!("{}", e);
            e
        })?;

        let instance = engine.configure(listen_addr).map_err(|source| {
            let e = NetkeeperError::Proxy {
                addr: listen_addr,
                source,
            };
            error!("{}", e);
            e
        })?;

        let admin = Arc::new(AdminState::new(&conf));
        if let Some(ref registrar) = conf.http_register {
            admin::register_routes(registrar.as_ref(), &admin);
        }

        Ok(Self {
            conf,
            listen_addr,
            instance,
            admin,
        })
    }

    /// Start listening. Bind errors come back unchanged inside
    /// [`NetkeeperError::Proxy`].
    pub async fn start(&mut self) -> Result<()> {
        self.instance
            .start()
            .await
            .map_err(|source| NetkeeperError::Proxy {
                addr: self.listen_addr,
                source,
            })?;

        self.admin.set_running(true);
        info!("proxy started on {}", self.listen_addr);
        Ok(())
    }

    /// Stop the proxy and release its port. Safe to call more than once.
    pub async fn close(&mut self) {
        self.instance.close().await;
        self.admin.set_running(false);
    }

    /// Copy of the applied configuration, hooks included.
    pub fn snapshot_config(&self) -> ProxyConfig {
        self.conf.clone()
    }

    /// Configuration requested through the admin API but not yet applied.
    ///
    /// Applying it means building a new controller from it.
    pub fn requested_config(&self) -> Option<ProxyConfig> {
        self.admin.requested().map(|listen_address| ProxyConfig {
            listen_address,
            ..self.conf.clone()
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.instance.local_addr()
    }

    pub fn is_running(&self) -> bool {
        self.admin.is_running()
    }
}
