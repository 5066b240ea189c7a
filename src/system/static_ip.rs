//! Pinning an interface's current address as its permanent static IP.
//!
//! Supported on Linux hosts managed by dhcpcd (Raspberry Pi OS and friends).
//! Nothing here is cached: the config file and the live interface state are
//! read again on every call.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};

use super::dhcpcd;
use super::network::{self, InterfaceRecord, IpCommand, Ipv4Cidr, NetworkQuery};
use crate::error::{NetkeeperError, Result};

/// Reads and appends static address blocks for dhcpcd.
///
/// Calls are not serialized. Two concurrent `set_static_ip` runs on the same
/// file race on read-modify-write; callers must serialize them.
#[derive(Debug, Clone)]
pub struct StaticIpConfigurator<Q = IpCommand> {
    conf_path: PathBuf,
    query: Q,
}

impl<Q: NetworkQuery> StaticIpConfigurator<Q> {
    pub fn with_query(conf_path: impl Into<PathBuf>, query: Q) -> Self {
        Self {
            conf_path: conf_path.into(),
            query,
        }
    }

    pub fn conf_path(&self) -> &Path {
        &self.conf_path
    }

    /// Whether `interface` already has a `static ip_address=` in its block.
    pub async fn has_static_ip(&self, interface: &str) -> Result<bool> {
        ensure_supported()?;

        let content = self.read_conf().await?;
        Ok(dhcpcd::has_static_ip_in(&content, interface))
    }

    /// Current IPv4 address of `interface` with its prefix length.
    ///
    /// `None` covers "no address", "query failed" and "unparseable output";
    /// an interface without an address is a normal state, not an error.
    pub async fn full_ip(&self, interface: &str) -> Option<Ipv4Cidr> {
        let output = match self.query.show_addresses(Some(interface)).await {
            Ok(output) => output,
            Err(e) => {
                debug!("address lookup for {} failed: {}", interface, e);
                return None;
            }
        };

        let address = network::parse_first_address(&output);
        if address.is_none() {
            debug!("no IPv4 address found for {}", interface);
        }
        address
    }

    /// Gateway of the default route bound to `interface`, if there is one.
    pub async fn gateway_ip(&self, interface: &str) -> Option<IpAddr> {
        let output = match self.query.show_routes(interface).await {
            Ok(output) => output,
            Err(e) => {
                debug!("route lookup for {} failed: {}", interface, e);
                return None;
            }
        };

        network::parse_default_gateway(&output)
    }

    /// Address and gateway of `interface`, or `None` if it has no address.
    pub async fn interface_record(&self, interface: &str) -> Option<InterfaceRecord> {
        let address = self.full_ip(interface).await?;
        let gateway = self.gateway_ip(interface).await;

        Some(InterfaceRecord {
            name: interface.to_string(),
            address,
            gateway,
        })
    }

    /// Name of the interface currently holding `ip`.
    pub async fn interface_by_ip(&self, ip: Ipv4Addr) -> Option<String> {
        let output = match self.query.show_addresses(None).await {
            Ok(output) => output,
            Err(e) => {
                debug!("address listing failed: {}", e);
                return None;
            }
        };

        network::parse_addresses(&output)
            .into_iter()
            .find(|(_, cidr)| cidr.addr() == ip)
            .map(|(name, _)| name)
    }

    /// Append a static block pinning `interface` to its current address.
    ///
    /// Existing content is kept byte for byte; the new block goes at the end.
    /// No check is made for an existing block, so a second call appends a
    /// second block (dhcpcd honours the last one).
    pub async fn set_static_ip(&self, interface: &str) -> Result<()> {
        ensure_supported()?;

        let address = self
            .full_ip(interface)
            .await
            .ok_or_else(|| NetkeeperError::AddressUnavailable {
                interface: interface.to_string(),
            })?;

        let mut body = fs::read(&self.conf_path)
            .await
            .map_err(|e| NetkeeperError::io(&self.conf_path, e))?;

        let gateway = self.gateway_ip(interface).await;
        body.extend_from_slice(dhcpcd::render_static_block(interface, address, gateway).as_bytes());

        dhcpcd::write_atomic(&self.conf_path, &body).await?;

        info!(
            "pinned {} to {} (gateway: {})",
            interface,
            address,
            gateway.map_or_else(|| "none".to_string(), |g| g.to_string())
        );
        Ok(())
    }

    /// Stray non-UTF-8 bytes (Latin-1 comments) are replaced, not rejected.
    async fn read_conf(&self) -> Result<String> {
        let bytes = fs::read(&self.conf_path)
            .await
            .map_err(|e| NetkeeperError::io(&self.conf_path, e))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn ensure_supported() -> Result<()> {
    if cfg!(target_os = "linux") {
        Ok(())
    } else {
        Err(NetkeeperError::UnsupportedPlatform {
            os: std::env::consts::OS,
        })
    }
}


#[cfg(all(test, not(target_os = "linux")))]
mod unsupported_tests {
    use super::*;

    #[tokio::test]
    async fn test_operations_report_unsupported_platform() {
        let cfg = StaticIpConfigurator::with_query("/nonexistent/dhcpcd.conf", IpCommand);

        assert!(matches!(
            cfg.has_static_ip("eth0").await,
            Err(NetkeeperError::UnsupportedPlatform { .. })
        ));
        assert!(matches!(
            cfg.set_static_ip("eth0").await,
            Err(NetkeeperError::UnsupportedPlatform { .. })
        ));
    }
}
