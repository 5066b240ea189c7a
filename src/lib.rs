//! netkeeper - control plane for a home-network appliance.
//!
//! Two independent pieces:
//! - [`system::StaticIpConfigurator`] pins a LAN interface to its current
//!   address by appending a static block to `dhcpcd.conf`.
//! - [`proxy::ProxyController`] validates a listen address and owns the
//!   filtering proxy's lifecycle and applied configuration.

pub mod config;
pub mod error;
pub mod proxy;
pub mod system;

pub use error::{NetkeeperError, Result};
