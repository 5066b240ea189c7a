//! System interaction modules for dhcpcd configuration and live interface state.

pub mod dhcpcd;
pub mod network;
pub mod static_ip;

pub use network::{InterfaceRecord, IpCommand, Ipv4Cidr, NetworkQuery};
pub use static_ip::StaticIpConfigurator;
