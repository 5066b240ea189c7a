//! Live interface address and route discovery via the `ip` tool.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use tokio::process::Command;
use tracing::debug;

use crate::error::{NetkeeperError, Result};

/// An IPv4 address with its prefix length, e.g. `192.168.1.5/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    addr: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Option<Self> {
        (prefix_len <= 32).then_some(Self { addr, prefix_len })
    }

    /// The bare host address without the prefix.
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = NetkeeperError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || NetkeeperError::InvalidCidr(s.to_string());

        let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        // Reject signs and leading garbage that u8::from_str would accept
        if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let prefix_len: u8 = prefix.parse().map_err(|_| invalid())?;

        Self::new(addr, prefix_len).ok_or_else(invalid)
    }
}

/// Snapshot of one interface's live addressing. Built fresh per query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRecord {
    pub name: String,
    pub address: Ipv4Cidr,
    pub gateway: Option<IpAddr>,
}

/// Source of raw address and route listings.
///
/// The production implementation shells out to `ip`; tests swap in canned
/// output so the parsing and decision logic runs without touching the host.
#[allow(async_fn_in_trait)]
pub trait NetworkQuery: Send + Sync {
    /// One-line-per-address IPv4 listing, for one interface or all of them.
    async fn show_addresses(&self, interface: Option<&str>) -> Result<String>;

    /// Routing table entries bound to `interface`.
    async fn show_routes(&self, interface: &str) -> Result<String>;
}

/// `NetworkQuery` backed by iproute2.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpCommand;

impl NetworkQuery for IpCommand {
    async fn show_addresses(&self, interface: Option<&str>) -> Result<String> {
        let mut args = vec!["-oneline", "-family", "inet", "address", "show"];
        if let Some(name) = interface {
            args.push(name);
        }
        run_ip(&args).await
    }

    async fn show_routes(&self, interface: &str) -> Result<String> {
        run_ip(&["route", "show", "dev", interface]).await
    }
}

async fn run_ip(args: &[&str]) -> Result<String> {
    let command = format!("ip {}", args.join(" "));
    debug!("executing {}", command);

    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(|e| NetkeeperError::CommandFailed {
            command: command.clone(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(NetkeeperError::CommandFailed {
            command,
            message: stderr.trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `ip -oneline -family inet address show` output into
/// `(interface, address)` pairs, skipping lines that don't parse.
///
/// Line format:
/// `2: eth0    inet 192.168.1.5/24 brd 192.168.1.255 scope global eth0\ ...`
pub fn parse_addresses(output: &str) -> Vec<(String, Ipv4Cidr)> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            let cidr = fields[3].parse::<Ipv4Cidr>().ok()?;
            Some((fields[1].trim_end_matches(':').to_string(), cidr))
        })
        .collect()
}

/// First parseable address in an address listing.
pub fn parse_first_address(output: &str) -> Option<Ipv4Cidr> {
    parse_addresses(output).into_iter().next().map(|(_, cidr)| cidr)
}

/// Extract the gateway from the `default` entry of `ip route show dev X`.
///
/// Format: `default via 192.168.1.1 proto dhcp src 192.168.1.5 metric 202`
pub fn parse_default_gateway(output: &str) -> Option<IpAddr> {
    output
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .find(|fields| fields.first() == Some(&"default"))
        .and_then(|fields| fields.get(2)?.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESSES: &str = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
2: eth0    inet 192.168.1.5/24 brd 192.168.1.255 scope global dynamic eth0\\       valid_lft 85717sec preferred_lft 85717sec
3: wlan0    inet 10.0.0.7/16 brd 10.0.255.255 scope global wlan0\\       valid_lft forever preferred_lft forever
";

    #[test]
    fn test_cidr_parse_and_display() {
        let cidr: Ipv4Cidr = "192.168.1.5/24".parse().unwrap();
        assert_eq!(cidr.addr(), Ipv4Addr::new(192, 168, 1, 5));
        assert_eq!(cidr.prefix_len(), 24);
        assert_eq!(cidr.to_string(), "192.168.1.5/24");

        assert!("192.168.1.5".parse::<Ipv4Cidr>().is_err());
        assert!("192.168.1.5/33".parse::<Ipv4Cidr>().is_err());
        assert!("192.168.1.5/+8".parse::<Ipv4Cidr>().is_err());
        assert!("fe80::1/64".parse::<Ipv4Cidr>().is_err());
        assert!("brd/24".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn test_parse_addresses() {
        let addrs = parse_addresses(ADDRESSES);
        assert_eq!(addrs.len(), 3);
        assert_eq!(addrs[1].0, "eth0");
        assert_eq!(addrs[1].1.to_string(), "192.168.1.5/24");
        assert_eq!(addrs[2].0, "wlan0");
    }

    #[test]
    fn test_parse_first_address() {
        let single = "2: eth0    inet 10.0.0.5/24 brd 10.0.0.255 scope global eth0";
        assert_eq!(
            parse_first_address(single).map(|c| c.to_string()),
            Some("10.0.0.5/24".to_string())
        );
        assert_eq!(parse_first_address(""), None);
        assert_eq!(parse_first_address("2: eth0 inet"), None);
        assert_eq!(parse_first_address("2: eth0 inet garbage brd"), None);
    }

    #[test]
    fn test_parse_default_gateway() {
        let routes = "\
default via 192.168.1.1 proto dhcp src 192.168.1.5 metric 202
192.168.1.0/24 proto dhcp scope link src 192.168.1.5 metric 202
";
        assert_eq!(
            parse_default_gateway(routes),
            Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)))
        );
    }

    #[test]
    fn test_parse_default_gateway_ignores_other_routes() {
        let routes = "192.168.1.0/24 proto kernel scope link src 192.168.1.5\n";
        assert_eq!(parse_default_gateway(routes), None);

        // "default" must be the first field, not just present somewhere
        let routes = "10.0.0.0/8 via 10.0.0.1 default\n";
        assert_eq!(parse_default_gateway(routes), None);

        assert_eq!(parse_default_gateway("default dev ppp0 scope link\n"), None);
        assert_eq!(parse_default_gateway("default via\n"), None);
    }
}
