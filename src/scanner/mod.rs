pub mod discovery;
pub mod neighbors;
pub mod port;
pub mod ssdp;
pub mod validate;

use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::Ipv4Network;
use pnet::datalink;

pub use discovery::{Discovery, HostScanner, LanScanner};
pub use validate::{AvrProbe, DeviceProbe, TvProbe, ValidationResult};

/// Widest subnet swept host by host
const MIN_SWEEP_PREFIX: u8 = 24;

/// Port scan result
#[derive(Debug, Clone)]
pub struct PortResult {
    pub ip: IpAddr,
    pub port: u16,
    pub open: bool,
    pub response_time_ms: Option<u64>,
}

/// SSDP/UPnP discovery result
#[derive(Debug, Clone)]
pub struct SsdpResult {
    pub ip: IpAddr,
    pub location: String,
    pub server: Option<String>,
    pub friendly_name: Option<String>,
    pub model_name: Option<String>,
}

/// IPv4 subnets of the up, non-loopback interfaces, narrowed to at most a /24
pub fn local_subnets() -> Vec<Ipv4Network> {
    datalink::interfaces()
        .into_iter()
        .filter(|iface| iface.is_up() && !iface.is_loopback())
        .flat_map(|iface| {
            iface.ips.into_iter().filter_map(|ip| {
                if let IpAddr::V4(ipv4) = ip.ip() {
                    clamp_subnet(ipv4, ip.prefix())
                } else {
                    None
                }
            })
        })
        .collect()
}

fn clamp_subnet(ip: Ipv4Addr, prefix: u8) -> Option<Ipv4Network> {
    let network = Ipv4Network::new(ip, prefix.max(MIN_SWEEP_PREFIX)).ok()?;
    Ipv4Network::new(network.network(), network.prefix()).ok()
}

/// Host addresses of a subnet, without the network and broadcast addresses
pub fn subnet_hosts(network: &Ipv4Network) -> impl Iterator<Item = IpAddr> + '_ {
    network
        .iter()
        .filter(move |ip| *ip != network.network() && *ip != network.broadcast())
        .map(IpAddr::V4)
}
