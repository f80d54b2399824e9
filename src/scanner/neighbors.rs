//! Kernel neighbour table. Hosts the machine has talked to recently are the
//! cheapest discovery candidates and need no raw-socket privileges.

use std::net::IpAddr;

const ARP_TABLE_PATH: &str = "/proc/net/arp";
// ATF_COM: entry is complete
const FLAG_COMPLETE: u32 = 0x2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub ip: IpAddr,
    pub mac: Option<String>,
}

/// Parse the `/proc/net/arp` text format, skipping incomplete entries
pub fn parse_arp_table(text: &str) -> Vec<Neighbor> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            let ip = fields[0].parse::<IpAddr>().ok()?;
            let flags = u32::from_str_radix(fields[2].trim_start_matches("0x"), 16).ok()?;
            if flags & FLAG_COMPLETE == 0 {
                return None;
            }
            let mac = Some(fields[3].to_ascii_lowercase()).filter(|m| m != "00:00:00:00:00:00");
            Some(Neighbor { ip, mac })
        })
        .collect()
}

pub async fn read_neighbor_table() -> Vec<Neighbor> {
    match tokio::fs::read_to_string(ARP_TABLE_PATH).await {
        Ok(text) => parse_arp_table(&text),
        Err(e) => {
            tracing::debug!("Neighbour table unavailable: {}", e);
            Vec::new()
        }
    }
}
