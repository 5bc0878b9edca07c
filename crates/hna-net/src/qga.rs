use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use hna_core::errors::Error;

const READ_LIMIT: usize = 5_000_000;
const DEADLINE: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct Command<'a> {
    execute: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    #[serde(rename = "ip-address-type")]
    pub kind: String,
    #[serde(rename = "ip-address")]
    pub address: String,
    #[serde(default)]
    pub prefix: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(rename = "hardware-address", default)]
    pub mac_address: String,
    #[serde(rename = "ip-addresses", default)]
    pub addresses: Vec<Address>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interfaces {
    #[serde(rename = "return", default)]
    pub interfaces: Vec<Interface>,
}

impl Interfaces {
    /// Addresses of the interface carrying `mac_addr`: the first ipv4
    /// and the first non-link-local ipv6.
    pub fn get_addr(&self, mac_addr: &str) -> (Option<String>, Option<String>) {
        let mac_addr = mac_addr.to_lowercase();
        let mut guest_addr = None;
        let mut guest_addr6 = None;

        for iface in &self.interfaces {
            if iface.mac_address.to_lowercase() != mac_addr {
                continue;
            }

            for addr in &iface.addresses {
                if addr.kind == "ipv4" && guest_addr.is_none() {
                    guest_addr = Some(addr.address.clone());
                } else if addr.kind == "ipv6" && guest_addr6.is_none() {
                    let lower = addr.address.to_lowercase();
                    if !lower.starts_with("fe") {
                        guest_addr6 = Some(lower);
                    }
                }
            }

            break;
        }

        (guest_addr, guest_addr6)
    }
}

/// Query a guest agent over its local stream socket for the guest's
/// network interfaces.
pub fn get_interfaces(sock_path: &Path) -> Result<Interfaces> {
    let mut conn = UnixStream::connect(sock_path).map_err(|e| {
        Error::Connection(format!("qga: Failed to connect to guest agent: {}", e))
    })?;

    conn.set_write_timeout(Some(DEADLINE))
        .map_err(|e| Error::Connection(format!("qga: Failed to set deadline: {}", e)))?;
    conn.set_read_timeout(Some(DEADLINE))
        .map_err(|e| Error::Connection(format!("qga: Failed to set deadline: {}", e)))?;

    let cmd = serde_json::to_vec(&Command {
        execute: "guest-network-get-interfaces",
    })
    .map_err(|e| Error::Parse(format!("qga: Failed to encode guest agent command: {}", e)))?;

    conn.write_all(&cmd)
        .map_err(|e| Error::Write(format!("qga: Failed to write to guest agent: {}", e)))?;

    let mut buffer = vec![0u8; READ_LIMIT];
    let n = conn
        .read(&mut buffer)
        .map_err(|e| Error::Read(format!("qga: Failed to read from guest agent: {}", e)))?;
    buffer.truncate(n);

    let trimmed: Vec<u8> = buffer.into_iter().filter(|b| *b != 0).collect();
    let text = String::from_utf8_lossy(&trimmed);
    let text = text.trim();

    let ifaces: Interfaces = serde_json::from_str(text)
        .map_err(|e| Error::Parse(format!("qga: Failed to parse guest agent response: {}", e)))?;

    Ok(ifaces)
}
