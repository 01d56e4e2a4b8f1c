use std::net::{IpAddr, Ipv4Addr};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, IngestResult};
use crate::session::DEFAULT_RECV_BUFFER;

pub const DEFAULT_PORT: u16 = 26090;

/// Address the acquisition system is normally configured to send to.
pub const DEFAULT_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 3, 100));

/// Consecutive failed batches tolerated before a run is ended and the socket rebuilt.
pub const DEFAULT_MAX_FAILED_BATCHES: u32 = 20;

/// Where to listen and how hard to try.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Local addresses the operator can choose from.
    #[serde(default)]
    pub candidates: Vec<IpAddr>,
    #[serde(default)]
    pub selected: Option<IpAddr>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Refresh `candidates` from the host's interfaces on every resolve.
    #[serde(default = "default_true")]
    pub enumerate_interfaces: bool,
    #[serde(default = "default_recv_buffer")]
    pub recv_buffer: usize,
    #[serde(default = "default_max_failed_batches")]
    pub max_failed_batches: u32,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

fn default_recv_buffer() -> usize {
    DEFAULT_RECV_BUFFER
}

fn default_max_failed_batches() -> u32 {
    DEFAULT_MAX_FAILED_BATCHES
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            candidates: Vec::new(),
            selected: None,
            port: DEFAULT_PORT,
            enumerate_interfaces: true,
            recv_buffer: DEFAULT_RECV_BUFFER,
            max_failed_batches: DEFAULT_MAX_FAILED_BATCHES,
        }
    }
}

/// Parse operator-entered port text. Zero and anything that is not a u16 are rejected.
pub fn parse_port(text: &str) -> IngestResult<u16> {
    match text.trim().parse::<u16>() {
        Ok(0) => Err(IngestError::InvalidConfiguration("port must be non-zero".into())),
        Ok(port) => Ok(port),
        Err(_) => Err(IngestError::InvalidConfiguration(format!(
            "invalid port {:?}",
            text.trim()
        ))),
    }
}

/// IPv4 addresses of the host's interfaces, loopback included.
pub fn interface_addresses() -> Vec<IpAddr> {
    if_addrs::get_if_addrs()
        .unwrap_or_default()
        .into_iter()
        .map(|iface| iface.ip())
        .filter(IpAddr::is_ipv4)
        .collect()
}

impl AcquisitionConfig {
    /// Listen on one fixed address; interfaces are not enumerated.
    pub fn fixed(ip: IpAddr, port: u16) -> Self {
        Self {
            candidates: vec![ip],
            selected: Some(ip),
            port,
            enumerate_interfaces: false,
            ..Self::default()
        }
    }

    /// Apply port text, keeping the current port when it is rejected.
    pub fn set_port_text(&mut self, text: &str) -> IngestResult<u16> {
        let port = parse_port(text)?;
        if port != self.port {
            info!("Port changed from {} to {}", self.port, port);
        }
        self.port = port;
        Ok(port)
    }

    pub fn select(&mut self, ip: IpAddr) -> IngestResult<()> {
        if !self.candidates.contains(&ip) {
            return Err(IngestError::InvalidConfiguration(format!(
                "{ip} is not a local address"
            )));
        }
        self.selected = Some(ip);
        Ok(())
    }

    /// Replace the candidate list and pick an address from it.
    ///
    /// When the list is unchanged the current selection stands. Otherwise the previous
    /// selection is kept if still present, then the default address, then the first
    /// entry. An empty list clears the selection.
    pub fn update_candidates(&mut self, current: Vec<IpAddr>) -> Option<IpAddr> {
        if current == self.candidates {
            return self.selected;
        }
        debug!("Local addresses changed: {:?}", current);
        self.candidates = current;

        self.selected = self
            .selected
            .filter(|ip| self.candidates.contains(ip))
            .or_else(|| self.candidates.iter().copied().find(|ip| *ip == DEFAULT_ADDRESS))
            .or_else(|| self.candidates.first().copied());
        self.selected
    }

    /// Address to bind right now, refreshing the candidates first if enumerating.
    pub fn resolve_address(&mut self) -> Option<IpAddr> {
        if self.enumerate_interfaces {
            self.update_candidates(interface_addresses())
        } else {
            self.selected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn port_text_parsing() {
        assert_eq!(parse_port("26090").unwrap(), 26090);
        assert_eq!(parse_port(" 8000 ").unwrap(), 8000);
        assert_eq!(parse_port("65535").unwrap(), 65535);
        for bad in ["0", "", "abc", "-1", "65536", "12ab", "1.5"] {
            assert!(
                matches!(parse_port(bad), Err(IngestError::InvalidConfiguration(_))),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn rejected_port_keeps_previous_value() {
        let mut config = AcquisitionConfig::default();
        assert!(config.set_port_text("nope").is_err());
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.set_port_text("4000").unwrap(), 4000);
        assert!(config.set_port_text("0").is_err());
        assert_eq!(config.port, 4000);
    }

    #[test]
    fn prefers_default_address_then_first() {
        let mut config = AcquisitionConfig::default();
        let picked = config.update_candidates(vec![v4(10, 0, 0, 2), DEFAULT_ADDRESS]);
        assert_eq!(picked, Some(DEFAULT_ADDRESS));

        let mut config = AcquisitionConfig::default();
        let picked = config.update_candidates(vec![v4(10, 0, 0, 2), v4(127, 0, 0, 1)]);
        assert_eq!(picked, Some(v4(10, 0, 0, 2)));
    }

    #[test]
    fn keeps_selection_across_list_changes() {
        let mut config = AcquisitionConfig::default();
        config.update_candidates(vec![DEFAULT_ADDRESS, v4(10, 0, 0, 2)]);
        config.select(v4(10, 0, 0, 2)).unwrap();

        let picked = config.update_candidates(vec![v4(10, 0, 0, 2), DEFAULT_ADDRESS, v4(10, 0, 0, 3)]);
        assert_eq!(picked, Some(v4(10, 0, 0, 2)));

        // selection vanished: fall back to the default
        let picked = config.update_candidates(vec![v4(10, 0, 0, 3), DEFAULT_ADDRESS]);
        assert_eq!(picked, Some(DEFAULT_ADDRESS));

        assert_eq!(config.update_candidates(Vec::new()), None);
    }

    #[test]
    fn selecting_unknown_address_fails() {
        let mut config = AcquisitionConfig::fixed(v4(127, 0, 0, 1), DEFAULT_PORT);
        assert!(config.select(v4(10, 9, 9, 9)).is_err());
        assert_eq!(config.resolve_address(), Some(v4(127, 0, 0, 1)));
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: AcquisitionConfig = serde_json::from_str(r#"{"port": 4100}"#).unwrap();
        assert_eq!(config.port, 4100);
        assert!(config.enumerate_interfaces);
        assert_eq!(config.max_failed_batches, DEFAULT_MAX_FAILED_BATCHES);
        assert!(config.candidates.is_empty());
    }
}
