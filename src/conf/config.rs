use crate::conf::name::TunnelName;
use anyhow::{Context, ensure};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

pub const KEY_LENGTH: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key([u8; KEY_LENGTH]);

impl Key {
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_base64(encoded: &str) -> anyhow::Result<Self> {
        let decoded = STANDARD
            .decode(encoded.trim())
            .context("Key is not valid base64")?;
        let bytes: [u8; KEY_LENGTH] = decoded
            .try_into()
            .map_err(|v: Vec<u8>| anyhow::anyhow!("Key must be 32 bytes, got {}", v.len()))?;
        Ok(Self(bytes))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(encoded: &str) -> anyhow::Result<Self> {
        let decoded = hex::decode(encoded).context("Key is not valid hex")?;
        let bytes: [u8; KEY_LENGTH] = decoded
            .try_into()
            .map_err(|v: Vec<u8>| anyhow::anyhow!("Key must be 32 bytes, got {}", v.len()))?;
        Ok(Self(bytes))
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl TryFrom<String> for Key {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_base64(&value)
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.to_base64()
    }
}

// Keys never appear in logs.
impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpCidr {
    pub addr: IpAddr,
    pub cidr: u8,
}

impl IpCidr {
    pub fn new(addr: IpAddr, cidr: u8) -> anyhow::Result<Self> {
        let max = Self::max_bits(&addr);
        ensure!(cidr <= max, "Prefix length {} exceeds {} for {}", cidr, max, addr);
        Ok(Self { addr, cidr })
    }

    fn max_bits(addr: &IpAddr) -> u8 {
        match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }

    pub fn bits(&self) -> u8 {
        Self::max_bits(&self.addr)
    }

    pub fn is_default_route(&self) -> bool {
        self.cidr == 0 && self.addr.is_unspecified()
    }
}

impl FromStr for IpCidr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once('/') {
            Some((addr, cidr)) => {
                let addr: IpAddr = addr
                    .parse()
                    .with_context(|| format!("Invalid IP address: {}", addr))?;
                let cidr: u8 = cidr
                    .parse()
                    .with_context(|| format!("Invalid prefix length: {}", cidr))?;
                Self::new(addr, cidr)
            }
            None => {
                let addr: IpAddr = s
                    .parse()
                    .with_context(|| format!("Invalid IP address: {}", s))?;
                Ok(Self {
                    addr,
                    cidr: Self::max_bits(&addr),
                })
            }
        }
    }
}

impl TryFrom<String> for IpCidr {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IpCidr> for String {
    fn from(value: IpCidr) -> Self {
        value.to_string()
    }
}

impl fmt::Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.cidr)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .with_context(|| format!("Missing port in endpoint: {}", s))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        ensure!(!host.is_empty(), "Missing host in endpoint: {}", s);
        let port: u16 = port
            .parse()
            .with_context(|| format!("Invalid port in endpoint: {}", s))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl TryFrom<String> for Endpoint {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(value: Endpoint) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host.contains(':') {
            true => write!(f, "[{}]:{}", self.host, self.port),
            false => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub private_key: Key,

    #[serde(default)]
    pub addresses: Vec<IpCidr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u16>,

    #[serde(default)]
    pub dns: Vec<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_up: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_up: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_down: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_down: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_handshake_unix: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub public_key: Key,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<Key>,

    #[serde(default)]
    pub allowed_ips: Vec<IpCidr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_keepalive: Option<u16>,

    /// Only populated in runtime configurations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<PeerStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub name: TunnelName,
    pub interface: Interface,

    #[serde(default)]
    pub peers: Vec<Peer>,
}

impl TunnelConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            !self.interface.private_key.is_zero(),
            "Interface private key cannot be all zeros"
        );

        if let Some(mtu) = self.interface.mtu {
            ensure!(
                (576..=65535).contains(&mtu),
                "MTU must be between 576 and 65535, got: {}",
                mtu
            );
        }

        let mut seen_keys = HashSet::new();
        for peer in &self.peers {
            ensure!(
                seen_keys.insert(peer.public_key),
                "Duplicate peer public key: {}",
                peer.public_key.to_base64()
            );
            ensure!(
                !peer.public_key.is_zero(),
                "Peer public key cannot be all zeros"
            );
        }

        Ok(())
    }

    /// A single peer that owns a default route means all traffic is expected
    /// to flow through the tunnel.
    pub fn routes_all_traffic(&self) -> bool {
        match self.peers.as_slice() {
            [peer] => peer.allowed_ips.iter().any(IpCidr::is_default_route),
            _ => false,
        }
    }

    pub fn without_runtime_stats(mut self) -> Self {
        for peer in &mut self.peers {
            peer.stats = None;
        }
        self
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_config(name: &str) -> TunnelConfig {
        TunnelConfig {
            name: TunnelName::new(name).unwrap(),
            interface: Interface {
                private_key: Key::from_bytes([7u8; KEY_LENGTH]),
                addresses: vec!["10.0.0.2/32".parse().unwrap()],
                listen_port: None,
                mtu: Some(1420),
                dns: vec!["10.0.0.1".parse().unwrap()],
                pre_up: None,
                post_up: None,
                pre_down: None,
                post_down: None,
            },
            peers: vec![Peer {
                public_key: Key::from_bytes([9u8; KEY_LENGTH]),
                preshared_key: None,
                allowed_ips: vec!["0.0.0.0/0".parse().unwrap(), "::/0".parse().unwrap()],
                endpoint: Some("vpn.example.com:51820".parse().unwrap()),
                persistent_keepalive: Some(25),
                stats: None,
            }],
        }
    }

    #[test]
    fn test_ip_cidr_parsing() {
        let v4: IpCidr = "192.168.1.0/24".parse().unwrap();
        assert_eq!(v4.cidr, 24);
        assert_eq!(v4.bits(), 32);

        let bare: IpCidr = "fd00::1".parse().unwrap();
        assert_eq!(bare.cidr, 128);

        assert!("10.0.0.0/33".parse::<IpCidr>().is_err());
        assert!("not-an-ip/8".parse::<IpCidr>().is_err());
    }

    #[test]
    fn test_default_route_detection() {
        assert!("0.0.0.0/0".parse::<IpCidr>().unwrap().is_default_route());
        assert!("::/0".parse::<IpCidr>().unwrap().is_default_route());
        assert!(!"10.0.0.0/0".parse::<IpCidr>().unwrap().is_default_route());
        assert!(!"0.0.0.0/1".parse::<IpCidr>().unwrap().is_default_route());
    }

    #[test]
    fn test_endpoint_parsing() {
        let ep: Endpoint = "[2001:db8::1]:51820".parse().unwrap();
        assert_eq!(ep.host, "2001:db8::1");
        assert_eq!(ep.port, 51820);
        assert_eq!(ep.to_string(), "[2001:db8::1]:51820");

        assert!("no-port".parse::<Endpoint>().is_err());
        assert!(":51820".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_key_rejects_wrong_length() {
        assert!(Key::from_base64("AAAA").is_err());
        let key = Key::from_bytes([1u8; KEY_LENGTH]);
        assert_eq!(Key::from_base64(&key.to_base64()).unwrap(), key);
        assert_eq!(Key::from_hex(&key.to_hex()).unwrap(), key);
    }

    #[test]
    fn test_routes_all_traffic_requires_single_peer() {
        let mut config = sample_config("corp-vpn");
        assert!(config.routes_all_traffic());

        let mut second = config.peers[0].clone();
        second.public_key = Key::from_bytes([3u8; KEY_LENGTH]);
        config.peers.push(second);
        assert!(!config.routes_all_traffic());
    }

    #[test]
    fn test_validate_duplicate_peers() {
        let mut config = sample_config("corp-vpn");
        config.peers.push(config.peers[0].clone());
        let result = config.validate();
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Duplicate peer public key")
        );
    }

    #[test]
    fn test_validate_mtu_range() {
        let mut config = sample_config("corp-vpn");
        config.interface.mtu = Some(100);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_shape() {
        let config = sample_config("corp-vpn");
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("name: corp-vpn"));
        assert!(yaml.contains("0.0.0.0/0"));
        assert!(!yaml.contains("stats"));
        let parsed: TunnelConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }
}
