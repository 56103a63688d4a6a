//! Tunnel Profiles
//!
//! Parses WireGuard INI profiles into a [`TunnelConfig`]:
//!
//! ```text
//! [Interface]
//! PrivateKey = <base64>
//! Address = 172.16.0.2/32, 2606:4700:110:8a36::1/128
//! DNS = 1.1.1.1
//! MTU = 1280
//!
//! [Peer]
//! PublicKey = <base64>
//! AllowedIPs = 0.0.0.0/0, ::/0
//! Endpoint = engage.cloudflareclient.com:2408
//! ```

use crate::keys::{KeyError, PresharedKey, PrivateKey, PublicKey};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

/// Default interface MTU when the profile does not set one
pub const DEFAULT_MTU: u16 = 1280;

/// An address with prefix length (`10.0.0.2/32`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl Cidr {
    /// Parse CIDR notation; a bare address gets a host prefix
    pub fn parse(s: &str) -> Result<Self, ProfileError> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };

        let addr: IpAddr = addr.parse()
            .map_err(|_| ProfileError::InvalidValue("address", s.to_string()))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };

        let prefix = match prefix {
            Some(p) => p.parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| ProfileError::InvalidValue("prefix", s.to_string()))?,
            None => max,
        };

        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// `[Interface]` section
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceConfig {
    pub private_key: PrivateKey,
    pub addresses: Vec<Cidr>,
    pub dns: Vec<IpAddr>,
    pub mtu: u16,
}

/// `[Peer]` section
#[derive(Debug, Clone, PartialEq)]
pub struct PeerConfig {
    pub public_key: PublicKey,
    pub preshared_key: Option<PresharedKey>,
    pub allowed_ips: Vec<Cidr>,
    /// Endpoint as written (`host:port`)
    pub endpoint: Option<String>,
    /// Endpoint after resolution
    pub resolved: Option<SocketAddr>,
    /// Persistent keepalive (seconds)
    pub keepalive: u16,
    /// Disguised keepalive pattern
    pub trick: bool,
}

/// Interface plus its ordered peers
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelConfig {
    pub interface: InterfaceConfig,
    pub peers: Vec<PeerConfig>,
}

impl TunnelConfig {
    /// Read and parse a profile file
    pub fn from_file(path: &Path) -> Result<Self, ProfileError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProfileError::Io(path.display().to_string(), e.to_string()))?;
        Self::parse(&content)
    }

    /// Parse profile text
    pub fn parse(content: &str) -> Result<Self, ProfileError> {
        #[derive(PartialEq)]
        enum Section {
            None,
            Interface,
            Peer,
        }

        let mut section = Section::None;
        let mut private_key = None;
        let mut addresses = Vec::new();
        let mut dns = Vec::new();
        let mut mtu = None;
        let mut peers: Vec<PeerBuilder> = Vec::new();

        for (idx, raw) in content.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                section = match line[1..line.len() - 1].trim().to_ascii_lowercase().as_str() {
                    "interface" => Section::Interface,
                    "peer" => {
                        peers.push(PeerBuilder::default());
                        Section::Peer
                    }
                    other => return Err(ProfileError::UnknownSection(other.to_string())),
                };
                continue;
            }

            let (key, value) = line.split_once('=')
                .ok_or(ProfileError::Syntax(idx + 1))?;
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match section {
                Section::None => return Err(ProfileError::Syntax(idx + 1)),
                Section::Interface => match key.as_str() {
                    "privatekey" => private_key = Some(PrivateKey::from_base64(value)?),
                    "address" => {
                        for item in split_list(value) {
                            addresses.push(Cidr::parse(item)?);
                        }
                    }
                    "dns" => {
                        for item in split_list(value) {
                            dns.push(item.parse()
                                .map_err(|_| ProfileError::InvalidValue("DNS", item.to_string()))?);
                        }
                    }
                    "mtu" => {
                        mtu = Some(value.parse()
                            .map_err(|_| ProfileError::InvalidValue("MTU", value.to_string()))?);
                    }
                    _ => {}
                },
                Section::Peer => {
                    // Section::Peer always has a builder pushed
                    let Some(peer) = peers.last_mut() else {
                        return Err(ProfileError::Syntax(idx + 1));
                    };
                    match key.as_str() {
                        "publickey" => peer.public_key = Some(PublicKey::from_base64(value)?),
                        "presharedkey" => peer.preshared_key = Some(PresharedKey::from_base64(value)?),
                        "allowedips" => {
                            for item in split_list(value) {
                                peer.allowed_ips.push(Cidr::parse(item)?);
                            }
                        }
                        "endpoint" => peer.endpoint = Some(value.to_string()),
                        "persistentkeepalive" => {
                            peer.keepalive = value.parse()
                                .map_err(|_| ProfileError::InvalidValue("PersistentKeepalive", value.to_string()))?;
                        }
                        _ => {}
                    }
                }
            }
        }

        let interface = InterfaceConfig {
            private_key: private_key.ok_or(ProfileError::Missing("PrivateKey"))?,
            addresses,
            dns,
            mtu: mtu.unwrap_or(DEFAULT_MTU),
        };

        let peers = peers.into_iter()
            .map(PeerBuilder::build)
            .collect::<Result<Vec<_>, _>>()?;

        if peers.is_empty() {
            return Err(ProfileError::Missing("[Peer]"));
        }

        Ok(Self { interface, peers })
    }

    /// Point every peer at `endpoint`, resolving it first
    pub async fn with_endpoint(self, endpoint: &str) -> Result<Self, ProfileError> {
        let resolved = tokio::net::lookup_host(endpoint).await
            .map_err(|e| ProfileError::Resolve(endpoint.to_string(), e.to_string()))?
            .next()
            .ok_or_else(|| ProfileError::Resolve(endpoint.to_string(), "no addresses".into()))?;

        let peers = self.peers.into_iter()
            .map(|peer| PeerConfig {
                endpoint: Some(endpoint.to_string()),
                resolved: Some(resolved),
                ..peer
            })
            .collect();

        Ok(Self { peers, ..self })
    }
}

#[derive(Default)]
struct PeerBuilder {
    public_key: Option<PublicKey>,
    preshared_key: Option<PresharedKey>,
    allowed_ips: Vec<Cidr>,
    endpoint: Option<String>,
    keepalive: u16,
}

impl PeerBuilder {
    fn build(self) -> Result<PeerConfig, ProfileError> {
        Ok(PeerConfig {
            public_key: self.public_key.ok_or(ProfileError::Missing("PublicKey"))?,
            preshared_key: self.preshared_key,
            allowed_ips: self.allowed_ips,
            endpoint: self.endpoint,
            resolved: None,
            keepalive: self.keepalive,
            trick: false,
        })
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find(['#', ';']) {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Profile errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProfileError {
    #[error("failed to read profile {0}: {1}")]
    Io(String, String),

    #[error("syntax error on line {0}")]
    Syntax(usize),

    #[error("unknown section [{0}]")]
    UnknownSection(String),

    #[error("missing {0}")]
    Missing(&'static str),

    #[error("invalid {0}: {1}")]
    InvalidValue(&'static str, String),

    #[error("cannot resolve endpoint {0}: {1}")]
    Resolve(String, String),

    #[error("key error: {0}")]
    Key(#[from] KeyError),
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_profile() -> String {
        let key = PrivateKey::generate();
        format!(
            "[Interface]\n\
             PrivateKey = {}\n\
             Address = 172.16.0.2/32, 2606:4700:110:8a36::1/128\n\
             DNS = 1.1.1.1\n\
             MTU = 1420\n\
             \n\
             # upstream\n\
             [Peer]\n\
             PublicKey = bmXOC+F1FxEMF9dyiK2H5/1SUtzH0JuVo51h2wPfgyo=\n\
             AllowedIPs = 0.0.0.0/0, ::/0\n\
             Endpoint = engage.cloudflareclient.com:2408 ; default\n",
            key.to_base64()
        )
    }

    #[test]
    fn test_parse_profile() {
        let config = TunnelConfig::parse(&sample_profile()).unwrap();

        assert_eq!(config.interface.mtu, 1420);
        assert_eq!(config.interface.addresses.len(), 2);
        assert_eq!(config.interface.addresses[1].prefix, 128);
        assert_eq!(config.interface.dns, vec!["1.1.1.1".parse::<IpAddr>().unwrap()]);

        let peer = &config.peers[0];
        assert_eq!(peer.endpoint.as_deref(), Some("engage.cloudflareclient.com:2408"));
        assert_eq!(peer.allowed_ips.len(), 2);
        assert_eq!(peer.keepalive, 0);
        assert!(!peer.trick);
        assert!(peer.resolved.is_none());
    }

    #[test]
    fn test_multiple_peers() {
        let text = format!(
            "{}\n[Peer]\nPublicKey = bmXOC+F1FxEMF9dyiK2H5/1SUtzH0JuVo51h2wPfgyo=\nPersistentKeepalive = 25\n",
            sample_profile()
        );
        let config = TunnelConfig::parse(&text).unwrap();

        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[1].keepalive, 25);
    }

    #[test]
    fn test_missing_sections() {
        let key = PrivateKey::generate();
        let no_peer = format!("[Interface]\nPrivateKey = {}\n", key.to_base64());

        assert!(matches!(TunnelConfig::parse(&no_peer), Err(ProfileError::Missing("[Peer]"))));
        assert!(matches!(
            TunnelConfig::parse("[Peer]\nPublicKey = bmXOC+F1FxEMF9dyiK2H5/1SUtzH0JuVo51h2wPfgyo=\n"),
            Err(ProfileError::Missing("PrivateKey"))
        ));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(TunnelConfig::parse("PrivateKey = x"), Err(ProfileError::Syntax(1))));
        assert!(matches!(TunnelConfig::parse("[Wat]"), Err(ProfileError::UnknownSection(_))));
        assert!(matches!(TunnelConfig::parse("[Interface]\nnonsense"), Err(ProfileError::Syntax(2))));
    }

    #[test]
    fn test_cidr() {
        assert_eq!(Cidr::parse("10.0.0.1").unwrap().prefix, 32);
        assert_eq!(Cidr::parse("::/0").unwrap().to_string(), "::/0");
        assert!(Cidr::parse("10.0.0.1/33").is_err());
    }

    #[tokio::test]
    async fn test_with_endpoint_overrides_every_peer() {
        let config = TunnelConfig::parse(&sample_profile()).unwrap()
            .with_endpoint("127.0.0.1:40000").await
            .unwrap();

        for peer in &config.peers {
            assert_eq!(peer.endpoint.as_deref(), Some("127.0.0.1:40000"));
            assert_eq!(peer.resolved, Some("127.0.0.1:40000".parse().unwrap()));
        }
    }

    #[tokio::test]
    async fn test_with_endpoint_unresolvable() {
        let config = TunnelConfig::parse(&sample_profile()).unwrap();
        let result = config.with_endpoint("not an endpoint").await;

        assert!(matches!(result, Err(ProfileError::Resolve(_, _))));
    }
}
