//! Session Builder
//!
//! Loads a slot's profile, aims it at the hop's endpoint and applies the
//! hop's tuning policy.

use crate::profile::{InterfaceConfig, PeerConfig, ProfileError, TunnelConfig};
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use tracing::debug;

/// MTU of a hop that carries the exit traffic directly
pub const OUTER_MTU: u16 = 1330;

/// MTU of a hop wrapped inside another hop (IPv6 minimum)
pub const INNER_MTU: u16 = 1280;

/// Per-hop tuning policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tuning {
    /// Frequent disguised keepalives, room for one layer of encapsulation
    Outer,
    /// Plain keepalives, sized to ride inside an outer hop
    Inner,
}

impl Tuning {
    pub fn mtu(self) -> u16 {
        match self {
            Tuning::Outer => OUTER_MTU,
            Tuning::Inner => INNER_MTU,
        }
    }

    pub fn keepalive(self) -> u16 {
        match self {
            Tuning::Outer => 3,
            Tuning::Inner => 10,
        }
    }

    pub fn trick(self) -> bool {
        matches!(self, Tuning::Outer)
    }

    /// Return a tuned copy of `config`
    pub fn apply(self, config: TunnelConfig) -> TunnelConfig {
        let peers = config.peers.into_iter()
            .map(|peer| PeerConfig {
                trick: self.trick(),
                keepalive: self.keepalive(),
                ..peer
            })
            .collect();

        TunnelConfig {
            interface: InterfaceConfig {
                mtu: self.mtu(),
                ..config.interface
            },
            peers,
        }
    }
}

impl fmt::Display for Tuning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tuning::Outer => write!(f, "outer"),
            Tuning::Inner => write!(f, "inner"),
        }
    }
}

/// Source of untuned, endpoint-aimed tunnel configurations
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn load(&self, profile: &Path, endpoint: &str) -> Result<TunnelConfig, ProfileError>;
}

/// Reads WireGuard profiles from disk
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileFiles;

#[async_trait]
impl SessionSource for ProfileFiles {
    async fn load(&self, profile: &Path, endpoint: &str) -> Result<TunnelConfig, ProfileError> {
        TunnelConfig::from_file(profile)?
            .with_endpoint(endpoint).await
    }
}

/// Build the tunnel configuration for one hop
pub async fn build_session(
    source: &dyn SessionSource,
    profile: &Path,
    endpoint: &str,
    tuning: Tuning,
) -> Result<TunnelConfig, ProfileError> {
    let config = source.load(profile, endpoint).await?;

    debug!(
        profile = %profile.display(),
        endpoint,
        %tuning,
        peers = config.peers.len(),
        "session built"
    );

    Ok(tuning.apply(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::tests::sample_profile;

    fn sample() -> TunnelConfig {
        let text = format!(
            "{}\n[Peer]\nPublicKey = bmXOC+F1FxEMF9dyiK2H5/1SUtzH0JuVo51h2wPfgyo=\nPersistentKeepalive = 25\n",
            sample_profile()
        );
        TunnelConfig::parse(&text).unwrap()
    }

    #[test]
    fn test_outer_tuning() {
        let tuned = Tuning::Outer.apply(sample());

        assert_eq!(tuned.interface.mtu, 1330);
        assert_eq!(tuned.peers.len(), 2);
        for peer in &tuned.peers {
            assert!(peer.trick);
            assert_eq!(peer.keepalive, 3);
        }
    }

    #[test]
    fn test_inner_tuning() {
        let tuned = Tuning::Inner.apply(Tuning::Outer.apply(sample()));

        assert_eq!(tuned.interface.mtu, 1280);
        for peer in &tuned.peers {
            assert!(!peer.trick);
            assert_eq!(peer.keepalive, 10);
        }
    }

    #[test]
    fn test_apply_leaves_source_untouched() {
        let original = sample();
        let tuned = Tuning::Outer.apply(original.clone());

        assert_eq!(original.interface.mtu, 1420);
        assert_eq!(original.peers[1].keepalive, 25);
        assert_ne!(original, tuned);
        assert_eq!(tuned.interface.private_key, original.interface.private_key);
    }

    #[tokio::test]
    async fn test_build_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg-profile.conf");
        std::fs::write(&path, sample_profile()).unwrap();

        let config = build_session(&ProfileFiles, &path, "127.0.0.1:2408", Tuning::Inner).await.unwrap();

        assert_eq!(config.interface.mtu, INNER_MTU);
        assert_eq!(config.peers[0].resolved, Some("127.0.0.1:2408".parse().unwrap()));
        assert_eq!(config.peers[0].keepalive, 10);
    }

    #[tokio::test]
    async fn test_build_session_missing_profile() {
        let dir = tempfile::tempdir().unwrap();
        let result = build_session(
            &ProfileFiles,
            &dir.path().join("absent.conf"),
            "127.0.0.1:2408",
            Tuning::Outer,
        )
        .await;

        assert!(matches!(result, Err(ProfileError::Io(_, _))));
    }
}
