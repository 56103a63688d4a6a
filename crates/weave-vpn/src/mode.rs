//! Mode Selection
//!
//! Turns the configuration flags into exactly one operating mode. The
//! mutual-exclusion rules are checked here, before any identity is
//! provisioned or any resource is created.

use crate::config::{ConfigError, RunOptions, TunOptions};
use std::fmt;

/// Operating mode of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// One outer-tuned hop exposed as a local proxy or OS interface
    Normal { tun: Option<TunOptions> },
    /// Inner hop carried through the outer hop's stack
    DoubleHop { tun: Option<TunOptions> },
    /// One hop behind a local proxy, exposed through the relay network
    Relay { country: String },
}

impl Mode {
    /// Validate `opts` and derive the active mode
    pub fn from_options(opts: &RunOptions) -> Result<Self, ConfigError> {
        if let Some(relay) = &opts.relay {
            if opts.double_hop {
                return Err(ConfigError::RelayWithDoubleHop);
            }
            if relay.country.trim().is_empty() {
                return Err(ConfigError::MissingRelayCountry);
            }
            if opts.tun.is_some() {
                return Err(ConfigError::RelayWithTun);
            }
            return Ok(Mode::Relay {
                country: relay.country.clone(),
            });
        }

        if opts.double_hop {
            Ok(Mode::DoubleHop { tun: opts.tun })
        } else {
            Ok(Mode::Normal { tun: opts.tun })
        }
    }

    /// Number of tunnel hops this mode builds
    pub fn hop_count(&self) -> usize {
        match self {
            Mode::DoubleHop { .. } => 2,
            Mode::Normal { .. } | Mode::Relay { .. } => 1,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Normal { .. } => write!(f, "normal"),
            Mode::DoubleHop { .. } => write!(f, "double-hop"),
            Mode::Relay { country } => write!(f, "relay ({})", country),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayOptions;

    fn relay_opts(country: &str) -> RunOptions {
        RunOptions {
            relay: Some(RelayOptions::new(country)),
            ..RunOptions::default()
        }
    }

    #[test]
    fn test_normal_by_default() {
        let mode = Mode::from_options(&RunOptions::default()).unwrap();
        assert_eq!(mode, Mode::Normal { tun: None });
        assert_eq!(mode.hop_count(), 1);
    }

    #[test]
    fn test_double_hop_keeps_tun() {
        let opts = RunOptions {
            double_hop: true,
            tun: Some(TunOptions { fwmark: 7 }),
            ..RunOptions::default()
        };

        let mode = Mode::from_options(&opts).unwrap();
        assert_eq!(mode, Mode::DoubleHop { tun: Some(TunOptions { fwmark: 7 }) });
        assert_eq!(mode.hop_count(), 2);
    }

    #[test]
    fn test_relay() {
        let mode = Mode::from_options(&relay_opts("AT")).unwrap();
        assert_eq!(mode, Mode::Relay { country: "AT".into() });
        assert_eq!(mode.to_string(), "relay (AT)");
    }

    #[test]
    fn test_relay_and_double_hop_rejected() {
        let opts = RunOptions {
            double_hop: true,
            ..relay_opts("AT")
        };
        assert_eq!(Mode::from_options(&opts), Err(ConfigError::RelayWithDoubleHop));
    }

    #[test]
    fn test_relay_without_country_rejected() {
        assert_eq!(
            Mode::from_options(&relay_opts("")),
            Err(ConfigError::MissingRelayCountry)
        );
        assert_eq!(
            Mode::from_options(&relay_opts("   ")),
            Err(ConfigError::MissingRelayCountry)
        );
    }

    #[test]
    fn test_relay_and_tun_rejected() {
        let opts = RunOptions {
            tun: Some(TunOptions::default()),
            ..relay_opts("AT")
        };
        assert_eq!(Mode::from_options(&opts), Err(ConfigError::RelayWithTun));
    }
}
