use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Probe protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Protocol {
    #[default]
    Icmp,
    Udp,
    Tcp,
}

impl Protocol {
    /// IP protocol number used in flow keys
    pub fn number(&self) -> u8 {
        match self {
            Protocol::Icmp => 1,
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
        }
    }
}

/// Address family of the probed path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AddressFamily {
    #[default]
    V4,
    V6,
}

impl AddressFamily {
    pub fn matches(&self, addr: IpAddr) -> bool {
        match self {
            AddressFamily::V4 => addr.is_ipv4(),
            AddressFamily::V6 => addr.is_ipv6(),
        }
    }
}

/// Upper bound on parallel probe paths per hop
pub const MAX_PROBES_PER_HOP: u8 = 32;

/// Upper bound on max TTL; larger values degrade probing throughput
pub const MAX_TTL_LIMIT: u8 = 64;

/// Runtime configuration for a probing session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Probe protocol
    pub protocol: Protocol,
    /// Address family the destination must belong to
    pub family: AddressFamily,
    /// Number of probes issued per TTL (one sender actor each)
    pub probes_per_hop: u8,
    /// Maximum TTL
    pub max_ttl: u8,
    /// Timeout for a single probe's response
    #[serde(with = "duration_serde")]
    pub per_probe_timeout: Duration,
    /// Wall-clock bound on the whole session
    #[serde(with = "duration_serde")]
    pub global_timeout: Duration,
    /// Delay between consecutive probes from one sender
    #[serde(with = "duration_serde")]
    pub pacing: Duration,
    /// Margin added to the per-probe timeout before a completed send
    /// schedule is considered settled
    #[serde(with = "duration_serde")]
    pub grace: Duration,
    /// Receiver read deadline; bounds stop-flag observation latency
    #[serde(with = "duration_serde")]
    pub read_timeout: Duration,
    /// Lifetime of an unmatched send record in the correlation cache
    #[serde(with = "duration_serde")]
    pub cache_eviction: Duration,
    /// Interval between cache eviction sweeps
    #[serde(with = "duration_serde")]
    pub cache_sweep: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol: Protocol::Icmp,
            family: AddressFamily::V4,
            probes_per_hop: 3,
            max_ttl: 30,
            per_probe_timeout: Duration::from_secs(3),
            global_timeout: Duration::from_secs(20),
            pacing: Duration::from_millis(100),
            grace: Duration::from_millis(500),
            read_timeout: Duration::from_millis(100),
            cache_eviction: Duration::from_secs(6),
            cache_sweep: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Validate bounds before any probing starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probes_per_hop == 0 || self.probes_per_hop > MAX_PROBES_PER_HOP {
            return Err(ConfigError::ProbesPerHop(self.probes_per_hop));
        }
        if self.max_ttl == 0 || self.max_ttl > MAX_TTL_LIMIT {
            return Err(ConfigError::MaxTtl(self.max_ttl));
        }
        Ok(())
    }
}

/// Fatal configuration errors, returned before probing starts
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("probes per hop must be between 1 and 32, got {0}")]
    ProbesPerHop(u8),
    #[error("max TTL must be between 1 and 64, got {0}")]
    MaxTtl(u8),
    #[error("destination is not a valid IP address: {0}")]
    Destination(String),
    #[error("destination {addr} does not match address family {family:?}")]
    AddressFamily { addr: IpAddr, family: AddressFamily },
}

/// Serde helper for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    fn with_probes(probes_per_hop: u8) -> Config {
        Config {
            probes_per_hop,
            ..Config::default()
        }
    }

    #[test]
    fn test_probes_per_hop_bounds() {
        assert!(matches!(
            with_probes(33).validate(),
            Err(ConfigError::ProbesPerHop(33))
        ));
        assert!(matches!(
            with_probes(0).validate(),
            Err(ConfigError::ProbesPerHop(0))
        ));
        assert!(with_probes(32).validate().is_ok());
    }

    #[test]
    fn test_max_ttl_bounds() {
        let config = Config {
            max_ttl: 65,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MaxTtl(65))));

        let config = Config {
            max_ttl: 64,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_protocol_numbers() {
        assert_eq!(Protocol::Icmp.number(), 1);
        assert_eq!(Protocol::Tcp.number(), 6);
        assert_eq!(Protocol::Udp.number(), 17);
    }

    #[test]
    fn test_family_match() {
        let v4: IpAddr = "192.0.2.1".parse().unwrap();
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert!(AddressFamily::V4.matches(v4));
        assert!(!AddressFamily::V4.matches(v6));
        assert!(AddressFamily::V6.matches(v6));
    }
}
