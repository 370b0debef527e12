use std::net::IpAddr;
use std::time::Instant;

use crate::config::Protocol;

/// Port value used in flow keys for protocols without real ports (ICMP)
pub const WILDCARD_PORT: u16 = 65535;

/// Identifies one probing flow by its 5-tuple.
///
/// The struct itself is the key: deriving `Hash`/`Eq` over all five fields
/// makes it deterministic and collision-free across distinct tuples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
}

impl FlowKey {
    pub fn new(src: IpAddr, dst: IpAddr, src_port: u16, dst_port: u16, proto: u8) -> Self {
        Self {
            src,
            dst,
            src_port,
            dst_port,
            proto,
        }
    }

    /// Key for the single shared ICMP flow of a session
    pub fn icmp(src: IpAddr, dst: IpAddr) -> Self {
        Self::new(
            src,
            dst,
            WILDCARD_PORT,
            WILDCARD_PORT,
            Protocol::Icmp.number(),
        )
    }
}

/// One outbound probe, recorded at send time
#[derive(Debug, Clone, Copy)]
pub struct SendMetric {
    pub flow: FlowKey,
    pub probe_id: u32,
    pub ttl: u8,
    pub sent_at: Instant,
}

/// One decoded response, recorded at receipt time
#[derive(Debug, Clone, Copy)]
pub struct RecvMetric {
    pub flow: FlowKey,
    pub probe_id: u32,
    pub responder: IpAddr,
    pub received_at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(key: &FlowKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn base_key() -> FlowKey {
        FlowKey::new(
            "192.0.2.1".parse().unwrap(),
            "198.51.100.7".parse().unwrap(),
            50000,
            33434,
            17,
        )
    }

    #[test]
    fn test_flow_key_deterministic() {
        let a = base_key();
        let b = base_key();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_flow_key_distinct_tuples_differ() {
        let base = base_key();

        let mut other = base;
        other.src = "192.0.2.2".parse().unwrap();
        assert_ne!(base, other);

        let mut other = base;
        other.dst = "198.51.100.8".parse().unwrap();
        assert_ne!(base, other);

        let mut other = base;
        other.src_port = 50001;
        assert_ne!(base, other);

        let mut other = base;
        other.dst_port = 33435;
        assert_ne!(base, other);

        let mut other = base;
        other.proto = 6;
        assert_ne!(base, other);
    }

    #[test]
    fn test_flow_key_port_edge_values() {
        let src: IpAddr = "192.0.2.1".parse().unwrap();
        let dst: IpAddr = "198.51.100.7".parse().unwrap();

        let zero = FlowKey::new(src, dst, 0, 0, 17);
        let max = FlowKey::new(src, dst, 65535, 65535, 17);
        assert_ne!(zero, max);
        assert_ne!(zero, FlowKey::new(src, dst, 0, 65535, 17));
        assert_ne!(max, FlowKey::new(src, dst, 65535, 0, 17));
    }

    #[test]
    fn test_icmp_key_uses_wildcard_ports() {
        let key = FlowKey::icmp("192.0.2.1".parse().unwrap(), "198.51.100.7".parse().unwrap());
        assert_eq!(key.src_port, WILDCARD_PORT);
        assert_eq!(key.dst_port, WILDCARD_PORT);
        assert_eq!(key.proto, 1);
    }
}
