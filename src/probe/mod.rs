//! Collaborator seams for wire formats and raw sockets.
//!
//! The measurement engine never touches packet bytes or OS sockets itself.
//! Callers supply a [`ProbeCodec`] that builds probe payloads and decodes
//! returned ICMP/TCP messages, and a [`Transport`] that moves raw bytes.
//! Tests drive the engine with in-memory implementations of both.

use std::io;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Classification of a decoded response message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// TTL expired at an intermediate router
    TimeExceeded,
    /// ICMP echo reply from the destination
    EchoReply,
    /// UDP probe hit a closed port on the destination
    PortUnreachable,
    /// TCP RST from the destination
    TcpReset,
    /// TCP SYN-ACK from the destination
    SynAck,
}

impl ResponseKind {
    /// Whether this kind can only originate from the final destination
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResponseKind::EchoReply | ResponseKind::PortUnreachable | ResponseKind::SynAck
        )
    }
}

/// A response decoded by the codec, ready for correlation
#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub kind: ResponseKind,
    /// Probe sequence number recovered from the quoted original packet
    pub probe_id: u32,
    /// Address the response came from
    pub responder: IpAddr,
    /// Source and destination ports quoted from the original probe, when
    /// the protocol carries them (UDP/TCP); used to rebuild the flow key
    pub quoted_ports: Option<(u16, u16)>,
}

/// Malformed or foreign response payloads; recovered locally by the receiver
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("response too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("response does not belong to this session")]
    Foreign,
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Probe payload construction failures
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("failed to encode probe: {0}")]
    Encode(String),
}

/// Builds outbound probe payloads and decodes inbound responses.
pub trait ProbeCodec: Send + Sync {
    /// Build the raw bytes for one probe toward `dest` at the given TTL.
    fn build_probe(&self, ttl: u8, probe_id: u32, dest: IpAddr) -> Result<Vec<u8>, BuildError>;

    /// Decode a raw response received from `responder`.
    fn parse_response(&self, raw: &[u8], responder: IpAddr) -> Result<ParsedResponse, ParseError>;
}

/// Raw datagram transport.
///
/// `recv` must return within `deadline`, signalling an elapsed deadline as
/// `io::ErrorKind::WouldBlock` or `TimedOut` so the receiver can run its
/// termination checks on a guaranteed cadence.
pub trait Transport: Send + Sync {
    fn send(&self, bytes: &[u8], dest: IpAddr) -> io::Result<()>;

    fn recv(&self, buf: &mut [u8], deadline: Duration) -> io::Result<(usize, IpAddr)>;
}

/// Whether an I/O error is an expected read-deadline expiry
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_kinds() {
        assert!(ResponseKind::EchoReply.is_terminal());
        assert!(ResponseKind::PortUnreachable.is_terminal());
        assert!(ResponseKind::SynAck.is_terminal());
        assert!(!ResponseKind::TimeExceeded.is_terminal());
        assert!(!ResponseKind::TcpReset.is_terminal());
    }

    #[test]
    fn test_timeout_classification() {
        assert!(is_timeout(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_timeout(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_timeout(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
