//! Core types for peer addressing.
//!
//! - [`Nid`]: network identifier (network number + address)
//! - [`ProcessId`]: a nid plus the remote process id, the key of a connection
//! - [`ObdUuid`]: the bounded textual identity of a remote target or client

use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum size of a uuid including the terminating byte the wire format keeps.
pub const UUID_MAX: usize = 40;

/// Process id used by servers when none is given explicitly.
pub const LNET_SERVER_PID: u32 = 12345;

/// Network identifier.
///
/// The upper 32 bits carry the network number, the lower 32 bits the address
/// on that network.
///
/// # Examples
///
/// ```
/// use ptlrpc_core::Nid;
///
/// let nid: Nid = "192.168.1.10@tcp".parse().expect("valid nid");
/// assert_eq!(nid.net(), 0);
/// assert_eq!(nid.to_string(), "192.168.1.10@tcp");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Nid(u64);

impl Nid {
    /// Create a nid from a network number and an address.
    pub const fn new(net: u32, addr: u32) -> Self {
        Self(((net as u64) << 32) | addr as u64)
    }

    /// Create a nid for an IPv4 address on the given network.
    pub fn from_ipv4(ip: Ipv4Addr, net: u32) -> Self {
        Self::new(net, u32::from(ip))
    }

    /// Network number.
    pub const fn net(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Address on the network.
    pub const fn addr(&self) -> u32 {
        self.0 as u32
    }

    /// Raw 64-bit value.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Bytes hashed by the registry.
    pub fn key_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl From<u64> for Nid {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for Nid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ip = Ipv4Addr::from(self.addr());
        match self.net() {
            0 => write!(f, "{}@tcp", ip),
            net => write!(f, "{}@tcp{}", ip, net),
        }
    }
}

/// Error parsing a [`Nid`] from its `address@network` form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NidParseError {
    /// The `@` separator is missing.
    #[error("missing '@' separator")]
    MissingSeparator,

    /// The address part is not an IPv4 address.
    #[error("invalid address")]
    InvalidAddress,

    /// The network part is not `tcp` or `tcpN`.
    #[error("invalid network: {0}")]
    InvalidNetwork(String),
}

impl FromStr for Nid {
    type Err = NidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, net) = s.split_once('@').ok_or(NidParseError::MissingSeparator)?;
        let ip: Ipv4Addr = addr.parse().map_err(|_| NidParseError::InvalidAddress)?;
        let net = match net.strip_prefix("tcp") {
            Some("") => 0,
            Some(num) => num
                .parse::<u32>()
                .map_err(|_| NidParseError::InvalidNetwork(net.to_string()))?,
            None => return Err(NidParseError::InvalidNetwork(net.to_string())),
        };
        Ok(Self::from_ipv4(ip, net))
    }
}

/// A remote process: nid plus process id.
///
/// Connections are keyed by this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId {
    /// Network identifier of the node.
    pub nid: Nid,
    /// Process id on that node.
    pub pid: u32,
}

impl ProcessId {
    /// Create a process id.
    pub const fn new(nid: Nid, pid: u32) -> Self {
        Self { nid, pid }
    }

    /// Process id of a server reachable at `nid`.
    pub const fn server(nid: Nid) -> Self {
        Self::new(nid, LNET_SERVER_PID)
    }

    /// Bytes hashed by the registry.
    pub fn key_bytes(&self) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        bytes[..8].copy_from_slice(&self.nid.key_bytes());
        bytes[8..].copy_from_slice(&self.pid.to_le_bytes());
        bytes
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.pid, self.nid)
    }
}

/// Bounded textual identity of a target or client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObdUuid(String);

/// Error validating an [`ObdUuid`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UuidError {
    /// The uuid is empty.
    #[error("uuid is empty")]
    Empty,

    /// The uuid does not fit the fixed-size wire field.
    #[error("uuid is {len} bytes (max {})", UUID_MAX - 1)]
    TooLong {
        /// Length of the rejected uuid.
        len: usize,
    },
}

impl ObdUuid {
    /// Validate and wrap a uuid string.
    pub fn new(uuid: impl Into<String>) -> Result<Self, UuidError> {
        let uuid = uuid.into();
        if uuid.is_empty() {
            return Err(UuidError::Empty);
        }
        if uuid.len() >= UUID_MAX {
            return Err(UuidError::TooLong { len: uuid.len() });
        }
        Ok(Self(uuid))
    }

    /// The uuid text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bytes hashed by the registry.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for ObdUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nid_parts() {
        let nid = Nid::new(2, 0x0a000001);
        assert_eq!(nid.net(), 2);
        assert_eq!(nid.addr(), 0x0a000001);
        assert_eq!(nid.to_string(), "10.0.0.1@tcp2");
    }

    #[test]
    fn test_nid_parse() {
        let nid: Nid = "10.0.0.1@tcp3".parse().expect("parse");
        assert_eq!(nid, Nid::new(3, 0x0a000001));

        assert_eq!(
            "10.0.0.1".parse::<Nid>(),
            Err(NidParseError::MissingSeparator)
        );
        assert_eq!(
            "nope@tcp".parse::<Nid>(),
            Err(NidParseError::InvalidAddress)
        );
        assert!(matches!(
            "10.0.0.1@o2ib".parse::<Nid>(),
            Err(NidParseError::InvalidNetwork(_))
        ));
    }

    #[test]
    fn test_process_id_display() {
        let pid = ProcessId::server(Nid::new(0, 0x7f000001));
        assert_eq!(pid.to_string(), "12345-127.0.0.1@tcp");
    }

    #[test]
    fn test_process_id_key_bytes_differ_by_pid() {
        let nid = Nid::new(0, 1);
        assert_ne!(
            ProcessId::new(nid, 1).key_bytes(),
            ProcessId::new(nid, 2).key_bytes()
        );
    }

    #[test]
    fn test_uuid_bounds() {
        assert_eq!(ObdUuid::new(""), Err(UuidError::Empty));
        assert!(ObdUuid::new("a".repeat(UUID_MAX - 1)).is_ok());
        assert_eq!(
            ObdUuid::new("a".repeat(UUID_MAX)),
            Err(UuidError::TooLong { len: UUID_MAX })
        );
    }
}
