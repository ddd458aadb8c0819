//! Socket addresses and network paths.
//!
//! [`Address`] is a family-tagged socket address with an optional dual-stack
//! flag; [`Path`] pairs a local and a remote address and is what a
//! [`Connection`](crate::connection::Connection) compares against to detect
//! NAT rebinding or migration.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::{Error, Result};

/// The fixed 12-byte prefix of an IPv4-mapped IPv6 address (`::ffff:0:0/96`).
pub const IPV4_MAPPED_PREFIX: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff];

/// Address family tag used when building an address from raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Raw address length in bytes for this family.
    pub fn octet_len(self) -> usize {
        match self {
            AddressFamily::Ipv4 => 4,
            AddressFamily::Ipv6 => 16,
        }
    }
}

/// An IPv4 CIDR range.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Range {
    base: u32,
    prefix: u8,
}

impl Ipv4Range {
    pub const fn new(a: u8, b: u8, c: u8, d: u8, prefix: u8) -> Self {
        Self {
            base: u32::from_be_bytes([a, b, c, d]),
            prefix,
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix as u32)
        };
        (u32::from(ip) & mask) == (self.base & mask)
    }
}

/// An IPv6 CIDR range.
#[derive(Debug, Clone, Copy)]
pub struct Ipv6Range {
    base: u128,
    prefix: u8,
}

impl Ipv6Range {
    pub const fn new(base: u128, prefix: u8) -> Self {
        Self { base, prefix }
    }

    pub fn contains(&self, ip: Ipv6Addr) -> bool {
        let mask = if self.prefix == 0 {
            0
        } else {
            u128::MAX << (128 - self.prefix as u32)
        };
        (u128::from(ip) & mask) == (self.base & mask)
    }
}

/// IPv4 ranges that are never publicly routable.
pub const IPV4_NONPUBLIC: &[Ipv4Range] = &[
    Ipv4Range::new(0, 0, 0, 0, 8),        // "this" network
    Ipv4Range::new(10, 0, 0, 0, 8),       // private
    Ipv4Range::new(100, 64, 0, 0, 10),    // carrier-grade NAT
    Ipv4Range::new(127, 0, 0, 0, 8),      // loopback
    Ipv4Range::new(169, 254, 0, 0, 16),   // link-local
    Ipv4Range::new(172, 16, 0, 0, 12),    // private
    Ipv4Range::new(192, 0, 0, 0, 24),     // IETF protocol assignments
    Ipv4Range::new(192, 0, 2, 0, 24),     // TEST-NET-1
    Ipv4Range::new(192, 88, 99, 0, 24),   // 6to4 relay anycast
    Ipv4Range::new(192, 168, 0, 0, 16),   // private
    Ipv4Range::new(198, 18, 0, 0, 15),    // benchmarking
    Ipv4Range::new(198, 51, 100, 0, 24),  // TEST-NET-2
    Ipv4Range::new(203, 0, 113, 0, 24),   // TEST-NET-3
    Ipv4Range::new(224, 0, 0, 0, 4),      // multicast
    Ipv4Range::new(240, 0, 0, 0, 4),      // reserved + broadcast
];

/// IPv4 loopback range.
pub const IPV4_LOOPBACK: Ipv4Range = Ipv4Range::new(127, 0, 0, 0, 8);

/// IPv6 ranges that are never publicly routable.
pub const IPV6_NONPUBLIC: &[Ipv6Range] = &[
    Ipv6Range::new(0, 128),                                      // unspecified
    Ipv6Range::new(1, 128),                                      // loopback
    Ipv6Range::new(0x0064_ff9b_0001_0000_0000_0000_0000_0000, 48), // local-use NAT64
    Ipv6Range::new(0x0100_0000_0000_0000_0000_0000_0000_0000, 64), // discard-only
    Ipv6Range::new(0x2001_0000_0000_0000_0000_0000_0000_0000, 23), // IETF protocol assignments
    Ipv6Range::new(0x2001_0db8_0000_0000_0000_0000_0000_0000, 32), // documentation
    Ipv6Range::new(0x2002_0000_0000_0000_0000_0000_0000_0000, 16), // 6to4
    Ipv6Range::new(0xfc00_0000_0000_0000_0000_0000_0000_0000, 7),  // unique local
    Ipv6Range::new(0xfe80_0000_0000_0000_0000_0000_0000_0000, 10), // link-local
    Ipv6Range::new(0xff00_0000_0000_0000_0000_0000_0000_0000, 8),  // multicast
];

/// Family-tagged socket address.
///
/// Family and address length always agree because the inner value is a
/// [`SocketAddr`]. Equality and hashing ignore the dual-stack flag, which
/// only affects how a socket bound to this address is configured.
#[derive(Clone, Copy)]
pub struct Address {
    addr: SocketAddr,
    dual_stack: bool,
}

impl Address {
    /// Build from a host string and port.
    ///
    /// An empty host yields the IPv6 any-address with dual-stack enabled
    /// (IPv4 any-address when built with the `no-dual-stack` feature). A host
    /// containing `:` is parsed as IPv6, optionally bracketed; anything else
    /// is parsed as IPv4.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        if host.is_empty() {
            return Ok(Self::any(port));
        }

        if host.contains(':') {
            let trimmed = host
                .strip_prefix('[')
                .and_then(|h| h.strip_suffix(']'))
                .unwrap_or(host);
            let ip: Ipv6Addr = trimmed
                .parse()
                .map_err(|_| Error::InvalidAddress(host.to_string()))?;
            Ok(Self::from_ipv6(ip, port))
        } else {
            let ip: Ipv4Addr = host
                .parse()
                .map_err(|_| Error::InvalidAddress(host.to_string()))?;
            Ok(Self::from_ipv4(ip, port))
        }
    }

    /// The wildcard address used when no host is given.
    #[cfg(not(feature = "no-dual-stack"))]
    pub fn any(port: u16) -> Self {
        Self {
            addr: SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
            dual_stack: true,
        }
    }

    /// The wildcard address used when no host is given.
    #[cfg(feature = "no-dual-stack")]
    pub fn any(port: u16) -> Self {
        Self::from_ipv4(Ipv4Addr::UNSPECIFIED, port)
    }

    /// Build from raw address bytes of the given family.
    pub fn from_octets(family: AddressFamily, octets: &[u8], port: u16) -> Result<Self> {
        if octets.len() != family.octet_len() {
            return Err(Error::AddressFamily(format!(
                "{:?} address needs {} bytes, got {}",
                family,
                family.octet_len(),
                octets.len()
            )));
        }
        match family {
            AddressFamily::Ipv4 => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(octets);
                Ok(Self::from_ipv4(Ipv4Addr::from(raw), port))
            }
            AddressFamily::Ipv6 => {
                let mut raw = [0u8; 16];
                raw.copy_from_slice(octets);
                Ok(Self::from_ipv6(Ipv6Addr::from(raw), port))
            }
        }
    }

    pub fn from_ipv4(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            addr: SocketAddr::V4(SocketAddrV4::new(ip, port)),
            dual_stack: false,
        }
    }

    pub fn from_ipv6(ip: Ipv6Addr, port: u16) -> Self {
        Self {
            addr: SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)),
            dual_stack: false,
        }
    }

    pub fn family(&self) -> AddressFamily {
        match self.addr {
            SocketAddr::V4(_) => AddressFamily::Ipv4,
            SocketAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    /// Whether a socket bound here should also accept IPv4 traffic.
    pub fn dual_stack(&self) -> bool {
        self.dual_stack
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_port(&mut self, port: u16) {
        self.addr.set_port(port);
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_any_addr(&self) -> bool {
        self.addr.ip().is_unspecified()
    }

    pub fn is_any_port(&self) -> bool {
        self.addr.port() == 0
    }

    /// Has both a concrete address and a concrete port.
    pub fn is_addressable(&self) -> bool {
        !self.is_any_addr() && !self.is_any_port()
    }

    pub fn is_ipv4_mapped_ipv6(&self) -> bool {
        match self.addr {
            SocketAddr::V6(a6) => a6.ip().octets()[..12] == IPV4_MAPPED_PREFIX,
            SocketAddr::V4(_) => false,
        }
    }

    /// Rewrite an IPv4 address into its `::ffff:a.b.c.d` form, keeping the port.
    pub fn map_ipv4_as_ipv6(&mut self) -> Result<()> {
        *self = self.mapped_ipv4_as_ipv6()?;
        Ok(())
    }

    pub fn mapped_ipv4_as_ipv6(&self) -> Result<Self> {
        let SocketAddr::V4(a4) = self.addr else {
            return Err(Error::AddressFamily(format!(
                "cannot map non-IPv4 address {} as IPv6",
                self
            )));
        };
        let mut raw = [0u8; 16];
        raw[..12].copy_from_slice(&IPV4_MAPPED_PREFIX);
        raw[12..].copy_from_slice(&a4.ip().octets());
        Ok(Self::from_ipv6(Ipv6Addr::from(raw), a4.port()))
    }

    /// Inverse of [`map_ipv4_as_ipv6`](Self::map_ipv4_as_ipv6).
    pub fn unmap_ipv4_from_ipv6(&mut self) -> Result<()> {
        *self = self.unmapped_ipv4_from_ipv6()?;
        Ok(())
    }

    pub fn unmapped_ipv4_from_ipv6(&self) -> Result<Self> {
        match self.addr {
            SocketAddr::V6(a6) if self.is_ipv4_mapped_ipv6() => {
                let o = a6.ip().octets();
                Ok(Self::from_ipv4(
                    Ipv4Addr::new(o[12], o[13], o[14], o[15]),
                    a6.port(),
                ))
            }
            _ => Err(Error::AddressFamily(format!(
                "{} is not an IPv4-mapped IPv6 address",
                self
            ))),
        }
    }

    /// Whether the IP (ignoring the port) is globally routable.
    pub fn is_public_ip(&self) -> bool {
        if self.is_any_addr() {
            return false;
        }
        if let Ok(v4) = self.unmapped_ipv4_from_ipv6() {
            return v4.is_public_ip();
        }
        match self.addr.ip() {
            IpAddr::V4(ip) => !IPV4_NONPUBLIC.iter().any(|r| r.contains(ip)),
            IpAddr::V6(ip) => !IPV6_NONPUBLIC.iter().any(|r| r.contains(ip)),
        }
    }

    /// Publicly routable IP with a concrete port.
    pub fn is_public(&self) -> bool {
        !self.is_any_port() && self.is_public_ip()
    }

    pub fn is_loopback(&self) -> bool {
        if self.is_any_addr() {
            return false;
        }
        if let Ok(v4) = self.unmapped_ipv4_from_ipv6() {
            return v4.is_loopback();
        }
        match self.addr.ip() {
            IpAddr::V4(ip) => IPV4_LOOPBACK.contains(ip),
            IpAddr::V6(ip) => ip == Ipv6Addr::LOCALHOST,
        }
    }

    /// Host part: bare for IPv4, bracketed for IPv6.
    pub fn host(&self) -> String {
        match self.addr.ip() {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => format!("[{}]", ip),
        }
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host(), self.port())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dual_stack {
            write!(f, "Address({} dual-stack)", self)
        } else {
            write!(f, "Address({})", self)
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self {
            addr,
            dual_stack: false,
        }
    }
}

impl From<SocketAddrV4> for Address {
    fn from(addr: SocketAddrV4) -> Self {
        SocketAddr::V4(addr).into()
    }
}

impl From<SocketAddrV6> for Address {
    fn from(addr: SocketAddrV6) -> Self {
        SocketAddr::V6(addr).into()
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> Self {
        addr.addr
    }
}

/// A (local, remote) address pair. Any change to either side is a path change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Path {
    pub local: Address,
    pub remote: Address,
}

impl Path {
    pub fn new(local: Address, remote: Address) -> Self {
        Self { local, remote }
    }

    /// Same local side, different remote (NAT rebinding as seen by a server).
    pub fn with_remote(&self, remote: Address) -> Self {
        Self {
            local: self.local,
            remote,
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{} -> {}}}", self.local, self.remote)
    }
}
