//! IPv4/IPv6 address + port value type.
//!
//! `InetAddr` is a thin newtype over [`std::net::SocketAddr`] with the
//! constructors and accessors the reactor needs: parse from `"ip:port"`,
//! wildcard and loopback binds, and conversion to the platform socket
//! address for the syscall layer.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// IPv4 or IPv6 endpoint address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InetAddr(SocketAddr);

impl InetAddr {
    /// Build from ip and port.
    #[must_use]
    pub const fn new(ip: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(ip, port))
    }

    /// Parse an ip string plus port, e.g. `("10.0.0.1", 8000)`.
    pub fn from_ip_port(ip: &str, port: u16) -> Result<Self, AddrError> {
        let ip = ip
            .parse::<IpAddr>()
            .map_err(|_| AddrError::InvalidIp(ip.to_string()))?;
        Ok(Self::new(ip, port))
    }

    /// Wildcard bind address (`0.0.0.0` or `::`).
    #[must_use]
    pub const fn any(port: u16, ipv6: bool) -> Self {
        if ipv6 {
            Self::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)
        } else {
            Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
        }
    }

    /// Loopback address (`127.0.0.1` or `::1`).
    #[must_use]
    pub const fn loopback(port: u16, ipv6: bool) -> Self {
        if ipv6 {
            Self::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port)
        } else {
            Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
        }
    }

    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }

    #[must_use]
    pub const fn is_ipv6(&self) -> bool {
        self.0.is_ipv6()
    }

    /// `"ip:port"` rendering; IPv6 addresses are bracketed.
    #[must_use]
    pub fn ip_port(&self) -> String {
        self.0.to_string()
    }

    /// The underlying platform address.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    /// Conversion for the syscall layer.
    #[must_use]
    pub fn to_sock_addr(&self) -> socket2::SockAddr {
        socket2::SockAddr::from(self.0)
    }
}

impl From<SocketAddr> for InetAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl FromStr for InetAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(Self)
            .map_err(|_| AddrError::InvalidAddr(s.to_string()))
    }
}

impl fmt::Display for InetAddr {
    // SocketAddr already renders `[v6]:port` correctly; delegate wholesale.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Errors from address parsing.
#[derive(Debug, thiserror::Error)]
pub enum AddrError {
    #[error("invalid ip address: {0}")]
    InvalidIp(String),

    #[error("invalid socket address: {0} (expected ip:port)")]
    InvalidAddr(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4() {
        let addr: InetAddr = "127.0.0.1:5555".parse().unwrap();
        assert_eq!(addr.port(), 5555);
        assert!(!addr.is_ipv6());
        assert_eq!(addr.ip_port(), "127.0.0.1:5555");
    }

    #[test]
    fn test_parse_ipv6() {
        let addr: InetAddr = "[::1]:5555".parse().unwrap();
        assert!(addr.is_ipv6());
        assert_eq!(addr.to_string(), "[::1]:5555");
    }

    #[test]
    fn test_from_ip_port() {
        let addr = InetAddr::from_ip_port("10.1.2.3", 80).unwrap();
        assert_eq!(addr.ip().to_string(), "10.1.2.3");
        assert_eq!(addr.port(), 80);

        let err = InetAddr::from_ip_port("not-an-ip", 80).unwrap_err();
        assert!(matches!(err, AddrError::InvalidIp(_)));
    }

    #[test]
    fn test_any_and_loopback() {
        assert_eq!(InetAddr::any(0, false).to_string(), "0.0.0.0:0");
        assert_eq!(InetAddr::loopback(7, true).to_string(), "[::1]:7");
    }

    #[test]
    fn test_sock_addr_round_trip() {
        let addr: InetAddr = "192.168.1.9:4242".parse().unwrap();
        let sa = addr.to_sock_addr();
        assert_eq!(sa.as_socket().unwrap(), addr.socket_addr());
    }

    #[test]
    fn test_invalid_addr() {
        let err = "nonsense".parse::<InetAddr>().unwrap_err();
        assert!(matches!(err, AddrError::InvalidAddr(_)));
    }
}
