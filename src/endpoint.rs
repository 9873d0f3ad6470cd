//! IPv4/IPv6 socket address value type.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

use crate::error::InvalidAddress;

/// An IPv4 or IPv6 address and port pair.
///
/// Immutable once constructed; `std::net::SocketAddr` already is the tagged
/// union the data model calls for, so `Endpoint` is a thin wrapper adding the
/// `ip:port` formatting and the fallible text constructor this crate's
/// `Acceptor`/`Connector`/`TcpServer`/`TcpClient` all take.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    /// A wildcard endpoint (`0.0.0.0:port` or `[::]:port`) for binding a listener.
    pub fn new(port: u16, ipv6: bool) -> Endpoint {
        let addr = if ipv6 {
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0))
        } else {
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
        };
        Endpoint(addr)
    }

    /// Parses a textual IP address and combines it with `port`.
    pub fn from_ip_str(ip: &str, port: u16) -> Result<Endpoint, InvalidAddress> {
        let ip: IpAddr = ip.parse().map_err(|_| InvalidAddress::new(ip))?;
        Ok(Endpoint(SocketAddr::new(ip, port)))
    }

    pub fn from_raw(addr: SocketAddr) -> Endpoint {
        Endpoint(addr)
    }

    pub fn ip(self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(self) -> u16 {
        self.0.port()
    }

    pub fn is_ipv6(self) -> bool {
        self.0.is_ipv6()
    }

    /// `"ip:port"` textual form, e.g. `127.0.0.1:8080`.
    pub fn ip_port(self) -> String {
        self.0.to_string()
    }

    /// IPv4 address in network byte order; `0` for an IPv6 endpoint.
    pub fn ip_net_endian(self) -> u32 {
        match self.0.ip() {
            IpAddr::V4(v4) => u32::from_be_bytes(v4.octets()),
            IpAddr::V6(_) => 0,
        }
    }

    pub fn port_net_endian(self) -> u16 {
        self.0.port().to_be()
    }

    pub fn as_socket_addr(self) -> SocketAddr {
        self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for Endpoint {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Endpoint, InvalidAddress> {
        s.parse::<SocketAddr>()
            .map(Endpoint)
            .map_err(|_| InvalidAddress::new(s))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Endpoint {
        Endpoint(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(e: Endpoint) -> SocketAddr {
        e.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_format_round_trip_v4() {
        let e: Endpoint = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(e.ip_port(), "127.0.0.1:8080");
        assert_eq!(e.port(), 8080);
        assert!(!e.is_ipv6());
        let round_tripped: Endpoint = e.ip_port().parse().unwrap();
        assert_eq!(round_tripped, e);
    }

    #[test]
    fn parse_format_round_trip_v6() {
        let e: Endpoint = "[::1]:9000".parse().unwrap();
        assert!(e.is_ipv6());
        let round_tripped: Endpoint = e.ip_port().parse().unwrap();
        assert_eq!(round_tripped, e);
    }

    #[test]
    fn invalid_text_is_rejected() {
        assert!("not an address".parse::<Endpoint>().is_err());
        assert!(Endpoint::from_ip_str("not an ip", 80).is_err());
    }

    #[test]
    fn wildcard_endpoint_has_requested_port() {
        let e = Endpoint::new(0, false);
        assert_eq!(e.port(), 0);
        assert!(!e.is_ipv6());
    }
}
