use std::fmt;
use std::net::IpAddr;

mod parse;

pub use parse::parse;

#[cfg(test)]
pub(crate) use parse::tests as fixtures;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpVersion::V4 => f.write_str("IPv4"),
            IpVersion::V6 => f.write_str("IPv6"),
        }
    }
}

/// IP protocol numbers as assigned by IANA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpProtocol {
    Icmp,
    Igmp,
    Tcp,
    Udp,
    Icmpv6,
    Other(u8),
}

impl IpProtocol {
    pub const fn from_number(n: u8) -> Self {
        match n {
            1 => IpProtocol::Icmp,
            2 => IpProtocol::Igmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            58 => IpProtocol::Icmpv6,
            n => IpProtocol::Other(n),
        }
    }

    pub const fn number(self) -> u8 {
        match self {
            IpProtocol::Icmp => 1,
            IpProtocol::Igmp => 2,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Icmpv6 => 58,
            IpProtocol::Other(n) => n,
        }
    }

    /// ICMP in either IP version.
    pub const fn is_icmp(self) -> bool {
        matches!(self, IpProtocol::Icmp | IpProtocol::Icmpv6)
    }

    pub const fn has_ports(self) -> bool {
        matches!(self, IpProtocol::Tcp | IpProtocol::Udp)
    }
}

impl From<u8> for IpProtocol {
    fn from(n: u8) -> Self {
        IpProtocol::from_number(n)
    }
}

impl From<IpProtocol> for u8 {
    fn from(p: IpProtocol) -> Self {
        p.number()
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpProtocol::Icmp => f.write_str("ICMP"),
            IpProtocol::Igmp => f.write_str("IGMP"),
            IpProtocol::Tcp => f.write_str("TCP"),
            IpProtocol::Udp => f.write_str("UDP"),
            IpProtocol::Icmpv6 => f.write_str("ICMPv6"),
            IpProtocol::Other(n) => write!(f, "IP({n})"),
        }
    }
}

/// Metadata decoded from one IP datagram.
///
/// Ports are only set when the transport layer is TCP or UDP.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Info {
    pub ip_version: IpVersion,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: IpProtocol,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

impl fmt::Display for Info {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.src_port, self.dst_port) {
            (Some(sp), Some(dp)) => match self.ip_version {
                IpVersion::V4 => write!(
                    f,
                    "{} {}:{} -> {}:{}",
                    self.protocol, self.src, sp, self.dst, dp
                ),
                IpVersion::V6 => write!(
                    f,
                    "{} [{}]:{} -> [{}]:{}",
                    self.protocol, self.src, sp, self.dst, dp
                ),
            },
            _ => write!(f, "{} {} -> {}", self.protocol, self.src, self.dst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn protocol_numbers_follow_iana() {
        assert_eq!(IpProtocol::from(6), IpProtocol::Tcp);
        assert_eq!(IpProtocol::from(17), IpProtocol::Udp);
        assert_eq!(IpProtocol::from(1), IpProtocol::Icmp);
        assert_eq!(IpProtocol::from(58), IpProtocol::Icmpv6);
        assert_eq!(IpProtocol::from(2), IpProtocol::Igmp);
        assert_eq!(IpProtocol::from(132), IpProtocol::Other(132));
        assert_eq!(u8::from(IpProtocol::Other(132)), 132);
        assert_eq!(u8::from(IpProtocol::Icmpv6), 58);
    }

    #[test]
    fn info_display() {
        let info = Info {
            ip_version: IpVersion::V4,
            src: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            protocol: IpProtocol::Tcp,
            src_port: Some(1234),
            dst_port: Some(80),
        };
        assert_eq!(info.to_string(), "TCP 10.0.0.1:1234 -> 10.0.0.2:80");

        let icmp = Info {
            protocol: IpProtocol::Icmp,
            src_port: None,
            dst_port: None,
            ..info
        };
        assert_eq!(icmp.to_string(), "ICMP 10.0.0.1 -> 10.0.0.2");
    }
}
