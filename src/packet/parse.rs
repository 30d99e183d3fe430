use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::{Info, IpProtocol, IpVersion};
use crate::error::DecodeError;

const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const IPV6_MAX_EXT_HEADERS: usize = 8;

const TCP_MIN_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const ICMP_MIN_HEADER_LEN: usize = 4;
const IGMP_MIN_LEN: usize = 8;

fn malformed(msg: String) -> DecodeError {
    DecodeError::MalformedLayer(msg)
}

/// Network layer view over the borrowed datagram.
///
/// Only the fixed header is validated on construction; extension headers and
/// the upper layer are located by [`Network::upper`] when asked for.
enum Network<'a> {
    V4 {
        header: &'a [u8],
        payload: &'a [u8],
        later_fragment: bool,
    },
    V6 {
        header: &'a [u8],
        payload: &'a [u8],
    },
}

/// Upper-layer protocol number and the bytes starting at its header.
struct Upper<'a> {
    protocol: u8,
    data: &'a [u8],
}

impl<'a> Network<'a> {
    fn ipv4(data: &'a [u8]) -> Result<Self, DecodeError> {
        if data.len() < IPV4_MIN_HEADER_LEN {
            return Err(malformed(format!(
                "IPv4 header truncated: {} bytes",
                data.len()
            )));
        }

        let ihl = (data[0] & 0x0F) as usize * 4;
        if ihl < IPV4_MIN_HEADER_LEN {
            return Err(malformed(format!("IPv4 header length {ihl} too small")));
        }
        if ihl > data.len() {
            return Err(malformed(format!(
                "IPv4 header length {ihl} exceeds packet length {}",
                data.len()
            )));
        }

        // total length 0 happens with segmentation offload
        let end = match u16::from_be_bytes([data[2], data[3]]) as usize {
            0 => data.len(),
            total if total < ihl => {
                return Err(malformed(format!(
                    "IPv4 total length {total} smaller than header length {ihl}"
                )));
            }
            total => total.min(data.len()),
        };

        let fragment_offset = u16::from_be_bytes([data[6], data[7]]) & 0x1FFF;

        Ok(Network::V4 {
            header: &data[..ihl],
            payload: &data[ihl..end],
            later_fragment: fragment_offset != 0,
        })
    }

    fn ipv6(data: &'a [u8]) -> Result<Self, DecodeError> {
        if data.len() < IPV6_HEADER_LEN {
            return Err(malformed(format!(
                "IPv6 header truncated: {} bytes",
                data.len()
            )));
        }

        // payload length 0 means a jumbogram, the hop-by-hop option carries the size
        let end = match u16::from_be_bytes([data[4], data[5]]) as usize {
            0 => data.len(),
            len => (IPV6_HEADER_LEN + len).min(data.len()),
        };

        Ok(Network::V6 {
            header: &data[..IPV6_HEADER_LEN],
            payload: &data[IPV6_HEADER_LEN..end],
        })
    }

    /// Addresses plus the protocol the network header announces.
    fn info(&self) -> Info {
        match self {
            Network::V4 { header, .. } => Info {
                ip_version: IpVersion::V4,
                src: IpAddr::V4(Ipv4Addr::new(
                    header[12], header[13], header[14], header[15],
                )),
                dst: IpAddr::V4(Ipv4Addr::new(
                    header[16], header[17], header[18], header[19],
                )),
                protocol: IpProtocol::from(header[9]),
                src_port: None,
                dst_port: None,
            },
            // next header is a fallback, the walk in `upper` replaces it
            // when a known upper layer turns up
            Network::V6 { header, .. } => Info {
                ip_version: IpVersion::V6,
                src: IpAddr::V6(ipv6_addr(&header[8..24])),
                dst: IpAddr::V6(ipv6_addr(&header[24..40])),
                protocol: IpProtocol::from(header[6]),
                src_port: None,
                dst_port: None,
            },
        }
    }

    /// Locate the upper-layer header. `None` for non-first fragments, which
    /// carry no transport header.
    fn upper(&self) -> Result<Option<Upper<'a>>, DecodeError> {
        match *self {
            Network::V4 {
                later_fragment: true,
                ..
            } => Ok(None),
            Network::V4 {
                header, payload, ..
            } => Ok(Some(Upper {
                protocol: header[9],
                data: payload,
            })),
            Network::V6 { header, payload } => walk_ipv6_extensions(header[6], payload),
        }
    }
}

fn ipv6_addr(bytes: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&bytes[..16]);
    Ipv6Addr::from(octets)
}

fn walk_ipv6_extensions(
    mut next_header: u8,
    mut rest: &[u8],
) -> Result<Option<Upper<'_>>, DecodeError> {
    for _ in 0..IPV6_MAX_EXT_HEADERS {
        match next_header {
            // hop-by-hop, routing, destination options, mobility, HIP, shim6, experimental
            0 | 43 | 60 | 135 | 139 | 140 | 253 | 254 => {
                if rest.len() < 2 {
                    return Err(malformed(format!(
                        "IPv6 extension header {next_header} truncated"
                    )));
                }
                let ext_len = (rest[1] as usize + 1) * 8;
                if rest.len() < ext_len {
                    return Err(malformed(format!(
                        "IPv6 extension header {next_header} length {ext_len} exceeds {} remaining bytes",
                        rest.len()
                    )));
                }
                next_header = rest[0];
                rest = &rest[ext_len..];
            }
            // fragment
            44 => {
                if rest.len() < 8 {
                    return Err(malformed("IPv6 fragment header truncated".to_string()));
                }
                let offset = u16::from_be_bytes([rest[2], rest[3]]) >> 3;
                if offset != 0 {
                    return Ok(None);
                }
                next_header = rest[0];
                rest = &rest[8..];
            }
            // authentication header counts in 4 byte units
            51 => {
                if rest.len() < 2 {
                    return Err(malformed("IPv6 authentication header truncated".to_string()));
                }
                let ext_len = (rest[1] as usize + 2) * 4;
                if rest.len() < ext_len {
                    return Err(malformed(format!(
                        "IPv6 authentication header length {ext_len} exceeds {} remaining bytes",
                        rest.len()
                    )));
                }
                next_header = rest[0];
                rest = &rest[ext_len..];
            }
            protocol => {
                return Ok(Some(Upper {
                    protocol,
                    data: rest,
                }));
            }
        }
    }

    Err(malformed(format!(
        "more than {IPV6_MAX_EXT_HEADERS} IPv6 extension headers"
    )))
}

fn decode_upper(upper: Upper<'_>, info: &mut Info) -> Result<(), DecodeError> {
    let data = upper.data;

    match IpProtocol::from(upper.protocol) {
        IpProtocol::Tcp => {
            if data.len() < TCP_MIN_HEADER_LEN {
                return Err(malformed(format!(
                    "TCP header truncated: {} bytes",
                    data.len()
                )));
            }
            let data_offset = (data[12] >> 4) as usize * 4;
            if data_offset < TCP_MIN_HEADER_LEN || data_offset > data.len() {
                return Err(malformed(format!("TCP data offset {data_offset} invalid")));
            }
            info.protocol = IpProtocol::Tcp;
            info.src_port = Some(u16::from_be_bytes([data[0], data[1]]));
            info.dst_port = Some(u16::from_be_bytes([data[2], data[3]]));
        }
        IpProtocol::Udp => {
            if data.len() < UDP_HEADER_LEN {
                return Err(malformed(format!(
                    "UDP header truncated: {} bytes",
                    data.len()
                )));
            }
            info.protocol = IpProtocol::Udp;
            info.src_port = Some(u16::from_be_bytes([data[0], data[1]]));
            info.dst_port = Some(u16::from_be_bytes([data[2], data[3]]));
        }
        protocol @ (IpProtocol::Icmp | IpProtocol::Icmpv6) => {
            if data.len() < ICMP_MIN_HEADER_LEN {
                return Err(malformed(format!(
                    "{protocol} header truncated: {} bytes",
                    data.len()
                )));
            }
            info.protocol = protocol;
        }
        IpProtocol::Igmp => {
            if data.len() < IGMP_MIN_LEN {
                return Err(malformed(format!(
                    "IGMP message truncated: {} bytes",
                    data.len()
                )));
            }
            info.protocol = IpProtocol::Igmp;
        }
        IpProtocol::Other(_) => {}
    }

    Ok(())
}

/// Decode one IP datagram into [`Info`].
///
/// The network header is read first. Extension headers and the transport
/// header are only visited to find ports or the protocol actually carried;
/// payloads are never read and nothing is copied.
pub fn parse(data: &[u8]) -> Result<Info, DecodeError> {
    let first = *data.first().ok_or(DecodeError::EmptyInput)?;

    let network = match first >> 4 {
        4 => Network::ipv4(data)?,
        6 => Network::ipv6(data)?,
        version => return Err(DecodeError::UnsupportedIpVersion(version)),
    };

    let mut info = network.info();
    if let Some(upper) = network.upper()? {
        decode_upper(upper, &mut info)?;
    }

    Ok(info)
}
