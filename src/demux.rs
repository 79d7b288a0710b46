use std::net::SocketAddr;

use log::{debug, trace};

use crate::ip::{IpError, IpHeader, IpVersion};
use crate::logger::fmt_slice_hex;
use crate::peers::PeerTable;
use crate::tunnel::TunnelError;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Route {
    Forward(IpVersion, SocketAddr),
    Drop,
}

/// Returns the IP packet inside a frame read from the tunnel device.
pub fn strip_framing(frame: &[u8], framing_length: usize) -> Option<&[u8]> {
    frame.get(framing_length..)
}

/// Picks the peer for a packet read from the tunnel device, based on its destination.
/// Packets that can't be classified are dropped; a destination without a peer is fatal.
pub fn route(packet: &[u8], peers: &PeerTable) -> Result<Route, TunnelError> {
    let header = match IpHeader::from_data(packet) {
        Ok(header) => header,
        Err(IpError::UnsupportedVersion(version)) => {
            debug!(
                "Dropping tunnel packet with unsupported IP version {version}\n{}",
                fmt_slice_hex(packet)
            );
            return Ok(Route::Drop);
        }
        Err(err) => {
            debug!("Dropping malformed tunnel packet: {err}");
            return Ok(Route::Drop);
        }
    };
    trace!("Routing tunnel packet {header}");
    let dst_addr = header.dst_addr();
    match peers.lookup(dst_addr) {
        Some(peer_addr) => Ok(Route::Forward(IpVersion::of_addr(&dst_addr), peer_addr)),
        None => Err(TunnelError::PeerNotFound(dst_addr)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        net::{IpAddr, Ipv4Addr, Ipv6Addr},
        str::FromStr,
    };

    fn peers() -> PeerTable {
        PeerTable::parse("10.0.0.2 192.0.2.10:5000\nfd00::2 [2001:db8::10]:5000\n").unwrap()
    }

    fn ipv4_packet(dst_addr: Ipv4Addr) -> Vec<u8> {
        let mut packet = vec![0u8; 40];
        packet[0] = 0x45;
        packet[16..20].copy_from_slice(&dst_addr.octets());
        packet
    }

    fn ipv6_packet(dst_addr: Ipv6Addr) -> Vec<u8> {
        let mut packet = vec![0u8; 60];
        packet[0] = 0x60;
        packet[24..40].copy_from_slice(&dst_addr.octets());
        packet
    }

    #[test]
    fn route_ipv4() {
        let packet = ipv4_packet(Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(
            route(&packet, &peers()).unwrap(),
            Route::Forward(
                IpVersion::V4,
                SocketAddr::from_str("192.0.2.10:5000").unwrap()
            )
        );
    }

    #[test]
    fn route_ipv6() {
        let packet = ipv6_packet(Ipv6Addr::from_str("fd00::2").unwrap());
        assert_eq!(
            route(&packet, &peers()).unwrap(),
            Route::Forward(
                IpVersion::V6,
                SocketAddr::from_str("[2001:db8::10]:5000").unwrap()
            )
        );
    }

    #[test]
    fn drop_unknown_version_and_truncated_packets() {
        assert_eq!(route(&[0x00; 40], &peers()).unwrap(), Route::Drop);
        assert_eq!(route(&[0x45, 0x00, 0x00], &peers()).unwrap(), Route::Drop);
        assert_eq!(route(&[], &peers()).unwrap(), Route::Drop);
    }

    #[test]
    fn lookup_miss_is_an_error() {
        let packet = ipv4_packet(Ipv4Addr::new(10, 0, 0, 99));
        assert!(matches!(
            route(&packet, &peers()),
            Err(TunnelError::PeerNotFound(addr)) if addr == IpAddr::V4(Ipv4Addr::new(10, 0, 0, 99))
        ));
    }

    #[test]
    fn framed_packet_routes_by_inner_destination() {
        let mut frame = vec![0x00, 0x00, 0x08, 0x00];
        frame.extend_from_slice(&ipv4_packet(Ipv4Addr::new(10, 0, 0, 2)));
        let packet = strip_framing(&frame, 4).unwrap();
        assert_eq!(packet[0], 0x45);
        assert!(matches!(
            route(packet, &peers()).unwrap(),
            Route::Forward(IpVersion::V4, _)
        ));
        assert_eq!(strip_framing(&frame[..3], 4), None);
        assert_eq!(strip_framing(&frame, 0), Some(&frame[..]));
    }
}
