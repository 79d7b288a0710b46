use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use super::{
    write_ipv4_header, write_ipv6_header, Checksum, IpError, TransportProtocolType,
    IPV4_HEADER_LENGTH, IPV6_HEADER_LENGTH,
};

pub const ICMP_HEADER_LENGTH: usize = 8;
// RFC 792 asks for the IP header plus 64 bits of the original datagram; the kernel only
// returns the UDP payload, so these are the first 8 bytes of the tunneled packet.
pub const ORIGINAL_DATAGRAM_LENGTH: usize = 8;
pub const FORGED_ICMPV4_LENGTH: usize =
    IPV4_HEADER_LENGTH + ICMP_HEADER_LENGTH + ORIGINAL_DATAGRAM_LENGTH;
pub const FORGED_ICMPV6_LENGTH: usize =
    IPV6_HEADER_LENGTH + ICMP_HEADER_LENGTH + ORIGINAL_DATAGRAM_LENGTH;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
enum IcmpV4 {
    EchoReply,
    DestinationUnreachable(IcmpV4DestinationUnreachable),
    SourceQuench,
    Redirect,
    EchoRequest,
    TimeExceeded(IcmpV4TimeExceeded),
    ParameterProblem(u8),
    Unknown(u8, u8),
}

impl IcmpV4 {
    const DESTINATION_UNREACHABLE: u8 = 3;
    const CODE_FRAGMENTATION_NEEDED: u8 = 4;

    fn from_type_code(icmp_type: u8, code: u8) -> IcmpV4 {
        match icmp_type {
            0 => IcmpV4::EchoReply,
            3 => IcmpV4::DestinationUnreachable(IcmpV4DestinationUnreachable(code)),
            4 => IcmpV4::SourceQuench,
            5 => IcmpV4::Redirect,
            8 => IcmpV4::EchoRequest,
            11 => IcmpV4::TimeExceeded(IcmpV4TimeExceeded(code)),
            12 => IcmpV4::ParameterProblem(code),
            icmp_type => IcmpV4::Unknown(icmp_type, code),
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
struct IcmpV4DestinationUnreachable(u8);

impl fmt::Display for IcmpV4DestinationUnreachable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            0 => f.write_str("Destination network unreachable"),
            1 => f.write_str("Destination host unreachable"),
            2 => f.write_str("Destination protocol unreachable"),
            3 => f.write_str("Destination port unreachable"),
            4 => f.write_str("Fragmentation required, and DF flag set"),
            5 => f.write_str("Source route failed"),
            6 => f.write_str("Destination network unknown"),
            7 => f.write_str("Destination host unknown"),
            8 => f.write_str("Source host isolated"),
            9 => f.write_str("Network administratively prohibited"),
            10 => f.write_str("Host administratively prohibited"),
            11 => f.write_str("Network unreachable for ToS"),
            12 => f.write_str("Host unreachable for ToS"),
            13 => f.write_str("Communication administratively prohibited"),
            other => write!(f, "{other}"),
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
struct IcmpV4TimeExceeded(u8);

impl fmt::Display for IcmpV4TimeExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            0 => f.write_str("Time to live (TTL) expired in transit"),
            1 => f.write_str("Fragment reassembly time exceeded"),
            other => write!(f, "{other}"),
        }
    }
}

impl fmt::Display for IcmpV4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IcmpV4::EchoReply => write!(f, "Echo Reply"),
            IcmpV4::DestinationUnreachable(code) => write!(f, "Destination Unreachable ({code})"),
            IcmpV4::SourceQuench => write!(f, "Source Quench"),
            IcmpV4::Redirect => write!(f, "Redirect"),
            IcmpV4::EchoRequest => write!(f, "Echo Request"),
            IcmpV4::TimeExceeded(code) => write!(f, "Time Exceeded ({code})"),
            IcmpV4::ParameterProblem(code) => write!(f, "Parameter Problem ({code})"),
            IcmpV4::Unknown(t, code) => write!(f, "{t} ({code})"),
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
enum IcmpV6 {
    DestinationUnreachable(IcmpV6DestinationUnreachable),
    PacketTooBig,
    TimeExceeded(u8),
    ParameterProblem(u8),
    EchoRequest,
    EchoReply,
    Unknown(u8, u8),
}

impl IcmpV6 {
    const PACKET_TOO_BIG: u8 = 2;

    fn from_type_code(icmp_type: u8, code: u8) -> IcmpV6 {
        match icmp_type {
            1 => IcmpV6::DestinationUnreachable(IcmpV6DestinationUnreachable(code)),
            2 => IcmpV6::PacketTooBig,
            3 => IcmpV6::TimeExceeded(code),
            4 => IcmpV6::ParameterProblem(code),
            128 => IcmpV6::EchoRequest,
            129 => IcmpV6::EchoReply,
            icmp_type => IcmpV6::Unknown(icmp_type, code),
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
struct IcmpV6DestinationUnreachable(u8);

impl fmt::Display for IcmpV6DestinationUnreachable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            0 => f.write_str("No route to destination"),
            1 => f.write_str("Communication with destination administratively prohibited"),
            2 => f.write_str("Beyond scope of source address"),
            3 => f.write_str("Address unreachable"),
            4 => f.write_str("Port unreachable"),
            5 => f.write_str("Source address failed ingress/egress policy"),
            6 => f.write_str("Reject route to destination"),
            other => write!(f, "{other}"),
        }
    }
}

impl fmt::Display for IcmpV6 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IcmpV6::DestinationUnreachable(code) => write!(f, "Destination Unreachable ({code})"),
            IcmpV6::PacketTooBig => write!(f, "Packet Too Big"),
            IcmpV6::TimeExceeded(code) => write!(f, "Time Exceeded ({code})"),
            IcmpV6::ParameterProblem(code) => write!(f, "Parameter Problem ({code})"),
            IcmpV6::EchoRequest => write!(f, "Echo Request"),
            IcmpV6::EchoReply => write!(f, "Echo Reply"),
            IcmpV6::Unknown(t, code) => write!(f, "{t} ({code})"),
        }
    }
}

/// An ICMP error reported by the kernel for a datagram this endpoint sent earlier.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct IcmpError {
    pub icmp_type: u8,
    pub code: u8,
    // Next-hop MTU for "fragmentation needed" and "packet too big".
    pub info: u32,
    pub offender: IpAddr,
}

impl IcmpError {
    /// Rebuilds the ICMP message as a packet from the offender to `dst_addr`, so that the
    /// tunnel-side sender observes the failure. Returns the number of bytes written to `dest`.
    pub fn write_forged_packet(
        &self,
        original_datagram: &[u8],
        dst_addr: IpAddr,
        dest: &mut [u8],
    ) -> Result<usize, IpError> {
        if original_datagram.len() < ORIGINAL_DATAGRAM_LENGTH {
            return Err("Not enough original datagram data to rebuild ICMP message".into());
        }
        let original_datagram = &original_datagram[..ORIGINAL_DATAGRAM_LENGTH];
        match (self.offender, dst_addr) {
            (IpAddr::V4(src_addr), IpAddr::V4(dst_addr)) => {
                self.write_forged_ipv4(original_datagram, src_addr, dst_addr, dest)
            }
            (IpAddr::V6(src_addr), IpAddr::V6(dst_addr)) => {
                self.write_forged_ipv6(original_datagram, src_addr, dst_addr, dest)
            }
            _ => Err("ICMP offender and tunnel address families don't match".into()),
        }
    }

    fn write_icmp_header(&self, icmp_data: &mut [u8]) {
        icmp_data[0] = self.icmp_type;
        icmp_data[1] = self.code;
        icmp_data[2..8].fill(0);
    }

    fn write_forged_ipv4(
        &self,
        original_datagram: &[u8],
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        dest: &mut [u8],
    ) -> Result<usize, IpError> {
        if dest.len() < FORGED_ICMPV4_LENGTH {
            return Err("Not enough space for forged ICMPv4 packet".into());
        }
        let (ip_header, icmp_data) =
            dest[..FORGED_ICMPV4_LENGTH].split_at_mut(IPV4_HEADER_LENGTH);
        self.write_icmp_header(icmp_data);
        if self.icmp_type == IcmpV4::DESTINATION_UNREACHABLE
            && self.code == IcmpV4::CODE_FRAGMENTATION_NEEDED
        {
            // RFC 1191 next-hop MTU.
            let mtu = self.info.min(u16::MAX as u32) as u16;
            icmp_data[6..8].copy_from_slice(&mtu.to_be_bytes());
        }
        icmp_data[ICMP_HEADER_LENGTH..].copy_from_slice(original_datagram);

        // ICMPv4 checksum doesn't include a pseudo-header.
        let mut checksum = Checksum::new();
        checksum.add_slice(icmp_data);
        checksum.fold();
        icmp_data[2..4].copy_from_slice(&checksum.value().to_be_bytes());

        let icmp_length = icmp_data.len();
        write_ipv4_header(
            ip_header,
            src_addr,
            dst_addr,
            TransportProtocolType::ICMP,
            icmp_length,
        )?;
        Ok(FORGED_ICMPV4_LENGTH)
    }

    fn write_forged_ipv6(
        &self,
        original_datagram: &[u8],
        src_addr: Ipv6Addr,
        dst_addr: Ipv6Addr,
        dest: &mut [u8],
    ) -> Result<usize, IpError> {
        if dest.len() < FORGED_ICMPV6_LENGTH {
            return Err("Not enough space for forged ICMPv6 packet".into());
        }
        let (ip_header, icmp_data) =
            dest[..FORGED_ICMPV6_LENGTH].split_at_mut(IPV6_HEADER_LENGTH);
        self.write_icmp_header(icmp_data);
        if self.icmp_type == IcmpV6::PACKET_TOO_BIG {
            icmp_data[4..8].copy_from_slice(&self.info.to_be_bytes());
        }
        icmp_data[ICMP_HEADER_LENGTH..].copy_from_slice(original_datagram);

        let icmp_length = icmp_data.len();
        let mut checksum = Checksum::ipv6_pseudo_header(
            src_addr,
            dst_addr,
            TransportProtocolType::IPV6_ICMP,
            icmp_length,
        );
        checksum.add_slice(icmp_data);
        checksum.fold();
        icmp_data[2..4].copy_from_slice(&checksum.value().to_be_bytes());

        write_ipv6_header(
            ip_header,
            src_addr,
            dst_addr,
            TransportProtocolType::IPV6_ICMP,
            icmp_length,
        )?;
        Ok(FORGED_ICMPV6_LENGTH)
    }
}

impl fmt::Display for IcmpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.offender {
            IpAddr::V4(offender) => write!(
                f,
                "ICMPv4 {} from {}",
                IcmpV4::from_type_code(self.icmp_type, self.code),
                offender
            ),
            IpAddr::V6(offender) => write!(
                f,
                "ICMPv6 {} from {}",
                IcmpV6::from_type_code(self.icmp_type, self.code),
                offender
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::{checksum, Ipv4Header};

    const FRAGMENT: [u8; 8] = [0x45, 0x00, 0x00, 0x54, 0x12, 0x34, 0x40, 0x00];

    fn host_unreachable() -> IcmpError {
        IcmpError {
            icmp_type: 3,
            code: 1,
            info: 0,
            offender: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)),
        }
    }

    #[test]
    fn forged_ipv4_packet_shape() {
        let mut dest = [0u8; 64];
        let private_addr = Ipv4Addr::new(10, 0, 0, 2);
        let length = host_unreachable()
            .write_forged_packet(&FRAGMENT, IpAddr::V4(private_addr), &mut dest)
            .unwrap();
        assert_eq!(length, 36);
        let packet = &dest[..length];
        assert_eq!(&packet[12..16], &[203, 0, 113, 7]);
        assert_eq!(&packet[16..20], &private_addr.octets());
        assert_eq!(packet[20], 3);
        assert_eq!(packet[21], 1);
        assert_eq!(&packet[24..28], &[0, 0, 0, 0]);
        assert_eq!(&packet[28..36], &FRAGMENT);
    }

    #[test]
    fn forged_ipv4_checksums_are_valid() {
        let mut dest = [0u8; FORGED_ICMPV4_LENGTH];
        host_unreachable()
            .write_forged_packet(
                &FRAGMENT,
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                &mut dest,
            )
            .unwrap();
        assert_eq!(checksum(&dest[..IPV4_HEADER_LENGTH]), 0x0000);
        assert_eq!(checksum(&dest[IPV4_HEADER_LENGTH..]), 0x0000);
        let header = Ipv4Header::from_data(&dest).unwrap();
        assert!(header.validate_checksum());
        assert_eq!(header.transport_protocol(), TransportProtocolType::ICMP);
        assert_eq!(&dest[2..4], &36u16.to_be_bytes());
    }

    #[test]
    fn forged_ipv4_uses_only_first_original_bytes() {
        let mut original = [0u8; 28];
        original[..8].copy_from_slice(&FRAGMENT);
        original[8..].fill(0xEE);
        let mut dest = [0u8; 40];
        let length = host_unreachable()
            .write_forged_packet(&original, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), &mut dest)
            .unwrap();
        assert_eq!(length, FORGED_ICMPV4_LENGTH);
        assert_eq!(&dest[28..36], &FRAGMENT);
        assert_eq!(&dest[36..], &[0, 0, 0, 0]);
    }

    #[test]
    fn forged_ipv4_fragmentation_needed_carries_mtu() {
        let error = IcmpError {
            icmp_type: 3,
            code: 4,
            info: 1400,
            offender: IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)),
        };
        let mut dest = [0u8; FORGED_ICMPV4_LENGTH];
        error
            .write_forged_packet(&FRAGMENT, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), &mut dest)
            .unwrap();
        assert_eq!(&dest[26..28], &1400u16.to_be_bytes());
        assert_eq!(checksum(&dest[IPV4_HEADER_LENGTH..]), 0x0000);
    }

    #[test]
    fn forged_ipv6_packet_shape() {
        let offender = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 7);
        let private_addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2);
        let error = IcmpError {
            icmp_type: 2,
            code: 0,
            info: 1280,
            offender: IpAddr::V6(offender),
        };
        let mut dest = [0u8; 64];
        let length = error
            .write_forged_packet(&FRAGMENT, IpAddr::V6(private_addr), &mut dest)
            .unwrap();
        assert_eq!(length, 56);
        assert_eq!(dest[0] >> 4, 6);
        assert_eq!(&dest[4..6], &16u16.to_be_bytes());
        assert_eq!(dest[6], 58);
        assert_eq!(&dest[8..24], &offender.octets());
        assert_eq!(&dest[24..40], &private_addr.octets());
        assert_eq!(dest[40], 2);
        assert_eq!(&dest[44..48], &1280u32.to_be_bytes());
        assert_eq!(&dest[48..56], &FRAGMENT);

        let mut verify = Checksum::ipv6_pseudo_header(
            offender,
            private_addr,
            TransportProtocolType::IPV6_ICMP,
            16,
        );
        verify.add_slice(&dest[40..56]);
        verify.fold();
        assert_eq!(verify.value(), 0x0000);
    }

    #[test]
    fn forge_rejects_short_fragment_and_family_mismatch() {
        let mut dest = [0u8; 64];
        assert!(host_unreachable()
            .write_forged_packet(&FRAGMENT[..7], IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), &mut dest)
            .is_err());
        assert!(host_unreachable()
            .write_forged_packet(&FRAGMENT, IpAddr::V6(Ipv6Addr::LOCALHOST), &mut dest)
            .is_err());
        assert!(host_unreachable()
            .write_forged_packet(
                &FRAGMENT,
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                &mut dest[..35]
            )
            .is_err());
    }

    #[test]
    fn display_names_icmp_type() {
        assert_eq!(
            host_unreachable().to_string(),
            "ICMPv4 Destination Unreachable (Destination host unreachable) from 203.0.113.7"
        );
        let error = IcmpError {
            icmp_type: 1,
            code: 4,
            info: 0,
            offender: IpAddr::V6(Ipv6Addr::LOCALHOST),
        };
        assert_eq!(
            error.to_string(),
            "ICMPv6 Destination Unreachable (Port unreachable) from ::1"
        );
    }
}
