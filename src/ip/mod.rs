use std::{
    error, fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

pub mod icmp;

pub const IPV4_HEADER_LENGTH: usize = 20;
pub const IPV6_HEADER_LENGTH: usize = 40;
// Packet information header used by tunnel devices opened without IFF_NO_PI.
pub const FRAMING_HEADER_LENGTH: usize = 4;

const DEFAULT_HOP_LIMIT: u8 = 255;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TransportProtocolType(u8);

impl TransportProtocolType {
    pub const ICMP: TransportProtocolType = TransportProtocolType(1);
    pub const TCP: TransportProtocolType = TransportProtocolType(6);
    pub const UDP: TransportProtocolType = TransportProtocolType(17);
    pub const IPV6_ICMP: TransportProtocolType = TransportProtocolType(58);

    pub fn from_u8(value: u8) -> TransportProtocolType {
        TransportProtocolType(value)
    }

    pub fn to_u8(self) -> u8 {
        self.0
    }
}

impl fmt::Display for TransportProtocolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::ICMP => write!(f, "ICMP"),
            Self::TCP => write!(f, "TCP"),
            Self::UDP => write!(f, "UDP"),
            Self::IPV6_ICMP => write!(f, "IPv6-ICMP"),
            _ => write!(f, "Unknown IP transport protocol {}", self.0),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IpVersion {
    V4,
    V6,
    Unknown(u8),
}

impl IpVersion {
    const ETHER_TYPE_IPV4: u16 = 0x0800;
    const ETHER_TYPE_IPV6: u16 = 0x86DD;

    /// Reads the version nibble from the first byte of an IP packet.
    pub fn from_data(data: &[u8]) -> Option<IpVersion> {
        let version = data.first()? >> 4;
        Some(match version {
            4 => IpVersion::V4,
            6 => IpVersion::V6,
            version => IpVersion::Unknown(version),
        })
    }

    pub fn of_addr(addr: &IpAddr) -> IpVersion {
        match addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    fn ether_type(&self) -> u16 {
        match self {
            IpVersion::V4 => Self::ETHER_TYPE_IPV4,
            IpVersion::V6 => Self::ETHER_TYPE_IPV6,
            IpVersion::Unknown(_) => 0,
        }
    }

    /// Writes the 4-byte framing header (flags, EtherType) that precedes every packet on a
    /// tunnel device opened with packet information enabled.
    pub fn write_framing_header(&self, dest: &mut [u8]) -> Result<(), IpError> {
        if dest.len() < FRAMING_HEADER_LENGTH {
            return Err("Not enough space for framing header".into());
        }
        dest[0..2].fill(0);
        dest[2..4].copy_from_slice(&self.ether_type().to_be_bytes());
        Ok(())
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpVersion::V4 => f.write_str("IPv4"),
            IpVersion::V6 => f.write_str("IPv6"),
            IpVersion::Unknown(version) => write!(f, "Unknown IP version {version}"),
        }
    }
}

pub struct Ipv4Header<'a>(&'a [u8]);

impl Ipv4Header<'_> {
    pub fn from_data(data: &[u8]) -> Result<Ipv4Header<'_>, IpError> {
        if data.len() < IPV4_HEADER_LENGTH {
            return Err("Not enough bytes in IPv4 header".into());
        }
        Ok(Ipv4Header(data))
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        let mut src_addr = [0u8; 4];
        src_addr.copy_from_slice(&self.0[12..16]);
        Ipv4Addr::from(src_addr)
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        let mut dst_addr = [0u8; 4];
        dst_addr.copy_from_slice(&self.0[16..20]);
        Ipv4Addr::from(dst_addr)
    }

    pub fn transport_protocol(&self) -> TransportProtocolType {
        TransportProtocolType::from_u8(self.0[9])
    }

    #[cfg(test)]
    fn validate_checksum(&self) -> bool {
        let header_length =
            ((self.0[0] & 0x0f) as usize * 4).clamp(IPV4_HEADER_LENGTH, self.0.len());
        let mut checksum = Checksum::new();
        checksum.add_slice(&self.0[..header_length]);
        checksum.fold();
        checksum.value() == 0x0000
    }
}

pub struct Ipv6Header<'a>(&'a [u8]);

impl Ipv6Header<'_> {
    pub fn from_data(data: &[u8]) -> Result<Ipv6Header<'_>, IpError> {
        if data.len() < IPV6_HEADER_LENGTH {
            return Err("Not enough bytes in IPv6 header".into());
        }
        Ok(Ipv6Header(data))
    }

    pub fn src_addr(&self) -> Ipv6Addr {
        let mut src_addr = [0u8; 16];
        src_addr.copy_from_slice(&self.0[8..24]);
        Ipv6Addr::from(src_addr)
    }

    pub fn dst_addr(&self) -> Ipv6Addr {
        let mut dst_addr = [0u8; 16];
        dst_addr.copy_from_slice(&self.0[24..40]);
        Ipv6Addr::from(dst_addr)
    }

    pub fn next_header(&self) -> TransportProtocolType {
        TransportProtocolType::from_u8(self.0[6])
    }
}

pub enum IpHeader<'a> {
    V4(Ipv4Header<'a>),
    V6(Ipv6Header<'a>),
}

impl IpHeader<'_> {
    pub fn from_data(data: &[u8]) -> Result<IpHeader<'_>, IpError> {
        match IpVersion::from_data(data) {
            Some(IpVersion::V4) => Ok(IpHeader::V4(Ipv4Header::from_data(data)?)),
            Some(IpVersion::V6) => Ok(IpHeader::V6(Ipv6Header::from_data(data)?)),
            Some(IpVersion::Unknown(version)) => Err(IpError::UnsupportedVersion(version)),
            None => Err("Packet is empty".into()),
        }
    }

    pub fn dst_addr(&self) -> IpAddr {
        match self {
            IpHeader::V4(header) => IpAddr::V4(header.dst_addr()),
            IpHeader::V6(header) => IpAddr::V6(header.dst_addr()),
        }
    }
}

impl fmt::Display for IpHeader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpHeader::V4(header) => write!(
                f,
                "IPv4 {} {} -> {}",
                header.transport_protocol(),
                header.src_addr(),
                header.dst_addr()
            ),
            IpHeader::V6(header) => write!(
                f,
                "IPv6 {} {} -> {}",
                header.next_header(),
                header.src_addr(),
                header.dst_addr()
            ),
        }
    }
}

/// Writes an option-less IPv4 header into `dest[..20]`, including its checksum.
pub fn write_ipv4_header(
    dest: &mut [u8],
    src_addr: Ipv4Addr,
    dst_addr: Ipv4Addr,
    protocol: TransportProtocolType,
    payload_length: usize,
) -> Result<usize, IpError> {
    if dest.len() < IPV4_HEADER_LENGTH {
        return Err("Not enough space for IPv4 header".into());
    }
    let total_length = IPV4_HEADER_LENGTH + payload_length;
    let total_length: u16 = match total_length.try_into() {
        Ok(total_length) => total_length,
        Err(_) => return Err("IPv4 total length overflow".into()),
    };
    let header = &mut dest[..IPV4_HEADER_LENGTH];
    header[0] = (4 << 4) | (IPV4_HEADER_LENGTH / 4) as u8;
    header[1] = 0;
    header[2..4].copy_from_slice(&total_length.to_be_bytes());
    // Identification, flags and fragment offset.
    header[4..8].fill(0);
    header[8] = DEFAULT_HOP_LIMIT;
    header[9] = protocol.to_u8();
    header[10..12].fill(0);
    header[12..16].copy_from_slice(&src_addr.octets());
    header[16..20].copy_from_slice(&dst_addr.octets());

    let checksum = checksum(header);
    header[10..12].copy_from_slice(&checksum.to_be_bytes());
    Ok(IPV4_HEADER_LENGTH)
}

/// Writes a fixed IPv6 header into `dest[..40]`; IPv6 has no header checksum.
pub fn write_ipv6_header(
    dest: &mut [u8],
    src_addr: Ipv6Addr,
    dst_addr: Ipv6Addr,
    next_header: TransportProtocolType,
    payload_length: usize,
) -> Result<usize, IpError> {
    if dest.len() < IPV6_HEADER_LENGTH {
        return Err("Not enough space for IPv6 header".into());
    }
    let payload_length: u16 = match payload_length.try_into() {
        Ok(payload_length) => payload_length,
        Err(_) => return Err("IPv6 payload length overflow".into()),
    };
    let header = &mut dest[..IPV6_HEADER_LENGTH];
    // Version, zero traffic class and flow label.
    header[0..4].copy_from_slice(&(6u32 << 28).to_be_bytes());
    header[4..6].copy_from_slice(&payload_length.to_be_bytes());
    header[6] = next_header.to_u8();
    header[7] = DEFAULT_HOP_LIMIT;
    header[8..24].copy_from_slice(&src_addr.octets());
    header[24..40].copy_from_slice(&dst_addr.octets());
    Ok(IPV6_HEADER_LENGTH)
}

/// Computes the RFC 1071 Internet checksum of `data`.
pub fn checksum(data: &[u8]) -> u16 {
    let mut checksum = Checksum::new();
    checksum.add_slice(data);
    checksum.fold();
    checksum.value()
}

pub(crate) struct Checksum(u32);

impl Checksum {
    pub fn new() -> Checksum {
        Checksum(0)
    }

    pub fn ipv6_pseudo_header(
        src_addr: Ipv6Addr,
        dst_addr: Ipv6Addr,
        next_header: TransportProtocolType,
        upper_layer_length: usize,
    ) -> Checksum {
        let mut checksum = Checksum::new();
        checksum.add_slice(&src_addr.octets());
        checksum.add_slice(&dst_addr.octets());
        checksum.add_slice(&(upper_layer_length as u32).to_be_bytes());
        checksum.add_slice(&[0u8, 0, 0, next_header.to_u8()]);
        checksum
    }

    #[inline]
    pub fn fold(&mut self) {
        let mut sum = self.0;
        // At most two folds are needed: 0xffff + 0xffff = 0x1fffe, 0x1 + 0xfffe = 0xffff.
        sum = (sum >> 16) + (sum & 0x0000ffffu32);
        sum = (sum >> 16) + (sum & 0x0000ffffu32);
        self.0 = sum;
    }

    pub fn add_slice(&mut self, add: &[u8]) {
        let mut iter = add.chunks_exact(2);
        let full_sum = iter
            .by_ref()
            .map(|bytes| ((bytes[0] as u32) << 8) | (bytes[1] as u32))
            .fold(0u32, |acc, word| {
                // Fold early so that large buffers can't overflow the accumulator.
                let acc = acc + word;
                (acc >> 16) + (acc & 0x0000ffff)
            });
        let remain_sum = match *iter.remainder() {
            [high] => (high as u32) << 8,
            _ => 0u32,
        };

        self.0 += full_sum + remain_sum;
        self.fold();
    }

    pub fn value(&self) -> u16 {
        // Must fold before calling!
        !((self.0 & 0x0000ffff) as u16)
    }
}

#[derive(Debug)]
pub enum IpError {
    Internal(&'static str),
    UnsupportedVersion(u8),
}

impl fmt::Display for IpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Internal(msg) => f.write_str(msg),
            Self::UnsupportedVersion(version) => write!(f, "Unsupported IP version {version}"),
        }
    }
}

impl error::Error for IpError {}

impl From<&'static str> for IpError {
    fn from(msg: &'static str) -> IpError {
        Self::Internal(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ipv4_header() -> [u8; IPV4_HEADER_LENGTH] {
        let mut header = [0u8; IPV4_HEADER_LENGTH];
        header[0] = 0x45;
        header[3] = 20;
        header[9] = 1;
        header
    }

    #[test]
    fn checksum_known_ipv4_header() {
        let header = sample_ipv4_header();
        // 0x4500 + 0x0014 + 0x0001 = 0x4515, complemented.
        assert_eq!(checksum(&header), 0xBAEA);
    }

    #[test]
    fn checksum_verifies_to_zero() {
        let mut header = sample_ipv4_header();
        header[8] = 64;
        header[12..16].copy_from_slice(&[192, 0, 2, 1]);
        header[16..20].copy_from_slice(&[198, 51, 100, 200]);
        let value = checksum(&header);
        header[10..12].copy_from_slice(&value.to_be_bytes());
        assert_eq!(checksum(&header), 0x0000);
        assert!(Ipv4Header::from_data(&header).unwrap().validate_checksum());
    }

    #[test]
    fn checksum_odd_length_pads_low_byte() {
        assert_eq!(checksum(&[0x01]), 0xFEFF);
        assert_eq!(checksum(&[0x12, 0x34, 0x56]), !0x6834u16);
    }

    #[test]
    fn checksum_carries_are_folded() {
        let data = [0xffu8; 64];
        assert_eq!(checksum(&data), 0x0000);
        assert_eq!(checksum(&[]), 0xFFFF);
    }

    #[test]
    fn write_ipv4_header_fields() {
        let mut dest = [0xAAu8; 32];
        let len = write_ipv4_header(
            &mut dest,
            Ipv4Addr::new(203, 0, 113, 7),
            Ipv4Addr::new(10, 0, 0, 1),
            TransportProtocolType::ICMP,
            16,
        )
        .unwrap();
        assert_eq!(len, IPV4_HEADER_LENGTH);
        assert_eq!(dest[0], 0x45);
        assert_eq!(&dest[2..4], &36u16.to_be_bytes());
        assert_eq!(dest[8], 255);
        assert_eq!(dest[9], 1);
        let header = Ipv4Header::from_data(&dest[..20]).unwrap();
        assert_eq!(header.src_addr(), Ipv4Addr::new(203, 0, 113, 7));
        assert_eq!(header.dst_addr(), Ipv4Addr::new(10, 0, 0, 1));
        assert!(header.validate_checksum());
        // Bytes after the header are left untouched.
        assert_eq!(dest[20], 0xAA);
    }

    #[test]
    fn write_ipv4_header_rejects_short_buffer() {
        let mut dest = [0u8; 19];
        assert!(write_ipv4_header(
            &mut dest,
            Ipv4Addr::LOCALHOST,
            Ipv4Addr::LOCALHOST,
            TransportProtocolType::ICMP,
            0,
        )
        .is_err());
    }

    #[test]
    fn classify_version_nibble() {
        assert_eq!(IpVersion::from_data(&[0x45]), Some(IpVersion::V4));
        assert_eq!(IpVersion::from_data(&[0x60]), Some(IpVersion::V6));
        assert_eq!(IpVersion::from_data(&[0x00]), Some(IpVersion::Unknown(0)));
        assert_eq!(IpVersion::from_data(&[]), None);
    }

    #[test]
    fn header_destinations() {
        let mut packet = [0u8; 40];
        packet[0] = 0x45;
        packet[16..20].copy_from_slice(&[10, 1, 2, 3]);
        let header = IpHeader::from_data(&packet).unwrap();
        assert_eq!(header.dst_addr(), IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)));

        let dst = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2);
        let mut packet = [0u8; 48];
        packet[0] = 0x60;
        packet[24..40].copy_from_slice(&dst.octets());
        let header = IpHeader::from_data(&packet).unwrap();
        assert_eq!(header.dst_addr(), IpAddr::V6(dst));

        assert!(matches!(
            IpHeader::from_data(&[0x45, 0, 0]),
            Err(IpError::Internal(_))
        ));
        assert!(matches!(
            IpHeader::from_data(&[0x00; 40]),
            Err(IpError::UnsupportedVersion(0))
        ));
    }

    #[test]
    fn framing_header_ether_types() {
        let mut dest = [0xffu8; 4];
        IpVersion::V4.write_framing_header(&mut dest).unwrap();
        assert_eq!(dest, [0x00, 0x00, 0x08, 0x00]);
        IpVersion::V6.write_framing_header(&mut dest).unwrap();
        assert_eq!(dest, [0x00, 0x00, 0x86, 0xDD]);
        assert!(IpVersion::V4.write_framing_header(&mut [0u8; 3]).is_err());
    }
}
