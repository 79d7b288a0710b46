use std::{
    fmt, io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    os::fd::RawFd,
};

use crate::ip::{icmp::IcmpError, IpError};

// struct sock_extended_err from linux/errqueue.h.
const EXTENDED_ERROR_LENGTH: usize = 16;
const CONTROL_BUFFER_WORDS: usize = 64;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ErrorOrigin {
    None,
    Local,
    Icmp,
    Icmp6,
    Other(u8),
}

impl ErrorOrigin {
    fn from_u8(origin: u8) -> ErrorOrigin {
        match origin {
            0 => ErrorOrigin::None,
            1 => ErrorOrigin::Local,
            2 => ErrorOrigin::Icmp,
            3 => ErrorOrigin::Icmp6,
            origin => ErrorOrigin::Other(origin),
        }
    }
}

impl fmt::Display for ErrorOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorOrigin::None => f.write_str("none"),
            ErrorOrigin::Local => f.write_str("local"),
            ErrorOrigin::Icmp => f.write_str("ICMP"),
            ErrorOrigin::Icmp6 => f.write_str("ICMPv6"),
            ErrorOrigin::Other(origin) => write!(f, "unknown origin {origin}"),
        }
    }
}

/// Asynchronous delivery failure reported by the kernel through a socket's error queue.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct ExtendedSocketError {
    pub errno: u32,
    pub origin: ErrorOrigin,
    pub icmp_type: u8,
    pub icmp_code: u8,
    pub info: u32,
    pub offender: Option<IpAddr>,
}

impl ExtendedSocketError {
    /// Decodes the payload of an `IP_RECVERR` or `IPV6_RECVERR` control message: the
    /// extended error header in host byte order, followed by the offender's sockaddr.
    pub fn from_data(data: &[u8]) -> Result<ExtendedSocketError, IpError> {
        if data.len() < EXTENDED_ERROR_LENGTH {
            return Err("Not enough data in extended socket error".into());
        }
        let read_u32 = |offset: usize| {
            let mut value = [0u8; 4];
            value.copy_from_slice(&data[offset..offset + 4]);
            u32::from_ne_bytes(value)
        };
        Ok(ExtendedSocketError {
            errno: read_u32(0),
            origin: ErrorOrigin::from_u8(data[4]),
            icmp_type: data[5],
            icmp_code: data[6],
            info: read_u32(8),
            offender: Self::decode_offender(&data[EXTENDED_ERROR_LENGTH..]),
        })
    }

    fn decode_offender(sockaddr: &[u8]) -> Option<IpAddr> {
        if sockaddr.len() < 2 {
            return None;
        }
        let family = u16::from_ne_bytes([sockaddr[0], sockaddr[1]]) as libc::c_int;
        if family == libc::AF_INET && sockaddr.len() >= 8 {
            let mut addr = [0u8; 4];
            addr.copy_from_slice(&sockaddr[4..8]);
            Some(IpAddr::V4(Ipv4Addr::from(addr)))
        } else if family == libc::AF_INET6 && sockaddr.len() >= 24 {
            let mut addr = [0u8; 16];
            addr.copy_from_slice(&sockaddr[8..24]);
            Some(IpAddr::V6(Ipv6Addr::from(addr)))
        } else {
            None
        }
    }

    /// Returns the ICMP message carried by this error, if it was caused by one.
    pub fn icmp_error(&self) -> Option<IcmpError> {
        match self.origin {
            ErrorOrigin::Icmp | ErrorOrigin::Icmp6 => Some(IcmpError {
                icmp_type: self.icmp_type,
                code: self.icmp_code,
                info: self.info,
                offender: self.offender?,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for ExtendedSocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} error (type {} code {}): {}",
            self.origin,
            self.icmp_type,
            self.icmp_code,
            io::Error::from_raw_os_error(self.errno as i32)
        )?;
        if let Some(offender) = self.offender {
            write!(f, " from {offender}")?;
        }
        Ok(())
    }
}

/// Reads one entry from the socket's error queue without blocking.
/// The leading bytes of the failed datagram are copied into `buf`, and their length is
/// returned together with the decoded error. Fails with `WouldBlock` if the queue is empty.
pub fn recv_error(fd: RawFd, buf: &mut [u8]) -> Result<(ExtendedSocketError, usize), io::Error> {
    // u64 words keep the control buffer aligned for cmsghdr.
    let mut control = [0u64; CONTROL_BUFFER_WORDS];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = std::ptr::from_mut(&mut iov);
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = std::mem::size_of_val(&control) as _;

    let received = unsafe {
        libc::recvmsg(
            fd,
            std::ptr::from_mut(&mut msg),
            libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT,
        )
    };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }
    let received = (received as usize).min(buf.len());

    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(std::ptr::from_ref(&msg)) };
    while !cmsg.is_null() {
        let (level, cmsg_type, cmsg_len) =
            unsafe { ((*cmsg).cmsg_level, (*cmsg).cmsg_type, (*cmsg).cmsg_len as usize) };
        if (level == libc::SOL_IP && cmsg_type == libc::IP_RECVERR)
            || (level == libc::SOL_IPV6 && cmsg_type == libc::IPV6_RECVERR)
        {
            let data = unsafe {
                let data_ptr = libc::CMSG_DATA(cmsg);
                let header_length = data_ptr as usize - cmsg as usize;
                std::slice::from_raw_parts(
                    data_ptr as *const u8,
                    cmsg_len.saturating_sub(header_length),
                )
            };
            return match ExtendedSocketError::from_data(data) {
                Ok(err) => Ok((err, received)),
                Err(err) => Err(io::Error::new(io::ErrorKind::InvalidData, err)),
            };
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(std::ptr::from_ref(&msg), cmsg) };
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "Error queue message has no extended error",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extended_error_data(origin: u8, icmp_type: u8, code: u8, offender: &[u8]) -> Vec<u8> {
        let mut data = vec![];
        data.extend_from_slice(&(libc::EHOSTUNREACH as u32).to_ne_bytes());
        data.extend_from_slice(&[origin, icmp_type, code, 0]);
        data.extend_from_slice(&0u32.to_ne_bytes());
        data.extend_from_slice(&0u32.to_ne_bytes());
        data.extend_from_slice(offender);
        data
    }

    fn sockaddr_in(addr: Ipv4Addr) -> Vec<u8> {
        let mut sockaddr = vec![0u8; 16];
        sockaddr[0..2].copy_from_slice(&(libc::AF_INET as u16).to_ne_bytes());
        sockaddr[4..8].copy_from_slice(&addr.octets());
        sockaddr
    }

    #[test]
    fn decode_icmp_host_unreachable() {
        let data = extended_error_data(2, 3, 1, &sockaddr_in(Ipv4Addr::new(203, 0, 113, 7)));
        let err = ExtendedSocketError::from_data(&data).unwrap();
        assert_eq!(err.errno, libc::EHOSTUNREACH as u32);
        assert_eq!(err.origin, ErrorOrigin::Icmp);
        assert_eq!(err.icmp_type, 3);
        assert_eq!(err.icmp_code, 1);
        assert_eq!(
            err.offender,
            Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)))
        );
        let icmp = err.icmp_error().unwrap();
        assert_eq!(icmp.icmp_type, 3);
        assert_eq!(icmp.code, 1);
        assert_eq!(icmp.offender, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)));
    }

    #[test]
    fn decode_icmp6_offender() {
        let offender = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        let mut sockaddr = vec![0u8; 28];
        sockaddr[0..2].copy_from_slice(&(libc::AF_INET6 as u16).to_ne_bytes());
        sockaddr[8..24].copy_from_slice(&offender.octets());
        let mut data = extended_error_data(3, 1, 4, &sockaddr);
        data[8..12].copy_from_slice(&1280u32.to_ne_bytes());
        let err = ExtendedSocketError::from_data(&data).unwrap();
        assert_eq!(err.origin, ErrorOrigin::Icmp6);
        assert_eq!(err.info, 1280);
        assert_eq!(err.offender, Some(IpAddr::V6(offender)));
        assert!(err.icmp_error().is_some());
    }

    #[test]
    fn local_origin_is_not_icmp() {
        let data = extended_error_data(1, 0, 0, &[0u8; 16]);
        let err = ExtendedSocketError::from_data(&data).unwrap();
        assert_eq!(err.origin, ErrorOrigin::Local);
        assert_eq!(err.offender, None);
        assert!(err.icmp_error().is_none());
    }

    #[test]
    fn icmp_origin_without_offender_is_skipped() {
        let data = extended_error_data(2, 3, 1, &[]);
        let err = ExtendedSocketError::from_data(&data).unwrap();
        assert_eq!(err.offender, None);
        assert!(err.icmp_error().is_none());
    }

    #[test]
    fn reject_short_extended_error() {
        assert!(ExtendedSocketError::from_data(&[0u8; 15]).is_err());
    }
}
