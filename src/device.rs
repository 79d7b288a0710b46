use std::{
    ffi::CStr,
    io,
    os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd},
};

use log::{debug, info};
use tokio::io::unix::AsyncFd;

const TUN_DEVICE_PATH: &[u8] = b"/dev/net/tun\0";
// _IOW('T', 202, int) from linux/if_tun.h.
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// Source and sink of raw IP packets on the private side of the tunnel.
pub trait TunnelDevice {
    async fn read_packet(&mut self, buf: &mut [u8]) -> Result<usize, io::Error>;
    async fn write_packet(&mut self, data: &[u8]) -> Result<usize, io::Error>;
}

pub struct TunDevice {
    fd: AsyncFd<OwnedFd>,
    name: String,
}

impl TunDevice {
    /// Creates (or attaches to) a TUN interface. An empty name lets the kernel pick one.
    /// With `framing` enabled, every packet carries the 4-byte packet information header.
    pub fn open(name: &str, framing: bool) -> Result<TunDevice, io::Error> {
        let fd = unsafe {
            libc::open(
                TUN_DEVICE_PATH.as_ptr().cast(),
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            log::error!("Failed to open tunnel device: {err}");
            return Err(err);
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut flags = libc::IFF_TUN;
        if !framing {
            flags |= libc::IFF_NO_PI;
        }
        let mut ifreq = libc::ifreq {
            ifr_name: Self::ifr_name(name)?,
            ifr_ifru: libc::__c_anonymous_ifr_ifru {
                ifru_flags: flags as libc::c_short,
            },
        };
        if unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF as _, std::ptr::from_mut(&mut ifreq)) }
            < 0
        {
            let err = io::Error::last_os_error();
            log::error!("Failed to configure tunnel device {name}: {err}");
            return Err(err);
        }
        let name = unsafe { CStr::from_ptr(ifreq.ifr_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        info!("Opened tunnel device {name}");
        if framing {
            debug!("Tunnel device {name} uses packet information headers");
        }

        Ok(TunDevice {
            fd: AsyncFd::new(fd)?,
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn ifr_name(name: &str) -> Result<[libc::c_char; libc::IFNAMSIZ], io::Error> {
        let mut ifr_name = [0; libc::IFNAMSIZ];
        if name.as_bytes().contains(&0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Tunnel interface name contains a NUL byte",
            ));
        }
        // Reserve one byte for the terminating NUL.
        if name.len() >= ifr_name.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Tunnel interface name is too long",
            ));
        }
        ifr_name
            .iter_mut()
            .zip(name.as_bytes())
            .for_each(|(dst, src)| *dst = *src as libc::c_char);
        Ok(ifr_name)
    }
}

impl TunnelDevice for TunDevice {
    async fn read_packet(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|fd| {
                let result =
                    unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
                if result >= 0 {
                    Ok(result as usize)
                } else {
                    Err(io::Error::last_os_error())
                }
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_packet(&mut self, data: &[u8]) -> Result<usize, io::Error> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|fd| {
                let result =
                    unsafe { libc::write(fd.as_raw_fd(), data.as_ptr().cast(), data.len()) };
                if result >= 0 {
                    Ok(result as usize)
                } else {
                    Err(io::Error::last_os_error())
                }
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_name_fits_ifreq() {
        let ifr_name = TunDevice::ifr_name("tun0").unwrap();
        assert_eq!(ifr_name[0], b't' as libc::c_char);
        assert_eq!(ifr_name[3], b'0' as libc::c_char);
        assert!(ifr_name[4..].iter().all(|c| *c == 0));
        assert!(TunDevice::ifr_name("").unwrap().iter().all(|c| *c == 0));
    }

    #[test]
    fn interface_name_rejected() {
        assert!(TunDevice::ifr_name("a-very-long-name").is_err());
        assert!(TunDevice::ifr_name("tun\00").is_err());
    }
}
