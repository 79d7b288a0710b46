use std::{
    io,
    net::{IpAddr, SocketAddr},
    os::fd::AsRawFd as _,
};

use log::{debug, info, warn};
use tokio::io::{unix::AsyncFd, Interest, Ready};

use crate::errqueue::{self, ExtendedSocketError};

pub enum Received {
    Datagram(usize),
    // Extended error and the length of the original datagram fragment.
    Error(ExtendedSocketError, usize),
}

/// Public side of the tunnel: a UDP socket that also reports queued delivery errors.
pub trait DatagramSocket {
    async fn recv(&mut self, buf: &mut [u8]) -> Result<Received, io::Error>;
    async fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> Result<usize, io::Error>;
}

pub struct UdpEndpoint {
    socket: AsyncFd<socket2::Socket>,
    local_addr: SocketAddr,
}

impl UdpEndpoint {
    pub fn open(listen_ip: IpAddr, port: u16) -> Result<UdpEndpoint, io::Error> {
        let listen_addr = SocketAddr::new(listen_ip, port);
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(listen_addr),
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        match listen_ip {
            IpAddr::V4(_) => {
                Self::setsockopt_bool(&socket, libc::SOL_IP, libc::IP_RECVERR, true)?;
            }
            IpAddr::V6(_) => {
                socket.set_only_v6(true)?;
                Self::setsockopt_bool(&socket, libc::SOL_IPV6, libc::IPV6_RECVERR, true)?;
            }
        }
        socket.set_nonblocking(true)?;
        if let Err(err) = socket.bind(&listen_addr.into()) {
            log::error!("Failed to bind UDP socket to {listen_addr}: {err}");
            return Err(err);
        }
        let local_addr = match socket.local_addr()?.as_socket() {
            Some(local_addr) => local_addr,
            None => listen_addr,
        };
        info!("Listening on {local_addr}");

        let socket = AsyncFd::with_interest(
            socket,
            Interest::READABLE | Interest::WRITABLE | Interest::ERROR,
        )?;
        Ok(UdpEndpoint { socket, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn setsockopt_bool(
        socket: &socket2::Socket,
        level: libc::c_int,
        name: libc::c_int,
        value: bool,
    ) -> Result<(), io::Error> {
        let value = if value {
            1 as libc::c_int
        } else {
            0 as libc::c_int
        };
        match unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                level,
                name,
                std::ptr::from_ref(&value).cast(),
                std::mem::size_of_val(&value) as libc::socklen_t,
            )
        } {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }

    /// Receives one datagram, returning its full length even if it didn't fit into `buf`.
    fn recv_datagram(socket: &socket2::Socket, buf: &mut [u8]) -> Result<usize, io::Error> {
        let result = unsafe {
            libc::recv(
                socket.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                libc::MSG_DONTWAIT | libc::MSG_TRUNC,
            )
        };
        if result >= 0 {
            Ok(result as usize)
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn is_async_error(err: &io::Error) -> bool {
        matches!(
            err.raw_os_error(),
            Some(
                libc::ECONNREFUSED
                    | libc::EHOSTUNREACH
                    | libc::ENETUNREACH
                    | libc::EHOSTDOWN
                    | libc::ENETDOWN
                    | libc::EPROTO
            )
        )
    }
}

impl DatagramSocket for UdpEndpoint {
    async fn recv(&mut self, buf: &mut [u8]) -> Result<Received, io::Error> {
        loop {
            // The error queue only signals EPOLLERR, so wait for either condition.
            let mut guard = self
                .socket
                .ready(Interest::READABLE | Interest::ERROR)
                .await?;
            if guard.ready().is_error() {
                match errqueue::recv_error(self.socket.as_raw_fd(), buf) {
                    Ok((err, length)) => return Ok(Received::Error(err, length)),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        guard.clear_ready_matching(Ready::ERROR);
                    }
                    Err(err) => return Err(err),
                }
            }
            if !guard.ready().is_readable() {
                continue;
            }
            match guard.try_io(|socket| Self::recv_datagram(socket.get_ref(), buf)) {
                Ok(Ok(length)) if length > buf.len() => {
                    debug!(
                        "Dropping {length}-byte datagram, larger than {} byte buffer",
                        buf.len()
                    );
                    continue;
                }
                Ok(Ok(length)) => return Ok(Received::Datagram(length)),
                Ok(Err(err)) => {
                    // A pending error fails the next receive with its errno.
                    match errqueue::recv_error(self.socket.as_raw_fd(), buf) {
                        Ok((ext_err, length)) => {
                            debug!("Receive failed with {err}, error queue has {ext_err}");
                            return Ok(Received::Error(ext_err, length));
                        }
                        Err(_) => return Err(err),
                    }
                }
                Err(_would_block) => continue,
            }
        }
    }

    async fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> Result<usize, io::Error> {
        let addr = socket2::SockAddr::from(addr);
        let mut retried = false;
        loop {
            let mut guard = self.socket.writable().await?;
            match guard.try_io(|socket| socket.get_ref().send_to(buf, &addr)) {
                Ok(Ok(sent)) => return Ok(sent),
                Ok(Err(err)) if Self::is_async_error(&err) && !retried => {
                    // Reported for an earlier datagram; the error queue keeps the details.
                    warn!("Send to {} reported an earlier failure: {err}", self.local_addr);
                    retried = true;
                }
                Ok(Err(err)) => return Err(err),
                Err(_would_block) => continue,
            }
        }
    }
}
