use std::{
    fmt,
    future::{self, Future},
    io,
    pin::{pin, Pin},
    task::Poll,
};

use log::{debug, info, trace, warn};
use tokio::{sync::oneshot, time};

use crate::demux::{self, Route};
use crate::device::TunnelDevice;
use crate::errqueue::ExtendedSocketError;
use crate::ip::{icmp, IpVersion, FRAMING_HEADER_LENGTH};
use crate::logger::fmt_slice_hex;
use crate::pcap;
use crate::socket::{DatagramSocket, Received};
use crate::tunnel::{TunnelError, TunnelState};

const MAX_PACKET_SIZE: usize = 2048;
// Anything this short is a keep-alive or probe, not a tunneled packet.
const MIN_DATAGRAM_SIZE: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LoopState {
    Init,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StopReason {
    IdleTimeout,
    Shutdown,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::IdleTimeout => f.write_str("idle timeout"),
            StopReason::Shutdown => f.write_str("shutdown requested"),
        }
    }
}

#[derive(Default)]
struct Events {
    shutdown_requested: bool,
    shutdown_closed: bool,
    tunnel: Option<Result<usize, io::Error>>,
    udp_v4: Option<Result<Received, io::Error>>,
    udp_v6: Option<Result<Received, io::Error>>,
}

impl Events {
    fn is_ready(&self) -> bool {
        self.shutdown_requested
            || self.shutdown_closed
            || self.tunnel.is_some()
            || self.udp_v4.is_some()
            || self.udp_v6.is_some()
    }
}

/// Moves packets between the tunnel device and the UDP sockets, one event per descriptor
/// per iteration, in tunnel, IPv4, IPv6 order.
pub struct Forwarder<'a, T, S> {
    state: &'a TunnelState,
    tunnel: T,
    udp_v4: Option<S>,
    udp_v6: Option<S>,
    capture: Option<pcap::PcapSender>,
    shutdown_receiver: Option<oneshot::Receiver<()>>,
    shutdown_requested: bool,
    loop_state: LoopState,
    tunnel_read_buffer: [u8; MAX_PACKET_SIZE],
    // Datagrams are received after FRAMING_HEADER_LENGTH bytes, to prepend framing in place.
    udp_v4_read_buffer: [u8; MAX_PACKET_SIZE],
    udp_v6_read_buffer: [u8; MAX_PACKET_SIZE],
    forged_buffer: [u8; FRAMING_HEADER_LENGTH + icmp::FORGED_ICMPV6_LENGTH],
}

impl<'a, T, S> Forwarder<'a, T, S>
where
    T: TunnelDevice,
    S: DatagramSocket,
{
    pub fn new(
        state: &'a TunnelState,
        tunnel: T,
        udp_v4: Option<S>,
        udp_v6: Option<S>,
        capture: Option<pcap::PcapSender>,
        shutdown_receiver: oneshot::Receiver<()>,
    ) -> Forwarder<'a, T, S> {
        Forwarder {
            state,
            tunnel,
            udp_v4,
            udp_v6,
            capture,
            shutdown_receiver: Some(shutdown_receiver),
            shutdown_requested: false,
            loop_state: LoopState::Init,
            tunnel_read_buffer: [0u8; MAX_PACKET_SIZE],
            udp_v4_read_buffer: [0u8; MAX_PACKET_SIZE],
            udp_v6_read_buffer: [0u8; MAX_PACKET_SIZE],
            forged_buffer: [0u8; FRAMING_HEADER_LENGTH + icmp::FORGED_ICMPV6_LENGTH],
        }
    }

    pub fn loop_state(&self) -> LoopState {
        self.loop_state
    }

    pub async fn run(&mut self) -> Result<StopReason, TunnelError> {
        self.loop_state = LoopState::Running;
        debug!("Forwarder is running in {} mode", self.state.mode());
        let result = self.run_loop().await;
        self.loop_state = LoopState::Stopped;
        result
    }

    async fn run_loop(&mut self) -> Result<StopReason, TunnelError> {
        loop {
            if self.shutdown_requested {
                self.loop_state = LoopState::ShuttingDown;
                let close_timeout = self.state.close_timeout();
                info!("Shutting down in {close_timeout:?}");
                // Let delayed acknowledgements drain instead of triggering ICMP errors.
                time::sleep(close_timeout).await;
                return Ok(StopReason::Shutdown);
            }
            let events = match self.wait_events().await {
                Some(events) => events,
                None => {
                    info!("No activity, stopping");
                    return Ok(StopReason::IdleTimeout);
                }
            };
            if events.shutdown_closed {
                warn!("Shutdown handler is gone, the tunnel can only stop when idle");
                self.shutdown_receiver = None;
            }
            self.shutdown_requested = events.shutdown_requested;

            if let Some(result) = events.tunnel {
                let length = result.map_err(TunnelError::TunnelRead)?;
                self.forward_from_tunnel(length).await?;
            }
            if let Some(result) = events.udp_v4 {
                let received = result.map_err(TunnelError::SocketRead)?;
                self.process_datagram(IpVersion::V4, received).await?;
            }
            if let Some(result) = events.udp_v6 {
                let received = result.map_err(TunnelError::SocketRead)?;
                self.process_datagram(IpVersion::V6, received).await?;
            }
        }
    }

    /// Waits until at least one descriptor is ready or shutdown is requested.
    /// Returns None if the idle timeout expired first.
    async fn wait_events(&mut self) -> Option<Events> {
        let idle_timeout = self.state.idle_timeout();
        let mut events = Events::default();
        let mut read_tunnel = pin!(self.tunnel.read_packet(&mut self.tunnel_read_buffer));
        let mut read_udp_v4 = pin!(recv_optional(
            self.udp_v4.as_mut(),
            &mut self.udp_v4_read_buffer[FRAMING_HEADER_LENGTH..]
        ));
        let mut read_udp_v6 = pin!(recv_optional(
            self.udp_v6.as_mut(),
            &mut self.udp_v6_read_buffer[FRAMING_HEADER_LENGTH..]
        ));
        let shutdown_receiver = &mut self.shutdown_receiver;
        let wait = future::poll_fn(|cx| {
            if !events.shutdown_requested && !events.shutdown_closed {
                if let Some(shutdown_receiver) = shutdown_receiver.as_mut() {
                    match Pin::new(shutdown_receiver).poll(cx) {
                        Poll::Ready(Ok(())) => events.shutdown_requested = true,
                        Poll::Ready(Err(_)) => events.shutdown_closed = true,
                        Poll::Pending => {}
                    }
                }
            }
            if events.tunnel.is_none() {
                if let Poll::Ready(result) = read_tunnel.as_mut().poll(cx) {
                    events.tunnel = Some(result);
                }
            }
            if events.udp_v4.is_none() {
                if let Poll::Ready(result) = read_udp_v4.as_mut().poll(cx) {
                    events.udp_v4 = Some(result);
                }
            }
            if events.udp_v6.is_none() {
                if let Poll::Ready(result) = read_udp_v6.as_mut().poll(cx) {
                    events.udp_v6 = Some(result);
                }
            }
            if events.is_ready() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        });
        match idle_timeout {
            Some(idle_timeout) => {
                if time::timeout(idle_timeout, wait).await.is_err() {
                    return None;
                }
            }
            None => wait.await,
        }
        Some(events)
    }

    async fn forward_from_tunnel(&mut self, length: usize) -> Result<(), TunnelError> {
        let frame = &self.tunnel_read_buffer[..length];
        trace!("Read {length} bytes from tunnel\n{}", fmt_slice_hex(frame));
        let packet = match demux::strip_framing(frame, self.state.framing_length()) {
            Some(packet) => packet,
            None => {
                debug!("Tunnel frame is shorter than its framing header");
                return Ok(());
            }
        };
        if let Some(capture) = &mut self.capture {
            capture.send_packet(packet);
        }
        // Foreign-family packets are dropped before the lookup, a miss there is fatal.
        let has_socket = match IpVersion::from_data(packet) {
            Some(IpVersion::V4) => self.udp_v4.is_some(),
            Some(IpVersion::V6) => self.udp_v6.is_some(),
            _ => true,
        };
        if !has_socket {
            debug!(
                "No socket for tunnel packet in {} mode, dropping\n{}",
                self.state.mode(),
                fmt_slice_hex(packet)
            );
            return Ok(());
        }
        let (version, peer_addr) = match demux::route(packet, self.state.peers())? {
            Route::Forward(version, peer_addr) => (version, peer_addr),
            Route::Drop => return Ok(()),
        };
        let socket = match version {
            IpVersion::V4 => self.udp_v4.as_mut(),
            IpVersion::V6 => self.udp_v6.as_mut(),
            IpVersion::Unknown(_) => None,
        };
        let socket = match socket {
            Some(socket) => socket,
            None => {
                debug!("No {version} socket, dropping packet to {peer_addr}");
                return Ok(());
            }
        };
        let sent = socket
            .send_to(packet, peer_addr)
            .await
            .map_err(TunnelError::SocketWrite)?;
        trace!("Sent {sent} bytes to {peer_addr}");
        Ok(())
    }

    async fn process_datagram(
        &mut self,
        version: IpVersion,
        received: Received,
    ) -> Result<(), TunnelError> {
        match received {
            Received::Datagram(length) => self.forward_to_tunnel(version, length).await,
            Received::Error(err, length) => self.reconstruct_error(version, err, length).await,
        }
    }

    async fn forward_to_tunnel(
        &mut self,
        version: IpVersion,
        length: usize,
    ) -> Result<(), TunnelError> {
        let buffer = match version {
            IpVersion::V6 => &mut self.udp_v6_read_buffer,
            _ => &mut self.udp_v4_read_buffer,
        };
        let payload_end = FRAMING_HEADER_LENGTH + length;
        if length <= MIN_DATAGRAM_SIZE {
            debug!(
                "Discarding {length}-byte {version} datagram\n{}",
                fmt_slice_hex(&buffer[FRAMING_HEADER_LENGTH..payload_end])
            );
            return Ok(());
        }
        trace!(
            "Received {length} bytes over {version}\n{}",
            fmt_slice_hex(&buffer[FRAMING_HEADER_LENGTH..payload_end])
        );
        // The tunnel device rejects anything that isn't IP, and a failed write is fatal.
        let payload = &buffer[FRAMING_HEADER_LENGTH..payload_end];
        let packet_version = match IpVersion::from_data(payload) {
            Some(packet_version @ (IpVersion::V4 | IpVersion::V6)) => packet_version,
            _ => {
                debug!(
                    "Discarding non-IP {version} datagram\n{}",
                    fmt_slice_hex(payload)
                );
                return Ok(());
            }
        };
        if let Some(capture) = &mut self.capture {
            capture.send_packet(&buffer[FRAMING_HEADER_LENGTH..payload_end]);
        }
        let framing_length = self.state.framing_length();
        let frame_start = FRAMING_HEADER_LENGTH - framing_length;
        if framing_length > 0 {
            packet_version.write_framing_header(&mut buffer[frame_start..])?;
        }
        let written = self
            .tunnel
            .write_packet(&buffer[frame_start..payload_end])
            .await
            .map_err(TunnelError::TunnelWrite)?;
        trace!("Wrote {written} bytes to tunnel");
        Ok(())
    }

    async fn reconstruct_error(
        &mut self,
        version: IpVersion,
        err: ExtendedSocketError,
        length: usize,
    ) -> Result<(), TunnelError> {
        let icmp_error = match err.icmp_error() {
            Some(icmp_error) => icmp_error,
            None => {
                debug!("Ignoring non-ICMP {version} socket error: {err}");
                return Ok(());
            }
        };
        debug!("Received {icmp_error}");
        let private_addr = match self.state.private_addr(version) {
            Some(private_addr) => private_addr,
            None => {
                debug!("No private {version} address to forward {icmp_error}");
                return Ok(());
            }
        };
        let original_datagram = match version {
            IpVersion::V6 => &self.udp_v6_read_buffer,
            _ => &self.udp_v4_read_buffer,
        };
        let original_datagram =
            &original_datagram[FRAMING_HEADER_LENGTH..FRAMING_HEADER_LENGTH + length];
        let packet_length = match icmp_error.write_forged_packet(
            original_datagram,
            private_addr,
            &mut self.forged_buffer[FRAMING_HEADER_LENGTH..],
        ) {
            Ok(packet_length) => packet_length,
            Err(err) => {
                warn!("Failed to rebuild {icmp_error}: {err}");
                return Ok(());
            }
        };
        let packet_end = FRAMING_HEADER_LENGTH + packet_length;
        if let Some(capture) = &mut self.capture {
            capture.send_packet(&self.forged_buffer[FRAMING_HEADER_LENGTH..packet_end]);
        }
        let framing_length = self.state.framing_length();
        let frame_start = FRAMING_HEADER_LENGTH - framing_length;
        if framing_length > 0 {
            IpVersion::of_addr(&private_addr)
                .write_framing_header(&mut self.forged_buffer[frame_start..])?;
        }
        trace!(
            "Writing rebuilt ICMP packet to tunnel\n{}",
            fmt_slice_hex(&self.forged_buffer[frame_start..packet_end])
        );
        self.tunnel
            .write_packet(&self.forged_buffer[frame_start..packet_end])
            .await
            .map_err(TunnelError::TunnelWrite)?;
        Ok(())
    }
}

async fn recv_optional<S: DatagramSocket>(
    socket: Option<&mut S>,
    buf: &mut [u8],
) -> Result<Received, io::Error> {
    match socket {
        Some(socket) => socket.recv(buf).await,
        None => future::pending().await,
    }
}
