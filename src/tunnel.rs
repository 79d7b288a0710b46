use std::{
    error, fmt, io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::Duration,
};

use log::{debug, info, warn};
use tokio::{runtime, sync::oneshot, time};

use crate::device::TunDevice;
use crate::forwarder::{Forwarder, StopReason};
use crate::ip::{self, IpVersion, FRAMING_HEADER_LENGTH};
use crate::peers::PeerTable;
use crate::pcap;
use crate::socket::UdpEndpoint;

pub struct Config {
    pub tun_name: String,
    pub private_ips: Vec<IpAddr>,
    pub listen_ips: Vec<IpAddr>,
    pub port: u16,
    pub peers: PeerTable,
    pub idle_timeout: Option<Duration>,
    pub close_timeout: Duration,
    pub initial_sleep: Duration,
    pub legacy_framing: bool,
    pub planetlab: bool,
    pub pcap_path: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    Ipv4,
    Ipv6,
    DualStack,
}

impl Mode {
    pub fn supports(&self, version: IpVersion) -> bool {
        matches!(
            (self, version),
            (Mode::Ipv4, IpVersion::V4)
                | (Mode::Ipv6, IpVersion::V6)
                | (Mode::DualStack, IpVersion::V4 | IpVersion::V6)
        )
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Ipv4 => f.write_str("IPv4"),
            Mode::Ipv6 => f.write_str("IPv6"),
            Mode::DualStack => f.write_str("dual-stack"),
        }
    }
}

/// Everything a running tunnel endpoint needs to know, fixed at startup.
pub struct TunnelState {
    mode: Mode,
    tun_name: String,
    private_v4: Option<Ipv4Addr>,
    private_v6: Option<Ipv6Addr>,
    listen_v4: Option<Ipv4Addr>,
    listen_v6: Option<Ipv6Addr>,
    port: u16,
    peers: PeerTable,
    idle_timeout: Option<Duration>,
    close_timeout: Duration,
    initial_sleep: Duration,
    legacy_framing: bool,
    planetlab: bool,
}

impl TunnelState {
    pub fn new(config: Config) -> Result<TunnelState, TunnelError> {
        let mut private_v4 = None;
        let mut private_v6 = None;
        for ip in config.private_ips {
            match ip {
                IpAddr::V4(ip) if private_v4.is_none() => private_v4 = Some(ip),
                IpAddr::V6(ip) if private_v6.is_none() => private_v6 = Some(ip),
                _ => return Err("Only one private address per IP version is supported".into()),
            }
        }
        let mut listen_v4 = None;
        let mut listen_v6 = None;
        for ip in config.listen_ips {
            match ip {
                IpAddr::V4(ip) if listen_v4.is_none() => listen_v4 = Some(ip),
                IpAddr::V6(ip) if listen_v6.is_none() => listen_v6 = Some(ip),
                _ => return Err("Only one listen address per IP version is supported".into()),
            }
        }
        let mode = match (listen_v4, listen_v6) {
            (Some(_), Some(_)) => Mode::DualStack,
            (Some(_), None) => Mode::Ipv4,
            (None, Some(_)) => Mode::Ipv6,
            (None, None) => return Err("No listen address specified".into()),
        };
        if mode.supports(IpVersion::V4) && private_v4.is_none() {
            warn!("No private IPv4 address configured, ICMP errors will not be forwarded");
        }
        if mode.supports(IpVersion::V6) && private_v6.is_none() {
            warn!("No private IPv6 address configured, ICMPv6 errors will not be forwarded");
        }
        if config.peers.is_empty() {
            warn!("Peer table is empty");
        }
        Ok(TunnelState {
            mode,
            tun_name: config.tun_name,
            private_v4,
            private_v6,
            listen_v4,
            listen_v6,
            port: config.port,
            peers: config.peers,
            idle_timeout: config.idle_timeout,
            close_timeout: config.close_timeout,
            initial_sleep: config.initial_sleep,
            legacy_framing: config.legacy_framing,
            planetlab: config.planetlab,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
    }

    /// Length of the header preceding every packet on the tunnel device.
    pub fn framing_length(&self) -> usize {
        // PlanetLab tunnel devices always carry packet information.
        if self.legacy_framing || self.planetlab {
            FRAMING_HEADER_LENGTH
        } else {
            0
        }
    }

    pub fn private_addr(&self, version: IpVersion) -> Option<IpAddr> {
        match version {
            IpVersion::V4 => self.private_v4.map(IpAddr::V4),
            IpVersion::V6 => self.private_v6.map(IpAddr::V6),
            IpVersion::Unknown(_) => None,
        }
    }

    fn listen_addr(&self, version: IpVersion) -> Option<IpAddr> {
        match version {
            IpVersion::V4 => self.listen_v4.map(IpAddr::V4),
            IpVersion::V6 => self.listen_v6.map(IpAddr::V6),
            IpVersion::Unknown(_) => None,
        }
    }
}

pub struct Tunnel {
    state: TunnelState,
    pcap_path: Option<String>,
}

impl Tunnel {
    pub fn new(mut config: Config) -> Result<Tunnel, TunnelError> {
        let pcap_path = config.pcap_path.take();
        let state = TunnelState::new(config)?;
        Ok(Tunnel { state, pcap_path })
    }

    pub fn run(
        &self,
        rt: runtime::Runtime,
        shutdown_receiver: oneshot::Receiver<()>,
    ) -> Result<StopReason, TunnelError> {
        let result = rt.block_on(self.run_process(shutdown_receiver));
        rt.shutdown_timeout(Duration::from_secs(60));
        result
    }

    async fn run_process(
        &self,
        shutdown_receiver: oneshot::Receiver<()>,
    ) -> Result<StopReason, TunnelError> {
        let state = &self.state;
        let tunnel = TunDevice::open(&state.tun_name, state.framing_length() > 0)?;
        let open_udp = |version| -> Result<Option<UdpEndpoint>, TunnelError> {
            match state.listen_addr(version) {
                Some(listen_ip) => Ok(Some(UdpEndpoint::open(listen_ip, state.port)?)),
                None => Ok(None),
            }
        };
        let udp_v4 = open_udp(IpVersion::V4)?;
        let udp_v6 = open_udp(IpVersion::V6)?;

        let (capture, capture_task) = if let Some(pcap_path) = &self.pcap_path {
            let writer = pcap::PcapWriter::new(pcap_path).await?;
            let sender = writer.create_sender();
            (Some(sender), Some(tokio::spawn(writer.run())))
        } else {
            (None, None)
        };

        if !state.initial_sleep.is_zero() {
            info!("Waiting {:?} before forwarding", state.initial_sleep);
            time::sleep(state.initial_sleep).await;
        }

        info!(
            "Forwarding between {} and {} peers in {} mode",
            tunnel.name(),
            state.peers.len(),
            state.mode
        );
        let result = {
            let mut forwarder =
                Forwarder::new(state, tunnel, udp_v4, udp_v6, capture, shutdown_receiver);
            let result = forwarder.run().await;
            debug!("Forwarder is {:?}", forwarder.loop_state());
            result
        };
        // All capture senders are gone, let the writer flush its queue.
        if let Some(capture_task) = capture_task {
            if let Err(err) = capture_task.await {
                warn!("PCAP writer task failed: {err}");
            }
        }
        if let Ok(reason) = &result {
            info!("Tunnel stopped: {reason}");
        }
        result
    }
}

#[derive(Debug)]
pub enum TunnelError {
    Internal(&'static str),
    Ip(ip::IpError),
    PeerNotFound(IpAddr),
    TunnelRead(io::Error),
    TunnelWrite(io::Error),
    SocketRead(io::Error),
    SocketWrite(io::Error),
    Io(io::Error),
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Ip(e) => write!(f, "IP error: {e}"),
            Self::PeerNotFound(addr) => write!(f, "No peer found for private address {addr}"),
            Self::TunnelRead(e) => write!(f, "Failed to read from tunnel device: {e}"),
            Self::TunnelWrite(e) => write!(f, "Failed to write to tunnel device: {e}"),
            Self::SocketRead(e) => write!(f, "Failed to receive from UDP socket: {e}"),
            Self::SocketWrite(e) => write!(f, "Failed to send to UDP socket: {e}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl error::Error for TunnelError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(_msg) => None,
            Self::Ip(err) => Some(err),
            Self::PeerNotFound(_addr) => None,
            Self::TunnelRead(err)
            | Self::TunnelWrite(err)
            | Self::SocketRead(err)
            | Self::SocketWrite(err)
            | Self::Io(err) => Some(err),
        }
    }
}

impl From<&'static str> for TunnelError {
    fn from(msg: &'static str) -> TunnelError {
        Self::Internal(msg)
    }
}

impl From<ip::IpError> for TunnelError {
    fn from(err: ip::IpError) -> TunnelError {
        Self::Ip(err)
    }
}

impl From<io::Error> for TunnelError {
    fn from(err: io::Error) -> TunnelError {
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn test_config(listen_ips: &[&str], private_ips: &[&str]) -> Config {
        Config {
            tun_name: String::new(),
            private_ips: private_ips
                .iter()
                .map(|ip| IpAddr::from_str(ip).unwrap())
                .collect(),
            listen_ips: listen_ips
                .iter()
                .map(|ip| IpAddr::from_str(ip).unwrap())
                .collect(),
            port: 5000,
            peers: PeerTable::new(),
            idle_timeout: None,
            close_timeout: Duration::ZERO,
            initial_sleep: Duration::ZERO,
            legacy_framing: false,
            planetlab: false,
            pcap_path: None,
        }
    }

    #[test]
    fn mode_follows_listen_addresses() {
        let state = TunnelState::new(test_config(&["0.0.0.0"], &["10.0.0.1"])).unwrap();
        assert_eq!(state.mode(), Mode::Ipv4);
        let state = TunnelState::new(test_config(&["::"], &["fd00::1"])).unwrap();
        assert_eq!(state.mode(), Mode::Ipv6);
        let state =
            TunnelState::new(test_config(&["0.0.0.0", "::"], &["10.0.0.1", "fd00::1"])).unwrap();
        assert_eq!(state.mode(), Mode::DualStack);
        assert!(state.mode().supports(IpVersion::V6));
        assert!(!Mode::Ipv4.supports(IpVersion::V6));
        assert!(!Mode::DualStack.supports(IpVersion::Unknown(0)));
    }

    #[test]
    fn reject_invalid_address_sets() {
        assert!(TunnelState::new(test_config(&[], &["10.0.0.1"])).is_err());
        assert!(TunnelState::new(test_config(&["0.0.0.0", "127.0.0.1"], &[])).is_err());
        assert!(TunnelState::new(test_config(&["0.0.0.0"], &["10.0.0.1", "10.0.0.2"])).is_err());
    }

    #[test]
    fn private_address_per_version() {
        let state = TunnelState::new(test_config(&["0.0.0.0"], &["10.0.0.1"])).unwrap();
        assert_eq!(
            state.private_addr(IpVersion::V4),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
        );
        assert_eq!(state.private_addr(IpVersion::V6), None);
        assert_eq!(state.private_addr(IpVersion::Unknown(5)), None);
    }

    #[test]
    fn planetlab_implies_framing() {
        let config = test_config(&["0.0.0.0"], &[]);
        assert_eq!(TunnelState::new(config).unwrap().framing_length(), 0);
        let mut config = test_config(&["0.0.0.0"], &[]);
        config.planetlab = true;
        assert_eq!(TunnelState::new(config).unwrap().framing_length(), 4);
        let mut config = test_config(&["0.0.0.0"], &[]);
        config.legacy_framing = true;
        assert_eq!(TunnelState::new(config).unwrap().framing_length(), 4);
    }
}
