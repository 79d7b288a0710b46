use std::{
    env, fmt, future, io,
    net::{IpAddr, Ipv4Addr},
    process,
    str::FromStr,
    task::Poll,
    time::Duration,
};

use log::info;
use tokio::{
    runtime,
    signal::unix::{self as signal, SignalKind},
    sync::oneshot,
};

mod demux;
mod device;
mod errqueue;
mod forwarder;
mod ip;
mod logger;
mod pcap;
mod peers;
mod socket;
mod tunnel;

enum Action {
    Run(tunnel::Config),
}

pub struct Args {
    log_level: log::LevelFilter,
    action: Action,
}

const USAGE_INSTRUCTIONS: &str = "Usage: udptun [OPTIONS] run\n\n\
Options:\
\n      --log-level=<LOG_LEVEL>          Log level [default: info]\
\n      --tun-name=<NAME>                Tunnel interface name [default: assigned by kernel]\
\n      --private-ip=<IP>                Private tunnel address, one IPv4 and one IPv6 can be provided\
\n      --listen-ip=<IP>                 Listen IP address, one IPv4 and one IPv6 can be provided [default: 0.0.0.0]\
\n      --port=<PORT>                    UDP port [default: 5000]\
\n      --peers=<FILENAME>               Path to peer table (private IP and public IP:port per line)\
\n      --idle-timeout=<SECONDS>         Stop after this many seconds without traffic, 0 to disable [default: 60]\
\n      --close-timeout=<SECONDS>        Grace period before stopping on shutdown [default: 2]\
\n      --initial-sleep=<SECONDS>        Wait before forwarding [default: 0]\
\n      --tun-framing                    Prepend packet information header on the tunnel device\
\n      --planetlab                      PlanetLab compatibility (implies --tun-framing)\
\n      --pcap=<FILENAME>                Capture tunnel traffic to a PCAP file\
\n      --help                           Print help";

fn fail_with_error(name: &str, value: &str, err: fmt::Arguments) -> ! {
    eprintln!(
        "Argument {} has an unsupported value {}: {}",
        name, value, err
    );
    println!("{}", USAGE_INSTRUCTIONS);
    process::exit(2);
}

impl Args {
    fn parse() -> Args {
        let parse_seconds = |name: &str, value: &str| -> Duration {
            match u64::from_str(value) {
                Ok(seconds) => Duration::from_secs(seconds),
                Err(err) => fail_with_error(
                    name,
                    value,
                    format_args!("Failed to parse duration in seconds: {}", err),
                ),
            }
        };

        let mut log_level = log::LevelFilter::Info;
        let mut tun_name = String::new();
        let mut private_ips = vec![];
        let mut listen_ips = vec![];
        let mut port = 5000;
        let mut peer_table = None;
        let mut idle_timeout = Some(Duration::from_secs(60));
        let mut close_timeout = Duration::from_secs(2);
        let mut initial_sleep = Duration::ZERO;
        let mut legacy_framing = false;
        let mut planetlab = false;
        let mut pcap_path = None;

        for arg in env::args()
            .take(env::args().len().saturating_sub(1))
            .skip(1)
        {
            if arg == "--help" || arg == "help" {
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(0);
            } else if arg == "--tun-framing" {
                legacy_framing = true;
                continue;
            } else if arg == "--planetlab" {
                planetlab = true;
                continue;
            }
            let (name, value) = if let Some(arg) = arg.split_once('=') {
                arg
            } else {
                eprintln!("Option flag {} has no value", arg);
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(2);
            };

            if name == "--log-level" {
                log_level = match value.to_uppercase().as_str() {
                    "TRACE" => log::LevelFilter::Trace,
                    "DEBUG" => log::LevelFilter::Debug,
                    "INFO" => log::LevelFilter::Info,
                    "WARN" => log::LevelFilter::Warn,
                    "ERROR" => log::LevelFilter::Error,
                    "OFF" => log::LevelFilter::Off,
                    _ => fail_with_error(name, value, format_args!("Unsupported log level")),
                };
            } else if name == "--tun-name" {
                tun_name = value.into();
            } else if name == "--private-ip" || name == "--listen-ip" {
                match IpAddr::from_str(value) {
                    Ok(ip) if name == "--private-ip" => private_ips.push(ip),
                    Ok(ip) => listen_ips.push(ip),
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse IP address: {}", err),
                    ),
                };
            } else if name == "--port" {
                port = match u16::from_str(value) {
                    Ok(port) => port,
                    Err(err) => {
                        fail_with_error(name, value, format_args!("Failed to parse port: {}", err))
                    }
                };
            } else if name == "--peers" {
                match peers::PeerTable::load(value) {
                    Ok(table) => peer_table = Some(table),
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to load peer table: {}", err),
                    ),
                };
            } else if name == "--idle-timeout" {
                let timeout = parse_seconds(name, value);
                idle_timeout = if timeout.is_zero() {
                    None
                } else {
                    Some(timeout)
                };
            } else if name == "--close-timeout" {
                close_timeout = parse_seconds(name, value);
            } else if name == "--initial-sleep" {
                initial_sleep = parse_seconds(name, value);
            } else if name == "--pcap" {
                pcap_path = Some(value.into());
            } else {
                eprintln!("Unsupported argument {}", arg);
            }
        }

        let action = if let Some(action) = env::args().last() {
            action
        } else {
            eprintln!("No action specified");
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        };

        match action.as_str() {
            "run" => {
                let peers = if let Some(peers) = peer_table {
                    peers
                } else {
                    eprintln!("No peer table specified");
                    println!("{}", USAGE_INSTRUCTIONS);
                    process::exit(2);
                };
                if listen_ips.is_empty() {
                    listen_ips = vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)];
                }

                let action = Action::Run(tunnel::Config {
                    tun_name,
                    private_ips,
                    listen_ips,
                    port,
                    peers,
                    idle_timeout,
                    close_timeout,
                    initial_sleep,
                    legacy_framing,
                    planetlab,
                    pcap_path,
                });
                Args { log_level, action }
            }
            _ => {
                eprintln!("No action specified");
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(2);
            }
        }
    }
}

async fn wait_termination() -> Result<(), io::Error> {
    let mut interrupt = signal::signal(SignalKind::interrupt())?;
    let mut terminate = signal::signal(SignalKind::terminate())?;
    future::poll_fn(|cx| {
        if interrupt.poll_recv(cx).is_ready() || terminate.poll_recv(cx).is_ready() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    })
    .await;
    info!("Received termination signal");
    Ok(())
}

fn main() {
    println!(
        "udptun version {}",
        option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
    );
    let args = Args::parse();

    if let Err(err) = logger::setup_logger(args.log_level) {
        eprintln!("Failed to set up logger, error is {}", err);
    }
    let rt = match runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            println!("Failed to start runtime, error is {}", err);
            process::exit(1);
        }
    };
    match args.action {
        Action::Run(config) => {
            let tunnel = match tunnel::Tunnel::new(config) {
                Ok(tunnel) => tunnel,
                Err(err) => {
                    println!("Failed to create tunnel, error is {}", err);
                    process::exit(1);
                }
            };
            let (shutdown_sender, shutdown_receiver) = oneshot::channel();
            rt.spawn(async move {
                if let Err(err) = wait_termination().await {
                    log::error!("Failed to set up signal handler: {err}");
                    return;
                }
                let _ = shutdown_sender.send(());
            });
            if let Err(err) = tunnel.run(rt, shutdown_receiver) {
                println!("Failed to run tunnel, error is {}", err);
                process::exit(1);
            }
        }
    }
}
