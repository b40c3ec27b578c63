//! `dbbridge`: a protocol-aware forwarding proxy (§4.7, §6's Proxy CLI).
//!
//! Thin CLI wrapper: parses arguments, resolves the upstream destination,
//! and hands both to [`wireport::listener::Listener`] with a
//! [`wireport::forwarder::Forwarder`] as the accept hook. The relay logic
//! itself lives in the library so it can be exercised directly from tests.

use std::net::ToSocketAddrs;
use std::process;
use std::sync::OnceLock;

use clap::Parser;
use log::{error, info};

use wireport::address::{Endpoint, Family};
use wireport::forwarder::Forwarder;
use wireport::listener::{Listener, ListenerConfig};
use wireport::registry;

/// Protocol-aware forwarding proxy between clients and an upstream database.
///
/// The minimal invocation is exactly `--port <int> --dest <host:port>` (§6);
/// the remaining flags are this build's ambient logging/timeout knobs and
/// have defaults that don't change that minimal surface.
#[derive(Parser, Debug)]
#[command(name = "dbbridge", version, about)]
struct Cli {
    /// Port to accept client connections on.
    #[arg(long)]
    port: u16,

    /// Upstream destination to forward traffic to, host:port.
    #[arg(long)]
    dest: String,

    /// Comma-separated bind addresses; empty binds the wildcard address on
    /// every available family (§4.1).
    #[arg(long, default_value = "")]
    bind: String,

    /// Per-connection socket timeout in milliseconds; 0 never times out.
    #[arg(long, default_value_t = 0)]
    timeout_ms: u64,

    /// Increase log verbosity; repeatable (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress per-connection accept logging.
    #[arg(long)]
    quiet: bool,
}

fn init_logging(verbosity: u8, quiet: bool) {
    let level = if quiet {
        log::LevelFilter::Error
    } else {
        match verbosity {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    };
    // RUST_LOG, when set, still wins over the verbosity flags.
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}

fn split_host_port(s: &str) -> Result<(String, u16), String> {
    let idx = s.rfind(':').ok_or_else(|| format!("'{s}' is not host:port"))?;
    let port: u16 = s[idx + 1..]
        .parse()
        .map_err(|_| format!("'{s}' has an invalid port"))?;
    Ok((s[..idx].to_string(), port))
}

fn resolve_dest(dest: &str) -> Result<Endpoint, String> {
    let (host, port) = split_host_port(dest)?;

    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        let family = if ip.is_ipv6() { Family::Ipv6 } else { Family::Ipv4 };
        return Ok(Endpoint::tcp(family, ip.to_string(), port));
    }

    let addr = (host.as_str(), port)
        .to_socket_addrs()
        .map_err(|e| format!("failed to resolve '{host}': {e}"))?
        .next()
        .ok_or_else(|| format!("no addresses found for '{host}'"))?;
    let family = if addr.is_ipv6() { Family::Ipv6 } else { Family::Ipv4 };
    Ok(Endpoint::tcp(family, addr.ip().to_string(), port))
}

static FORWARDER: OnceLock<Forwarder> = OnceLock::new();

/// On SIGINT/SIGTERM, closes every listening socket and live port and exits
/// with status 0, matching §6's "normal termination on a fatal signal"
/// clause. Deliberately simple: this CLI has no in-flight state beyond those
/// two registries worth preserving.
extern "C" fn handle_shutdown_signal(_signum: libc::c_int) {
    if let Some(forwarder) = FORWARDER.get() {
        forwarder.request_shutdown();
    }
    registry::listening_sockets().close_all();
    registry::ports().close_all();
    process::exit(0);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_shutdown_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_shutdown_signal as libc::sighandler_t);
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}");
            process::exit(255);
        }
    };

    init_logging(cli.verbose, cli.quiet);

    let upstream = match resolve_dest(&cli.dest) {
        Ok(ep) => ep,
        Err(msg) => {
            eprintln!("dbbridge: {msg}");
            process::exit(255);
        }
    };

    info!("dbbridge forwarding port {} -> {upstream}", cli.port);

    let forwarder = FORWARDER.get_or_init(|| Forwarder::new(upstream, cli.timeout_ms));
    install_signal_handlers();

    let mut config = ListenerConfig::new(cli.bind, cli.port);
    config.quiet = cli.quiet;
    config.timeout_ms = cli.timeout_ms;

    let listener = Listener::new(config, forwarder.clone());
    if let Err(e) = listener.init_and_listen() {
        error!("dbbridge: {e}");
        process::exit(255);
    }
}
