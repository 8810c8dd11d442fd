use anyhow::Result;
use clap::Parser;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "tunbridge",
    version,
    about = "User-space TUN to SOCKS5 bridge"
)]
struct Cli {
    /// TUN device name; the kernel picks one when omitted
    #[arg(long)]
    tapdev: Option<String>,

    /// IPv4 address of the virtual interface
    #[arg(long = "netif-ipaddr")]
    netif_ipaddr: std::net::Ipv4Addr,

    /// IPv4 netmask of the virtual interface
    #[arg(long = "netif-netmask")]
    netif_netmask: std::net::Ipv4Addr,

    /// SOCKS5 server address, a.b.c.d:port or [v6-addr]:port
    #[arg(long = "socks-server-addr")]
    socks_server_addr: std::net::SocketAddr,

    /// Log level: error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    loglevel: String,
}

fn main() {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.loglevel.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(version = env!("CARGO_PKG_VERSION"), "initializing");

    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(error = %e, "initialization failed");
            std::process::exit(1);
        }
    }
}

#[cfg(target_os = "linux")]
fn run(cli: &Cli) -> Result<i32> {
    use std::rc::Rc;

    use tunbridge::device::Tun;
    use tunbridge::engine::{Engine, EngineConfig};
    use tunbridge::reactor::{signal::SignalWatcher, Reactor};
    use tunbridge::stack::smol::SmolStack;

    let reactor = Reactor::new()?;

    let device_reactor = reactor.clone();
    let tun = Tun::open(&reactor, cli.tapdev.as_deref(), move || {
        tracing::error!("device error");
        device_reactor.quit(1);
    })?;

    let stack = SmolStack::new(&reactor, cli.netif_ipaddr, cli.netif_netmask, tun.mtu());

    let engine = Rc::new(Engine::new(
        &reactor,
        EngineConfig {
            mtu: tun.mtu(),
            socks_server: cli.socks_server_addr,
            override_dest: None,
        },
        Box::new(stack),
        tun.output(),
        tun.input(),
    )?);

    let signal_engine = engine.clone();
    let _signals = SignalWatcher::new(
        &reactor,
        Box::new(move || {
            info!("termination requested");
            signal_engine.terminate();
        }),
    )?;

    info!("entering event loop");
    let code = reactor.run();

    engine.shutdown();
    info!("exiting");
    Ok(code)
}

#[cfg(not(target_os = "linux"))]
fn run(_cli: &Cli) -> Result<i32> {
    anyhow::bail!("this platform has no TUN device support")
}
