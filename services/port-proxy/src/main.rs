//! portbridge port proxy binary.

use anyhow::{Context, Result};
use clap::Parser;
use portbridge_port_proxy::config::{parse_listen_addr, Cli, ListenAddr};
use portbridge_port_proxy::proxy::{NotificationListener, PortProxy, ProxyConfig};
use tokio::net::{TcpListener, UnixListener};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let listen_addr = parse_listen_addr(&cli.listen)
        .with_context(|| format!("invalid --listen value {:?}", cli.listen))?;

    let listener = match &listen_addr {
        ListenAddr::Unix(path) => {
            // A stale socket file from a previous run blocks the bind.
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("removing stale socket {}", path.display()));
                }
            }
            let listener = UnixListener::bind(path)
                .with_context(|| format!("binding notification socket {}", path.display()))?;
            NotificationListener::Unix(listener)
        }
        ListenAddr::Tcp(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding notification listener {addr}"))?;
            NotificationListener::Tcp(listener)
        }
    };

    info!(listen = %cli.listen, upstream = %cli.upstream_address, "starting portbridge port proxy");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => debug!("received SIGTERM"),
            _ = sigint.recv() => debug!("received SIGINT"),
        }
        let _ = shutdown_tx.send(true);
    });

    let proxy = PortProxy::new(
        listener,
        ProxyConfig {
            upstream_address: cli.upstream_address,
            udp_buffer_size: cli.udp_buffer_size,
        },
    );
    proxy.run(shutdown_rx).await
}
