//! portbridge guest agent binary.
//!
//! Wires the configured monitors to a tracker and runs them until SIGTERM.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Parser;
use portbridge_guest_agent::config::{Cli, Config};
use portbridge_guest_agent::forwarder::Forwarder;
use portbridge_guest_agent::monitors::containerd::ContainerdMonitor;
use portbridge_guest_agent::monitors::docker::DockerMonitor;
use portbridge_guest_agent::monitors::iptables::IptablesScanner;
use portbridge_guest_agent::monitors::kube::KubeWatcher;
use portbridge_guest_agent::monitors::procnet::ProcNetScanner;
use portbridge_guest_agent::monitors::wait_for_engine;
use portbridge_guest_agent::tracker;
use portbridge_portmap::{PortBinding, PortKey, PortMap, PortMapping};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DOCKER_SOCKET: &str = "/var/run/docker.sock";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Config::from_cli(cli)?;

    info!(admin_install = config.admin_install, "starting portbridge guest agent");

    if !nix::unistd::geteuid().is_root() {
        bail!("agent must run as root");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = std::sync::Arc::new(shutdown_tx);

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let signal_shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        sigterm.recv().await;
        debug!("received SIGTERM");
        let _ = signal_shutdown.send(true);
    });

    let port_tracker = tracker::from_config(&config);

    // The Kubernetes API port never shows up as a container binding, so it
    // is forwarded once as a static mapping before the monitors start.
    if config.kubernetes {
        let forwarder = tracker::notification_forwarder(&config);
        let mut ports = PortMap::new();
        ports.insert(
            PortKey::tcp(config.k8s_api_port),
            vec![PortBinding::new("127.0.0.1", config.k8s_api_port.to_string())],
        );

        forwarder
            .send(PortMapping::add(ports, Vec::new()))
            .await
            .context("failed to forward the Kubernetes API port")?;
        debug!(port = config.k8s_api_port, "forwarded the Kubernetes API port");
    }

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    if config.containerd {
        let tracker = port_tracker.clone();
        let sock = config.containerd_sock.clone();
        let privileged_helper = config.privileged_helper;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            wait_for_engine(Path::new(&sock), || async {
                ContainerdMonitor::connect(&sock, tracker.clone(), privileged_helper)
                    .await?
                    .is_serving()
                    .await
            })
            .await?;

            let monitor =
                ContainerdMonitor::connect(&sock, tracker, privileged_helper).await?;
            monitor.run(shutdown).await;
            Ok(())
        });
    }

    if config.docker {
        let tracker = port_tracker.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            let monitor =
                DockerMonitor::new(tracker).context("initializing docker event monitor")?;
            wait_for_engine(Path::new(DOCKER_SOCKET), || monitor.is_serving()).await?;
            monitor.run(shutdown).await;
            Ok(())
        });
    }

    if config.kubernetes {
        let watcher = KubeWatcher::new(
            config.kubeconfig.clone(),
            config.k8s_service_listener_addr,
            config.privileged_helper,
            port_tracker.clone(),
        );
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            watcher
                .run(shutdown)
                .await
                .context("kubernetes service watcher failed")
        });

        let scanner = IptablesScanner::new(port_tracker.clone());
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            scanner
                .run(shutdown)
                .await
                .context("iptables port forwarding failed")
        });
    }

    let scanner = ProcNetScanner::new(port_tracker.clone())
        .context("initializing /proc/net scanner failed")?;
    let shutdown = shutdown_rx.clone();
    tasks.spawn(async move {
        scanner
            .run(shutdown)
            .await
            .context("/proc/net port forwarding failed")
    });

    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "monitor failed");
                failure.get_or_insert(e);
                // One failed monitor takes the agent down; drain the rest.
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                error!(error = %e, "monitor task panicked");
                failure.get_or_insert_with(|| anyhow::anyhow!(e));
                let _ = shutdown_tx.send(true);
            }
        }
    }

    if let Some(e) = failure {
        return Err(e);
    }

    info!("portbridge guest agent shutting down");
    Ok(())
}
