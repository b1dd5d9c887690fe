use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};

use rust_sdnmgmt::api;
use rust_sdnmgmt::config::Config;
use rust_sdnmgmt::controller::Controller;
use rust_sdnmgmt::ofp_controller::openflow0x01::OF0x01Controller;
use rust_sdnmgmt::ofp_controller::OfpController;
use rust_sdnmgmt::orchestrator::{DryRunMigrator, Migrator, Orchestrator, VirshMigrator};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file. Defaults apply when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Address switches connect to.
    #[arg(long)]
    openflow_listen: Option<SocketAddr>,
    /// Address of the HTTP control API.
    #[arg(long)]
    api_listen: Option<SocketAddr>,
    /// Log migrations instead of running them.
    #[arg(long)]
    dry_run: bool,
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match args.config {
        Some(ref path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(addr) = args.openflow_listen {
        config.controller.openflow_listen = addr;
    }
    if let Some(addr) = args.api_listen {
        config.controller.api_listen = addr;
    }
    config.migration.dry_run |= args.dry_run;
    Ok(config)
}

fn serve_switches(listener: TcpListener, ofp: OF0x01Controller<Controller>) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let peer = stream.peer_addr().ok();
                let ofp = ofp.clone();
                thread::spawn(move || {
                    if let Err(e) = ofp.handle_client_connected(stream) {
                        warn!("session with {:?} ended: {}", peer, e);
                    }
                });
            }
            Err(e) => error!("connection failed: {}", e),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let filters = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    pretty_env_logger::formatted_timed_builder()
        .parse_filters(&filters)
        .init();
    let args = Args::parse();
    let config = load_config(&args)?;

    let controller = Arc::new(Controller::new(&config));

    let listener = TcpListener::bind(config.controller.openflow_listen)
        .with_context(|| format!("binding {}", config.controller.openflow_listen))?;
    info!("waiting for switches on {}", config.controller.openflow_listen);
    let ofp = OF0x01Controller::new(controller.clone(), config.controller.lldp_interval());
    thread::Builder::new()
        .name("openflow".to_string())
        .spawn(move || serve_switches(listener, ofp))?;

    if config.orchestrator.enabled {
        let migrator: Box<dyn Migrator> = if config.migration.dry_run {
            Box::new(DryRunMigrator)
        } else {
            Box::new(VirshMigrator::new(&config.migration))
        };
        let mut orchestrator = Orchestrator::new(
            controller.clone(),
            migrator,
            config.orchestrator.clone(),
            config.controller.controller_mac,
        );
        thread::Builder::new()
            .name("orchestrator".to_string())
            .spawn(move || orchestrator.run(&AtomicBool::new(true)))?;
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(config.controller.api_listen)
            .await
            .with_context(|| format!("binding {}", config.controller.api_listen))?;
        info!("control API on http://{}{}", config.controller.api_listen, api::API_PREFIX);
        api::serve(listener, controller).await?;
        Ok::<(), anyhow::Error>(())
    })
}
