//! Networking node CLI
//!
//! Runs an OCPP 2.0.1 networking node: charging stations connect to the
//! node, which handles, rejects or relays their requests towards a CSMS.
//!
//! # Usage
//!
//! ```bash
//! # Standalone: the node answers BootNotification/Heartbeat itself
//! netnode-ocpp-node --node-id nn-1
//!
//! # Relay to a CSMS
//! netnode-ocpp-node --node-id nn-1 \
//!     --csms-url ws://localhost:8180/steve/websocket/CentralSystemService
//!
//! # Refuse DataTransfer requests carrying a marker value
//! netnode-ocpp-node --node-id nn-1 --reject-data "Please REJECT!"
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use netnode_adapter_ocpp::ocpp::Action;
use netnode_adapter_ocpp::{
    csms_handlers, policy, serve_station, station_handlers, NetworkingNode, NodeConfig, Station,
    StationDirectory, Uplink, UplinkConfig,
};
use netnode_core::{compose, DecisionFn, Direction, TracingErrorSink};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// OCPP 2.0.1 networking node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node identity used on network paths
    #[arg(short, long)]
    node_id: String,

    /// Address charging stations connect to
    #[arg(short, long, default_value = "0.0.0.0:9000")]
    listen: SocketAddr,

    /// CSMS WebSocket URL; without it the node answers station requests itself
    #[arg(long)]
    csms_url: Option<String>,

    /// Name of the CSMS on network paths
    #[arg(long, default_value = "CSMS")]
    csms_id: String,

    /// Send a BootNotification for the node's own station after connecting
    #[arg(long)]
    boot: bool,

    /// Number of EVSEs of the node's own station
    #[arg(long, default_value = "1")]
    evse_count: u32,

    /// Heartbeat interval handed out when answering BootNotification
    #[arg(long, default_value = "300")]
    heartbeat_interval: i32,

    /// Seconds to wait for a relayed request's answer
    #[arg(long, default_value = "30")]
    relay_timeout: u64,

    /// Reject DataTransfer requests whose data equals this value
    #[arg(long)]
    reject_data: Option<String>,

    /// Actions refused with NotSupported (can be repeated)
    #[arg(long = "block")]
    blocked: Vec<Action>,

    /// Only accept requests originating from these stations (can be repeated)
    #[arg(long = "allow-sender")]
    allowed_senders: Vec<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides it
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    init_logging(&args.log_level)?;

    let mut config = NodeConfig::new(&args.node_id, args.listen)
        .with_evse_count(args.evse_count)
        .with_relay_timeout(std::time::Duration::from_secs(args.relay_timeout));
    config.station.heartbeat_interval = args.heartbeat_interval;
    if let Some(url) = &args.csms_url {
        let mut uplink = UplinkConfig::new(url);
        uplink.csms_id = args.csms_id.clone();
        config = config.with_uplink(uplink);
    }
    config.validate()?;

    info!(
        node_id = %config.node_id,
        listen = %config.listen_addr,
        uplink = config.uplink.as_ref().map(|u| u.csms_url.as_str()).unwrap_or("none"),
        "Starting networking node"
    );

    let node = NetworkingNode::new(&config, Arc::new(TracingErrorSink));
    let station = Arc::new(RwLock::new(
        Station::new(config.node_id.clone()).with_evses(config.station.evse_count),
    ));
    station_handlers(&node, station.clone());

    match &config.uplink {
        Some(uplink) => node.relay_upward(uplink.csms_id.clone()),
        None => csms_handlers(
            &node,
            Arc::new(RwLock::new(StationDirectory::new(config.station.heartbeat_interval))),
        ),
    }
    node.relay_downward();

    let installed = install_policies(&node, &args);
    if installed > 0 {
        info!(count = installed, "Forwarding policies installed");
    }

    let shutdown = CancellationToken::new();

    if let Some(uplink_config) = config.uplink.clone() {
        let mut uplink = Uplink::new(node.clone(), uplink_config);
        if args.boot {
            uplink = uplink.with_boot_notification(station.read().await.charging_station_info());
        }
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = uplink.run(token).await {
                error!(error = %e, "Uplink stopped");
            }
        });
    }

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Accepting station connections");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                };
                let node = node.clone();
                let token = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_station(stream, node, token).await {
                        warn!(%remote, error = %e, "Station connection ended with error");
                    }
                });
            }
        }
    }

    shutdown.cancel();
    let failed = node.shutdown();
    if failed > 0 {
        info!(count = failed, "Failed pending relayed requests");
    }
    Ok(())
}

fn init_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = match log_level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Register the forwarding policies requested on the command line.
///
/// Policies for the same action are chained: the sender check runs first,
/// then the block list, then the DataTransfer literal.
fn install_policies(node: &NetworkingNode, args: &Args) -> usize {
    let blocked: HashSet<Action> = args.blocked.iter().copied().collect();
    let mut installed = 0;

    for direction in [Direction::DeviceToSystem, Direction::SystemToDevice] {
        for action in Action::arriving(direction).filter(|a| !a.is_binary()) {
            let mut chain: Vec<DecisionFn<Action, Value>> = Vec::new();

            if direction == Direction::DeviceToSystem && !args.allowed_senders.is_empty() {
                chain.push(policy::allow_senders(args.allowed_senders.iter().cloned()));
            }
            if blocked.contains(&action) {
                chain.push(policy::block_kinds([action]));
            }
            if let (Direction::DeviceToSystem, Action::DataTransfer, Some(literal)) =
                (direction, action, &args.reject_data)
            {
                chain.push(policy::reject_data_transfer(literal.as_str()));
            }

            if let Some(decision) = chain.into_iter().reduce(compose) {
                node.json().forwarding().register_decision(direction, action, decision);
                installed += 1;
            }
        }
    }
    installed
}
