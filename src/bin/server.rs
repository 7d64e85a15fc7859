// ABOUTME: Link manager daemon
// ABOUTME: Serves the control and data sockets with a loopback link layer for local testing

use a2dp_link::link::LoopbackLink;
use a2dp_link::peer::{PeerAddress, PeerState, Role};
use a2dp_link::service::{LinkService, ServiceArgs, ServiceHandle};
use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "a2dp-linkd")]
#[command(author, version, about = "A2DP control and data path manager", long_about = None)]
struct Args {
    #[command(flatten)]
    service: ServiceArgs,

    /// Peer to connect to at startup, in the control role
    #[arg(long)]
    connect: Option<PeerAddress>,

    /// Start streaming once the startup peer is connected
    #[arg(long, requires = "connect")]
    stream: bool,

    /// Seconds between session statistics reports
    #[arg(long, default_value = "5")]
    report_secs: u64,
}

/// Wait until the peer has opened its link
fn wait_opened(handle: &ServiceHandle, peer: PeerAddress, role: Role) -> bool {
    for _ in 0..100 {
        if handle.peer_state(peer, role) == Some(PeerState::Opened) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    // Initialize tracing
    args.service.init_tracing();

    // Build configuration
    let config = args.service.build_config()?;
    args.service.log_startup_info(&config);
    let roles = config.roles.clone();
    let control_role = roles[0];

    // Create and start the service
    let builder = LinkService::builder(config);
    let link = LoopbackLink::new(builder.event_sender()).with_offload(args.service.offload);
    let service = builder.link(Box::new(link)).start()?;
    let handle = service.handle();

    if let Some(peer) = args.connect {
        if handle.connect(peer, control_role).wait_async().await {
            tracing::info!("Connecting to {} as {}", peer, control_role);
        } else {
            tracing::warn!("Connection to {} refused", peer);
        }

        if args.stream {
            let probe = handle.clone();
            let opened =
                tokio::task::spawn_blocking(move || wait_opened(&probe, peer, control_role))
                    .await?;
            if opened && handle.start_stream(control_role).wait_async().await {
                tracing::info!("Streaming requested for {}", peer);
            } else {
                tracing::warn!("Could not start streaming with {}", peer);
            }
        }
    }

    // Spawn a task to periodically report session statistics
    let reporter = handle.clone();
    let period = Duration::from_secs(args.report_secs.max(1));
    let report_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            for role in &roles {
                if let Some(peer) = reporter.active_peer(*role) {
                    tracing::info!("Active {} peer: {}", role, peer);
                }
                if let Some(stats) = reporter.session_stats(*role) {
                    match serde_json::to_string(&stats) {
                        Ok(json) => tracing::info!("{} session: {}", role, json),
                        Err(e) => tracing::warn!("Cannot serialize stats: {}", e),
                    }
                }
            }
        }
    });

    tracing::info!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    report_task.abort();
    tokio::task::spawn_blocking(move || service.shutdown()).await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
