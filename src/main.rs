//! callcore - demo entry point
//!
//! Runs two controllers in one process, wires them through an in-process
//! signaling relay and places a call from one to the other.

mod args;

use args::Args;
use callcore::negotiator::NegotiationState;
use callcore::record::format_duration;
use callcore::signaling::RelayEndpoint;
use callcore::{
    CallController, CallEnded, CallHandle, CallObserver, Collaborators, Config, DeviceMediaAcquirer,
    InMemoryCallRecords, MediaKind, RemoteMedia, RtcPeerLinkFactory, SignalingMessage, SignalingRelay,
};
use clap::Parser;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

/// Logs notifications and counts received payloads per remote track
struct LoggingObserver {
    party: String,
}

impl CallObserver for LoggingObserver {
    fn on_remote_media(&self, call: &CallHandle, remote: Arc<RemoteMedia>) {
        info!(
            "[{}] remote media on call {}: {} track(s)",
            self.party,
            call.call_id(),
            remote.tracks().len()
        );
        for track in remote.tracks() {
            let mut payloads = track.subscribe();
            let party = self.party.clone();
            let track_id = track.id().to_string();
            tokio::spawn(async move {
                let mut packets: u64 = 0;
                loop {
                    match payloads.recv().await {
                        Ok(_) => packets += 1,
                        Err(RecvError::Lagged(n)) => debug!("[{}] track {} lagged by {}", party, track_id, n),
                        Err(RecvError::Closed) => break,
                    }
                }
                info!("[{}] track {} delivered {} packet(s)", party, track_id, packets);
            });
        }
    }

    fn on_call_ended(&self, ended: &CallEnded) {
        if ended.is_failure() {
            warn!("[{}] {}", self.party, ended.describe());
        } else {
            info!("[{}] {}", self.party, ended.describe());
        }
    }
}

fn controller_for(
    party: &str,
    config: &Config,
    signaling: RelayEndpoint,
    records: Arc<InMemoryCallRecords>,
) -> CallController {
    let mut call = config.call.clone();
    call.local_user = party.to_string();
    CallController::new(
        call,
        Collaborators {
            acquirer: Arc::new(DeviceMediaAcquirer::new(config.media.clone())),
            links: Arc::new(RtcPeerLinkFactory::new(config.webrtc.clone())),
            signaling: Arc::new(signaling),
            records,
            observer: Arc::new(LoggingObserver {
                party: party.to_string(),
            }),
        },
    )
}

/// Feed relay frames addressed to `party` into its controller
async fn pump_inbound(
    party: String,
    controller: CallController,
    mut inbound: mpsc::UnboundedReceiver<String>,
    decline: bool,
) {
    while let Some(frame) = inbound.recv().await {
        let message = match SignalingMessage::from_json(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("[{}] {}", party, e);
                continue;
            }
        };

        if let Some(incoming) = message.incoming_call() {
            let controller = controller.clone();
            let party = party.clone();
            tokio::spawn(async move {
                if decline {
                    if let Err(e) = controller.decline_incoming_call(&incoming).await {
                        warn!("[{}] failed to decline: {}", party, e);
                    }
                    return;
                }
                match controller.accept_incoming_call(incoming).await {
                    Ok(call) => info!("[{}] accepted call {} ({})", party, call.call_id(), call.state()),
                    Err(e) => warn!("[{}] failed to accept: {}", party, e),
                }
            });
            continue;
        }

        if let Some(event) = message.into_event() {
            controller.handle_signaling(event);
        }
    }
    debug!("[{}] signaling relay closed", party);
}

async fn hold_call(seconds: u64) {
    if seconds == 0 {
        let _ = signal::ctrl_c().await;
        info!("Shutdown signal received");
        return;
    }
    tokio::select! {
        _ = signal::ctrl_c() => info!("Shutdown signal received"),
        _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();
    let loaded = args.load_config();

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = match (&loaded, args.verbose) {
        (_, true) => "debug".to_string(),
        (Ok(cfg), false) => cfg.logging.level.clone(),
        (Err(_), false) => "info".to_string(),
    };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("CALLCORE_LOG").unwrap_or(log_level))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("callcore v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match loaded {
        Ok(cfg) => {
            info!("Loaded configuration from {:?}", args.config);
            cfg
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }
    };
    args.apply_overrides(&mut config)?;

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    let records = Arc::new(InMemoryCallRecords::new());
    let ((caller_signaling, caller_inbound), (callee_signaling, callee_inbound)) =
        SignalingRelay::pair(&args.caller, &args.callee);
    let caller = controller_for(&args.caller, &config, caller_signaling, records.clone());
    let callee = controller_for(&args.callee, &config, callee_signaling, records.clone());

    tokio::spawn(pump_inbound(args.caller.clone(), caller.clone(), caller_inbound, false));
    tokio::spawn(pump_inbound(args.callee.clone(), callee.clone(), callee_inbound, args.decline));

    let media_kind = if args.video {
        MediaKind::AudioVideo
    } else {
        MediaKind::AudioOnly
    };
    let call = caller.start_outgoing_call(&args.callee, media_kind).await?;
    info!(
        "Calling {} (session {})",
        args.callee,
        call.session_id().unwrap_or_default()
    );

    let connected = tokio::time::timeout(
        Duration::from_secs(args.connect_timeout),
        call.wait_for(|s| s.state == NegotiationState::Connected || s.is_terminal()),
    )
    .await;
    match connected {
        Ok(Ok(snapshot)) if snapshot.state == NegotiationState::Connected => {
            info!("Connected to {}", args.callee);
            hold_call(args.duration).await;
        }
        Ok(Ok(snapshot)) => warn!(
            "Call ended before connecting ({})",
            snapshot
                .terminal_reason
                .map(|r| r.to_string())
                .unwrap_or_default()
        ),
        Ok(Err(e)) => warn!("Lost track of the call: {}", e),
        Err(_) => warn!("Call did not connect within {}s", args.connect_timeout),
    }

    futures::future::join(caller.end_all(), callee.end_all()).await;

    for record in records.history() {
        info!(
            "Call record {}: {} -> {} [{:?}] {} ({})",
            record.id,
            record.caller,
            record.callee,
            record.status,
            record.reason.unwrap_or_default(),
            format_duration(record.duration_seconds)
        );
    }

    Ok(())
}
