//! RTP H.264 Receiver
//!
//! Joins a single-peer RTP session, reorders the incoming stream through a
//! playout buffer and writes the depacketized Annex-B stream to a file.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::BufWriter;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rtp_media_player::{
    config::AppConfig,
    constants::{DEFAULT_CONTROL_PORT, DEFAULT_DATA_PORT, DEFAULT_PAYLOAD_TYPE},
    h264::{H264Depacketizer, StreamDecoder},
    network::UdpTransportFactory,
    packet::DataPacket,
    participant::{ParticipantInfo, RtpParticipant},
    playout::{self, PacketTracer},
    session::{DataListener, RtpSession, SessionEvent},
};

struct Args {
    config: Option<PathBuf>,
    bind: IpAddr,
    data_port: u16,
    control_port: u16,
    remote: SocketAddrPair,
    output: PathBuf,
}

#[derive(Clone, Copy)]
struct SocketAddrPair {
    data: SocketAddr,
    control: SocketAddr,
}

impl Default for Args {
    fn default() -> Self {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        Self {
            config: None,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            data_port: DEFAULT_DATA_PORT,
            control_port: DEFAULT_CONTROL_PORT,
            remote: SocketAddrPair {
                data: SocketAddr::new(localhost, 5000),
                control: SocketAddr::new(localhost, 5001),
            },
            output: PathBuf::from("received.h264"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args()?;
    let config = load_config(args.config.as_ref())?;

    tracing::info!("Starting RTP receiver");

    // Sink chain, innermost first
    let decoder = Arc::new(StreamDecoder::new(BufWriter::new(
        File::create(&args.output)
            .with_context(|| format!("cannot create {}", args.output.display()))?,
    )));
    let depacketizer = Arc::new(
        H264Depacketizer::new(decoder.clone(), &config.depacketizer).with_debug(config.debug),
    );
    let buffer = playout::create_buffer(&config.playout, depacketizer.clone(), config.debug);
    let playout_entry: Arc<dyn DataListener> = {
        let buffer = buffer.clone();
        Arc::new(move |info: &ParticipantInfo, packet: &DataPacket| {
            buffer.data_packet_received(info, packet)
        })
    };
    let entry: Arc<dyn DataListener> = match &config.trace_path {
        Some(path) => Arc::new(PacketTracer::to_file(path)?.with_downstream(playout_entry)),
        None => playout_entry,
    };

    let local = RtpParticipant::receiver(
        ParticipantInfo::random(),
        SocketAddr::new(args.bind, args.data_port),
        SocketAddr::new(args.bind, args.control_port),
    );
    let remote = RtpParticipant::receiver(
        ParticipantInfo::new(0),
        args.remote.data,
        args.remote.control,
    );
    let session = RtpSession::single(
        format!("receiver-{}", uuid::Uuid::new_v4().simple()),
        &[DEFAULT_PAYLOAD_TYPE],
        local,
        remote,
        config.session.clone(),
        Arc::new(UdpTransportFactory::new(config.transport.clone())),
    )?;
    session.add_data_listener(entry);

    let mut events = session.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::ParticipantJoinedFromData(p)
                | SessionEvent::ParticipantJoinedFromControl(p) => {
                    tracing::info!("Participant joined: {}", p)
                }
                SessionEvent::ParticipantDataUpdated(p) => {
                    tracing::info!("Participant updated: {}", p)
                }
                SessionEvent::ParticipantLeft(p) => tracing::info!("Participant left: {}", p),
                SessionEvent::ParticipantDeleted(p) => {
                    tracing::info!("Participant removed: {}", p)
                }
                SessionEvent::ResolvedSsrcConflict { old, new } => {
                    tracing::warn!("SSRC conflict resolved: {} -> {}", old, new)
                }
                SessionEvent::SsrcChanged => tracing::warn!("Remote peer changed SSRC"),
                SessionEvent::Terminated { cause } => {
                    tracing::info!("Session terminated ({})", cause.as_deref().unwrap_or("local"));
                    break;
                }
            }
        }
    });

    session.init()?;
    tracing::info!(
        "Listening on data {} / control {}, peer {} / {}, writing {}",
        session.local_data_address().map(|a| a.to_string()).unwrap_or_default(),
        session.local_control_address().map(|a| a.to_string()).unwrap_or_default(),
        args.remote.data,
        args.remote.control,
        args.output.display()
    );

    let running = Arc::new(AtomicBool::new(true));
    let running_for_signal = running.clone();
    ctrlc::set_handler(move || running_for_signal.store(false, Ordering::SeqCst))
        .context("cannot install Ctrl+C handler")?;

    tracing::info!("Receiving - press Ctrl+C to stop");

    let mut last_stats_time = Instant::now();
    while running.load(Ordering::Relaxed) && session.is_running() {
        tokio::time::sleep(Duration::from_millis(100)).await;

        if last_stats_time.elapsed() >= Duration::from_secs(5) {
            last_stats_time = Instant::now();
            let playout = buffer.stats();
            tracing::info!(
                "Playout: {} received, {} emitted, {} late, {} incomplete",
                playout.received,
                playout.emitted,
                playout.dropped_late,
                playout.dropped_incomplete
            );
        }
    }

    tracing::info!("Shutting down...");
    session.terminate();
    buffer.stop();
    decoder.flush()?;

    let playout = buffer.stats();
    let depacketizer = depacketizer.stats();
    println!("\n=== Receiver Statistics ===");
    println!("  Playout received:      {}", playout.received);
    println!("  Playout emitted:       {}", playout.emitted);
    println!("  Dropped (late):        {}", playout.dropped_late);
    println!("  Dropped (incomplete):  {}", playout.dropped_incomplete);
    println!("  Playout resets:        {}", playout.resets);
    println!("  Access units written:  {}", depacketizer.units_emitted);
    println!("  Access units dropped:  {}", depacketizer.units_dropped);
    println!("  Sequence gaps:         {}", depacketizer.sequence_gaps);
    println!("  Unknown NAL types:     {}", depacketizer.unknown_nal_types);
    for participant in session.remote_participants().values() {
        println!(
            "  Peer {}: {} packets, {} bytes",
            participant,
            participant.received_packets(),
            participant.received_bytes()
        );
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    if let Some(path) = path {
        return AppConfig::load(path)
            .with_context(|| format!("cannot load config {}", path.display()));
    }
    match AppConfig::default_path() {
        Some(path) if path.exists() => {
            tracing::info!("Using config {}", path.display());
            Ok(AppConfig::load(&path)?)
        }
        _ => Ok(AppConfig::default()),
    }
}

/// `ip:data_port:control_port`
fn parse_remote(value: &str) -> Result<SocketAddrPair> {
    let mut parts = value.rsplitn(3, ':');
    let (Some(control), Some(data), Some(ip)) = (parts.next(), parts.next(), parts.next()) else {
        bail!("expected <ip:data:control>, got {}", value);
    };
    let ip: IpAddr = ip
        .trim_matches(|c| c == '[' || c == ']')
        .parse()
        .with_context(|| format!("invalid address {}", ip))?;
    Ok(SocketAddrPair {
        data: SocketAddr::new(ip, data.parse().context("invalid data port")?),
        control: SocketAddr::new(ip, control.parse().context("invalid control port")?),
    })
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let argv: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < argv.len() {
        let flag = argv[i].as_str();
        if matches!(flag, "--help" | "-h") {
            println!("RTP H.264 receiver");
            println!();
            println!("Usage: rtp-receiver [OPTIONS]");
            println!();
            println!("Options:");
            println!("  --config <PATH>              Configuration file (TOML)");
            println!("  --bind <IP>                  Local address (default: 0.0.0.0)");
            println!("  --data-port <PORT>           Local RTP port (default: 5006)");
            println!("  --control-port <PORT>        Local RTCP port (default: 5007)");
            println!("  --remote <IP:DATA:CONTROL>   Sending peer (default: 127.0.0.1:5000:5001)");
            println!("  --output <PATH>              Annex-B output (default: received.h264)");
            println!("  -h, --help                   Show this help");
            std::process::exit(0);
        }

        let Some(value) = argv.get(i + 1) else {
            bail!("missing value for {}", flag);
        };
        match flag {
            "--config" => args.config = Some(PathBuf::from(value)),
            "--bind" => args.bind = value.parse().context("invalid --bind address")?,
            "--data-port" => args.data_port = value.parse().context("invalid --data-port")?,
            "--control-port" => {
                args.control_port = value.parse().context("invalid --control-port")?
            }
            "--remote" => args.remote = parse_remote(value)?,
            "--output" => args.output = PathBuf::from(value),
            other => bail!("unknown option {}", other),
        }
        i += 2;
    }

    Ok(args)
}
