use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use testbed::accounting::{ByteOrder, PacketFormat, SeqWidth};
use testbed::config::StreamConfig;
use testbed::pipeline::TransformRegistry;
use testbed::pipeline::source::SYNTHETIC_SCHEME;
use testbed::recording::{FfmpegEncoderFactory, check_binary};
use testbed::relocate::{RelocationStats, select_strategy};
use testbed::{
    BlackboxHandle, BlackboxPoller, Config, RelocationService, Relocator, RtspLossProbe, StopFlag,
    Supervisor, TestSender, UdpLossMonitor, shaping,
};

mod log;

#[derive(Parser)]
#[command(
    name = "testbed",
    version,
    about = "Record RTSP streams under simulated loss and measure what arrives"
)]
struct Cli {
    /// Configuration file (defaults to ./testbed.toml when present)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log level or filter, e.g. `debug` or `testbed=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Receive, process and record the configured streams
    Record(RecordArgs),
    /// Move finalized segments into the dated archive and report them
    Relocate(RelocateArgs),
    /// Measure sequence loss on a bare UDP port
    UdpLoss(UdpLossArgs),
    /// Negotiate an RTSP session and measure its RTP loss
    RtspLoss(RtspLossArgs),
    /// Send numbered test datagrams with a deterministic loss pattern
    UdpSend(UdpSendArgs),
    /// Print (or apply) the `tc` commands for the configured shaping rules
    Shape(ShapeArgs),
}

#[derive(Args)]
struct RecordArgs {
    /// Source URL or file; repeat for several streams (replaces `[[streams]]`)
    #[arg(long = "source", short)]
    sources: Vec<String>,

    /// Record only the first N streams
    #[arg(long, short = 'n')]
    workers: Option<usize>,

    /// Stop after this many seconds (runs until Ctrl-C otherwise)
    #[arg(long, short)]
    duration: Option<u64>,

    /// Process frames without writing segments
    #[arg(long)]
    no_save: bool,

    /// Directory for segments being written
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Input frame rate for every stream
    #[arg(long)]
    fps: Option<f64>,

    /// Simulated frame-loss probability in [0, 1]
    #[arg(long)]
    loss_rate: Option<f64>,

    /// Also run the relocation service in this process
    #[arg(long)]
    relocate: bool,
}

#[derive(Args)]
struct RelocateArgs {
    /// Directory to watch (defaults to `recording.temp_dir`)
    #[arg(long)]
    source_dir: Option<PathBuf>,

    /// Archive root
    #[arg(long)]
    final_root: Option<PathBuf>,

    /// Relocate what is already there and exit
    #[arg(long)]
    once: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatKind {
    Rtp,
    Simple,
}

#[derive(Args)]
struct FormatArgs {
    /// Packet layout (defaults to `[probe.packet]`)
    #[arg(long, value_enum)]
    format: Option<FormatKind>,

    /// Byte offset of the sequence field (`simple` only)
    #[arg(long, default_value_t = 0)]
    offset: usize,

    /// Sequence field width in bytes: 1, 2, 4 or 8 (`simple` only)
    #[arg(long, default_value_t = 4)]
    seq_bytes: usize,

    /// Little-endian sequence field (`simple` only)
    #[arg(long)]
    little_endian: bool,
}

impl FormatArgs {
    fn resolve(&self, configured: PacketFormat) -> anyhow::Result<PacketFormat> {
        Ok(match self.format {
            None => configured,
            Some(FormatKind::Rtp) => PacketFormat::Rtp,
            Some(FormatKind::Simple) => PacketFormat::Simple {
                offset: self.offset,
                width: SeqWidth::from_bytes(self.seq_bytes)
                    .with_context(|| format!("unsupported sequence width: {} bytes", self.seq_bytes))?,
                order: if self.little_endian {
                    ByteOrder::Little
                } else {
                    ByteOrder::Big
                },
            },
        })
    }
}

#[derive(Args)]
struct UdpLossArgs {
    #[arg(long, short, default_value = "0.0.0.0:5004")]
    bind: SocketAddr,

    #[arg(long, short)]
    duration: Option<u64>,

    #[command(flatten)]
    packet: FormatArgs,
}

#[derive(Args)]
struct RtspLossArgs {
    url: String,

    #[arg(long, short)]
    duration: Option<u64>,

    /// Local RTP port announced in SETUP
    #[arg(long)]
    client_port: Option<u16>,
}

#[derive(Args)]
struct UdpSendArgs {
    #[arg(long, short)]
    target: SocketAddr,

    #[arg(long, short = 'n', default_value_t = 1000)]
    count: u64,

    #[arg(long, default_value_t = 10)]
    interval_ms: u64,

    /// Skip every (100 / loss)-th packet
    #[arg(long, default_value_t = 0.0)]
    loss_percent: f64,

    #[arg(long, default_value_t = 1200)]
    size: usize,

    #[command(flatten)]
    packet: FormatArgs,
}

#[derive(Args)]
struct ShapeArgs {
    /// Run the commands instead of printing them
    #[arg(long)]
    apply: bool,

    /// Only remove the root qdisc of each interface
    #[arg(long)]
    clear: bool,

    /// Limit to one interface
    #[arg(long)]
    interface: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    log::set(cli.log_level.as_deref().unwrap_or(&config.log.level));

    let stop = StopFlag::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        tracing::info!("interrupt received, shutting down");
        handler_stop.stop();
    })
    .context("installing Ctrl-C handler")?;

    match cli.command {
        Command::Record(args) => record(config, args, &stop),
        Command::Relocate(args) => relocate(config, args, &stop),
        Command::UdpLoss(args) => {
            let mut probe = config.probe.clone();
            probe.packet = args.packet.resolve(probe.packet)?;
            let monitor = UdpLossMonitor::bind(args.bind, &probe)
                .with_context(|| format!("binding {}", args.bind))?;
            let report = monitor.run(&stop, args.duration.map(Duration::from_secs))?;
            println!("{report}");
            Ok(())
        }
        Command::RtspLoss(args) => {
            let mut probe = config.probe.clone();
            if let Some(port) = args.client_port {
                probe.client_port = port;
            }
            let report = RtspLossProbe::new(&args.url, &probe)
                .run(&stop, args.duration.map(Duration::from_secs))
                .with_context(|| format!("probing {}", args.url))?;
            println!("{report}");
            Ok(())
        }
        Command::UdpSend(args) => {
            let format = args.packet.resolve(config.probe.packet)?;
            let report = TestSender::new(args.target, format)?
                .with_interval(Duration::from_millis(args.interval_ms))
                .with_packet_size(args.size)
                .with_loss_percent(args.loss_percent)
                .run(args.count, &stop)?;
            println!("sent {} packets, skipped {}", report.sent, report.skipped);
            Ok(())
        }
        Command::Shape(args) => shape(&config, args),
    }
}

fn apply_record_overrides(config: &mut Config, args: &RecordArgs) {
    if !args.sources.is_empty() {
        let template = config.streams.first().cloned();
        config.streams = args
            .sources
            .iter()
            .enumerate()
            .map(|(i, source)| {
                let name = format!("vessel_stream{:02}", i + 1);
                match &template {
                    Some(t) => StreamConfig {
                        name,
                        source: source.clone(),
                        ..t.clone()
                    },
                    None => StreamConfig::new(&name, source),
                }
            })
            .collect();
    }
    if let Some(n) = args.workers {
        config.streams.truncate(n);
    }
    if let Some(fps) = args.fps {
        for stream in &mut config.streams {
            stream.fps = fps;
        }
    }
    if let Some(rate) = args.loss_rate {
        config.pipeline.simulated_loss_rate = rate;
    }
    if args.no_save {
        config.recording.enabled = false;
    }
    if let Some(dir) = &args.output {
        config.recording.temp_dir = dir.clone();
    }
}

fn record(mut config: Config, args: RecordArgs, stop: &StopFlag) -> anyhow::Result<()> {
    apply_record_overrides(&mut config, &args);
    config.validate().context("invalid configuration")?;
    if config.streams.is_empty() {
        bail!("no streams configured; add [[streams]] or pass --source");
    }

    let needs_ffmpeg = config.recording.enabled
        || config
            .streams
            .iter()
            .any(|s| !s.source.to_ascii_lowercase().starts_with(SYNTHETIC_SCHEME));
    if needs_ffmpeg {
        check_binary(&config.recording.encoder.binary)
            .with_context(|| format!("encoder binary `{}` is not usable", config.recording.encoder.binary))?;
    }

    let config = Arc::new(config);
    let telemetry = start_telemetry(&config, stop)?;
    let handle = telemetry.as_ref().map(|t| t.handle.clone());
    let relocation = if args.relocate {
        Some(spawn_relocation(config.clone(), handle.clone(), stop.child())?)
    } else {
        None
    };

    let encoder = FfmpegEncoderFactory::new(config.recording.encoder.clone(), config.recording.container);
    let mut supervisor = Supervisor::new(config.clone(), Arc::new(encoder), TransformRegistry::default());
    if let Some(handle) = handle {
        supervisor = supervisor.with_telemetry(handle);
    }
    let supervisor_stop = supervisor.stop_flag();
    if let Err(e) = supervisor.start() {
        supervisor.shutdown();
        stop.stop();
        return Err(e).context("starting streams");
    }

    match args.duration {
        Some(secs) => {
            stop.sleep(Duration::from_secs(secs));
        }
        None => while stop.sleep(Duration::from_secs(1)) {},
    }
    supervisor_stop.stop();

    for (name, snapshot) in supervisor.shutdown() {
        println!("{name}: {snapshot}");
    }
    if let Some(handle) = relocation {
        // Give the watcher a moment to pick up the segments closed on shutdown.
        std::thread::sleep(Duration::from_secs(1));
        stop.stop();
        match handle.join() {
            Ok(result) => {
                let stats = result?;
                println!("relocated {} files ({} reported, {} failed)", stats.moved, stats.reported, stats.failed);
            }
            Err(_) => bail!("relocation thread panicked"),
        }
    }
    if let Some(telemetry) = telemetry {
        telemetry.finish();
    }
    Ok(())
}

/// Running blackbox poller.
struct Telemetry {
    handle: BlackboxHandle,
    stop: StopFlag,
    thread: std::thread::JoinHandle<()>,
}

impl Telemetry {
    fn finish(self) {
        self.stop.stop();
        if self.thread.join().is_err() {
            tracing::error!("blackbox poller panicked");
        }
    }
}

fn start_telemetry(config: &Config, stop: &StopFlag) -> anyhow::Result<Option<Telemetry>> {
    if !config.blackbox.enabled {
        return Ok(None);
    }
    let poller = BlackboxPoller::from_config(config).context("building blackbox client")?;
    let handle = poller.handle();
    let stop = stop.child();
    let worker_stop = stop.clone();
    let thread = std::thread::Builder::new()
        .name("blackbox".into())
        .spawn(move || poller.run(&worker_stop))
        .context("spawning blackbox poller")?;
    Ok(Some(Telemetry { handle, stop, thread }))
}

type RelocationHandle = std::thread::JoinHandle<testbed::Result<RelocationStats>>;

fn spawn_relocation(
    config: Arc<Config>,
    telemetry: Option<BlackboxHandle>,
    stop: StopFlag,
) -> anyhow::Result<RelocationHandle> {
    let strategy = select_strategy(
        config.relocation.watch,
        config.relocation_source_dir(),
        config.relocation.poll_interval(),
    )
    .context("starting directory watch")?;
    let rescan = config.relocation.rescan_interval();
    let mut relocator = Relocator::new(config).context("building relocator")?;
    if let Some(telemetry) = telemetry {
        relocator = relocator.with_telemetry(telemetry);
    }
    let handle = std::thread::Builder::new()
        .name("relocate".into())
        .spawn(move || RelocationService::new(relocator, strategy, rescan).run(&stop))
        .context("spawning relocation thread")?;
    Ok(handle)
}

fn relocate(mut config: Config, args: RelocateArgs, stop: &StopFlag) -> anyhow::Result<()> {
    if let Some(dir) = args.source_dir {
        config.relocation.source_dir = Some(dir);
    }
    if let Some(root) = args.final_root {
        config.relocation.final_root = root;
    }
    config.validate().context("invalid configuration")?;
    let config = Arc::new(config);

    if args.once {
        let mut relocator = Relocator::new(config.clone()).context("building relocator")?;
        if config.blackbox.enabled {
            let mut poller = BlackboxPoller::from_config(&config).context("building blackbox client")?;
            poller.poll_once();
            relocator = relocator.with_telemetry(poller.handle());
        }
        let moved = relocator.recover()?;
        for relocated in &moved {
            println!("{} -> {}", relocated.source.display(), relocated.destination.display());
        }
        println!("relocated {} files", moved.len());
        return Ok(());
    }

    let telemetry = start_telemetry(&config, stop)?;
    let handle = telemetry.as_ref().map(|t| t.handle.clone());
    let stats = spawn_relocation(config, handle, stop.clone())?
        .join()
        .map_err(|_| anyhow::anyhow!("relocation thread panicked"))??;
    if let Some(telemetry) = telemetry {
        telemetry.finish();
    }
    println!(
        "relocated {} files ({} copied, {} reported, {} failed)",
        stats.moved, stats.copied, stats.reported, stats.failed
    );
    Ok(())
}

fn shape(config: &Config, args: ShapeArgs) -> anyhow::Result<()> {
    config.validate().context("invalid configuration")?;
    let rules: Vec<_> = config
        .shaping
        .iter()
        .filter(|r| args.interface.as_deref().is_none_or(|i| i == r.interface))
        .collect();
    if rules.is_empty() {
        bail!("no [[shaping]] rules match");
    }

    for rule in rules {
        let commands = if args.clear {
            vec![shaping::clear(&rule.interface)]
        } else {
            shaping::plan(rule)
        };
        if args.apply {
            shaping::apply(&commands).with_context(|| format!("shaping {}", rule.interface))?;
        } else {
            for command in &commands {
                println!("{command}");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_every_subcommand() {
        for argv in [
            &["testbed", "record", "-s", "synthetic://a", "-n", "1", "--no-save"][..],
            &["testbed", "relocate", "--once"],
            &["testbed", "udp-loss", "--format", "simple", "--seq-bytes", "2"],
            &["testbed", "rtsp-loss", "rtsp://127.0.0.1:8554/live"],
            &["testbed", "udp-send", "-t", "127.0.0.1:5004", "--loss-percent", "5"],
            &["testbed", "shape", "--apply"],
        ] {
            assert!(Cli::try_parse_from(argv).is_ok(), "{argv:?}");
        }
    }

    #[test]
    fn record_overrides_replace_streams() {
        let mut config = Config::default();
        let args = RecordArgs {
            sources: vec!["synthetic://a".into(), "synthetic://b".into(), "synthetic://c".into()],
            workers: Some(2),
            duration: None,
            no_save: true,
            output: Some(PathBuf::from("/tmp/out")),
            fps: Some(5.0),
            loss_rate: Some(0.1),
            relocate: false,
        };
        apply_record_overrides(&mut config, &args);
        let names: Vec<_> = config.streams.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["vessel_stream01", "vessel_stream02"]);
        assert!(config.streams.iter().all(|s| s.fps == 5.0));
        assert!(!config.recording.enabled);
        assert_eq!(config.pipeline.simulated_loss_rate, 0.1);
        assert_eq!(config.recording.temp_dir, PathBuf::from("/tmp/out"));
    }

    #[test]
    fn simple_format_from_flags() {
        let args = FormatArgs {
            format: Some(FormatKind::Simple),
            offset: 2,
            seq_bytes: 2,
            little_endian: true,
        };
        assert_eq!(
            args.resolve(PacketFormat::Rtp).unwrap(),
            PacketFormat::Simple {
                offset: 2,
                width: SeqWidth::W16,
                order: ByteOrder::Little
            }
        );
        let bad = FormatArgs { seq_bytes: 3, ..args };
        assert!(bad.resolve(PacketFormat::Rtp).is_err());
    }

    #[test]
    fn every_listed_seq_width_resolves() {
        for (bytes, width) in [(1, SeqWidth::W8), (2, SeqWidth::W16), (4, SeqWidth::W32), (8, SeqWidth::W64)] {
            let args = FormatArgs {
                format: Some(FormatKind::Simple),
                offset: 0,
                seq_bytes: bytes,
                little_endian: false,
            };
            assert!(matches!(
                args.resolve(PacketFormat::Rtp).unwrap(),
                PacketFormat::Simple { width: w, .. } if w == width
            ));
        }
    }
}
