//! rfmesh: node and collector CLI for the RF observation mesh.
//!
//! Supports:
//! - Encoding an observation into a wire frame
//! - Decoding captured frames into a table or JSON
//! - Running captured frames through a relay node
//! - Solving a single trilateration triple
//! - Simulating a three-sensor mesh end to end

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{Cell, Table};
use serde::Serialize;

use rfmesh_core::config::{self, Config};
use rfmesh_core::forward::{Disposition, DropReason, Forwarder, NoSensing};
use rfmesh_core::frame::{now_ms, Frame, FrameEncoder};
use rfmesh_core::fusion::{FusionSession, PositionEstimate, SharedFusion};
use rfmesh_core::node::MeshNode;
use rfmesh_core::radio::LoopbackRadio;
use rfmesh_core::trilateration::{self, Anchor, Point, RangeModel};
use rfmesh_core::types::*;

mod input;
mod model;
mod simulate;

use model::ModelArg;

#[derive(Parser)]
#[command(
    name = "rfmesh",
    version,
    about = "RF observation mesh: encode, relay, decode and locate"
)]
struct Cli {
    /// Enable verbose output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (default ~/.rfmesh/config.yaml)
    #[arg(long, global = true, env = "RFMESH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode an observation into a hex frame
    Encode {
        /// Reporting node id (default: node.id from config)
        #[arg(long)]
        source: Option<NodeId>,

        #[arg(long, allow_hyphen_values = true, default_value = "0")]
        lat: f64,

        #[arg(long, allow_hyphen_values = true, default_value = "0")]
        lon: f64,

        /// Altitude in metres
        #[arg(long, allow_hyphen_values = true, default_value = "0")]
        alt: f64,

        /// wifi, bluetooth, 5g, lora, zigbee
        #[arg(long, default_value = "wifi", value_parser = parse_signal_type)]
        signal_type: SignalType,

        /// 802.11n, 802.11ac, 802.11ax, ble, classic-bluetooth, nr
        #[arg(long, default_value = "802.11n", value_parser = parse_protocol)]
        protocol: LinkProtocol,

        /// Current RSSI in dBm
        #[arg(long, allow_hyphen_values = true)]
        rssi: f64,

        #[arg(long, default_value = "2437000000")]
        frequency_hz: f64,

        #[arg(long, default_value = "6")]
        channel: u16,

        /// RSSI history in dBm, comma separated
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        samples: Vec<f64>,

        /// Speed in m/s
        #[arg(long, default_value = "0")]
        speed: f64,

        /// Heading in degrees
        #[arg(long, default_value = "0")]
        direction: f64,

        /// Hop budget (default: node.hop_budget from config)
        #[arg(long)]
        hops: Option<u8>,

        /// Protocol version (default: node.protocol_version from config)
        #[arg(long)]
        protocol_version: Option<u8>,

        /// Wrap output as `*hex;`
        #[arg(long)]
        wrap: bool,
    },

    /// Decode frames from a hex string, a file of hex lines, or `-` for stdin
    Decode {
        input: String,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Run captured frames through a relay node and show what it does with each
    Relay {
        /// File of hex frames, or `-` for stdin
        file: PathBuf,

        /// This node's id (default: node.id from config)
        #[arg(long)]
        node_id: Option<NodeId>,

        /// Print rebroadcast frames as hex after the table
        #[arg(long)]
        emit: bool,

        /// Range model for fusing delivered frames
        #[arg(long, value_enum, default_value = "linear")]
        model: ModelArg,
    },

    /// Trilaterate one position from three anchors
    Solve {
        /// Anchor as `x,y`; give exactly three
        #[arg(long = "anchor", value_parser = parse_anchor, allow_hyphen_values = true, required = true)]
        anchors: Vec<Anchor>,

        /// Ranges to the anchors, comma separated
        #[arg(long, value_delimiter = ',', conflicts_with = "strengths")]
        distances: Vec<f64>,

        /// Compressed strengths (0-255) to convert with --model, comma separated
        #[arg(long, value_delimiter = ',')]
        strengths: Vec<u8>,

        #[arg(long, value_enum, default_value = "linear")]
        model: ModelArg,
    },

    /// Simulate three sensors reporting one emitter through relay chains
    Simulate {
        /// Emitter x
        #[arg(long, allow_hyphen_values = true, default_value = "50")]
        x: f64,

        /// Emitter y
        #[arg(long, allow_hyphen_values = true, default_value = "28.87")]
        y: f64,

        #[arg(long, value_enum, default_value = "linear")]
        model: ModelArg,

        /// Delay per hop in milliseconds
        #[arg(long, default_value = "10")]
        hop_delay_ms: u64,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(config::config_file);
    let cfg = config::load_config_from(&config_path);

    match cli.command {
        Commands::Encode {
            source,
            lat,
            lon,
            alt,
            signal_type,
            protocol,
            rssi,
            frequency_hz,
            channel,
            samples,
            speed,
            direction,
            hops,
            protocol_version,
            wrap,
        } => {
            let obs = SignalObservation {
                source_node_id: source.unwrap_or(cfg.node.id),
                position: GeoPosition::new(lat, lon, alt),
                signal_type,
                signal_strength: rssi,
                protocol,
                frequency_hz,
                channel,
                strength_over_time: samples,
                speed,
                direction,
            };
            let version = protocol_version.unwrap_or(cfg.node.protocol_version);
            let hops = hops.unwrap_or(cfg.node.hop_budget);
            cmd_encode(&obs, version, hops, wrap)
        }
        Commands::Decode { input, json } => cmd_decode(&input, json),
        Commands::Relay {
            file,
            node_id,
            emit,
            model,
        } => cmd_relay(&cfg, &file, node_id.unwrap_or(cfg.node.id), emit, model),
        Commands::Solve {
            anchors,
            distances,
            strengths,
            model,
        } => cmd_solve(&anchors, &distances, &strengths, model),
        Commands::Simulate {
            x,
            y,
            model,
            hop_delay_ms,
            json,
        } => cmd_simulate(&cfg, Point { x, y }, model, hop_delay_ms, json),
        Commands::Config { action } => match action {
            ConfigAction::Init { force } => cmd_config_init(&config_path, force),
            ConfigAction::Show => {
                println!("# {}", config_path.display());
                print!("{}", config::serialize_config(&cfg));
                Ok(())
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Argument parsers
// ---------------------------------------------------------------------------

fn parse_signal_type(s: &str) -> std::result::Result<SignalType, String> {
    SignalType::from_label(s).ok_or_else(|| format!("unknown signal type '{s}'"))
}

fn parse_protocol(s: &str) -> std::result::Result<LinkProtocol, String> {
    LinkProtocol::from_label(s).ok_or_else(|| format!("unknown protocol '{s}'"))
}

fn parse_anchor(s: &str) -> std::result::Result<Anchor, String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("expected x,y, got '{s}'"))?;
    let x = x.trim().parse::<f64>().map_err(|e| format!("x: {e}"))?;
    let y = y.trim().parse::<f64>().map_err(|e| format!("y: {e}"))?;
    Ok(Anchor::new(x, y))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_encode(obs: &SignalObservation, version: u8, hops: u8, wrap: bool) -> Result<()> {
    let mut encoder = FrameEncoder::new(version)?;
    let bytes = encoder
        .encode(obs, hops)
        .context("observation does not fit in one frame")?;
    let hex = hex_encode(&bytes);
    if wrap {
        println!("*{hex};");
    } else {
        println!("{hex}");
    }
    Ok(())
}

/// JSON view of one decoded line.
#[derive(Serialize)]
struct DecodedLine {
    line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    frame: Option<Frame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    position: Option<GeoPosition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_hz: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    direction: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl DecodedLine {
    fn new(line: usize, result: rfmesh_core::types::Result<Frame>) -> Self {
        match result {
            Ok(frame) => {
                let info = frame.signal_info_fields();
                let (speed, direction) = frame.speed_direction();
                DecodedLine {
                    line,
                    position: Some(frame.geo_position()),
                    frequency_hz: info.map(|(f, _)| f),
                    channel: info.map(|(_, c)| c),
                    speed: Some(speed),
                    direction: Some(direction),
                    frame: Some(frame),
                    error: None,
                }
            }
            Err(e) => DecodedLine {
                line,
                frame: None,
                position: None,
                frequency_hz: None,
                channel: None,
                speed: None,
                direction: None,
                error: Some(e.to_string()),
            },
        }
    }
}

fn load_input_frames(input: &str) -> Result<Vec<input::RawFrame>> {
    let path = Path::new(input);
    if input == "-" || path.exists() {
        return input::read_frames(path).with_context(|| format!("reading {input}"));
    }
    let hex = input::clean_hex_line(input).unwrap_or_else(|| input.trim().to_string());
    let bytes = hex_decode(&hex).context("argument is neither a file nor a hex frame")?;
    Ok(vec![input::RawFrame { line: 1, bytes }])
}

fn cmd_decode(input: &str, json: bool) -> Result<()> {
    let raw = load_input_frames(input)?;
    let decoded: Vec<DecodedLine> = raw
        .iter()
        .map(|r| DecodedLine::new(r.line, Frame::decode(&r.bytes)))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&decoded)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec![
        "Line", "Ver", "Packet", "Src", "Hops", "Type", "Proto", "RSSI", "Lat", "Lon", "Freq (MHz)",
        "Ch", "Samples", "Status",
    ]);
    let dash = || Cell::new("-");
    for d in &decoded {
        let Some(f) = &d.frame else {
            let mut row = vec![Cell::new(d.line)];
            row.extend(std::iter::repeat_with(dash).take(12));
            row.push(Cell::new(d.error.as_deref().unwrap_or("error")));
            table.add_row(row);
            continue;
        };
        table.add_row(vec![
            Cell::new(d.line),
            Cell::new(f.protocol_version),
            Cell::new(format!("{:08X}", f.packet_id)),
            Cell::new(f.source_node_id),
            Cell::new(f.packet_life_counter),
            Cell::new(f.signal_type),
            Cell::new(f.protocol),
            Cell::new(f.signal_strength as i32 - 120),
            d.position
                .map(|p| Cell::new(format!("{:.5}", p.lat)))
                .unwrap_or_else(dash),
            d.position
                .map(|p| Cell::new(format!("{:.5}", p.lon)))
                .unwrap_or_else(dash),
            d.frequency_hz
                .map(|hz| Cell::new(format!("{:.3}", hz / 1e6)))
                .unwrap_or_else(dash),
            d.channel.map(Cell::new).unwrap_or_else(dash),
            Cell::new(f.strength_over_time.len()),
            Cell::new("ok"),
        ]);
    }
    println!("{table}");

    let errors = decoded.iter().filter(|d| d.error.is_some()).count();
    eprintln!("  {} frames, {} rejected", decoded.len(), errors);
    Ok(())
}

fn cmd_relay(cfg: &Config, file: &Path, node_id: NodeId, emit: bool, model: ModelArg) -> Result<()> {
    let raw = input::read_frames(file).with_context(|| format!("reading {}", file.display()))?;
    let fusion = SharedFusion::new(FusionSession::new(
        cfg.anchors.clone(),
        model,
        cfg.fusion.timeout_ms(),
    ));

    let mut node = MeshNode::new(
        LoopbackRadio::new(),
        Forwarder::new(node_id, NoSensing, cfg.dedup.ttl_ms),
        fusion.clone(),
        FrameEncoder::new(cfg.node.protocol_version)?,
        cfg.node.hop_budget,
    );

    let mut table = Table::new();
    table.set_header(vec!["Line", "Packet", "Src", "Outcome", "Detail"]);
    let mut rebroadcast = Vec::new();

    for r in &raw {
        node.radio_mut().inject(r.bytes.clone());
        let Some(disposition) = node.poll_at(now_ms())? else {
            continue;
        };
        let row = match &disposition {
            Disposition::Relay { frame, enriched, .. } => vec![
                Cell::new(r.line),
                Cell::new(format!("{:08X}", frame.packet_id)),
                Cell::new(frame.source_node_id),
                Cell::new("relay"),
                Cell::new(format!(
                    "{} hops left{}",
                    frame.packet_life_counter,
                    if *enriched { ", enriched" } else { "" }
                )),
            ],
            Disposition::Deliver(frame) => vec![
                Cell::new(r.line),
                Cell::new(format!("{:08X}", frame.packet_id)),
                Cell::new(frame.source_node_id),
                Cell::new("deliver"),
                Cell::new("hop budget exhausted"),
            ],
            Disposition::Dropped(DropReason::Duplicate { source, packet_id }) => vec![
                Cell::new(r.line),
                Cell::new(format!("{packet_id:08X}")),
                Cell::new(source),
                Cell::new("drop"),
                Cell::new("duplicate"),
            ],
            Disposition::Dropped(DropReason::Invalid(e)) => vec![
                Cell::new(r.line),
                Cell::new("-"),
                Cell::new("-"),
                Cell::new("drop"),
                Cell::new(e),
            ],
        };
        table.add_row(row);
        rebroadcast.extend(node.radio_mut().take_sent());
    }
    println!("{table}");

    let fwd = node.forwarder();
    eprintln!(
        "  node {}: {} received, {} relayed, {} delivered, {} dropped",
        fwd.node_id, fwd.received, fwd.relayed, fwd.delivered, fwd.dropped
    );

    let session = fusion.lock();
    if !session.estimates().is_empty() {
        print_estimates(session.estimates());
    }

    if emit {
        for bytes in &rebroadcast {
            println!("{}", hex_encode(bytes));
        }
    }
    Ok(())
}

fn cmd_solve(anchors: &[Anchor], distances: &[f64], strengths: &[u8], model: ModelArg) -> Result<()> {
    let ranges: Vec<f64> = if strengths.is_empty() {
        distances.to_vec()
    } else {
        strengths.iter().map(|s| model.distance(*s)).collect()
    };
    if ranges.is_empty() {
        bail!("give --distances or --strengths");
    }

    let point = trilateration::solve(anchors, &ranges)?;
    println!("x = {:.3}, y = {:.3}", point.x, point.y);

    let mut table = Table::new();
    table.set_header(vec!["Anchor", "Range", "Residual"]);
    let residuals = trilateration::residuals(anchors, &ranges, &point);
    for ((a, r), res) in anchors.iter().zip(&ranges).zip(&residuals) {
        table.add_row(vec![
            Cell::new(format!("({}, {})", a.x, a.y)),
            Cell::new(format!("{r:.3}")),
            Cell::new(format!("{res:.3}")),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn cmd_simulate(cfg: &Config, emitter: Point, model: ModelArg, hop_delay_ms: u64, json: bool) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting runtime")?;
    let params = simulate::SimulationParams {
        emitter,
        model,
        hop_delay: Duration::from_millis(hop_delay_ms),
        frequency_hz: 2.437e9,
        channel: 6,
    };
    let estimates = runtime.block_on(simulate::run(cfg, params))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&estimates)?);
        return Ok(());
    }
    if estimates.is_empty() {
        bail!("no position estimate produced");
    }
    print_estimates(&estimates);
    for est in &estimates {
        let err = ((est.point.x - emitter.x).powi(2) + (est.point.y - emitter.y).powi(2)).sqrt();
        eprintln!("  error vs emitter: {err:.2}");
    }
    Ok(())
}

fn print_estimates(estimates: &[PositionEstimate]) {
    let mut table = Table::new();
    table.set_header(vec!["Session", "Sources", "Ranges", "X", "Y"]);
    for est in estimates {
        table.add_row(vec![
            Cell::new(est.session_id),
            Cell::new(
                est.sources
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            Cell::new(
                est.distances
                    .iter()
                    .map(|d| format!("{d:.1}"))
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            Cell::new(format!("{:.3}", est.point.x)),
            Cell::new(format!("{:.3}", est.point.y)),
        ]);
    }
    println!("{table}");
}

fn cmd_config_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    config::save_config_to(path, &Config::default())?;
    println!("Wrote {}", path.display());
    Ok(())
}
