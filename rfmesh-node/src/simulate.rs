//! Three-sensor mesh simulation.
//!
//! Each anchor node hears one emitter and originates a frame that walks a
//! chain of relays until its hop budget runs out. Every chain runs as its own
//! tokio task; the node that finally delivers hands the frame to a single
//! collector task over an mpsc channel, which owns the fusion session.

use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use rfmesh_core::config::Config;
use rfmesh_core::forward::{Controller, Forwarder, NoSensing};
use rfmesh_core::frame::{Frame, FrameEncoder};
use rfmesh_core::fusion::{FusionEvent, FusionSession, PositionEstimate};
use rfmesh_core::node::MeshNode;
use rfmesh_core::radio::LoopbackRadio;
use rfmesh_core::trilateration::{self, Anchor, Point};
use rfmesh_core::types::*;

use crate::model::ModelArg;

/// Metres per degree at the equator, for placing anchors on the globe.
const METRES_PER_DEGREE: f64 = 111_320.0;

pub struct SimulationParams {
    pub emitter: Point,
    pub model: ModelArg,
    pub hop_delay: Duration,
    pub frequency_hz: f64,
    pub channel: u16,
}

/// Forwards deliveries to the collector task.
#[derive(Clone)]
struct ChannelController {
    tx: UnboundedSender<Frame>,
}

impl Controller for ChannelController {
    fn deliver(&mut self, frame: Frame) {
        if self.tx.send(frame).is_err() {
            warn!("collector gone, delivery lost");
        }
    }
}

type SimNode = MeshNode<LoopbackRadio, NoSensing, ChannelController>;

/// Run every chain to completion and return the collector's estimates.
pub async fn run(config: &Config, params: SimulationParams) -> Result<Vec<PositionEstimate>> {
    let anchors: Vec<(NodeId, Anchor)> = config
        .anchors
        .iter()
        .take(trilateration::ANCHOR_COUNT)
        .map(|(id, a)| (*id, *a))
        .collect();
    if anchors.len() < trilateration::ANCHOR_COUNT {
        return Err(MeshError::Config(format!(
            "{} anchors configured, {} required",
            anchors.len(),
            trilateration::ANCHOR_COUNT
        )));
    }

    let session = FusionSession::new(config.anchors.clone(), params.model, config.fusion.timeout_ms());
    info!(session = %session.id, "collection session started");

    let (tx, rx) = mpsc::unbounded_channel();
    let collector = tokio::spawn(collect(rx, session));

    let mut chains = Vec::new();
    for (chain, (anchor_id, anchor)) in anchors.into_iter().enumerate() {
        let observation = observe(anchor_id, &anchor, &params);
        let nodes = build_chain(config, chain, anchor_id, &tx)?;
        chains.push(tokio::spawn(run_chain(nodes, observation, params.hop_delay)));
    }
    // Collector finishes once every chain has dropped its sender.
    drop(tx);

    for chain in chains {
        chain
            .await
            .map_err(|e| MeshError::InvalidInput(format!("chain task failed: {e}")))??;
    }
    collector
        .await
        .map_err(|e| MeshError::InvalidInput(format!("collector task failed: {e}")))
}

/// What the sensor at `anchor` reads for the emitter.
fn observe(anchor_id: NodeId, anchor: &Anchor, params: &SimulationParams) -> SignalObservation {
    let range = trilateration::distance(anchor, &params.emitter);
    let rssi = params.model.expected_rssi(range);
    SignalObservation {
        source_node_id: anchor_id,
        position: GeoPosition::new(anchor.y / METRES_PER_DEGREE, anchor.x / METRES_PER_DEGREE, 0.0),
        signal_type: SignalType::WiFi,
        signal_strength: rssi,
        protocol: LinkProtocol::Ieee80211n,
        frequency_hz: params.frequency_hz,
        channel: params.channel,
        strength_over_time: vec![rssi; 8],
        speed: 0.0,
        direction: 0.0,
    }
}

/// Sensor first, then one relay per remaining hop. The last relay delivers.
fn build_chain(
    config: &Config,
    chain: usize,
    anchor_id: NodeId,
    tx: &UnboundedSender<Frame>,
) -> Result<Vec<SimNode>> {
    let hops = config.node.hop_budget.max(1);
    let mut nodes = Vec::with_capacity(hops as usize + 1);
    for hop in 0..=hops {
        let id = if hop == 0 {
            anchor_id
        } else {
            1000 + (chain as NodeId) * 100 + hop as NodeId
        };
        nodes.push(MeshNode::new(
            LoopbackRadio::new(),
            Forwarder::new(id, NoSensing, config.dedup.ttl_ms),
            ChannelController { tx: tx.clone() },
            FrameEncoder::new(config.node.protocol_version)?,
            hops,
        ));
    }
    Ok(nodes)
}

async fn run_chain(mut nodes: Vec<SimNode>, observation: SignalObservation, hop_delay: Duration) -> Result<()> {
    let Some((sensor, relays)) = nodes.split_first_mut() else {
        return Ok(());
    };
    let packet_id = sensor.originate(&observation)?;
    let mut in_flight = sensor.radio_mut().take_sent();

    for relay in relays.iter_mut() {
        if in_flight.is_empty() {
            break;
        }
        tokio::time::sleep(hop_delay).await;
        for bytes in in_flight.drain(..) {
            relay.radio_mut().inject(bytes);
        }
        relay.drain_at(frame_clock())?;
        in_flight = relay.radio_mut().take_sent();
        debug!(node = relay.node_id(), packet_id, forwarded = in_flight.len(), "hop");
    }
    Ok(())
}

fn frame_clock() -> u64 {
    rfmesh_core::frame::now_ms()
}

async fn collect<M: trilateration::RangeModel>(
    mut rx: UnboundedReceiver<Frame>,
    mut session: FusionSession<M>,
) -> Vec<PositionEstimate> {
    while let Some(frame) = rx.recv().await {
        match session.ingest(&frame, frame_clock()) {
            FusionEvent::Pending { reports } => {
                debug!(source = frame.source_node_id, reports, "report stored")
            }
            FusionEvent::UnknownAnchor(id) => warn!(source = id, "report from unmapped node"),
            FusionEvent::Unsolvable(e) => warn!(error = %e, "triple rejected"),
            FusionEvent::Estimated(_) => {}
        }
    }
    session.estimates().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(model: ModelArg) -> SimulationParams {
        SimulationParams {
            emitter: Point { x: 50.0, y: 28.87 },
            model,
            hop_delay: Duration::ZERO,
            frequency_hz: 2.437e9,
            channel: 6,
        }
    }

    #[tokio::test]
    async fn test_simulation_estimates_emitter() {
        let config = Config::default();
        let estimates = run(&config, params(ModelArg::Linear)).await.unwrap();
        assert_eq!(estimates.len(), 1);
        let p = estimates[0].point;
        assert!((p.x - 50.0).abs() < 2.0, "x = {}", p.x);
        assert!((p.y - 28.87).abs() < 2.0, "y = {}", p.y);
    }

    #[tokio::test]
    async fn test_simulation_single_hop() {
        let mut config = Config::default();
        config.node.hop_budget = 1;
        config.node.protocol_version = 2;
        let estimates = run(&config, params(ModelArg::Linear)).await.unwrap();
        assert_eq!(estimates.len(), 1);
    }

    #[tokio::test]
    async fn test_simulation_needs_three_anchors() {
        let mut config = Config::default();
        config.anchors.remove(&3);
        assert!(matches!(
            run(&config, params(ModelArg::Linear)).await,
            Err(MeshError::Config(_))
        ));
    }
}
