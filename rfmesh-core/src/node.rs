//! Event-driven node loop over a [`Radio`].
//!
//! One `poll` handles at most one frame: receive, decide, and (for a relay)
//! switch to transmit, send, and return to receive before the next frame is
//! looked at.

use tracing::info;

use crate::forward::{Controller, Disposition, Forwarder, Sensing};
use crate::frame::{now_ms, FrameEncoder};
use crate::radio::{Radio, RadioMode};
use crate::types::*;

pub struct MeshNode<R: Radio, S: Sensing, C: Controller> {
    radio: R,
    forwarder: Forwarder<S>,
    controller: C,
    encoder: FrameEncoder,
    hop_budget: u8,
}

impl<R: Radio, S: Sensing, C: Controller> MeshNode<R, S, C> {
    pub fn new(
        radio: R,
        forwarder: Forwarder<S>,
        controller: C,
        encoder: FrameEncoder,
        hop_budget: u8,
    ) -> Self {
        MeshNode {
            radio,
            forwarder,
            controller,
            encoder,
            hop_budget,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.forwarder.node_id
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn forwarder(&self) -> &Forwarder<S> {
        &self.forwarder
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    /// Encode and broadcast a local observation. Returns its packet id.
    pub fn originate(&mut self, obs: &SignalObservation) -> Result<u32> {
        let frame = self.encoder.frame(obs, self.hop_budget);
        let bytes = frame.encode()?;
        self.forwarder.remember(&frame, frame.timestamp_ms);
        self.transmit(&bytes)?;
        info!(
            node = self.node_id(),
            packet_id = frame.packet_id,
            len = bytes.len(),
            "originated frame"
        );
        Ok(frame.packet_id)
    }

    /// Handle at most one pending frame, using the wall clock.
    pub fn poll(&mut self) -> Result<Option<Disposition>> {
        self.poll_at(now_ms())
    }

    /// Handle at most one pending frame at an explicit time.
    ///
    /// Radio errors propagate; frame errors become `Dropped`.
    pub fn poll_at(&mut self, now_ms: u64) -> Result<Option<Disposition>> {
        let Some(bytes) = self.radio.receive()? else {
            return Ok(None);
        };
        let disposition = self.forwarder.on_receive(&bytes, now_ms);
        match &disposition {
            Disposition::Relay { bytes, .. } => self.transmit(bytes)?,
            Disposition::Deliver(frame) => self.controller.deliver(frame.clone()),
            Disposition::Dropped(_) => {}
        }
        Ok(Some(disposition))
    }

    /// Poll until the radio has nothing pending. Returns the number handled.
    pub fn drain_at(&mut self, now_ms: u64) -> Result<usize> {
        let mut handled = 0;
        while self.poll_at(now_ms)?.is_some() {
            handled += 1;
        }
        Ok(handled)
    }

    fn transmit(&mut self, bytes: &[u8]) -> Result<()> {
        self.radio.set_mode(RadioMode::Transmit)?;
        let sent = self.radio.send(bytes);
        // Back to listening even if the send failed.
        self.radio.set_mode(RadioMode::ReceiveContinuous)?;
        sent
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::NoSensing;
    use crate::frame::{test_observation, Frame};
    use crate::radio::LoopbackRadio;

    type TestNode = MeshNode<LoopbackRadio, NoSensing, Vec<Frame>>;

    fn node(id: NodeId, hops: u8, dedup_ttl_ms: u64) -> TestNode {
        MeshNode::new(
            LoopbackRadio::new(),
            Forwarder::new(id, NoSensing, dedup_ttl_ms),
            Vec::new(),
            FrameEncoder::default(),
            hops,
        )
    }

    #[test]
    fn test_originate_transmits_and_returns_to_receive() {
        let mut n = node(1, 3, 0);
        let id = n.originate(&test_observation(1, 4)).unwrap();
        assert_eq!(n.radio().mode(), RadioMode::ReceiveContinuous);

        let sent = n.radio_mut().take_sent();
        assert_eq!(sent.len(), 1);
        let frame = Frame::decode(&sent[0]).unwrap();
        assert_eq!(frame.packet_id, id);
        assert_eq!(frame.packet_life_counter, 3);
    }

    #[test]
    fn test_poll_empty() {
        let mut n = node(1, 3, 0);
        assert!(n.poll_at(0).unwrap().is_none());
    }

    #[test]
    fn test_relay_then_deliver_across_nodes() {
        let mut origin = node(1, 2, 0);
        origin.originate(&test_observation(1, 2)).unwrap();
        let first = origin.radio_mut().take_sent();

        let mut relay = node(2, 2, 0);
        relay.radio_mut().inject(first[0].clone());
        assert!(relay.poll_at(0).unwrap().unwrap().is_relay());
        let second = relay.radio_mut().take_sent();
        assert_eq!(second.len(), 1);

        let mut sink = node(3, 2, 0);
        sink.radio_mut().inject(second[0].clone());
        assert!(sink.poll_at(0).unwrap().unwrap().is_deliver());
        assert_eq!(sink.controller().len(), 1);
        assert!(sink.radio_mut().take_sent().is_empty());
    }

    #[test]
    fn test_own_echo_dropped() {
        let mut n = node(1, 4, 60_000);
        n.originate(&test_observation(1, 0)).unwrap();
        let echo = n.radio_mut().take_sent().remove(0);
        n.radio_mut().inject(echo);
        assert!(n.poll().unwrap().unwrap().is_dropped());
    }

    #[test]
    fn test_drain_handles_all_pending() {
        let mut n = node(5, 3, 0);
        for id in 0..3u32 {
            let bytes = Frame::from_observation(&test_observation(9, 0), 1, id, 0)
                .encode()
                .unwrap();
            n.radio_mut().inject(bytes);
        }
        n.radio_mut().inject(vec![0u8; 4]);
        assert_eq!(n.drain_at(0).unwrap(), 4);
        assert_eq!(n.controller().len(), 3);
        assert_eq!(n.forwarder().dropped, 1);
    }
}
