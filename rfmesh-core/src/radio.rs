//! Radio capability interface.
//!
//! Hardware adapters (SX127x boards and the like) live outside this crate and
//! implement [`Radio`]. The link is half-duplex: a node in `Transmit` cannot
//! receive, and must be put back into `ReceiveContinuous` after sending.

use std::collections::VecDeque;

use serde::Serialize;

use crate::types::{MeshError, Result};

/// Operating mode of the transceiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RadioMode {
    Sleep,
    Standby,
    Transmit,
    ReceiveContinuous,
}

/// Minimal transceiver surface the mesh needs.
pub trait Radio {
    /// Transmit one frame. Returns once the hardware reports completion;
    /// adapters must bound that wait themselves.
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Next received frame, if any. Non-blocking.
    fn receive(&mut self) -> Result<Option<Vec<u8>>>;

    fn set_mode(&mut self, mode: RadioMode) -> Result<()>;

    fn mode(&self) -> RadioMode;
}

/// In-memory radio for tests and simulation.
///
/// Frames pushed with [`LoopbackRadio::inject`] become receivable; frames
/// sent are kept in order until [`LoopbackRadio::take_sent`] drains them.
#[derive(Debug)]
pub struct LoopbackRadio {
    mode: RadioMode,
    inbox: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    mode_changes: u64,
}

impl LoopbackRadio {
    pub fn new() -> Self {
        LoopbackRadio {
            mode: RadioMode::ReceiveContinuous,
            inbox: VecDeque::new(),
            sent: Vec::new(),
            mode_changes: 0,
        }
    }

    /// Queue a frame as if it arrived over the air.
    pub fn inject(&mut self, bytes: Vec<u8>) {
        self.inbox.push_back(bytes);
    }

    /// Drain every frame sent so far.
    pub fn take_sent(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.sent)
    }

    pub fn pending(&self) -> usize {
        self.inbox.len()
    }

    pub fn mode_changes(&self) -> u64 {
        self.mode_changes
    }
}

impl Default for LoopbackRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl Radio for LoopbackRadio {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if self.mode != RadioMode::Transmit {
            return Err(MeshError::InvalidInput(format!(
                "send while radio in {:?}",
                self.mode
            )));
        }
        self.sent.push(bytes.to_vec());
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        if self.mode != RadioMode::ReceiveContinuous {
            return Ok(None);
        }
        Ok(self.inbox.pop_front())
    }

    fn set_mode(&mut self, mode: RadioMode) -> Result<()> {
        if self.mode != mode {
            self.mode = mode;
            self.mode_changes += 1;
        }
        Ok(())
    }

    fn mode(&self) -> RadioMode {
        self.mode
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_receiving() {
        let radio = LoopbackRadio::new();
        assert_eq!(radio.mode(), RadioMode::ReceiveContinuous);
        assert_eq!(radio.pending(), 0);
    }

    #[test]
    fn test_inject_and_receive_in_order() {
        let mut radio = LoopbackRadio::new();
        radio.inject(vec![1]);
        radio.inject(vec![2]);
        assert_eq!(radio.receive().unwrap(), Some(vec![1]));
        assert_eq!(radio.receive().unwrap(), Some(vec![2]));
        assert_eq!(radio.receive().unwrap(), None);
    }

    #[test]
    fn test_half_duplex() {
        let mut radio = LoopbackRadio::new();
        radio.inject(vec![9]);
        assert!(radio.send(&[1, 2]).is_err());

        radio.set_mode(RadioMode::Transmit).unwrap();
        assert_eq!(radio.receive().unwrap(), None);
        radio.send(&[1, 2]).unwrap();

        radio.set_mode(RadioMode::ReceiveContinuous).unwrap();
        assert_eq!(radio.receive().unwrap(), Some(vec![9]));
        assert_eq!(radio.take_sent(), vec![vec![1, 2]]);
        assert!(radio.take_sent().is_empty());
        assert_eq!(radio.mode_changes(), 2);
    }
}
