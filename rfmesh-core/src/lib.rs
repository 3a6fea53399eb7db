//! rfmesh-core: frame codec, hop-budget forwarding and trilateration for a
//! mesh of RF-sensing nodes.
//!
//! No async, no network I/O; just algorithms plus the radio capability trait.
//! This crate is the shared core used by the `rfmesh` node/collector binary.

pub mod checksum;
pub mod codec;
pub mod config;
pub mod forward;
pub mod frame;
pub mod fusion;
pub mod node;
pub mod radio;
pub mod trilateration;
pub mod types;

// Re-export commonly used types at crate root
pub use forward::{Controller, Disposition, DropReason, Forwarder, NoSensing, Sensing};
pub use frame::{decode, Frame, FrameEncoder};
pub use fusion::{FusedObservation, FusionEvent, FusionSession, PositionEstimate, SharedFusion};
pub use node::MeshNode;
pub use radio::{LoopbackRadio, Radio, RadioMode};
pub use trilateration::{solve, Anchor, LinearProxy, LogDistance, Point, RangeModel};
pub use types::*;
