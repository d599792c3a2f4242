//! Control stack for a laboratory embryo pick-and-plate machine.
//!
//! Three workers talk over channels: [`link::SerialLink`] owns the serial
//! port and the line-delimited JSON protocol, [`motion::MotionController`]
//! turns the device's asynchronous status stream into a request/completion
//! API, and [`cycle::CycleOrchestrator`] runs the autonomous pick-and-plate
//! cycle on top of both. Vision and the operator surface are external
//! collaborators behind the [`vision::VisionSource`] and
//! [`cycle::OperatorPrompt`] traits.

pub mod config;
pub mod cycle;
pub mod error;
pub mod link;
pub mod motion;
pub mod protocol;
pub mod vision;

pub use config::{EmbryoProfile, PlatingOrder, PlatingRunConfig, Settings};
pub use cycle::{
    CycleControl, CycleEvent, CycleHandle, CycleOrchestrator, CycleState, OperatorDecision,
    OperatorPrompt,
};
pub use error::{PickPlateError, Result};
pub use link::{LinkEvent, LinkHandle, LinkTransport, SerialLink, SerialTransport};
pub use motion::{HomeAxis, LocationUpdate, MotionController, MotionHandle, MoveTarget};
pub use protocol::{MachineState, Precision};
pub use vision::{FrameSnapshot, NullVision, VisionSource};
