//! Motion controller worker: a request/completion facade over the serial
//! link.
//!
//! Callers get a synchronous-looking async API ([`MotionHandle`]): each
//! request enqueues the matching [`OutboundCommand`] and resolves only when
//! its completion condition holds. The device gives no per-command
//! completion callback, so completion is inferred from its asynchronous
//! status stream:
//!
//! - homing completes when the machine state leaves `Homing`, a state this
//!   worker enters *synthetically* at issue time, before the device has
//!   reported it;
//! - motion completes when the machine state is no longer `MotionRunning`,
//!   sampled after a short settle delay so a slow state transition on the
//!   device is not mistaken for an already-finished move;
//! - light/motor/setting changes complete on a command acknowledgement.
//!
//! There is deliberately no per-call timeout: a device that never responds
//! stalls the requesting worker until shutdown, exactly like the machine
//! this controls. Reconnection of the link is the only cancellation-like
//! primitive.

use crate::config::Settings;
use crate::error::{PickPlateError, Result};
use crate::link::{LinkEvent, LinkHandle};
use crate::protocol::{
    AxisPosition, MachineState, OutboundCommand, Precision, MM_PER_MICROLITER,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Completion-wait poll tick.
const POLL_TICK: Duration = Duration::from_millis(50);

/// Delay before sampling machine state after issuing a move.
const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Relative jog applied before X/Y homing so a carriage parked on a homing
/// switch does not false-trigger it.
const HOMING_BACKOFF_MM: f64 = -20.0;

/// X/Y settle tolerance for the precision homing poll, in mm.
const ORIGIN_EPSILON_MM: f64 = 0.01;

/// Which axis group a homing request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomeAxis {
    A,
    Z,
    Xy,
}

/// Stage location snapshot published after every position change.
/// The A axis is converted to microliters for consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LocationUpdate {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub a_microliters: f64,
}

impl From<AxisPosition> for LocationUpdate {
    fn from(p: AxisPosition) -> Self {
        Self {
            x: p.x,
            y: p.y,
            z: p.z,
            a_microliters: p.a / MM_PER_MICROLITER,
        }
    }
}

/// Target for an absolute move; `None` leaves that axis where it is.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MoveTarget {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub a: Option<f64>,
}

enum Request {
    MoveAbsolute {
        target: MoveTarget,
        feedrate: Option<f64>,
        reply: oneshot::Sender<Result<()>>,
    },
    MoveRelative {
        x: f64,
        y: f64,
        z: f64,
        a: f64,
        reply: oneshot::Sender<Result<()>>,
    },
    Home {
        axis: HomeAxis,
        precision: Precision,
        reply: oneshot::Sender<Result<()>>,
    },
    HomeFull {
        precision: Precision,
        reply: oneshot::Sender<Result<()>>,
    },
    SetLight {
        brightness: i32,
        reply: oneshot::Sender<Result<()>>,
    },
    SetMotor {
        enabled: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    ReadState {
        reply: oneshot::Sender<MachineState>,
    },
}

/// Cloneable handle to the motion controller worker.
#[derive(Clone)]
pub struct MotionHandle {
    req_tx: mpsc::Sender<Request>,
    location: watch::Receiver<LocationUpdate>,
}

impl MotionHandle {
    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<()>>) -> Request,
    ) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.req_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| PickPlateError::MotionStopped)?;
        reply_rx.await.map_err(|_| PickPlateError::MotionStopped)?
    }

    pub async fn move_absolute(&self, target: MoveTarget) -> Result<()> {
        self.request(|reply| Request::MoveAbsolute {
            target,
            feedrate: None,
            reply,
        })
        .await
    }

    pub async fn move_absolute_with_feedrate(
        &self,
        target: MoveTarget,
        feedrate: f64,
    ) -> Result<()> {
        self.request(|reply| Request::MoveAbsolute {
            target,
            feedrate: Some(feedrate),
            reply,
        })
        .await
    }

    pub async fn move_xy(&self, x: f64, y: f64) -> Result<()> {
        self.move_absolute(MoveTarget {
            x: Some(x),
            y: Some(y),
            ..MoveTarget::default()
        })
        .await
    }

    pub async fn move_z(&self, z: f64) -> Result<()> {
        self.move_absolute(MoveTarget {
            z: Some(z),
            ..MoveTarget::default()
        })
        .await
    }

    pub async fn move_relative(&self, x: f64, y: f64, z: f64, a: f64) -> Result<()> {
        self.request(|reply| Request::MoveRelative { x, y, z, a, reply })
            .await
    }

    /// Move the pipette plunger by a signed volume; positive aspirates,
    /// negative dispenses.
    pub async fn pipette(&self, microliters: f64) -> Result<()> {
        self.move_relative(0.0, 0.0, 0.0, MM_PER_MICROLITER * microliters)
            .await
    }

    pub async fn home(&self, axis: HomeAxis, precision: Precision) -> Result<()> {
        self.request(|reply| Request::Home {
            axis,
            precision,
            reply,
        })
        .await
    }

    /// Full homing sequence: A, rough Z, X/Y back-off jog, X/Y; the fine
    /// variant continues with the precision pass.
    pub async fn home_full(&self, precision: Precision) -> Result<()> {
        self.request(|reply| Request::HomeFull { precision, reply })
            .await
    }

    pub async fn set_light(&self, brightness: i32) -> Result<()> {
        self.request(|reply| Request::SetLight { brightness, reply })
            .await
    }

    pub async fn set_motor(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Request::SetMotor { enabled, reply })
            .await
    }

    /// Last machine state observed by the motion worker.
    pub async fn machine_state(&self) -> Result<MachineState> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.req_tx
            .send(Request::ReadState { reply: reply_tx })
            .await
            .map_err(|_| PickPlateError::MotionStopped)?;
        reply_rx.await.map_err(|_| PickPlateError::MotionStopped)
    }

    /// Location snapshots, updated after every device position report.
    pub fn location(&self) -> watch::Receiver<LocationUpdate> {
        self.location.clone()
    }
}

/// The motion controller worker. Keeps its own view of machine state and
/// position, fed by link events; the synthetic `Homing` entry lives here.
pub struct MotionController {
    link: LinkHandle,
    events: broadcast::Receiver<LinkEvent>,
    req_rx: mpsc::Receiver<Request>,
    location_tx: watch::Sender<LocationUpdate>,
    shutdown: watch::Receiver<bool>,
    precision_reference: (f64, f64),
    state: MachineState,
    position: AxisPosition,
    ack_seen: bool,
    events_closed: bool,
}

impl MotionController {
    pub fn spawn(
        link: LinkHandle,
        settings: &Settings,
        shutdown: watch::Receiver<bool>,
    ) -> (MotionHandle, JoinHandle<()>) {
        let (req_tx, req_rx) = mpsc::channel(16);
        let (location_tx, location_rx) = watch::channel(LocationUpdate::default());
        let events = link.subscribe();
        let reference = settings.calibration.precision_reference;

        let controller = MotionController {
            link,
            events,
            req_rx,
            location_tx,
            shutdown,
            precision_reference: (reference.x, reference.y),
            state: MachineState::Initializing,
            position: AxisPosition::default(),
            ack_seen: false,
            events_closed: false,
        };

        let handle = MotionHandle {
            req_tx,
            location: location_rx,
        };
        let task = tokio::spawn(controller.run());
        (handle, task)
    }

    async fn run(mut self) {
        debug!("Motion controller worker starting");
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                event = self.events.recv(), if !self.events_closed => {
                    self.apply_event(event);
                }
                request = self.req_rx.recv() => {
                    match request {
                        Some(request) => self.handle_request(request).await,
                        None => break,
                    }
                }
            }
        }
        debug!("Motion controller worker exiting");
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::MoveAbsolute {
                target,
                feedrate,
                reply,
            } => {
                let result = self.do_move_absolute(target, feedrate).await;
                let _ = reply.send(result);
            }
            Request::MoveRelative { x, y, z, a, reply } => {
                let result = self.do_move_relative(x, y, z, a).await;
                let _ = reply.send(result);
            }
            Request::Home {
                axis,
                precision,
                reply,
            } => {
                let result = self.do_home(axis, precision).await;
                let _ = reply.send(result);
            }
            Request::HomeFull { precision, reply } => {
                let result = self.do_home_full(precision).await;
                let _ = reply.send(result);
            }
            Request::SetLight { brightness, reply } => {
                let result = self.do_acknowledged(OutboundCommand::LightSet(brightness)).await;
                let _ = reply.send(result);
            }
            Request::SetMotor { enabled, reply } => {
                let result = self.do_acknowledged(OutboundCommand::MotorEnable(enabled)).await;
                let _ = reply.send(result);
            }
            Request::ReadState { reply } => {
                let _ = reply.send(self.state);
            }
        }
    }

    fn apply_event(&mut self, event: std::result::Result<LinkEvent, broadcast::error::RecvError>) {
        match event {
            Ok(LinkEvent::MachineStateChanged(state)) => {
                self.state = state;
            }
            Ok(LinkEvent::LocationChanged(position)) => {
                self.position = position;
                let _ = self.location_tx.send(LocationUpdate::from(position));
            }
            Ok(LinkEvent::CommandAcknowledged) => {
                self.ack_seen = true;
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                // Snapshots are eventually consistent; the stream resumes
                // from the next report.
                warn!("Motion controller lagged {missed} link events");
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.events_closed = true;
            }
        }
    }

    /// Wait until `done(self)` holds, consuming link events cooperatively.
    /// No timeout: a wedged device stalls this worker until shutdown.
    async fn wait_until(&mut self, done: impl Fn(&Self) -> bool) -> Result<()> {
        let mut tick = tokio::time::interval(POLL_TICK);
        loop {
            if done(self) {
                return Ok(());
            }
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Err(PickPlateError::ShuttingDown);
                    }
                }
                event = self.events.recv(), if !self.events_closed => {
                    self.apply_event(event);
                }
                _ = tick.tick() => {}
            }
        }
    }

    /// Absorb link events for a fixed duration (the settle window between
    /// issuing a move and trusting the machine-state sample).
    async fn absorb_events_for(&mut self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            if Instant::now() >= deadline {
                return Ok(());
            }
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Err(PickPlateError::ShuttingDown);
                    }
                }
                event = self.events.recv(), if !self.events_closed => {
                    self.apply_event(event);
                }
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    async fn do_move_absolute(&mut self, target: MoveTarget, feedrate: Option<f64>) -> Result<()> {
        let command = match feedrate {
            Some(feedrate) => OutboundCommand::MoveAbsoluteWithFeedrate {
                x: target.x,
                y: target.y,
                z: target.z,
                a: target.a,
                feedrate,
            },
            None => OutboundCommand::MoveAbsolute {
                x: target.x,
                y: target.y,
                z: target.z,
                a: target.a,
            },
        };
        debug!(?target, ?feedrate, "Absolute move requested");
        self.link.enqueue(command)?;
        self.wait_for_motion_settled().await
    }

    async fn do_move_relative(&mut self, x: f64, y: f64, z: f64, a: f64) -> Result<()> {
        // Desired position is computed at issue time, not completion time.
        let desired = AxisPosition {
            x: self.position.x + x,
            y: self.position.y + y,
            z: self.position.z + z,
            a: self.position.a + a,
        };
        debug!(?desired, "Relative move requested");
        self.link
            .enqueue(OutboundCommand::MoveRelative { x, y, z, a })?;
        self.wait_for_motion_settled().await
    }

    async fn wait_for_motion_settled(&mut self) -> Result<()> {
        self.absorb_events_for(SETTLE_DELAY).await?;
        self.wait_until(|s| s.state != MachineState::MotionRunning)
            .await
    }

    async fn do_home(&mut self, axis: HomeAxis, precision: Precision) -> Result<()> {
        let command = match (axis, precision) {
            (HomeAxis::A, _) => OutboundCommand::HomeA,
            (HomeAxis::Z, precision) => OutboundCommand::HomeZ(precision),
            (HomeAxis::Xy, Precision::Rough) => OutboundCommand::HomeXY,
            (HomeAxis::Xy, Precision::Fine) => OutboundCommand::HomeXYPrecision,
        };
        self.link.enqueue(command)?;

        // The device has not reported Homing yet; enter it synthetically
        // and wait for the device to report anything else.
        self.state = MachineState::Homing;
        self.wait_until(|s| s.state != MachineState::Homing).await?;
        debug!(?axis, ?precision, "Homing complete");
        Ok(())
    }

    async fn do_home_full(&mut self, precision: Precision) -> Result<()> {
        info!("Full homing sequence starting");
        self.do_home(HomeAxis::A, Precision::Rough).await?;
        self.do_home(HomeAxis::Z, Precision::Rough).await?;
        self.do_move_relative(HOMING_BACKOFF_MM, HOMING_BACKOFF_MM, 0.0, 0.0)
            .await?;
        self.do_home(HomeAxis::Xy, Precision::Rough).await?;

        if precision == Precision::Fine {
            let (ref_x, ref_y) = self.precision_reference;
            self.do_move_absolute(
                MoveTarget {
                    x: Some(ref_x),
                    y: Some(ref_y),
                    ..MoveTarget::default()
                },
                None,
            )
            .await?;
            self.do_home(HomeAxis::Z, Precision::Fine).await?;
            self.do_home(HomeAxis::Xy, Precision::Fine).await?;

            // The device re-reports positions as the axes settle at the
            // switches; hold until X/Y read as origin.
            self.wait_until(|s| {
                s.position.x.abs() <= ORIGIN_EPSILON_MM && s.position.y.abs() <= ORIGIN_EPSILON_MM
            })
            .await?;
        }
        info!("Full homing sequence complete");
        Ok(())
    }

    async fn do_acknowledged(&mut self, command: OutboundCommand) -> Result<()> {
        self.ack_seen = false;
        self.link.enqueue(command)?;
        self.wait_until(|s| s.ack_seen).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_update_converts_a_axis_to_microliters() {
        let update = LocationUpdate::from(AxisPosition {
            x: 1.0,
            y: 2.0,
            z: 3.0,
            a: MM_PER_MICROLITER * 12.5,
        });
        assert!((update.a_microliters - 12.5).abs() < 1e-9);
        assert_eq!(update.x, 1.0);
    }

    #[test]
    fn test_move_target_default_ignores_all_axes() {
        let target = MoveTarget::default();
        assert!(target.x.is_none());
        assert!(target.a.is_none());
    }
}
