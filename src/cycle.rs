//! Cycle orchestrator: the autonomous pick-and-plate state machine.
//!
//! One worker runs the whole cycle: initialize the stage, wait for the
//! operator to load embryos, then loop pick iterations until the plate is
//! full, the operator bails out, or a stop is requested. Vision candidates
//! arrive as per-frame snapshots from the collaborator behind
//! [`VisionSource`]; every stage motion goes through the blocking
//! [`MotionHandle`] API, so a pick iteration is a straight-line sequence of
//! completed operations.
//!
//! Pause/resume only gates entry into a *new* pick iteration, and a stop
//! request is consulted between iterations: an in-flight pick always runs
//! to completion, never abandoning an embryo mid-air.

use crate::config::{PlatingOrder, PlatingRunConfig, PointMm, Settings};
use crate::error::Result;
use crate::motion::MotionHandle;
use crate::protocol::{MachineState, Precision};
use crate::vision::{
    pickable_candidates, valid_candidates, EmbryoCandidate, PixelCalibration, VisionSource,
};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub const WELL_ROWS: usize = 8;
pub const WELL_COLS: usize = 12;
pub const WELL_PITCH_MM: f64 = 9.0;

/// Idle-poll tick while waiting on the operator or a paused cycle.
const IDLE_TICK: Duration = Duration::from_millis(250);

/// Wait between retries when a frame has no pickable embryo.
const NO_EMBRYO_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Frames without a pickable embryo before escalating to the operator.
const NO_EMBRYO_THRESHOLD: u32 = 3;

/// Light blink half-period during no-embryo recovery.
const BLINK_PERIOD: Duration = Duration::from_millis(500);

const LIGHT_FULL: i32 = 1000;

/// Iteration pointer over the destination plate grid.
#[derive(Debug, Clone, Copy)]
pub struct WellCursor {
    index: usize,
    order: PlatingOrder,
}

impl WellCursor {
    pub fn new(order: PlatingOrder) -> Self {
        Self { index: 0, order }
    }

    fn row_col(&self) -> (usize, usize) {
        match self.order {
            PlatingOrder::RowMajor => (self.index / WELL_COLS, self.index % WELL_COLS),
            PlatingOrder::ColumnMajor => (self.index % WELL_ROWS, self.index / WELL_ROWS),
        }
    }

    pub fn row(&self) -> usize {
        self.row_col().0
    }

    pub fn col(&self) -> usize {
        self.row_col().1
    }

    /// Number of wells already filled.
    pub fn filled(&self) -> usize {
        self.index
    }

    /// Stage position of the current well, relative to the taught A1.
    pub fn position(&self, well_a1: PointMm) -> PointMm {
        let (row, col) = self.row_col();
        PointMm {
            x: well_a1.x + col as f64 * WELL_PITCH_MM,
            y: well_a1.y + row as f64 * WELL_PITCH_MM,
        }
    }

    /// Well name in plate notation, "A1" through "H12".
    pub fn well_name(&self) -> String {
        let (row, col) = self.row_col();
        let row_letter = (b'A' + row as u8) as char;
        format!("{row_letter}{}", col + 1)
    }

    /// Advance to the next well; `false` when the plate is exhausted.
    pub fn advance(&mut self) -> bool {
        self.index += 1;
        self.index < WELL_ROWS * WELL_COLS
    }
}

/// Observable orchestrator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Initializing,
    WaitingForOperatorPlacement,
    Picking,
    NoEmbryoRecovery,
    Ending,
}

/// Events published toward UI collaborators.
#[derive(Debug, Clone)]
pub enum CycleEvent {
    StateChanged(CycleState),
    PickCompleted {
        well: String,
        dish_mm: PointMm,
        wells_filled: usize,
    },
    RunFinished {
        wells_filled: usize,
        elapsed: Duration,
    },
}

/// Operator decisions returned from modal prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorDecision {
    Continue,
    Exit,
}

/// The UI collaborator's modal surface, as seen from the core.
#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    /// Resolve once the operator confirms embryos are loaded in the dish.
    async fn confirm_embryos_loaded(&self) -> OperatorDecision;

    /// Ask whether to keep looking after repeated empty frames.
    async fn no_embryos_found(&self) -> OperatorDecision;
}

/// Control messages for a running orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleControl {
    Start,
    Pause,
    Resume,
    Stop,
}

/// XY feedrate (mm/min) for the synchronized drop: the XY leg must take
/// the configured free-fall time minus the Z time spent on the
/// pick-retract and place-approach legs at the configured vertical
/// velocity, so XY arrival coincides with Z arrival at place depth.
pub fn synchronized_xy_feedrate(distance_mm: f64, run: &PlatingRunConfig) -> f64 {
    let z_travel = (run.traverse_height - run.pick_height).abs()
        + (run.traverse_height - run.place_height).abs();
    let z_time = z_travel / run.vertical_velocity;
    let xy_time = (run.free_fall_time - z_time).max(0.05);
    distance_mm / xy_time * 60.0
}

/// Cloneable handle to the cycle orchestrator.
#[derive(Clone)]
pub struct CycleHandle {
    ctrl_tx: mpsc::UnboundedSender<CycleControl>,
    events: broadcast::Sender<CycleEvent>,
}

impl CycleHandle {
    pub fn start(&self) {
        let _ = self.ctrl_tx.send(CycleControl::Start);
    }

    pub fn pause(&self) {
        let _ = self.ctrl_tx.send(CycleControl::Pause);
    }

    pub fn resume(&self) {
        let _ = self.ctrl_tx.send(CycleControl::Resume);
    }

    pub fn stop(&self) {
        let _ = self.ctrl_tx.send(CycleControl::Stop);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CycleEvent> {
        self.events.subscribe()
    }
}

/// The cycle orchestrator worker.
pub struct CycleOrchestrator {
    motion: MotionHandle,
    vision: Arc<dyn VisionSource>,
    operator: Arc<dyn OperatorPrompt>,
    settings: Settings,
    ctrl_rx: mpsc::UnboundedReceiver<CycleControl>,
    events: broadcast::Sender<CycleEvent>,
    shutdown: watch::Receiver<bool>,
    state: CycleState,
    paused: bool,
    end_requested: bool,
}

impl CycleOrchestrator {
    pub fn spawn(
        motion: MotionHandle,
        vision: Arc<dyn VisionSource>,
        operator: Arc<dyn OperatorPrompt>,
        settings: Settings,
        shutdown: watch::Receiver<bool>,
    ) -> (CycleHandle, JoinHandle<()>) {
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);

        let orchestrator = CycleOrchestrator {
            motion,
            vision,
            operator,
            settings,
            ctrl_rx,
            events: events.clone(),
            shutdown,
            state: CycleState::Idle,
            paused: false,
            end_requested: false,
        };

        let handle = CycleHandle { ctrl_tx, events };
        let task = tokio::spawn(orchestrator.run());
        (handle, task)
    }

    async fn run(mut self) {
        debug!("Cycle orchestrator worker starting");
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                control = self.ctrl_rx.recv() => {
                    match control {
                        Some(CycleControl::Start) => {
                            if let Err(e) = self.run_cycle().await {
                                error!("Cycle aborted: {e}");
                                self.end_run_best_effort().await;
                            }
                            self.set_state(CycleState::Idle);
                        }
                        Some(other) => debug!("Ignoring {other:?} outside a running cycle"),
                        None => break,
                    }
                }
            }
        }
        debug!("Cycle orchestrator worker exiting");
    }

    fn set_state(&mut self, state: CycleState) {
        if self.state != state {
            info!("Cycle state: {:?} -> {:?}", self.state, state);
            self.state = state;
            let _ = self.events.send(CycleEvent::StateChanged(state));
        }
    }

    fn apply_control(&mut self, control: CycleControl) {
        match control {
            CycleControl::Pause => self.paused = true,
            CycleControl::Resume => self.paused = false,
            CycleControl::Stop => self.end_requested = true,
            CycleControl::Start => {}
        }
    }

    fn drain_control(&mut self) {
        while let Ok(control) = self.ctrl_rx.try_recv() {
            self.apply_control(control);
        }
    }

    /// Block while paused; stop requests and shutdown break the gate.
    async fn gate_on_pause(&mut self) -> Result<()> {
        loop {
            self.drain_control();
            if !self.paused || self.end_requested {
                return Ok(());
            }
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Err(crate::error::PickPlateError::ShuttingDown);
                    }
                }
                control = self.ctrl_rx.recv() => {
                    if let Some(control) = control {
                        self.apply_control(control);
                    }
                }
            }
        }
    }

    async fn run_cycle(&mut self) -> Result<()> {
        self.paused = false;
        self.end_requested = false;
        let started = Instant::now();

        let run = PlatingRunConfig::from_settings(&self.settings);
        let calibration = PixelCalibration::from_calibration(&self.settings.calibration)?;
        let mut cursor = WellCursor::new(run.order);

        // ---- Initializing ----
        self.set_state(CycleState::Initializing);
        self.motion.set_motor(true).await?;
        if let Err(e) = self.vision.set_cycle_active(true, &run.profile_name).await {
            warn!("Vision collaborator rejected cycle start: {e:#}");
        }
        self.motion.home_full(Precision::Fine).await?;
        self.motion.set_light(LIGHT_FULL).await?;
        self.motion.move_z(run.traverse_height).await?;

        // ---- Waiting for operator placement ----
        self.set_state(CycleState::WaitingForOperatorPlacement);
        if self.wait_for_placement().await? == OperatorDecision::Exit {
            return self.end_run(&run, started, cursor.filled()).await;
        }

        // ---- Picking ----
        self.set_state(CycleState::Picking);
        let mut no_embryo_strikes = 0u32;
        if let Err(e) = self.vision.request_frame().await {
            warn!("Frame request failed: {e:#}");
        }

        loop {
            self.gate_on_pause().await?;
            if self.end_requested {
                info!("Cycle stop requested; ending after completed pick");
                break;
            }

            // An alarmed device must not be commanded further.
            if self.motion.machine_state().await? == MachineState::Alarm {
                error!("Device reported Alarm; aborting run");
                break;
            }

            let snapshot = match self.vision.next_snapshot().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("Vision snapshot failed: {e:#}");
                    tokio::time::sleep(NO_EMBRYO_RETRY_DELAY).await;
                    let _ = self.vision.request_frame().await;
                    continue;
                }
            };

            // A stop or pause that arrived while waiting on the frame takes
            // effect before a new pick starts.
            self.drain_control();
            if self.paused {
                self.gate_on_pause().await?;
            }
            if self.end_requested {
                info!("Cycle stop requested; ending after completed pick");
                break;
            }

            let valid = valid_candidates(&snapshot.candidates);
            let pickable = pickable_candidates(
                &valid,
                self.settings.detection.min_separation_px,
                self.settings.detection.min_diameter_px,
                self.settings.detection.max_diameter_px,
            );

            if pickable.is_empty() {
                no_embryo_strikes += 1;
                debug!("No pickable embryo ({no_embryo_strikes}/{NO_EMBRYO_THRESHOLD})");
                if no_embryo_strikes >= NO_EMBRYO_THRESHOLD {
                    match self.no_embryo_recovery(&run).await? {
                        OperatorDecision::Continue => {
                            no_embryo_strikes = 0;
                            self.set_state(CycleState::Picking);
                            let _ = self.vision.request_frame().await;
                            continue;
                        }
                        OperatorDecision::Exit => break,
                    }
                }
                tokio::time::sleep(NO_EMBRYO_RETRY_DELAY).await;
                let _ = self.vision.request_frame().await;
                continue;
            }
            no_embryo_strikes = 0;

            // Uniformly random among pickable candidates.
            let chosen = pickable[rand::thread_rng().gen_range(0..pickable.len())];
            let dish_mm = calibration.dish_position(&chosen);
            self.pick_and_place(&run, &chosen, dish_mm, &cursor).await?;

            let _ = self.events.send(CycleEvent::PickCompleted {
                well: cursor.well_name(),
                dish_mm,
                wells_filled: cursor.filled() + 1,
            });

            if !cursor.advance() {
                info!("Plate exhausted after {} wells", cursor.filled());
                break;
            }
        }

        self.end_run(&run, started, cursor.filled()).await
    }

    /// One complete pick: dish approach, aspirate, synchronized drop into
    /// the current well, waste purge.
    async fn pick_and_place(
        &mut self,
        run: &PlatingRunConfig,
        chosen: &EmbryoCandidate,
        dish_mm: PointMm,
        cursor: &WellCursor,
    ) -> Result<()> {
        debug!(
            well = %cursor.well_name(),
            x = dish_mm.x,
            y = dish_mm.y,
            diameter_px = chosen.diameter_px,
            "Picking embryo"
        );

        self.motion.move_z(run.traverse_height).await?;
        self.motion.move_xy(dish_mm.x, dish_mm.y).await?;
        self.motion.move_z(run.pick_height).await?;
        self.motion.pipette(run.pick_volume_ul).await?;

        // Synchronized drop: time the XY leg so it lands together with the
        // Z place-approach leg.
        let well = cursor.position(run.well_a1);
        let distance = (well.x - dish_mm.x).hypot(well.y - dish_mm.y);
        let feedrate = synchronized_xy_feedrate(distance, run);

        self.motion.move_z(run.traverse_height).await?;
        self.motion
            .move_absolute_with_feedrate(
                crate::motion::MoveTarget {
                    x: Some(well.x),
                    y: Some(well.y),
                    ..Default::default()
                },
                feedrate,
            )
            .await?;
        self.motion.move_z(run.place_height).await?;
        self.motion.pipette(-run.place_volume_ul).await?;
        tokio::time::sleep(Duration::from_secs_f64(run.placement_dwell)).await;

        self.motion.move_z(run.traverse_height).await?;
        self.motion.move_xy(run.waste.x, run.waste.y).await?;

        // Pipeline the next frame while the stage is over the waste
        // station, so the snapshot is ready when the next iteration asks.
        let _ = self.vision.request_frame().await;

        let excess = (run.pick_volume_ul - run.place_volume_ul).max(0.0);
        if excess > 0.0 {
            self.motion.pipette(-excess).await?;
        }
        Ok(())
    }

    /// Camera and motor keepalive poll while the operator confirms
    /// placement.
    async fn wait_for_placement(&mut self) -> Result<OperatorDecision> {
        let operator = Arc::clone(&self.operator);
        let confirm = operator.confirm_embryos_loaded();
        tokio::pin!(confirm);
        let mut tick = tokio::time::interval(IDLE_TICK);

        loop {
            tokio::select! {
                decision = &mut confirm => return Ok(decision),
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Err(crate::error::PickPlateError::ShuttingDown);
                    }
                }
                _ = tick.tick() => {
                    let _ = self.vision.request_frame().await;
                    // Steppers stay energized while the dish is handled.
                    self.motion.set_motor(true).await?;
                }
            }
        }
    }

    /// Park over home, blink the lights, and wait for the operator.
    async fn no_embryo_recovery(&mut self, run: &PlatingRunConfig) -> Result<OperatorDecision> {
        self.set_state(CycleState::NoEmbryoRecovery);
        self.motion.move_z(run.traverse_height).await?;
        self.motion.move_xy(0.0, 0.0).await?;

        let operator = Arc::clone(&self.operator);
        let prompt = operator.no_embryos_found();
        tokio::pin!(prompt);
        let mut tick = tokio::time::interval(BLINK_PERIOD);
        let mut lights_on = false;

        let decision = loop {
            tokio::select! {
                decision = &mut prompt => break decision,
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Err(crate::error::PickPlateError::ShuttingDown);
                    }
                }
                _ = tick.tick() => {
                    lights_on = !lights_on;
                    self.motion
                        .set_light(if lights_on { LIGHT_FULL } else { 0 })
                        .await?;
                    // Keep the steppers energized while the dish is handled.
                    self.motion.set_motor(true).await?;
                }
            }
        };

        self.motion.set_light(LIGHT_FULL).await?;
        Ok(decision)
    }

    /// Ending: retract, purge, park, lights and motors off, telemetry.
    async fn end_run(
        &mut self,
        run: &PlatingRunConfig,
        started: Instant,
        wells_filled: usize,
    ) -> Result<()> {
        self.set_state(CycleState::Ending);

        self.motion.move_z(run.traverse_height).await?;
        self.motion.move_xy(run.waste.x, run.waste.y).await?;
        self.motion.pipette(-run.purge_volume_ul).await?;
        self.motion.move_xy(0.0, 0.0).await?;
        self.motion.set_light(0).await?;
        self.motion.set_motor(false).await?;

        if let Err(e) = self.vision.set_cycle_active(false, &run.profile_name).await {
            warn!("Vision collaborator rejected cycle stop: {e:#}");
        }

        let elapsed = started.elapsed();
        info!(
            wells_filled,
            elapsed_s = elapsed.as_secs_f64(),
            "Pick-and-plate cycle finished"
        );
        let _ = self.events.send(CycleEvent::RunFinished {
            wells_filled,
            elapsed,
        });
        Ok(())
    }

    /// Ending pass used after a cycle error; every step is best effort.
    async fn end_run_best_effort(&mut self) {
        self.set_state(CycleState::Ending);
        let run = PlatingRunConfig::from_settings(&self.settings);
        let _ = self.motion.move_z(run.traverse_height).await;
        let _ = self.motion.move_xy(0.0, 0.0).await;
        let _ = self.motion.set_light(0).await;
        let _ = self.motion.set_motor(false).await;
        let _ = self.vision.set_cycle_active(false, &run.profile_name).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_config() -> PlatingRunConfig {
        PlatingRunConfig::from_settings(&Settings::default())
    }

    #[test]
    fn test_row_major_advancement_visits_rows_of_twelve() {
        let mut cursor = WellCursor::new(PlatingOrder::RowMajor);
        assert_eq!(cursor.well_name(), "A1");

        for n in 0..(WELL_ROWS * WELL_COLS - 1) {
            assert!(cursor.advance(), "exhausted early at index {n}");
            let expected_row = (n + 1) / WELL_COLS;
            let expected_col = (n + 1) % WELL_COLS;
            assert_eq!(cursor.row(), expected_row);
            assert_eq!(cursor.col(), expected_col);
        }
        assert_eq!(cursor.well_name(), "H12");
        assert!(!cursor.advance(), "96th advance must end the run");
    }

    #[test]
    fn test_column_major_is_the_transpose() {
        let mut cursor = WellCursor::new(PlatingOrder::ColumnMajor);
        for _ in 0..WELL_ROWS {
            cursor.advance();
        }
        // After 8 wells the cursor wraps to the second column, first row.
        assert_eq!(cursor.row(), 0);
        assert_eq!(cursor.col(), 1);
        assert_eq!(cursor.well_name(), "A2");
    }

    #[test]
    fn test_well_positions_increase_by_pitch() {
        let mut cursor = WellCursor::new(PlatingOrder::RowMajor);
        let a1 = PointMm { x: -34.0, y: -135.0 };
        let first = cursor.position(a1);
        cursor.advance();
        let second = cursor.position(a1);
        assert!((second.x - first.x - WELL_PITCH_MM).abs() < 1e-9);
        assert_eq!(second.y, first.y);

        // Last well of the first row, then the first well of the second.
        let mut cursor = WellCursor::new(PlatingOrder::RowMajor);
        for _ in 0..WELL_COLS {
            cursor.advance();
        }
        let row2 = cursor.position(a1);
        assert_eq!(row2.x, a1.x);
        assert!((row2.y - a1.y - WELL_PITCH_MM).abs() < 1e-9);
    }

    #[test]
    fn test_synchronized_feedrate_subtracts_z_time() {
        let mut run = run_config();
        run.traverse_height = 12.0;
        run.pick_height = 4.0;
        run.place_height = 4.0;
        run.vertical_velocity = 16.0;
        run.free_fall_time = 2.0;

        // Z travel: 8 mm down-up legs => 16 mm at 16 mm/s = 1 s.
        // XY leg gets the remaining 1 s: 90 mm => 5400 mm/min.
        let feedrate = synchronized_xy_feedrate(90.0, &run);
        assert!((feedrate - 5400.0).abs() < 1e-6);
    }

    #[test]
    fn test_synchronized_feedrate_clamps_exhausted_budget() {
        let mut run = run_config();
        run.free_fall_time = 0.01;
        // The XY time budget is clamped to a small positive floor rather
        // than going negative.
        let feedrate = synchronized_xy_feedrate(10.0, &run);
        assert!(feedrate.is_finite());
        assert!(feedrate > 0.0);
    }
}
