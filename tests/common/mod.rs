//! Shared test harness: an in-memory device simulator that speaks the
//! firmware's line-delimited JSON dialect over a duplex stream.

use async_trait::async_trait;
use pickplate::cycle::{OperatorDecision, OperatorPrompt};
use pickplate::link::{LinkStream, LinkTransport};
use pickplate::vision::{EmbryoCandidate, FrameSnapshot, VisionSource};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

/// Transport that hands out one pre-built duplex stream, then parks.
pub struct DuplexTransport {
    stream: Option<DuplexStream>,
}

impl DuplexTransport {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream: Some(stream),
        }
    }
}

#[async_trait]
impl LinkTransport for DuplexTransport {
    async fn open(&mut self) -> anyhow::Result<Box<dyn LinkStream>> {
        match self.stream.take() {
            Some(stream) => Ok(Box::new(stream)),
            // Reconnect attempts after the simulated device is gone hang
            // forever; the tests end by shutdown, not by reconnect.
            None => std::future::pending().await,
        }
    }
}

/// Everything the simulated device has received, for assertions.
#[derive(Debug, Default)]
pub struct DeviceLog {
    pub gcode: Vec<String>,
    pub frames: Vec<String>,
}

/// Simulated firmware: acks every frame, replenishes queue credit, and
/// plays back plausible status reports for motion and homing commands.
pub struct DeviceSim {
    pub log: Arc<Mutex<DeviceLog>>,
    pub task: JoinHandle<()>,
}

impl DeviceSim {
    /// Spawn the simulator on one end of a fresh duplex pipe; returns the
    /// simulator and the transport for the link under test.
    pub fn spawn() -> (Self, DuplexTransport) {
        let (device_end, link_end) = tokio::io::duplex(4096);
        let log = Arc::new(Mutex::new(DeviceLog::default()));
        let task = tokio::spawn(Self::run(device_end, Arc::clone(&log)));
        (Self { log, task }, DuplexTransport::new(link_end))
    }

    async fn run(stream: DuplexStream, log: Arc<Mutex<DeviceLog>>) {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half).split(b'\n');
        let mut pos = [0.0f64; 4];

        while let Ok(Some(line)) = lines.next_segment().await {
            let text = String::from_utf8_lossy(&line).to_string();
            log.lock().unwrap().frames.push(text.clone());

            let value: serde_json::Value = match serde_json::from_slice(&line) {
                Ok(value) => value,
                // Raw control bytes (firmware reset) are not JSON.
                Err(_) => continue,
            };

            // Every accepted frame is acked and the buffer slot returned.
            let _ = write_half.write_all(b"{\"r\":{}}\n").await;
            let _ = write_half.write_all(b"{\"qr\":28}\n").await;

            let gc = match value.get("gc").and_then(|g| g.as_str()) {
                Some(gc) => gc.to_string(),
                // Setting frames (zsn, me, sys, ...) need only the ack.
                None => continue,
            };
            log.lock().unwrap().gcode.push(gc.clone());

            if gc.contains("G28.2") {
                for (i, token) in [(0, 'X'), (1, 'Y'), (2, 'Z'), (3, 'A')] {
                    if gc.contains(token) {
                        pos[i] = 0.0;
                    }
                }
                let _ = write_half.write_all(b"{\"sr\":{\"stat\":9}}\n").await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                let _ = write_half.write_all(status_line(&pos, 1).as_bytes()).await;
            } else if gc.starts_with("G90") {
                apply_axis_tokens(&gc, &mut pos, false);
                let _ = write_half.write_all(b"{\"sr\":{\"stat\":5}}\n").await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                let _ = write_half.write_all(status_line(&pos, 1).as_bytes()).await;
            } else if gc.starts_with("G91") {
                apply_axis_tokens(&gc, &mut pos, true);
                let _ = write_half.write_all(b"{\"sr\":{\"stat\":5}}\n").await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                let _ = write_half.write_all(status_line(&pos, 1).as_bytes()).await;
            }
            // M3 (light) needs only the ack above.
            let _ = write_half.flush().await;
        }
    }
}

fn status_line(pos: &[f64; 4], stat: i64) -> String {
    format!(
        "{{\"sr\":{{\"posx\":{},\"posy\":{},\"posz\":{},\"posa\":{},\"stat\":{}}}}}\n",
        pos[0], pos[1], pos[2], pos[3], stat
    )
}

/// Apply `X..`/`Y..`/`Z..`/`A..` tokens of a move command to the position,
/// absolutely or as deltas.
fn apply_axis_tokens(gc: &str, pos: &mut [f64; 4], relative: bool) {
    for token in gc.split_whitespace() {
        let mut chars = token.chars();
        let axis = match chars.next() {
            Some(c @ ('X' | 'Y' | 'Z' | 'A')) => c,
            _ => continue,
        };
        let value: f64 = match chars.as_str().parse() {
            Ok(value) => value,
            Err(_) => continue,
        };
        let i = match axis {
            'X' => 0,
            'Y' => 1,
            'Z' => 2,
            _ => 3,
        };
        if relative {
            pos[i] += value;
        } else {
            pos[i] = value;
        }
    }
}

/// Vision source that hands out the same frame every time. The gated
/// variant blocks `next_snapshot` until the test releases a permit, which
/// pins down exactly how many picks a run may attempt.
pub struct FixedVision {
    candidates: Vec<EmbryoCandidate>,
    frame_gate: Option<tokio::sync::Semaphore>,
    pub frames_requested: AtomicUsize,
}

impl FixedVision {
    pub fn new(candidates: Vec<EmbryoCandidate>) -> Self {
        Self {
            candidates,
            frame_gate: None,
            frames_requested: AtomicUsize::new(0),
        }
    }

    pub fn gated(candidates: Vec<EmbryoCandidate>) -> Self {
        Self {
            candidates,
            frame_gate: Some(tokio::sync::Semaphore::new(0)),
            frames_requested: AtomicUsize::new(0),
        }
    }

    pub fn allow_frames(&self, count: usize) {
        if let Some(gate) = &self.frame_gate {
            gate.add_permits(count);
        }
    }
}

#[async_trait]
impl VisionSource for FixedVision {
    async fn set_cycle_active(&self, _active: bool, _profile: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn request_frame(&self) -> anyhow::Result<()> {
        self.frames_requested.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn next_snapshot(&self) -> anyhow::Result<FrameSnapshot> {
        if let Some(gate) = &self.frame_gate {
            gate.acquire().await?.forget();
        }
        Ok(FrameSnapshot {
            candidates: self.candidates.clone(),
        })
    }
}

/// Operator with canned answers; placement confirmation can be delayed to
/// hold a run in the placement wait.
pub struct AutoOperator {
    pub placement: OperatorDecision,
    pub recovery: OperatorDecision,
    pub placement_delay: Duration,
}

impl AutoOperator {
    pub fn continues() -> Self {
        Self {
            placement: OperatorDecision::Continue,
            recovery: OperatorDecision::Exit,
            placement_delay: Duration::ZERO,
        }
    }

    pub fn with_placement_delay(delay: Duration) -> Self {
        Self {
            placement_delay: delay,
            ..Self::continues()
        }
    }
}

#[async_trait]
impl OperatorPrompt for AutoOperator {
    async fn confirm_embryos_loaded(&self) -> OperatorDecision {
        if !self.placement_delay.is_zero() {
            tokio::time::sleep(self.placement_delay).await;
        }
        self.placement
    }

    async fn no_embryos_found(&self) -> OperatorDecision {
        self.recovery
    }
}

/// Settings tuned for fast test runs: real geometry, minimal dwell.
pub fn test_settings() -> pickplate::Settings {
    let mut settings = pickplate::Settings::default();
    settings.calibration.placement_dwell_s = 0.01;
    settings
}
