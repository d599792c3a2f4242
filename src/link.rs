//! Serial link worker: line-delimited JSON transport with device-driven
//! flow control.
//!
//! The link owns the physical connection and is the only writer of machine
//! state and axis positions; everything downstream sees those as events.
//! Flow control is credit-based: the device reports its remaining inbound
//! buffer slots (`qr`), and the drain loop transmits the head of the
//! outbound queue only while more than [`CREDIT_LOW_WATER`] slots remain.
//! There is no per-command acknowledgement handshake.
//!
//! Connection loss is never fatal: the link reconnects forever on a fixed
//! backoff, and a reconnect is a hard reset of transport state: the
//! outbound queue and any partially buffered inbound line are discarded,
//! not resumed.

use crate::error::{PickPlateError, Result};
use crate::protocol::{
    decode_line, AxisPosition, DeviceReport, Frame, MachineState, OutboundCommand,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Transmit only while the device reports more credit than this.
pub const CREDIT_LOW_WATER: i64 = 10;

/// Device inbound buffer size assumed until the first `qr` report.
pub const CREDIT_INITIAL: i64 = 32;

/// Fixed delay between connection attempts.
pub const RECONNECT_BACKOFF: Duration = Duration::from_millis(2500);

/// Drain loop tick; one frame may be transmitted per tick.
pub const DRAIN_TICK: Duration = Duration::from_millis(50);

const EVENT_CHANNEL_CAPACITY: usize = 512;

/// Events published by the link's decode path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LinkEvent {
    MachineStateChanged(MachineState),
    LocationChanged(AxisPosition),
    CommandAcknowledged,
}

/// Byte stream to the device.
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> LinkStream for T {}

/// Opens the connection to the device; swapped out for an in-memory
/// stream in tests.
#[async_trait]
pub trait LinkTransport: Send {
    async fn open(&mut self) -> anyhow::Result<Box<dyn LinkStream>>;
}

/// Real serial port at 115200 8N1 via tokio-serial.
pub struct SerialTransport {
    port: String,
    baud: u32,
}

impl SerialTransport {
    pub fn new(port: impl Into<String>, baud: u32) -> Self {
        Self {
            port: port.into(),
            baud,
        }
    }
}

#[async_trait]
impl LinkTransport for SerialTransport {
    async fn open(&mut self) -> anyhow::Result<Box<dyn LinkStream>> {
        use anyhow::Context;
        let stream = tokio_serial::SerialStream::open(&tokio_serial::new(&self.port, self.baud))
            .with_context(|| format!("Failed to open serial port '{}'", self.port))?;
        Ok(Box::new(stream))
    }
}

/// Outbound frame queue with device credit. FIFO, unbounded.
#[derive(Debug)]
pub(crate) struct Outbox {
    queue: VecDeque<Frame>,
    credit: i64,
}

impl Outbox {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            credit: CREDIT_INITIAL,
        }
    }

    pub(crate) fn push(&mut self, command: &OutboundCommand) {
        self.queue.extend(command.frames());
    }

    pub(crate) fn set_credit(&mut self, credit: i64) {
        self.credit = credit;
    }

    /// Pop the head frame iff the queue is non-empty and credit is above
    /// the low-water mark.
    pub(crate) fn pop_transmittable(&mut self) -> Option<Frame> {
        if self.credit > CREDIT_LOW_WATER {
            self.queue.pop_front()
        } else {
            None
        }
    }

    pub(crate) fn clear(&mut self) {
        self.queue.clear();
        self.credit = CREDIT_INITIAL;
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Cloneable handle for enqueueing commands and subscribing to events.
#[derive(Clone)]
pub struct LinkHandle {
    cmd_tx: mpsc::UnboundedSender<OutboundCommand>,
    events: broadcast::Sender<LinkEvent>,
}

impl LinkHandle {
    /// Append a command's frames to the tail of the outbound queue.
    pub fn enqueue(&self, command: OutboundCommand) -> Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| PickPlateError::LinkClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }
}

/// The serial link worker. Owns the transport, the outbound queue, and the
/// authoritative copy of device-reported state.
pub struct SerialLink {
    transport: Box<dyn LinkTransport>,
    cmd_rx: mpsc::UnboundedReceiver<OutboundCommand>,
    events: broadcast::Sender<LinkEvent>,
    shutdown: watch::Receiver<bool>,
    outbox: Outbox,
    position: AxisPosition,
    velocity: f64,
    machine_state: MachineState,
    commands_closed: bool,
}

impl SerialLink {
    /// Spawn the link worker; returns its handle and join handle.
    pub fn spawn(
        transport: Box<dyn LinkTransport>,
        shutdown: watch::Receiver<bool>,
    ) -> (LinkHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let link = SerialLink {
            transport,
            cmd_rx,
            events: events.clone(),
            shutdown,
            outbox: Outbox::new(),
            position: AxisPosition::default(),
            velocity: 0.0,
            machine_state: MachineState::Initializing,
            commands_closed: false,
        };

        let handle = LinkHandle { cmd_tx, events };
        let task = tokio::spawn(link.run());
        (handle, task)
    }

    async fn run(mut self) {
        debug!("Serial link worker starting");
        while !*self.shutdown.borrow() && !self.commands_closed {
            let stream = match self.transport.open().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Unable to connect to motion controller: {e:#}. Trying again.");
                    self.sleep_or_shutdown(RECONNECT_BACKOFF).await;
                    continue;
                }
            };

            // Hard reset of transport state on every (re)connect.
            self.outbox.clear();
            info!("Motion controller serial connection established");

            if let Err(e) = self.drive(stream).await {
                warn!("Serial connection lost: {e:#}. Reconnecting.");
                self.sleep_or_shutdown(RECONNECT_BACKOFF).await;
            }
        }
        debug!("Serial link worker exiting");
    }

    /// Run the drain loop over one connection. Returns `Ok(())` on clean
    /// shutdown, `Err` when the connection drops.
    async fn drive(&mut self, stream: Box<dyn LinkStream>) -> anyhow::Result<()> {
        let (read_half, mut write_half) = tokio::io::split(stream);
        // Partial inbound lines live in this reader and die with it on
        // reconnect.
        let mut lines = BufReader::new(read_half).split(b'\n');
        let mut tick = tokio::time::interval(DRAIN_TICK);

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        self.drain_lights_off(&mut write_half).await;
                        return Ok(());
                    }
                }

                command = self.cmd_rx.recv() => {
                    match command {
                        Some(command) => self.outbox.push(&command),
                        None => {
                            // Every handle is gone; nothing can enqueue
                            // again, so the worker winds down for good.
                            self.commands_closed = true;
                            self.drain_lights_off(&mut write_half).await;
                            return Ok(());
                        }
                    }
                }

                segment = lines.next_segment() => {
                    match segment? {
                        Some(line) => self.handle_line(&line),
                        None => anyhow::bail!("serial stream closed by peer"),
                    }
                }

                _ = tick.tick() => {
                    if let Some(frame) = self.outbox.pop_transmittable() {
                        write_half.write_all(frame.as_bytes()).await?;
                        write_half.flush().await?;
                    }
                }
            }
        }
    }

    fn handle_line(&mut self, line: &[u8]) {
        match decode_line(line) {
            Some(DeviceReport::Status(sr)) => {
                if let Some(vel) = sr.vel {
                    self.velocity = vel;
                }
                if let Some(x) = sr.posx {
                    self.position.x = x;
                }
                if let Some(y) = sr.posy {
                    self.position.y = y;
                }
                if let Some(z) = sr.posz {
                    self.position.z = z;
                }
                if let Some(a) = sr.posa {
                    self.position.a = a;
                }
                if let Some(stat) = sr.stat {
                    match MachineState::from_stat(stat) {
                        Some(state) => {
                            if state != self.machine_state {
                                debug!(
                                    velocity = self.velocity,
                                    "Machine state {:?} -> {:?}", self.machine_state, state
                                );
                            }
                            self.machine_state = state;
                            let _ = self.events.send(LinkEvent::MachineStateChanged(state));
                        }
                        None => warn!("Device reported unknown stat value {stat}"),
                    }
                }
                let _ = self.events.send(LinkEvent::LocationChanged(self.position));
            }
            Some(DeviceReport::QueueCredit(credit)) => {
                self.outbox.set_credit(credit);
            }
            Some(DeviceReport::Ack) => {
                let _ = self.events.send(LinkEvent::CommandAcknowledged);
            }
            // Malformed or debug lines are dropped by design; the firmware
            // has no NACK concept.
            None => {}
        }
    }

    /// Best-effort final "lights off" on clean shutdown.
    async fn drain_lights_off(&mut self, write_half: &mut (impl AsyncWrite + Unpin)) {
        for frame in OutboundCommand::LightSet(0).frames() {
            let _ = write_half.write_all(frame.as_bytes()).await;
        }
        let _ = write_half.flush().await;
        info!("Serial link shut down, lights off");
    }

    async fn sleep_or_shutdown(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown.changed() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Precision;

    #[test]
    fn test_outbox_holds_frames_below_low_water() {
        let mut outbox = Outbox::new();
        outbox.push(&OutboundCommand::LightSet(1000));
        outbox.set_credit(10);
        assert!(outbox.pop_transmittable().is_none());
        outbox.set_credit(3);
        assert!(outbox.pop_transmittable().is_none());
        outbox.set_credit(11);
        assert!(outbox.pop_transmittable().is_some());
    }

    #[test]
    fn test_outbox_empty_queue_transmits_nothing() {
        let mut outbox = Outbox::new();
        outbox.set_credit(32);
        assert!(outbox.pop_transmittable().is_none());
    }

    #[test]
    fn test_outbox_preserves_fifo_across_credit_changes() {
        let mut outbox = Outbox::new();
        outbox.push(&OutboundCommand::HomeZ(Precision::Rough));
        outbox.push(&OutboundCommand::HomeA);
        let expected: Vec<_> = OutboundCommand::HomeZ(Precision::Rough)
            .frames()
            .into_iter()
            .chain(OutboundCommand::HomeA.frames())
            .collect();

        let mut sent = Vec::new();
        // Alternate starving and feeding credit; order must not change.
        for (i, _) in expected.iter().enumerate() {
            outbox.set_credit(if i % 2 == 0 { 5 } else { 30 });
            if let Some(frame) = outbox.pop_transmittable() {
                sent.push(frame);
            }
            outbox.set_credit(30);
            if sent.len() < expected.len() {
                if let Some(frame) = outbox.pop_transmittable() {
                    sent.push(frame);
                }
            }
        }
        while let Some(frame) = outbox.pop_transmittable() {
            sent.push(frame);
        }
        assert_eq!(sent, expected);
    }

    #[test]
    fn test_reconnect_clears_queue_and_restores_credit() {
        let mut outbox = Outbox::new();
        for _ in 0..5 {
            outbox.push(&OutboundCommand::HomeA);
        }
        outbox.set_credit(2);
        assert_eq!(outbox.len(), 5);

        outbox.clear();
        assert_eq!(outbox.len(), 0);
        assert!(outbox.pop_transmittable().is_none());
        outbox.push(&OutboundCommand::HomeA);
        // Credit is back at the initial assumption, so the frame flows.
        assert!(outbox.pop_transmittable().is_some());
    }
}
