//! Wire protocol for the motion-controller firmware.
//!
//! The firmware speaks line-delimited JSON over a 115200-baud serial
//! connection. Outbound traffic is a mix of G-code frames (`{"gc": ...}`),
//! device-setting frames (`{"zsn": 0}` and friends), motor enable/disable
//! frames, and one raw control-byte sequence for firmware reset. Inbound
//! traffic is status reports (`sr`), queue-credit reports (`qr`), and
//! command acknowledgements (`r`).
//!
//! This module is purely data: command-to-frame encoding and line decoding.
//! The drain loop that moves frames over the wire lives in [`crate::link`].

use serde::Deserialize;
use serde_json::json;

/// Millimeters of A-axis travel per microliter of pipette volume
/// (12.15 mm per 100 ul on the installed pipette head).
pub const MM_PER_MICROLITER: f64 = 0.1215;

/// Machine states reported by the firmware's `stat` field, in ordinal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Initializing,
    ReadyForUse,
    Alarm,
    ProgramStop,
    ProgramEnd,
    MotionRunning,
    MotionHolding,
    ProbeCycle,
    Running,
    Homing,
}

impl MachineState {
    /// Map a reported `stat` ordinal onto a machine state.
    pub fn from_stat(stat: i64) -> Option<Self> {
        match stat {
            0 => Some(Self::Initializing),
            1 => Some(Self::ReadyForUse),
            2 => Some(Self::Alarm),
            3 => Some(Self::ProgramStop),
            4 => Some(Self::ProgramEnd),
            5 => Some(Self::MotionRunning),
            6 => Some(Self::MotionHolding),
            7 => Some(Self::ProbeCycle),
            8 => Some(Self::Running),
            9 => Some(Self::Homing),
            _ => None,
        }
    }
}

/// Homing precision selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Rough,
    Fine,
}

/// Current stage position in millimeters.
///
/// The A axis is the pipette plunger, expressed in mm-equivalent travel
/// (convertible to microliters via [`MM_PER_MICROLITER`]).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AxisPosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub a: f64,
}

/// One newline-terminated message ready for the wire.
///
/// Almost every frame is JSON; the firmware reset is a bare control-X byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Vec<u8>);

impl Frame {
    fn jsonify(value: serde_json::Value) -> Self {
        // Serializing a Value built right here cannot fail.
        let mut bytes = serde_json::to_vec(&value).unwrap_or_default();
        bytes.push(b'\n');
        Frame(bytes)
    }

    fn raw(bytes: &[u8]) -> Self {
        Frame(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A discrete request for the device, as produced by the motion controller.
///
/// Each variant encodes to one or more protocol frames, in the exact order
/// the firmware requires (setting frames must precede the homing move that
/// depends on them, and the device needs them to settle in between).
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCommand {
    /// Dish illumination, 0..=1000 (spindle PWM reuse on the firmware).
    LightSet(i32),
    MotorEnable(bool),
    HomeZ(Precision),
    HomeXY,
    HomeXYPrecision,
    HomeA,
    /// Absolute move; `None` omits the axis token, leaving that axis alone.
    MoveAbsolute {
        x: Option<f64>,
        y: Option<f64>,
        z: Option<f64>,
        a: Option<f64>,
    },
    /// Absolute move with an explicit feedrate in mm/min.
    MoveAbsoluteWithFeedrate {
        x: Option<f64>,
        y: Option<f64>,
        z: Option<f64>,
        a: Option<f64>,
        feedrate: f64,
    },
    MoveRelative {
        x: f64,
        y: f64,
        z: f64,
        a: f64,
    },
    /// Firmware reset; raw control-X, not JSON-wrapped.
    Reset,
    SettingsDump,
}

impl OutboundCommand {
    /// Encode this command as its ordered frame sequence.
    pub fn frames(&self) -> Vec<Frame> {
        match self {
            Self::LightSet(brightness) => {
                let level = (*brightness).clamp(0, 1000);
                vec![Frame::jsonify(json!({ "gc": format!("M3 S{level}") }))]
            }
            Self::MotorEnable(true) => vec![Frame::jsonify(json!({ "me": null }))],
            Self::MotorEnable(false) => vec![Frame::jsonify(json!({ "md": null }))],
            Self::HomeZ(Precision::Rough) => vec![
                Frame::jsonify(json!({ "zsn": 0 })),
                Frame::jsonify(json!({ "zsx": 1 })),
                Frame::jsonify(json!({ "gc": "G28.2 Z0" })),
            ],
            Self::HomeZ(Precision::Fine) => vec![
                Frame::jsonify(json!({ "zsn": 0 })),
                Frame::jsonify(json!({ "zsx": 1 })),
                // Slow search velocity for the fine pass.
                Frame::jsonify(json!({ "zsv": 200 })),
                Frame::jsonify(json!({ "gc": "G28.2 Z0" })),
            ],
            Self::HomeXY => vec![Frame::jsonify(json!({ "gc": "G28.2 X0 Y0" }))],
            Self::HomeXYPrecision => vec![
                Frame::jsonify(json!({ "xsv": 500 })),
                Frame::jsonify(json!({ "ysv": 500 })),
                Frame::jsonify(json!({ "gc": "G28.2 X0 Y0" })),
            ],
            Self::HomeA => vec![Frame::jsonify(json!({ "gc": "G28.2 A0" }))],
            Self::MoveAbsolute { x, y, z, a } => {
                vec![Frame::jsonify(json!({ "gc": motion_gcode("G90 G0", *x, *y, *z, *a, None) }))]
            }
            Self::MoveAbsoluteWithFeedrate { x, y, z, a, feedrate } => vec![Frame::jsonify(
                json!({ "gc": motion_gcode("G90 G1", *x, *y, *z, *a, Some(*feedrate)) }),
            )],
            Self::MoveRelative { x, y, z, a } => vec![Frame::jsonify(
                json!({ "gc": motion_gcode("G91 G0", Some(*x), Some(*y), Some(*z), Some(*a), None) }),
            )],
            Self::Reset => vec![Frame::raw(b"\x18\n")],
            Self::SettingsDump => vec![Frame::jsonify(json!({ "sys": null }))],
        }
    }
}

fn motion_gcode(
    prefix: &str,
    x: Option<f64>,
    y: Option<f64>,
    z: Option<f64>,
    a: Option<f64>,
    feedrate: Option<f64>,
) -> String {
    let mut out = String::from(prefix);
    for (token, value) in [('X', x), ('Y', y), ('Z', z), ('A', a)] {
        if let Some(v) = value {
            out.push_str(&format!(" {token}{v}"));
        }
    }
    if let Some(f) = feedrate {
        out.push_str(&format!(" F{f}"));
    }
    out
}

/// Status report payload; the firmware sends any subset of these keys.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StatusReport {
    pub vel: Option<f64>,
    pub posx: Option<f64>,
    pub posy: Option<f64>,
    pub posz: Option<f64>,
    pub posa: Option<f64>,
    pub stat: Option<i64>,
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceReport {
    Status(StatusReport),
    /// Remaining inbound buffer slots on the device (flow control).
    QueueCredit(i64),
    /// Command acknowledgement envelope; diagnostic sub-keys are ignored.
    Ack,
}

/// Decode one buffered line into a device report.
///
/// Bytes below 40 at the start of the line are discarded first; line noise
/// on the serial cable shows up there. A line that still fails to parse is
/// dropped (`None`) without further ceremony; the firmware intermixes
/// plain-text debug output with its JSON, and there is no NACK to request a
/// retransmission anyway.
pub fn decode_line(line: &[u8]) -> Option<DeviceReport> {
    let start = line.iter().position(|&b| b >= 40)?;
    let value: serde_json::Value = serde_json::from_slice(&line[start..]).ok()?;

    if let Some(sr) = value.get("sr") {
        let report: StatusReport = serde_json::from_value(sr.clone()).ok()?;
        return Some(DeviceReport::Status(report));
    }
    if let Some(qr) = value.get("qr") {
        return qr.as_i64().map(DeviceReport::QueueCredit);
    }
    if value.get("r").is_some() {
        return Some(DeviceReport::Ack);
    }
    None
}
