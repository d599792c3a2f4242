//! Embryo candidate geometry and the vision collaborator seam.
//!
//! Frame acquisition and blob detection are external collaborators; the
//! core consumes only their per-frame candidate list through
//! [`VisionSource`]. What lives here is the pure selection geometry: which
//! detected candidates are valid, which are safely pickable, and where a
//! pixel candidate sits on the dish in stage millimeters.

use crate::config::{PointMm, PointPx, StageCalibration};
use crate::error::{PickPlateError, Result};
use async_trait::async_trait;

/// One detected embryo candidate, in crop-window pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmbryoCandidate {
    pub x_px: f64,
    pub y_px: f64,
    pub diameter_px: f64,
}

/// Candidate list for one captured frame.
#[derive(Debug, Clone, Default)]
pub struct FrameSnapshot {
    pub candidates: Vec<EmbryoCandidate>,
}

/// Drop candidates the detector reported with NaN coordinates or size.
pub fn valid_candidates(frame: &[EmbryoCandidate]) -> Vec<EmbryoCandidate> {
    frame
        .iter()
        .filter(|c| !c.x_px.is_nan() && !c.y_px.is_nan() && !c.diameter_px.is_nan())
        .copied()
        .collect()
}

/// Keep candidates that are within the size band and not crowded.
///
/// A candidate is crowded if any *valid* neighbor (pickable or not) sits
/// closer than `min_separation` edge to edge; one close neighbor excludes
/// it. The self-comparison is skipped by the identical-coordinate check,
/// matching the detector's guarantee that no two keypoints coincide.
pub fn pickable_candidates(
    valid: &[EmbryoCandidate],
    min_separation: f64,
    min_diameter: f64,
    max_diameter: f64,
) -> Vec<EmbryoCandidate> {
    let mut pickable = Vec::new();

    for candidate in valid {
        if candidate.diameter_px < min_diameter || candidate.diameter_px > max_diameter {
            continue;
        }

        let mut found_too_close = false;
        for neighbor in valid {
            if candidate.x_px == neighbor.x_px && candidate.y_px == neighbor.y_px {
                continue;
            }
            let distance = (candidate.x_px - neighbor.x_px).hypot(candidate.y_px - neighbor.y_px);
            let gap = distance - candidate.diameter_px / 2.0 - neighbor.diameter_px / 2.0;
            if gap < min_separation {
                found_too_close = true;
                break;
            }
        }

        if !found_too_close {
            pickable.push(*candidate);
        }
    }

    pickable
}

/// Pixel-to-stage mapping derived from two imaged calibration points.
#[derive(Debug, Clone, Copy)]
pub struct PixelCalibration {
    mm_per_px: f64,
    crop_center: PointPx,
    dish_center: PointMm,
}

impl PixelCalibration {
    pub fn new(
        start: PointPx,
        end: PointPx,
        distance_mm: f64,
        crop_center: PointPx,
        dish_center: PointMm,
    ) -> Result<Self> {
        let pixel_span = (end.x - start.x).hypot(end.y - start.y);
        if pixel_span == 0.0 {
            return Err(PickPlateError::Calibration(
                "distance calibration points coincide".into(),
            ));
        }
        Ok(Self {
            mm_per_px: distance_mm / pixel_span,
            crop_center,
            dish_center,
        })
    }

    pub fn from_calibration(cal: &StageCalibration) -> Result<Self> {
        Self::new(
            cal.distance_cal_start,
            cal.distance_cal_end,
            cal.distance_cal_mm,
            cal.crop_center,
            cal.dish_center,
        )
    }

    pub fn mm_per_px(&self) -> f64 {
        self.mm_per_px
    }

    /// Stage position of a candidate. Camera x runs opposite the stage x
    /// axis, so that offset is inverted; y is not.
    pub fn dish_position(&self, candidate: &EmbryoCandidate) -> PointMm {
        let dx_px = candidate.x_px - self.crop_center.x;
        let dy_px = candidate.y_px - self.crop_center.y;
        PointMm {
            x: self.dish_center.x - dx_px * self.mm_per_px,
            y: self.dish_center.y + dy_px * self.mm_per_px,
        }
    }
}

/// The vision collaborator as seen from the core.
#[async_trait]
pub trait VisionSource: Send + Sync {
    /// Toggle cycle mode on the detector, with the active embryo profile.
    async fn set_cycle_active(&self, active: bool, profile: &str) -> anyhow::Result<()>;

    /// Ask the collaborator to capture and process the next frame.
    async fn request_frame(&self) -> anyhow::Result<()>;

    /// Wait for the data-ready handshake and take the frame's candidates.
    async fn next_snapshot(&self) -> anyhow::Result<FrameSnapshot>;
}

/// Vision source that never sees an embryo. Lets the stack run headless
/// when no camera collaborator is wired in.
pub struct NullVision;

#[async_trait]
impl VisionSource for NullVision {
    async fn set_cycle_active(&self, _active: bool, _profile: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn request_frame(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn next_snapshot(&self) -> anyhow::Result<FrameSnapshot> {
        Ok(FrameSnapshot::default())
    }
}
