//! Strongly-typed settings, loaded with Figment.
//!
//! Configuration merges three layers: built-in defaults (the values the
//! machine shipped with), an optional TOML file, and environment variables
//! prefixed with `PICKPLATE_`. The per-run [`PlatingRunConfig`] is derived
//! from these settings once at cycle start and stays immutable for the
//! duration of the run.
//!
//! ```text
//! PICKPLATE_SERIAL__PORT=/dev/ttyUSB1
//! PICKPLATE_SYSTEM__PROFILE=dechorionated
//! ```

use crate::error::{PickPlateError, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A point in stage millimeters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointMm {
    pub x: f64,
    pub y: f64,
}

/// A point in camera pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointPx {
    pub x: f64,
    pub y: f64,
}

/// Destination-plate iteration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatingOrder {
    RowMajor,
    ColumnMajor,
}

/// Embryo preparation profile; selects a plating calibration block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbryoProfile {
    Chorionated,
    Dechorionated,
}

impl EmbryoProfile {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Chorionated => "chorionated",
            Self::Dechorionated => "dechorionated",
        }
    }
}

/// Top-level application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub serial: SerialSettings,
    pub system: SystemSettings,
    pub calibration: StageCalibration,
    pub detection: DetectionSettings,
    pub plating: PlatingProfiles,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Serial port path (e.g. "/dev/ttyUSB0").
    pub port: String,
    pub baud: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud: 115_200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    pub profile: EmbryoProfile,
    pub plating_order: PlatingOrder,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            profile: EmbryoProfile::Chorionated,
            plating_order: PlatingOrder::RowMajor,
        }
    }
}

/// Stage and camera geometry shared by both embryo profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCalibration {
    /// Center of the camera crop window, in pixels.
    pub crop_center: PointPx,
    /// Side length of the crop window, in pixels.
    pub crop_dimension_px: f64,
    /// Two stage positions imaged for the pixel-to-mm scale.
    pub distance_cal_start: PointPx,
    pub distance_cal_end: PointPx,
    /// Physical distance between the two calibration points.
    pub distance_cal_mm: f64,
    pub dish_center: PointMm,
    pub well_a1: PointMm,
    pub waste: PointMm,
    /// Reference point used before the precision homing pass.
    pub precision_reference: PointMm,
    /// Z height safe for horizontal travel.
    pub traverse_height_mm: f64,
    pub dish_z_min_mm: f64,
    pub plate_z_min_mm: f64,
    /// Commanded Z velocity in mm/s; sizes the synchronized drop.
    pub vertical_velocity_mm_s: f64,
    /// Total time an embryo takes to fall from pipette to well, in seconds.
    pub free_fall_time_s: f64,
    /// Dwell after dispensing into a well, in seconds.
    pub placement_dwell_s: f64,
}

impl Default for StageCalibration {
    fn default() -> Self {
        Self {
            crop_center: PointPx { x: 150.0, y: 150.0 },
            crop_dimension_px: 200.0,
            distance_cal_start: PointPx { x: 120.0, y: 10.0 },
            distance_cal_end: PointPx { x: 220.0, y: 10.0 },
            distance_cal_mm: 25.0,
            dish_center: PointMm { x: -125.0, y: -110.0 },
            well_a1: PointMm { x: -34.0, y: -135.0 },
            waste: PointMm { x: -125.0, y: 0.0 },
            precision_reference: PointMm { x: -10.0, y: -10.0 },
            traverse_height_mm: 12.0,
            dish_z_min_mm: -14.0,
            plate_z_min_mm: -13.0,
            vertical_velocity_mm_s: 40.0,
            free_fall_time_s: 1.2,
            placement_dwell_s: 0.5,
        }
    }
}

/// Thresholds for the pickable-embryo filter, in pixels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionSettings {
    pub min_separation_px: f64,
    pub min_diameter_px: f64,
    pub max_diameter_px: f64,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            min_separation_px: 5.0,
            min_diameter_px: 15.0,
            max_diameter_px: 20.0,
        }
    }
}

/// Plating calibration per embryo preparation profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatingProfiles {
    pub chorionated: ProfileCalibration,
    pub dechorionated: ProfileCalibration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileCalibration {
    pub pick_height_mm: f64,
    pub place_height_mm: f64,
    /// Pipette tube diameter; offsets every taught coordinate.
    pub tube_diameter_mm: f64,
    pub pick_volume_ul: f64,
    pub place_volume_ul: f64,
    pub purge_volume_ul: f64,
}

impl Default for ProfileCalibration {
    fn default() -> Self {
        // Chorionated defaults; `Settings::default` overrides the
        // dechorionated block.
        Self {
            pick_height_mm: 4.56,
            place_height_mm: 4.56,
            tube_diameter_mm: 2.35,
            pick_volume_ul: 8.56,
            place_volume_ul: 4.0,
            purge_volume_ul: 20.0,
        }
    }
}

impl Settings {
    /// Load settings from defaults, an optional TOML file, and the
    /// environment, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let settings: Settings = figment
            .merge(Env::prefixed("PICKPLATE_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.serial.port.is_empty() {
            return Err(PickPlateError::Configuration(
                "serial port must not be empty".into(),
            ));
        }
        if self.calibration.vertical_velocity_mm_s <= 0.0 {
            return Err(PickPlateError::Configuration(
                "vertical velocity must be positive".into(),
            ));
        }
        if self.calibration.free_fall_time_s <= 0.0 {
            return Err(PickPlateError::Configuration(
                "free-fall time must be positive".into(),
            ));
        }
        if self.detection.min_diameter_px > self.detection.max_diameter_px {
            return Err(PickPlateError::Configuration(
                "detection min diameter exceeds max diameter".into(),
            ));
        }
        Ok(())
    }

    pub fn profile_calibration(&self) -> &ProfileCalibration {
        match self.system.profile {
            EmbryoProfile::Chorionated => &self.plating.chorionated,
            EmbryoProfile::Dechorionated => &self.plating.dechorionated,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            serial: SerialSettings::default(),
            system: SystemSettings::default(),
            calibration: StageCalibration::default(),
            detection: DetectionSettings::default(),
            plating: PlatingProfiles {
                chorionated: ProfileCalibration::default(),
                dechorionated: ProfileCalibration {
                    pick_height_mm: 4.56,
                    place_height_mm: 4.56,
                    tube_diameter_mm: 1.98,
                    pick_volume_ul: 10.15,
                    place_volume_ul: 5.0,
                    purge_volume_ul: 20.0,
                },
            },
        }
    }
}

/// Calibration bundle for one plating run, immutable once derived.
#[derive(Debug, Clone)]
pub struct PlatingRunConfig {
    pub profile_name: String,
    pub order: PlatingOrder,
    /// Dish center, A1, and waste positions, offset by the pipette
    /// centerline so the tube lands where the calibration taught.
    pub dish_center: PointMm,
    pub well_a1: PointMm,
    pub waste: PointMm,
    pub pick_height: f64,
    pub place_height: f64,
    pub pick_volume_ul: f64,
    pub place_volume_ul: f64,
    pub purge_volume_ul: f64,
    pub traverse_height: f64,
    pub dish_z_min: f64,
    pub plate_z_min: f64,
    pub vertical_velocity: f64,
    pub free_fall_time: f64,
    pub placement_dwell: f64,
}

impl PlatingRunConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let cal = &settings.calibration;
        let profile = settings.profile_calibration();
        let offset = profile.tube_diameter_mm / 2.0;
        let adjust = |p: PointMm| PointMm {
            x: p.x + offset,
            y: p.y + offset,
        };

        Self {
            profile_name: settings.system.profile.name().to_string(),
            order: settings.system.plating_order,
            dish_center: adjust(cal.dish_center),
            well_a1: adjust(cal.well_a1),
            waste: adjust(cal.waste),
            pick_height: profile.pick_height_mm.max(cal.dish_z_min_mm),
            place_height: profile.place_height_mm.max(cal.plate_z_min_mm),
            pick_volume_ul: profile.pick_volume_ul,
            place_volume_ul: profile.place_volume_ul,
            purge_volume_ul: profile.purge_volume_ul,
            traverse_height: cal.traverse_height_mm,
            dish_z_min: cal.dish_z_min_mm,
            plate_z_min: cal.plate_z_min_mm,
            vertical_velocity: cal.vertical_velocity_mm_s,
            free_fall_time: cal.free_fall_time_s,
            placement_dwell: cal.placement_dwell_s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn test_profile_selects_calibration_block() {
        let mut settings = Settings::default();
        settings.system.profile = EmbryoProfile::Dechorionated;
        assert_eq!(settings.profile_calibration().tube_diameter_mm, 1.98);
        settings.system.profile = EmbryoProfile::Chorionated;
        assert_eq!(settings.profile_calibration().tube_diameter_mm, 2.35);
    }

    #[test]
    fn test_run_config_applies_pipette_offset() {
        let settings = Settings::default();
        let run = PlatingRunConfig::from_settings(&settings);
        let offset = settings.plating.chorionated.tube_diameter_mm / 2.0;
        assert_eq!(run.well_a1.x, settings.calibration.well_a1.x + offset);
        assert_eq!(run.waste.y, settings.calibration.waste.y + offset);
        assert_eq!(run.profile_name, "chorionated");
    }

    #[test]
    fn test_run_config_respects_z_minimums() {
        let mut settings = Settings::default();
        settings.plating.chorionated.pick_height_mm = -100.0;
        let run = PlatingRunConfig::from_settings(&settings);
        assert_eq!(run.pick_height, settings.calibration.dish_z_min_mm);
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[serial]\nport = \"/dev/ttyACM7\"\nbaud = 115200\n\n\
             [system]\nprofile = \"dechorionated\"\nplating_order = \"column_major\"\n"
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.serial.port, "/dev/ttyACM7");
        assert_eq!(settings.system.profile, EmbryoProfile::Dechorionated);
        assert_eq!(settings.system.plating_order, PlatingOrder::ColumnMajor);
        // Untouched sections keep their defaults.
        assert_eq!(settings.detection.min_separation_px, 5.0);
    }

    #[test]
    fn test_validation_rejects_zero_velocity() {
        let mut settings = Settings::default();
        settings.calibration.vertical_velocity_mm_s = 0.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_inverted_diameter_band() {
        let mut settings = Settings::default();
        settings.detection.min_diameter_px = 30.0;
        settings.detection.max_diameter_px = 20.0;
        assert!(settings.validate().is_err());
    }
}
