//! # Loop configuration
//!
//! The configuration is read once, from a TOML file, at start-up and handed
//! over to each component.
//! Every field has a default so a configuration file only needs to list the
//! values that differ from the defaults:
//! ```
//! use ao_loop::Config;
//!
//! let config: Config = r#"
//! [sensor]
//! search_box_half_width = 10
//! centroiding_iterations = 3
//!
//! [control]
//! gain = 0.2
//! "#.parse()?;
//! assert_eq!(config.sensor.search_box_half_width, 10.);
//! assert_eq!(config.control.n_control_modes, 50);
//! # Ok::<(), ao_loop::AoError>(())
//! ```

use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::{AoError, Result};

/// Loop configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sensor: SensorConfig,
    pub mirror: MirrorConfig,
    pub poke: PokeConfig,
    pub control: ControlConfig,
    pub paths: PathsConfig,
}

/// Shack-Hartmann wavefront sensor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub image_width_px: usize,
    pub image_height_px: usize,
    pub lenslet_pitch_m: f64,
    pub lenslet_focal_length_m: f64,
    pub pixel_size_m: f64,
    pub beam_diameter_m: f64,
    pub wavelength_m: f64,
    pub estimate_background: bool,
    pub background_correction: f64,
    pub search_box_half_width: f64,
    /// Lower bound of the search box half width during iterative centroiding
    pub min_search_box_half_width: f64,
    /// Peak intensity above which a lenslet is active
    pub spots_threshold: f64,
    pub reconstruct_wavefront: bool,
    pub remove_tip_tilt: bool,
    pub centroiding_num_threads: usize,
    pub iterative_centroiding_step: f64,
    pub centroiding_iterations: usize,
    pub reference_n_measurements: usize,
    pub zernike_dioptric_equivalent: f64,
}
impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            image_width_px: 1024,
            image_height_px: 1024,
            lenslet_pitch_m: 500e-6,
            lenslet_focal_length_m: 20e-3,
            pixel_size_m: 11e-6,
            beam_diameter_m: 10e-3,
            wavelength_m: 840e-9,
            estimate_background: true,
            background_correction: -100.,
            search_box_half_width: 12.,
            min_search_box_half_width: 1.,
            spots_threshold: 100.,
            reconstruct_wavefront: true,
            remove_tip_tilt: true,
            centroiding_num_threads: 1,
            iterative_centroiding_step: 2.,
            centroiding_iterations: 1,
            reference_n_measurements: 10,
            zernike_dioptric_equivalent: 1.5,
        }
    }
}
impl SensorConfig {
    /// Lenslet pitch in pixels
    pub fn pitch_px(&self) -> f64 {
        self.lenslet_pitch_m / self.pixel_size_m
    }
    /// Largest search box half width that keeps neighbouring boxes apart
    pub fn search_box_half_width_max(&self) -> f64 {
        (self.pitch_px() as usize / 2) as f64
    }
    /// Centroid displacement to slope conversion factor `[rd/px]`
    pub fn slope_scale(&self) -> f64 {
        self.pixel_size_m / self.lenslet_focal_length_m
    }
}

/// Deformable mirror settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub n_actuators: usize,
    pub command_min: f64,
    pub command_max: f64,
    pub settling_time_s: f64,
}
impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            n_actuators: 97,
            command_min: -0.3,
            command_max: 0.3,
            settling_time_s: 0.001,
        }
    }
}
impl MirrorConfig {
    pub fn settling_time(&self) -> Duration {
        Duration::from_secs_f64(self.settling_time_s)
    }
}

/// Poke calibration stimulus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PokeConfig {
    pub command_min: f64,
    pub command_max: f64,
    pub n_command_steps: usize,
}
impl Default for PokeConfig {
    fn default() -> Self {
        Self {
            command_min: -0.1,
            command_max: 0.1,
            n_command_steps: 5,
        }
    }
}

/// Control law and control matrix settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub n_control_modes: usize,
    /// When set, singular values are retained by condition number instead of by count
    pub condition_cutoff: Option<f64>,
    pub gain: f64,
    pub loss: f64,
    /// Maximum number of control matrices kept for previously seen lenslet masks
    pub ctrl_cache_size: usize,
    /// Wait for in-flight cycles after pausing the loop `[s]`
    pub quiesce_s: f64,
}
impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            n_control_modes: 50,
            condition_cutoff: None,
            gain: 0.3,
            loss: 0.01,
            ctrl_cache_size: 10,
            quiesce_s: 0.05,
        }
    }
}
impl ControlConfig {
    pub fn quiesce_time(&self) -> Duration {
        Duration::from_secs_f64(self.quiesce_s)
    }
}

/// Calibration files and output directories
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub reference_coordinates: Option<PathBuf>,
    pub reference_mask: Option<PathBuf>,
    pub poke: Option<PathBuf>,
    pub mirror_flat: Option<PathBuf>,
    pub mirror_mask: Option<PathBuf>,
    pub poke_directory: Option<PathBuf>,
    pub reference_directory: Option<PathBuf>,
    pub logging_directory: Option<PathBuf>,
}

impl FromStr for Config {
    type Err = AoError;

    fn from_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Loads and validates a TOML configuration file
    pub fn from_toml(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| AoError::file(path, e))?;
        let config = contents.parse()?;
        log::info!("configuration loaded from {path:?}");
        Ok(config)
    }
    /// Checks the consistency of the configuration
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(AoError::Configuration(msg));
        let s = &self.sensor;
        if s.image_width_px == 0 || s.image_height_px == 0 {
            return invalid(format!(
                "image size must be non-zero, found {}x{}",
                s.image_width_px, s.image_height_px
            ));
        }
        for (name, value) in [
            ("lenslet_pitch_m", s.lenslet_pitch_m),
            ("lenslet_focal_length_m", s.lenslet_focal_length_m),
            ("pixel_size_m", s.pixel_size_m),
            ("search_box_half_width", s.search_box_half_width),
            ("min_search_box_half_width", s.min_search_box_half_width),
        ] {
            if value <= 0. || value.is_nan() {
                return invalid(format!("{name} must be positive, found {value}"));
            }
        }
        if s.search_box_half_width > s.search_box_half_width_max() {
            return invalid(format!(
                "search_box_half_width ({}) exceeds half the lenslet pitch ({})",
                s.search_box_half_width,
                s.search_box_half_width_max()
            ));
        }
        if s.iterative_centroiding_step < 0. {
            return invalid("iterative_centroiding_step must not be negative".into());
        }
        if s.centroiding_iterations == 0 {
            return invalid("centroiding_iterations must be at least 1".into());
        }
        if s.centroiding_num_threads == 0 {
            return invalid("centroiding_num_threads must be at least 1".into());
        }
        if s.reference_n_measurements == 0 {
            return invalid("reference_n_measurements must be at least 1".into());
        }
        let m = &self.mirror;
        if m.n_actuators == 0 {
            return invalid("mirror must have at least one actuator".into());
        }
        if m.command_min >= m.command_max {
            return invalid(format!(
                "mirror command range [{},{}] is empty",
                m.command_min, m.command_max
            ));
        }
        if m.settling_time_s < 0. {
            return invalid("settling_time_s must not be negative".into());
        }
        let p = &self.poke;
        if p.n_command_steps < 2 {
            return invalid("poke calibration needs at least 2 command steps".into());
        }
        if p.command_min >= p.command_max {
            return invalid(format!(
                "poke command range [{},{}] is empty",
                p.command_min, p.command_max
            ));
        }
        let c = &self.control;
        if c.gain <= 0. || c.gain.is_nan() {
            return invalid(format!("control gain must be positive, found {}", c.gain));
        }
        if !(0. ..1.).contains(&c.loss) {
            return invalid(format!("control loss must be in [0,1), found {}", c.loss));
        }
        if c.n_control_modes == 0 {
            return invalid("n_control_modes must be at least 1".into());
        }
        if let Some(cutoff) = c.condition_cutoff {
            if cutoff < 1. || cutoff.is_nan() {
                return invalid(format!("condition_cutoff must be ≥ 1, found {cutoff}"));
            }
        }
        if c.ctrl_cache_size == 0 {
            return invalid("ctrl_cache_size must be at least 1".into());
        }
        if c.quiesce_s < 0. {
            return invalid("quiesce_s must not be negative".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.sensor.search_box_half_width_max(), 22.);
        assert_eq!(config.mirror.n_actuators, 97);
    }

    #[test]
    fn partial_toml() {
        let config: Config = "[control]\ngain = 0.5\nloss = 0.1\n".parse().unwrap();
        assert_eq!(config.control.gain, 0.5);
        assert_eq!(config.control.loss, 0.1);
        assert_eq!(config.sensor.centroiding_iterations, 1);
    }

    #[test]
    fn rejects_bad_values() {
        for toml in [
            "[control]\nloss = 1.0",
            "[sensor]\nsearch_box_half_width = 0",
            "[sensor]\nsearch_box_half_width = 40",
            "[poke]\nn_command_steps = 1",
            "[mirror]\ncommand_min = 0.3\ncommand_max = -0.3",
            "[control]\ngain = nan",
            "[control]\ncondition_cutoff = nan",
            "[sensor]\npixel_size_m = nan",
        ] {
            assert!(
                matches!(toml.parse::<Config>(), Err(AoError::Configuration(_))),
                "{toml}"
            );
        }
    }
}
