//! # Hardware and numerical collaborators
//!
//! The loop talks to the camera, the deformable mirror and the wavefront
//! reconstructor only through the traits of this module.

use nalgebra::DMatrix;
use std::path::PathBuf;

use crate::{config::Config, textfile, AoError, Result, SearchGeometry};

/// Camera frame, indexed as `frame[(row, column)]` i.e. `frame[(y, x)]`
pub type Frame = DMatrix<f64>;

/// Square grid of booleans (lenslet or actuator layout)
pub type Grid = DMatrix<bool>;

/// Shack-Hartmann camera
pub trait Camera: Send {
    /// Acquires a new frame
    fn get_image(&mut self) -> Result<Frame>;
    /// Returns the search boxes and the lenslet mask of a self-describing camera
    fn search_geometry(&self) -> Option<(SearchGeometry, Grid)> {
        None
    }
}

/// Deformable mirror
pub trait Mirror: Send {
    /// Number of actuators
    fn n_actuators(&self) -> usize;
    /// Actuators layout
    fn mask(&self) -> &Grid;
    /// Current actuator commands
    fn get_command(&self) -> Vec<f64>;
    /// Sends new commands to all the actuators
    fn set_command(&mut self, command: &[f64]) -> Result<()>;
    /// Sends the mirror to its flat (zero) state
    fn flatten(&mut self) -> Result<()>;
    /// Sets a single actuator, leaving the others as they are
    fn set_actuator(&mut self, index: usize, value: f64) -> Result<()>;
    fn pause(&mut self) {}
    fn unpause(&mut self) {}
}

/// Wavefront estimate from the slopes
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Wavefront {
    /// Modal coefficients
    pub coefficients: Vec<f64>,
    /// Wavefront map over the lenslet grid
    pub map: DMatrix<f64>,
    /// Wavefront error RMS
    pub rms: f64,
}

/// Modal wavefront reconstructor
pub trait Reconstructor: Send {
    fn get_wavefront(&mut self, x_slopes: &[f64], y_slopes: &[f64]) -> Result<Wavefront>;
    /// Spots displacement `[px]` per lenslet for one unit of defocus
    fn defocus_displacement(&self) -> (&[f64], &[f64]);
}

/// Where the reference search boxes come from
///
/// The camera capability is checked once, when the sensor is built.
#[derive(Debug, Clone)]
pub enum GeometrySource {
    /// The camera supplies its own search boxes and lenslet mask
    SelfDescribing { geometry: SearchGeometry, mask: Grid },
    /// Reference coordinates and mask text files
    ReferenceFile {
        coordinates: PathBuf,
        mask: PathBuf,
        half_width: f64,
    },
}

impl GeometrySource {
    /// Selects the geometry source for a given camera
    pub fn resolve(camera: &dyn Camera, config: &Config) -> Result<Self> {
        if let Some((geometry, mask)) = camera.search_geometry() {
            log::info!("camera supplies {} search boxes", geometry.n());
            return Ok(Self::SelfDescribing { geometry, mask });
        }
        match (
            config.paths.reference_coordinates.as_ref(),
            config.paths.reference_mask.as_ref(),
        ) {
            (Some(coordinates), Some(mask)) => Ok(Self::ReferenceFile {
                coordinates: coordinates.clone(),
                mask: mask.clone(),
                half_width: config.sensor.search_box_half_width,
            }),
            _ => Err(AoError::Configuration(
                "the camera does not supply search boxes and no reference coordinates/mask files are configured".into(),
            )),
        }
    }
    /// Returns the reference search boxes and the lenslet mask
    pub fn load(self) -> Result<(SearchGeometry, Grid)> {
        match self {
            Self::SelfDescribing { geometry, mask } => Ok((geometry, mask)),
            Self::ReferenceFile {
                coordinates,
                mask,
                half_width,
            } => {
                let xy = textfile::load_matrix(&coordinates)?;
                if xy.ncols() != 2 {
                    return Err(AoError::shape((xy.nrows(), 2), xy.shape()));
                }
                let geometry = SearchGeometry::new(
                    xy.column(0).iter().cloned().collect(),
                    xy.column(1).iter().cloned().collect(),
                    half_width,
                )?;
                let mask = textfile::load_mask(&mask)?;
                log::info!(
                    "loaded {} reference coordinates from {coordinates:?}",
                    geometry.n()
                );
                Ok((geometry, mask))
            }
        }
    }
}
