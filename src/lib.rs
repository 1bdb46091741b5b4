//! # Shack-Hartmann adaptive optics loop
//!
//! A closed-loop controller that measures the wavefront slopes with a
//! Shack-Hartmann sensor and drives a deformable mirror to null them.
//!
//! The loop is built from 2 clients of the [interface] crate:
//!  1. the [WavefrontSensor](sensor::WavefrontSensor), that turns camera frames into slopes,
//!  2. the [ControlLaw](control::ControlLaw), that turns slopes into mirror commands,
//!
//! and a [ClosedLoop](controller::ClosedLoop) driver that runs them, back to back,
//! on a [tokio] task.
//!
//! The hardware is abstracted behind the [Camera](devices::Camera),
//! [Mirror](devices::Mirror) and [Reconstructor](devices::Reconstructor) traits;
//! the [sim] module implements them with a simulated optical bench:
//! ```no_run
//! use ao_loop::{
//!     calibration::PokeStimulus, centroiding::CenterOfMass, controller::ClosedLoop,
//!     sensor::WavefrontSensor, sim::SimulatedBench, Config,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> ao_loop::Result<()> {
//! let config = Config::default();
//! let bench = SimulatedBench::new(&config)?;
//! let centroider = CenterOfMass::new(config.sensor.centroiding_num_threads)?;
//! let sensor = WavefrontSensor::new(Box::new(bench.camera), Box::new(centroider), &config)?;
//! let mut ao = ClosedLoop::new(sensor, Box::new(bench.mirror), &config)?.start();
//! ao.run_poke_calibration(&PokeStimulus::try_from(&config.poke)?).await?;
//! ao.set_closed(true).await;
//! ao.wait_cycles(100).await?;
//! let _ao = ao.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod calibration;
pub mod centroiding;
pub mod config;
pub mod control;
pub mod controller;
pub mod devices;
mod error;
pub mod geometry;
pub mod integrator;
pub mod poke;
pub mod reference;
pub mod sensor;
pub mod sim;
pub mod textfile;

pub use config::Config;
pub use error::{AoError, Result};
pub use geometry::SearchGeometry;

interface::uid! {
    /// Horizontal slopes of the active lenslets `[rd]`
    XSlopes: Vec<f64>,
    /// Vertical slopes of the active lenslets `[rd]`
    YSlopes: Vec<f64>,
    /// Maximum intensity within each search box
    LensletPeaks: Vec<f64>,
    /// Deformable mirror actuator commands
    MirrorCommand: Vec<f64>,
    /// Mirror command correction from the control matrix
    Correction: Vec<f64>,
}
