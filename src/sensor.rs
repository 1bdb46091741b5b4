//! # Shack-Hartmann wavefront sensor
//!
//! The [WavefrontSensor] turns a camera frame into wavefront slopes:
//! the spots are centroided within the boxes of the reference [SearchGeometry],
//! optionally refined over several passes with shrinking boxes, and the
//! displacements from the reference positions are converted into slopes.
//!
//! A sensing cycle is atomic: the slopes, centroids and statistics are only
//! replaced when the whole cycle succeeds.

use interface::{print_info, Data, Update, Write};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::BufWriter,
    path::PathBuf,
    time::Instant,
};

use crate::{
    centroiding::{BoxStatistics, CentroidOptions, Centroider},
    config::{Config, SensorConfig},
    devices::{Camera, Frame, GeometrySource, Grid, Reconstructor, Wavefront},
    textfile, AoError, LensletPeaks, Result, SearchGeometry, XSlopes, YSlopes,
};

/// Sensor state written to the log directory after each cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub x_slopes: Vec<f64>,
    pub y_slopes: Vec<f64>,
    pub x_centroids: Vec<f64>,
    pub y_centroids: Vec<f64>,
    pub search_box_x1: Vec<i64>,
    pub search_box_x2: Vec<i64>,
    pub search_box_y1: Vec<i64>,
    pub search_box_y2: Vec<i64>,
    pub ref_x: Vec<f64>,
    pub ref_y: Vec<f64>,
    pub error: Option<f64>,
    pub tip: f64,
    pub tilt: f64,
    pub wavefront: Option<Wavefront>,
}

/// Outcome of one sensing cycle, committed at once
struct Measurement {
    image: Frame,
    x_centroids: Vec<f64>,
    y_centroids: Vec<f64>,
    x_slopes: Vec<f64>,
    y_slopes: Vec<f64>,
    stats: BoxStatistics,
    tip: f64,
    tilt: f64,
    wavefront: Option<Wavefront>,
}

/// Shack-Hartmann wavefront sensor
pub struct WavefrontSensor {
    camera: Box<dyn Camera>,
    centroider: Box<dyn Centroider>,
    reconstructor: Option<Box<dyn Reconstructor>>,
    config: SensorConfig,
    logging_directory: Option<PathBuf>,
    lenslet_mask: Grid,
    geometry: SearchGeometry,
    // reference positions before any defocus offset
    x0: Vec<f64>,
    y0: Vec<f64>,
    defocus: f64,
    background_correction: f64,
    image: Option<Frame>,
    x_centroids: Vec<f64>,
    y_centroids: Vec<f64>,
    x_slopes: Vec<f64>,
    y_slopes: Vec<f64>,
    stats: BoxStatistics,
    tip: f64,
    tilt: f64,
    wavefront: Option<Wavefront>,
    paused: bool,
    logging: bool,
    n_cycle: usize,
    last_cycle: Option<Instant>,
    frame_rate: f64,
}

impl WavefrontSensor {
    /// Creates a new wavefront sensor
    ///
    /// The search boxes come either from the camera itself or from the reference files of the configuration.
    pub fn new(
        camera: Box<dyn Camera>,
        centroider: Box<dyn Centroider>,
        config: &Config,
    ) -> Result<Self> {
        config.validate()?;
        let (geometry, lenslet_mask) = GeometrySource::resolve(camera.as_ref(), config)?.load()?;
        let n = geometry.n();
        Ok(Self {
            camera,
            centroider,
            reconstructor: None,
            config: config.sensor.clone(),
            logging_directory: config.paths.logging_directory.clone(),
            lenslet_mask,
            x0: geometry.x().to_vec(),
            y0: geometry.y().to_vec(),
            geometry,
            defocus: 0.,
            background_correction: config.sensor.background_correction,
            image: None,
            x_centroids: vec![0.; n],
            y_centroids: vec![0.; n],
            x_slopes: vec![0.; n],
            y_slopes: vec![0.; n],
            stats: BoxStatistics::zeros(n),
            tip: 0.,
            tilt: 0.,
            wavefront: None,
            paused: false,
            logging: false,
            n_cycle: 0,
            last_cycle: None,
            frame_rate: 0.,
        })
    }
    /// Sets the wavefront reconstructor
    pub fn reconstructor(mut self, reconstructor: Box<dyn Reconstructor>) -> Self {
        self.reconstructor = Some(reconstructor);
        self
    }
    /// Number of lenslets
    pub fn n_lenslets(&self) -> usize {
        self.geometry.n()
    }

    fn measure(&mut self) -> Result<Measurement> {
        let image = self.camera.get_image()?;
        let (n_rows, n_cols) = image.shape();
        if (n_cols, n_rows) != (self.config.image_width_px, self.config.image_height_px) {
            return Err(AoError::Hardware(format!(
                "expected a {}x{} frame, found {n_cols}x{n_rows}",
                self.config.image_width_px, self.config.image_height_px
            )));
        }
        let options = CentroidOptions {
            estimate_background: self.config.estimate_background,
            background_correction: self.background_correction,
        };
        let n = self.geometry.n();
        let n_pass = self.config.centroiding_iterations;
        let mut working = self.geometry.clone();
        let mut pass = 0;
        let centroids = loop {
            let centroids = self.centroider.compute_centroids(&image, &working, &options)?;
            if centroids.x.len() != n || centroids.y.len() != n || centroids.stats.len() != n {
                return Err(AoError::shape((n, 2), (centroids.x.len(), 2)));
            }
            pass += 1;
            if pass == n_pass {
                break centroids;
            }
            let half_width = (working.half_width() - self.config.iterative_centroiding_step)
                .max(self.config.min_search_box_half_width);
            working = SearchGeometry::new(centroids.x, centroids.y, half_width)?;
        };

        let scale = self.config.slope_scale();
        let mut x_slopes: Vec<f64> = centroids
            .x
            .iter()
            .zip(self.geometry.x())
            .map(|(c, r)| (c - r) * scale)
            .collect();
        let mut y_slopes: Vec<f64> = centroids
            .y
            .iter()
            .zip(self.geometry.y())
            .map(|(c, r)| (c - r) * scale)
            .collect();
        let tilt = x_slopes.iter().sum::<f64>() / n as f64;
        let tip = y_slopes.iter().sum::<f64>() / n as f64;
        if self.config.remove_tip_tilt {
            x_slopes.iter_mut().for_each(|s| *s -= tilt);
            y_slopes.iter_mut().for_each(|s| *s -= tip);
        }
        let wavefront = match self.reconstructor.as_mut() {
            Some(reconstructor) if self.config.reconstruct_wavefront => {
                Some(reconstructor.get_wavefront(&x_slopes, &y_slopes)?)
            }
            _ => None,
        };
        Ok(Measurement {
            image,
            x_centroids: centroids.x,
            y_centroids: centroids.y,
            x_slopes,
            y_slopes,
            stats: centroids.stats,
            tip,
            tilt,
            wavefront,
        })
    }
    /// Runs one sensing cycle
    ///
    /// On failure, the sensor keeps the results of the previous cycle.
    pub fn sense(&mut self) -> Result<()> {
        let m = self.measure()?;
        self.image = Some(m.image);
        self.x_centroids = m.x_centroids;
        self.y_centroids = m.y_centroids;
        self.x_slopes = m.x_slopes;
        self.y_slopes = m.y_slopes;
        self.stats = m.stats;
        self.tip = m.tip;
        self.tilt = m.tilt;
        self.wavefront = m.wavefront;

        self.n_cycle += 1;
        let now = Instant::now();
        if let Some(last) = self.last_cycle.replace(now) {
            let dt = now.duration_since(last).as_secs_f64();
            if dt > 0. {
                self.frame_rate = if self.frame_rate > 0. {
                    0.9 * self.frame_rate + 0.1 / dt
                } else {
                    dt.recip()
                };
            }
        }
        if self.n_cycle % 100 == 0 {
            log::debug!("sensor frame rate: {:.1}Hz", self.frame_rate);
        }
        Ok(())
    }
    /// Records a new reference from the mean of several measurements
    ///
    /// The new search geometry is in place before the sensor resumes; a paused sensor stays paused.
    /// Returns the new reference coordinates.
    pub fn record_reference(&mut self) -> Result<(Vec<f64>, Vec<f64>)> {
        let was_paused = self.paused;
        self.pause();
        let result = self.average_centroids().and_then(|(x_ref, y_ref)| {
            self.geometry = self.geometry.moved_to(x_ref.clone(), y_ref.clone())?;
            self.x0 = x_ref.clone();
            self.y0 = y_ref.clone();
            self.defocus = 0.;
            Ok((x_ref, y_ref))
        });
        if !was_paused {
            self.unpause();
        }
        if result.is_ok() {
            log::info!("new reference recorded for {} lenslets", self.geometry.n());
        }
        result
    }
    fn average_centroids(&mut self) -> Result<(Vec<f64>, Vec<f64>)> {
        let n_measurement = self.config.reference_n_measurements;
        let n = self.geometry.n();
        let mut x_ref = vec![0f64; n];
        let mut y_ref = vec![0f64; n];
        for k in 0..n_measurement {
            self.sense()?;
            log::debug!("reference measurement {} of {n_measurement}", k + 1);
            x_ref.iter_mut().zip(&self.x_centroids).for_each(|(r, c)| *r += c);
            y_ref.iter_mut().zip(&self.y_centroids).for_each(|(r, c)| *r += c);
        }
        let d = n_measurement as f64;
        x_ref.iter_mut().for_each(|r| *r /= d);
        y_ref.iter_mut().for_each(|r| *r /= d);
        Ok((x_ref, y_ref))
    }
    /// Offsets the reference positions by a defocus given in diopters
    pub fn set_defocus(&mut self, diopters: f64) -> Result<()> {
        let reconstructor = self.reconstructor.as_ref().ok_or_else(|| {
            AoError::Configuration("defocus requires a wavefront reconstructor".into())
        })?;
        let (dx, dy) = reconstructor.defocus_displacement();
        let n = self.geometry.n();
        if dx.len() != n || dy.len() != n {
            return Err(AoError::shape((n, 2), (dx.len(), 2)));
        }
        let scale = diopters * self.config.zernike_dioptric_equivalent;
        let x: Vec<f64> = self.x0.iter().zip(dx).map(|(x, d)| x + d * scale).collect();
        let y: Vec<f64> = self.y0.iter().zip(dy).map(|(y, d)| y + d * scale).collect();
        let was_paused = self.paused;
        self.pause();
        let moved = self.geometry.moved_to(x, y);
        if !was_paused {
            self.unpause();
        }
        self.geometry = moved?;
        self.defocus = diopters;
        Ok(())
    }
    pub fn set_background_correction(&mut self, value: f64) {
        self.background_correction = value;
    }
    /// Enables or disables the writing of a snapshot after each cycle
    pub fn set_logging(&mut self, logging: bool) -> Result<()> {
        if logging && self.logging_directory.is_none() {
            return Err(AoError::Configuration(
                "sensor logging requires a logging directory".into(),
            ));
        }
        self.logging = logging;
        Ok(())
    }
    pub fn pause(&mut self) {
        log::debug!("sensor paused");
        self.paused = true;
    }
    pub fn unpause(&mut self) {
        log::debug!("sensor unpaused");
        self.paused = false;
    }
    pub fn is_paused(&self) -> bool {
        self.paused
    }
    /// Current state of the sensor
    pub fn snapshot(&self) -> SensorSnapshot {
        let (x1, x2, y1, y2) = self.geometry.iter_bounds().fold(
            (vec![], vec![], vec![], vec![]),
            |(mut x1, mut x2, mut y1, mut y2), b| {
                x1.push(b.0);
                x2.push(b.1);
                y1.push(b.2);
                y2.push(b.3);
                (x1, x2, y1, y2)
            },
        );
        SensorSnapshot {
            x_slopes: self.x_slopes.clone(),
            y_slopes: self.y_slopes.clone(),
            x_centroids: self.x_centroids.clone(),
            y_centroids: self.y_centroids.clone(),
            search_box_x1: x1,
            search_box_x2: x2,
            search_box_y1: y1,
            search_box_y2: y2,
            ref_x: self.geometry.x().to_vec(),
            ref_y: self.geometry.y().to_vec(),
            error: self.error(),
            tip: self.tip,
            tilt: self.tilt,
            wavefront: self.wavefront.clone(),
        }
    }
    fn log(&self) -> Result<()> {
        let Some(dir) = self.logging_directory.as_ref() else {
            return Ok(());
        };
        let path = dir.join(format!("sensor_{}.bin", textfile::now_string(true)));
        let file = File::create(&path).map_err(|e| AoError::file(&path, e))?;
        bincode::serialize_into(BufWriter::new(file), &self.snapshot())?;
        Ok(())
    }
    pub fn image(&self) -> Option<&Frame> {
        self.image.as_ref()
    }
    pub fn geometry(&self) -> &SearchGeometry {
        &self.geometry
    }
    pub fn lenslet_mask(&self) -> &Grid {
        &self.lenslet_mask
    }
    pub fn x_slopes(&self) -> &[f64] {
        &self.x_slopes
    }
    pub fn y_slopes(&self) -> &[f64] {
        &self.y_slopes
    }
    pub fn x_centroids(&self) -> &[f64] {
        &self.x_centroids
    }
    pub fn y_centroids(&self) -> &[f64] {
        &self.y_centroids
    }
    pub fn statistics(&self) -> &BoxStatistics {
        &self.stats
    }
    pub fn tip(&self) -> f64 {
        self.tip
    }
    pub fn tilt(&self) -> f64 {
        self.tilt
    }
    pub fn wavefront(&self) -> Option<&Wavefront> {
        self.wavefront.as_ref()
    }
    /// Wavefront error RMS of the last reconstruction
    pub fn error(&self) -> Option<f64> {
        self.wavefront.as_ref().map(|w| w.rms)
    }
    pub fn defocus(&self) -> f64 {
        self.defocus
    }
    pub fn background_correction(&self) -> f64 {
        self.background_correction
    }
    /// Smoothed sensing rate `[Hz]`
    pub fn frame_rate(&self) -> f64 {
        self.frame_rate
    }
    /// Number of successful sensing cycles
    pub fn n_cycle(&self) -> usize {
        self.n_cycle
    }
}

impl Update for WavefrontSensor {
    fn update(&mut self) {
        if self.paused {
            return;
        }
        match self.sense() {
            Ok(()) if self.logging => {
                if let Err(e) = self.log() {
                    print_info("sensor snapshot not saved", Some(&e));
                }
            }
            Ok(()) => (),
            Err(e) => print_info("sensing cycle skipped", Some(&e)),
        }
    }
}
impl Write<XSlopes> for WavefrontSensor {
    fn write(&mut self) -> Option<Data<XSlopes>> {
        Some(self.x_slopes.clone().into())
    }
}
impl Write<YSlopes> for WavefrontSensor {
    fn write(&mut self) -> Option<Data<YSlopes>> {
        Some(self.y_slopes.clone().into())
    }
}
impl Write<LensletPeaks> for WavefrontSensor {
    fn write(&mut self) -> Option<Data<LensletPeaks>> {
        Some(self.stats.maxes.clone().into())
    }
}
