//! # Simulated adaptive optics bench
//!
//! A Shack-Hartmann camera and a deformable mirror sharing the mirror command:
//! the camera renders one Gaussian spot per lenslet, displaced by a static
//! low order aberration and by the slopes of the mirror surface.
//! Each actuator pushes a Gaussian bump on the mirror surface.
//!
//! ```no_run
//! use ao_loop::{sim::SimulatedBench, Config};
//!
//! let config = Config::default();
//! let bench = SimulatedBench::builder(&config).aberration(2.).build()?;
//! # Ok::<(), ao_loop::AoError>(())
//! ```

use nalgebra::{DMatrix, DVector};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use crate::{
    config::{Config, SensorConfig},
    devices::{Camera, Frame, Grid, Mirror, Reconstructor, Wavefront},
    reference::ReferenceGenerator,
    textfile, AoError, Result, SearchGeometry,
};

type SharedCommand = Arc<Mutex<Vec<f64>>>;

fn poisoned<T>(_: T) -> AoError {
    AoError::Hardware("simulated mirror command lock poisoned".into())
}

/// Circular mask of `n` cells, the cells nearest to the center of the smallest square grid that fits them
fn circular_mask(n: usize) -> Grid {
    let d = (n as f64).sqrt().ceil() as usize;
    let c = (d as f64 - 1.) / 2.;
    let mut cells: Vec<(usize, usize)> = (0..d).flat_map(|i| (0..d).map(move |j| (i, j))).collect();
    let r2 = |&(i, j): &(usize, usize)| (i as f64 - c).powi(2) + (j as f64 - c).powi(2);
    cells.sort_by(|a, b| r2(a).total_cmp(&r2(b)));
    let mut mask = Grid::from_element(d, d, false);
    cells.into_iter().take(n).for_each(|ij| mask[ij] = true);
    mask
}

/// Fault injection handle
///
/// The next `n` frames of the camera fail with a hardware error.
#[derive(Debug, Clone, Default)]
pub struct FaultInjector(Arc<AtomicUsize>);
impl FaultInjector {
    pub fn fail_next(&self, n: usize) {
        self.0.store(n, Ordering::SeqCst);
    }
    fn consume(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Simulated deformable mirror
pub struct SimulatedMirror {
    mask: Grid,
    flat: Vec<f64>,
    command: SharedCommand,
    command_min: f64,
    command_max: f64,
    paused: bool,
}
impl SimulatedMirror {
    fn clip(&self, value: f64) -> f64 {
        value.clamp(self.command_min, self.command_max)
    }
    pub fn is_paused(&self) -> bool {
        self.paused
    }
}
impl Mirror for SimulatedMirror {
    fn n_actuators(&self) -> usize {
        self.flat.len()
    }
    fn mask(&self) -> &Grid {
        &self.mask
    }
    fn get_command(&self) -> Vec<f64> {
        self.command
            .lock()
            .map(|c| c.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
    fn set_command(&mut self, command: &[f64]) -> Result<()> {
        let n = self.n_actuators();
        if command.len() != n {
            return Err(AoError::shape((n, 1), (command.len(), 1)));
        }
        if command.iter().any(|c| !c.is_finite()) {
            return Err(AoError::Hardware("non-finite mirror command".into()));
        }
        let clipped: Vec<f64> = command.iter().map(|c| self.clip(*c)).collect();
        *self.command.lock().map_err(poisoned)? = clipped;
        Ok(())
    }
    fn flatten(&mut self) -> Result<()> {
        let flat = self.flat.clone();
        self.set_command(&flat)
    }
    fn set_actuator(&mut self, index: usize, value: f64) -> Result<()> {
        let n = self.n_actuators();
        let value = self.clip(value);
        let mut command = self.command.lock().map_err(poisoned)?;
        let actuator = command.get_mut(index).ok_or_else(|| {
            AoError::Hardware(format!("actuator #{index} out of range [0,{n})"))
        })?;
        *actuator = value;
        Ok(())
    }
    fn pause(&mut self) {
        self.paused = true;
    }
    fn unpause(&mut self) {
        self.paused = false;
    }
}

/// Simulated Shack-Hartmann camera
pub struct SimulatedCamera {
    width: usize,
    height: usize,
    geometry: SearchGeometry,
    lenslet_mask: Grid,
    // static spots displacement [px]
    x_static: DVector<f64>,
    y_static: DVector<f64>,
    // spots displacement per unit actuator command [px]
    x_influence: DMatrix<f64>,
    y_influence: DMatrix<f64>,
    command: SharedCommand,
    spot_sigma: f64,
    spot_peak: f64,
    background: f64,
    faults: FaultInjector,
}
impl SimulatedCamera {
    /// Spots positions for the current mirror command
    pub fn spots(&self) -> Result<(Vec<f64>, Vec<f64>)> {
        let command = DVector::from_vec(self.command.lock().map_err(poisoned)?.clone());
        let dx = &self.x_static + &self.x_influence * &command;
        let dy = &self.y_static + &self.y_influence * &command;
        Ok((
            self.geometry.x().iter().zip(dx.iter()).map(|(x, d)| x + d).collect(),
            self.geometry.y().iter().zip(dy.iter()).map(|(y, d)| y + d).collect(),
        ))
    }
}
impl Camera for SimulatedCamera {
    fn get_image(&mut self) -> Result<Frame> {
        if self.faults.consume() {
            return Err(AoError::Hardware("simulated camera frame dropped".into()));
        }
        let (x, y) = self.spots()?;
        let mut frame = Frame::from_element(self.height, self.width, self.background);
        let r = (4. * self.spot_sigma).ceil() as i64;
        let s2 = 2. * self.spot_sigma * self.spot_sigma;
        for (xs, ys) in x.into_iter().zip(y) {
            let (xc, yc) = (xs.round() as i64, ys.round() as i64);
            for py in (yc - r).max(0)..=(yc + r).min(self.height as i64 - 1) {
                for px in (xc - r).max(0)..=(xc + r).min(self.width as i64 - 1) {
                    let d2 = (px as f64 - xs).powi(2) + (py as f64 - ys).powi(2);
                    frame[(py as usize, px as usize)] += self.spot_peak * (-d2 / s2).exp();
                }
            }
        }
        Ok(frame)
    }
    fn search_geometry(&self) -> Option<(SearchGeometry, Grid)> {
        Some((self.geometry.clone(), self.lenslet_mask.clone()))
    }
}

/// Simulated camera and mirror
pub struct SimulatedBench {
    pub camera: SimulatedCamera,
    pub mirror: SimulatedMirror,
    pub faults: FaultInjector,
}

/// [SimulatedBench] builder
pub struct SimulatedBenchBuilder {
    config: Config,
    aberration: f64,
    stroke: f64,
    spot_sigma: f64,
    spot_peak: f64,
    background: f64,
}

impl SimulatedBench {
    pub fn builder(config: &Config) -> SimulatedBenchBuilder {
        SimulatedBenchBuilder {
            config: config.clone(),
            aberration: 1.5,
            stroke: 20.,
            spot_sigma: 1.5,
            spot_peak: 1000.,
            background: 50.,
        }
    }
    /// Bench with the default aberration, stroke and spot settings
    pub fn new(config: &Config) -> Result<Self> {
        Self::builder(config).build()
    }
}

impl SimulatedBenchBuilder {
    /// Largest static spot displacement `[px]`
    pub fn aberration(mut self, aberration: f64) -> Self {
        self.aberration = aberration;
        self
    }
    /// Largest spot displacement for a unit command on a single actuator `[px]`
    pub fn stroke(mut self, stroke: f64) -> Self {
        self.stroke = stroke;
        self
    }
    pub fn spot_sigma(mut self, sigma: f64) -> Self {
        self.spot_sigma = sigma;
        self
    }
    pub fn spot_peak(mut self, peak: f64) -> Self {
        self.spot_peak = peak;
        self
    }
    pub fn background(mut self, background: f64) -> Self {
        self.background = background;
        self
    }
    pub fn build(self) -> Result<SimulatedBench> {
        let Self { config, .. } = &self;
        config.validate()?;
        let s = &config.sensor;
        let pitch = s.pitch_px();
        let d_lenslet = (s.beam_diameter_m / s.lenslet_pitch_m).round() as usize;
        if d_lenslet == 0 || d_lenslet as f64 * pitch > s.image_width_px.min(s.image_height_px) as f64 {
            return Err(AoError::Configuration(format!(
                "a {d_lenslet} lenslets wide beam does not fit the {}x{} frame",
                s.image_width_px, s.image_height_px
            )));
        }
        let c = (d_lenslet as f64 - 1.) / 2.;
        let lenslet_mask = Grid::from_fn(d_lenslet, d_lenslet, |i, j| {
            (i as f64 - c).hypot(j as f64 - c) <= d_lenslet as f64 / 2.
        });
        let (x, y) = ReferenceGenerator::new(s).centered_grid(
            &lenslet_mask,
            s.image_width_px,
            s.image_height_px,
        );
        let geometry = SearchGeometry::new(x, y, s.search_box_half_width)?;
        let (xc, yc) = (s.image_width_px as f64 / 2., s.image_height_px as f64 / 2.);
        let radius = d_lenslet as f64 * pitch / 2.;

        // static defocus and astigmatism
        let x_static = DVector::from_iterator(
            geometry.n(),
            geometry.x().iter().zip(geometry.y()).map(|(x, y)| {
                let (xn, yn) = ((x - xc) / radius, (y - yc) / radius);
                self.aberration * (0.8 * xn + 0.4 * yn) / 1.2
            }),
        );
        let y_static = DVector::from_iterator(
            geometry.n(),
            geometry.x().iter().zip(geometry.y()).map(|(x, y)| {
                let (xn, yn) = ((x - xc) / radius, (y - yc) / radius);
                self.aberration * (0.8 * yn + 0.4 * xn) / 1.2
            }),
        );

        let m = &config.mirror;
        let mirror_mask = match config.paths.mirror_mask.as_ref() {
            Some(path) => textfile::load_mask(path)?,
            None => circular_mask(m.n_actuators),
        };
        let n_actuators = mirror_mask.iter().filter(|a| **a).count();
        if n_actuators != m.n_actuators {
            return Err(AoError::Configuration(format!(
                "the mirror mask has {n_actuators} actuators, {} were configured",
                m.n_actuators
            )));
        }
        let flat = match config.paths.mirror_flat.as_ref() {
            Some(path) => {
                let flat = textfile::load_vector(path)?;
                if flat.len() != n_actuators {
                    return Err(AoError::shape((n_actuators, 1), (flat.len(), 1)));
                }
                flat.iter().cloned().collect()
            }
            None => vec![0.; n_actuators],
        };
        let d_actuator = mirror_mask.nrows();
        let act_pitch = 2. * radius / d_actuator as f64;
        let ca = (d_actuator as f64 - 1.) / 2.;
        let actuators: Vec<(f64, f64)> = (0..d_actuator)
            .flat_map(|i| (0..d_actuator).map(move |j| (i, j)))
            .filter(|ij| mirror_mask[*ij])
            .map(|(i, j)| {
                (
                    xc + (j as f64 - ca) * act_pitch,
                    yc + (i as f64 - ca) * act_pitch,
                )
            })
            .collect();
        // gradient of exp(-r²/2σ²), normalized to a unit maximum
        let gain = self.stroke * std::f64::consts::E.sqrt() / act_pitch;
        let influence = |k: usize| {
            DMatrix::from_fn(geometry.n(), n_actuators, |i, a| {
                let (xa, ya) = actuators[a];
                let (dx, dy) = (geometry.x()[i] - xa, geometry.y()[i] - ya);
                let g = (-(dx * dx + dy * dy) / (2. * act_pitch * act_pitch)).exp();
                let d = if k == 0 { dx } else { dy };
                -gain * d * g
            })
        };
        let command: SharedCommand = Arc::new(Mutex::new(flat.clone()));
        let faults = FaultInjector::default();
        log::info!(
            "simulated bench: {} lenslets, {n_actuators} actuators",
            geometry.n()
        );
        Ok(SimulatedBench {
            camera: SimulatedCamera {
                width: s.image_width_px,
                height: s.image_height_px,
                x_influence: influence(0),
                y_influence: influence(1),
                geometry,
                lenslet_mask,
                x_static,
                y_static,
                command: command.clone(),
                spot_sigma: self.spot_sigma,
                spot_peak: self.spot_peak,
                background: self.background,
                faults: faults.clone(),
            },
            mirror: SimulatedMirror {
                mask: mirror_mask,
                flat,
                command,
                command_min: m.command_min,
                command_max: m.command_max,
                paused: false,
            },
            faults,
        })
    }
}

/// Tip, tilt and defocus wavefront reconstructor
///
/// The modes are fitted to the slopes in the least square sense; the
/// coefficients are in meters of wavefront.
pub struct LowOrderReconstructor {
    fit: DMatrix<f64>,
    modes: DMatrix<f64>,
    lenslets: Vec<(usize, usize)>,
    map_size: usize,
    defocus_dx: Vec<f64>,
    defocus_dy: Vec<f64>,
}
impl LowOrderReconstructor {
    pub fn new(geometry: &SearchGeometry, lenslet_mask: &Grid, config: &SensorConfig) -> Result<Self> {
        let n = geometry.n();
        let lenslets: Vec<(usize, usize)> = (0..lenslet_mask.nrows())
            .flat_map(|i| (0..lenslet_mask.ncols()).map(move |j| (i, j)))
            .filter(|ij| lenslet_mask[*ij])
            .collect();
        if lenslets.len() != n {
            return Err(AoError::shape((n, 1), (lenslets.len(), 1)));
        }
        let xc = geometry.x().iter().sum::<f64>() / n as f64;
        let yc = geometry.y().iter().sum::<f64>() / n as f64;
        let radius_px = geometry
            .x()
            .iter()
            .zip(geometry.y())
            .map(|(x, y)| (x - xc).hypot(y - yc))
            .fold(0f64, f64::max)
            + config.pitch_px() / 2.;
        let radius_m = radius_px * config.pixel_size_m;
        let (xn, yn): (Vec<f64>, Vec<f64>) = geometry
            .x()
            .iter()
            .zip(geometry.y())
            .map(|(x, y)| ((x - xc) / radius_px, (y - yc) / radius_px))
            .unzip();
        // slopes of [tip, tilt, defocus] with Z = [y, x, 2r²-1]
        let d = DMatrix::from_fn(2 * n, 3, |i, k| {
            let (l, is_x) = if i < n { (i, true) } else { (i - n, false) };
            let slope = match (k, is_x) {
                (0, true) | (1, false) => 0.,
                (0, false) | (1, true) => 1.,
                (_, true) => 4. * xn[l],
                (_, false) => 4. * yn[l],
            };
            slope / radius_m
        });
        let fit = d
            .clone()
            .pseudo_inverse(1e-12)
            .map_err(|e| AoError::DegenerateCalibration(e.to_string()))?;
        let modes = DMatrix::from_fn(n, 3, |l, k| match k {
            0 => yn[l],
            1 => xn[l],
            _ => 2. * (xn[l] * xn[l] + yn[l] * yn[l]) - 1.,
        });
        // spots displacement for 1µm of defocus
        let px_per_rad = config.lenslet_focal_length_m / config.pixel_size_m;
        let defocus_dx = (0..n).map(|l| d[(l, 2)] * 1e-6 * px_per_rad).collect();
        let defocus_dy = (0..n).map(|l| d[(n + l, 2)] * 1e-6 * px_per_rad).collect();
        Ok(Self {
            fit,
            modes,
            lenslets,
            map_size: lenslet_mask.nrows(),
            defocus_dx,
            defocus_dy,
        })
    }
}
impl Reconstructor for LowOrderReconstructor {
    fn get_wavefront(&mut self, x_slopes: &[f64], y_slopes: &[f64]) -> Result<Wavefront> {
        let n = self.lenslets.len();
        if x_slopes.len() != n || y_slopes.len() != n {
            return Err(AoError::shape((n, 2), (x_slopes.len(), 2)));
        }
        let slopes = DVector::from_iterator(2 * n, x_slopes.iter().chain(y_slopes).cloned());
        let coefficients = &self.fit * slopes;
        let values = &self.modes * &coefficients;
        let mut map = DMatrix::zeros(self.map_size, self.map_size);
        for (ij, v) in self.lenslets.iter().zip(values.iter()) {
            map[*ij] = *v;
        }
        let mean = values.mean();
        let rms = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64).sqrt();
        Ok(Wavefront {
            coefficients: coefficients.iter().cloned().collect(),
            map,
            rms,
        })
    }
    fn defocus_displacement(&self) -> (&[f64], &[f64]) {
        (&self.defocus_dx, &self.defocus_dy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        let mut config = Config::default();
        config.sensor.image_width_px = 200;
        config.sensor.image_height_px = 200;
        config.sensor.lenslet_pitch_m = 20. * config.sensor.pixel_size_m;
        config.sensor.beam_diameter_m = 8. * config.sensor.lenslet_pitch_m;
        config.sensor.search_box_half_width = 8.;
        config.mirror.n_actuators = 21;
        config
    }

    #[test]
    fn masks() {
        let mask = circular_mask(97);
        assert_eq!(mask.iter().filter(|a| **a).count(), 97);
        assert_eq!(mask.nrows(), 10);
        assert!(mask[(5, 5)] && mask[(4, 4)]);
        assert!(!mask[(0, 0)]);
    }

    #[test]
    fn mirror_drives_the_spots() -> Result<()> {
        let SimulatedBench {
            camera,
            mut mirror,
            faults,
        } = SimulatedBench::builder(&config()).aberration(0.).build()?;
        let (x0, y0) = camera.spots()?;
        assert_eq!(x0, camera.geometry.x());
        mirror.set_actuator(10, 0.1)?;
        let (x1, _) = camera.spots()?;
        assert!(x0.iter().zip(&x1).any(|(a, b)| (a - b).abs() > 0.1));
        mirror.set_command(&[1.; 21])?;
        assert!(mirror.get_command().iter().all(|c| *c == 0.3));
        mirror.flatten()?;
        assert_eq!(camera.spots()?.1, y0);
        assert!(mirror.set_command(&[0.; 3]).is_err());
        assert!(mirror.set_actuator(21, 0.).is_err());

        let mut camera = camera;
        faults.fail_next(1);
        assert!(matches!(camera.get_image(), Err(AoError::Hardware(_))));
        let frame = camera.get_image()?;
        assert_eq!(frame.shape(), (200, 200));
        assert!(frame.max() > 1000.);
        Ok(())
    }

    #[test]
    fn low_order_fit() -> Result<()> {
        let config = config();
        let bench = SimulatedBench::new(&config)?;
        let (geometry, mask) = bench
            .camera
            .search_geometry()
            .ok_or_else(|| AoError::Configuration("no geometry".into()))?;
        let mut reconstructor = LowOrderReconstructor::new(&geometry, &mask, &config.sensor)?;
        let (dx, dy) = reconstructor.defocus_displacement();
        let scale = config.sensor.slope_scale();
        // 2µm of defocus
        let x: Vec<f64> = dx.iter().map(|d| 2. * d * scale).collect();
        let y: Vec<f64> = dy.iter().map(|d| 2. * d * scale).collect();
        let wavefront = reconstructor.get_wavefront(&x, &y)?;
        assert!(wavefront.coefficients[0].abs() < 1e-12);
        assert!(wavefront.coefficients[1].abs() < 1e-12);
        assert!((wavefront.coefficients[2] - 2e-6).abs() < 1e-12);
        assert!(wavefront.rms > 0.);
        assert_eq!(wavefront.map.shape(), mask.shape());
        Ok(())
    }
}
