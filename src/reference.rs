//! # Reference coordinates
//!
//! Estimates the reference spot positions of a lenslet array from a camera
//! frame taken with a flat wavefront.
//! The lenslets of the reference mask are laid on a square grid, with the
//! lenslet pitch, centered on the frame; the grid is then shifted by the
//! whole number of pixels that gathers the most light within the spot windows
//! and, finally, by the mean offset of the spots within these windows.

use nalgebra::DMatrix;
use std::path::Path;

use crate::{
    config::SensorConfig,
    devices::{Camera, Frame, Grid},
    textfile::{self, TextFormat},
    AoError, Result, SearchGeometry,
};

/// Averages `n` camera frames
pub fn average_frames(camera: &mut dyn Camera, n: usize) -> Result<Frame> {
    if n == 0 {
        return Err(AoError::Configuration(
            "at least one frame is required".into(),
        ));
    }
    let mut mean = camera.get_image()?;
    for _ in 1..n {
        let frame = camera.get_image()?;
        if frame.shape() != mean.shape() {
            return Err(AoError::shape(mean.shape(), frame.shape()));
        }
        mean += frame;
    }
    Ok(mean / n as f64)
}

/// Summed-area table with a leading row and column of zeros
struct IntegralImage(DMatrix<f64>);
impl IntegralImage {
    fn new(image: &Frame) -> Self {
        let (n_rows, n_cols) = image.shape();
        let mut sat = DMatrix::<f64>::zeros(n_rows + 1, n_cols + 1);
        for y in 0..n_rows {
            for x in 0..n_cols {
                sat[(y + 1, x + 1)] =
                    image[(y, x)] + sat[(y, x + 1)] + sat[(y + 1, x)] - sat[(y, x)];
            }
        }
        Self(sat)
    }
    /// Sum over `[x1,x2]x[y1,y2]`, bounds included and clipped to the image
    fn window(&self, x1: i64, x2: i64, y1: i64, y2: i64) -> f64 {
        let n_rows = self.0.nrows() as i64 - 1;
        let n_cols = self.0.ncols() as i64 - 1;
        let (x1, x2) = (x1.max(0), (x2 + 1).min(n_cols));
        let (y1, y2) = (y1.max(0), (y2 + 1).min(n_rows));
        if x1 >= x2 || y1 >= y2 {
            return 0.;
        }
        let (x1, x2, y1, y2) = (x1 as usize, x2 as usize, y1 as usize, y2 as usize);
        self.0[(y2, x2)] - self.0[(y1, x2)] - self.0[(y2, x1)] + self.0[(y1, x1)]
    }
}

/// Reference coordinates estimator
#[derive(Debug, Clone)]
pub struct ReferenceGenerator {
    pitch_px: f64,
    half_width: f64,
}
impl ReferenceGenerator {
    pub fn new(config: &SensorConfig) -> Self {
        Self {
            pitch_px: config.pitch_px(),
            half_width: config.search_box_half_width,
        }
    }
    /// Spot positions of a lenslet grid centered on a `width x height` frame
    pub fn centered_grid(&self, mask: &Grid, width: usize, height: usize) -> (Vec<f64>, Vec<f64>) {
        let d = mask.nrows() as f64;
        let x_border = (width as f64 - d * self.pitch_px) / 2. + self.pitch_px / 2.;
        let y_border = (height as f64 - d * self.pitch_px) / 2. + self.pitch_px / 2.;
        let mut x = vec![];
        let mut y = vec![];
        // row major, as the lenslets are numbered
        for ly in 0..mask.nrows() {
            for lx in 0..mask.ncols() {
                if mask[(ly, lx)] {
                    x.push(x_border + self.pitch_px * lx as f64);
                    y.push(y_border + self.pitch_px * ly as f64);
                }
            }
        }
        (x, y)
    }
    /// Estimates the reference search boxes from a flat wavefront frame
    pub fn generate(&self, image: &Frame, mask: &Grid) -> Result<SearchGeometry> {
        if mask.nrows() != mask.ncols() {
            return Err(AoError::shape((mask.nrows(), mask.nrows()), mask.shape()));
        }
        let (height, width) = image.shape();
        let (x, y) = self.centered_grid(mask, width, height);
        let sat = IntegralImage::new(image);
        let h = self.half_width;
        let score = |sx: i64, sy: i64| -> f64 {
            x.iter()
                .zip(&y)
                .map(|(x, y)| {
                    let x1 = (x - h).round() as i64 + sx;
                    let y1 = (y - h).round() as i64 + sy;
                    let w = (2. * h).round() as i64;
                    sat.window(x1, x1 + w, y1, y1 + w)
                })
                .sum()
        };
        let range = self.pitch_px.round() as i64;
        let mut best = (0i64, 0i64, f64::NEG_INFINITY);
        for sy in -range..=range {
            for sx in -range..=range {
                let s = score(sx, sy);
                // ties go to the smallest shift
                if s > best.2 || (s == best.2 && sx.abs() + sy.abs() < best.0.abs() + best.1.abs()) {
                    best = (sx, sy, s);
                }
            }
        }
        let (sx, sy, _) = best;
        // sub-pixel refinement: mean spot offset within the shifted windows
        let (n_rows, n_cols) = (height as i64, width as i64);
        let mut offsets = (0., 0., 0usize);
        for (x, y) in x.iter().zip(&y) {
            let (xc, yc) = (x + sx as f64, y + sy as f64);
            let (mut m00, mut m10, mut m01) = (0., 0., 0.);
            for py in ((yc - h).round() as i64).max(0)..=((yc + h).round() as i64).min(n_rows - 1) {
                for px in ((xc - h).round() as i64).max(0)..=((xc + h).round() as i64).min(n_cols - 1) {
                    let v = image[(py as usize, px as usize)].max(0.);
                    m00 += v;
                    m10 += v * px as f64;
                    m01 += v * py as f64;
                }
            }
            if m00 > 0. {
                offsets.0 += m10 / m00 - xc;
                offsets.1 += m01 / m00 - yc;
                offsets.2 += 1;
            }
        }
        let (dx, dy) = if offsets.2 > 0 {
            (
                sx as f64 + offsets.0 / offsets.2 as f64,
                sy as f64 + offsets.1 / offsets.2 as f64,
            )
        } else {
            (sx as f64, sy as f64)
        };
        log::info!("reference grid shifted by ({dx:.3},{dy:.3}) pixels");
        SearchGeometry::new(
            x.into_iter().map(|x| x + dx).collect(),
            y.into_iter().map(|y| y + dy).collect(),
            self.half_width,
        )
    }
}

/// Writes reference coordinates as `x y` rows
pub fn save_coordinates(path: impl AsRef<Path>, geometry: &SearchGeometry, format: TextFormat) -> Result<()> {
    let (x, y) = (geometry.x(), geometry.y());
    let xy = DMatrix::from_fn(geometry.n(), 2, |i, j| if j == 0 { x[i] } else { y[i] });
    textfile::save_matrix(path, &xy, format)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_windows() {
        let image = Frame::from_fn(5, 6, |y, x| (x + 10 * y) as f64);
        let sat = IntegralImage::new(&image);
        let direct: f64 = (1..=3).flat_map(|y| (2..=4).map(move |x| (x + 10 * y) as f64)).sum();
        assert_eq!(sat.window(2, 4, 1, 3), direct);
        assert_eq!(sat.window(-10, 100, -10, 100), image.sum());
        assert_eq!(sat.window(10, 12, 0, 1), 0.);
    }

    #[test]
    fn shifted_grid() -> Result<()> {
        let mut config = SensorConfig::default();
        config.lenslet_pitch_m = 20. * config.pixel_size_m;
        config.search_box_half_width = 4.;
        let generator = ReferenceGenerator::new(&config);
        let mut mask = Grid::from_element(4, 4, true);
        mask[(0, 0)] = false;
        let (x, y) = generator.centered_grid(&mask, 100, 100);
        assert_eq!(x.len(), 15);
        assert!((x[0] - 40.).abs() < 1e-9 && (y[0] - 20.).abs() < 1e-9);
        let mut image = Frame::zeros(100, 100);
        for (x, y) in x.iter().zip(&y) {
            let (px, py) = ((x + 3.).round() as usize, (y - 2.).round() as usize);
            image[(py, px)] = 100.;
            image[(py + 1, px)] = 50.;
        }
        let geometry = generator.generate(&image, &mask)?;
        assert!((geometry.x()[0] - 43.).abs() < 1e-9);
        assert!((geometry.y()[0] - (18. + 1. / 3.)).abs() < 1e-9);
        Ok(())
    }
}
