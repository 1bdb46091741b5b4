//! # Spots centroiding
//!
//! A [Centroider] computes the sub-pixel position of the spot within each
//! search box of a [SearchGeometry] together with some intensity statistics
//! per box.
//! [CenterOfMass] is the default implementation: the intensity-weighted
//! center of the background subtracted box pixels.

use rayon::prelude::*;

use crate::{devices::Frame, AoError, Result, SearchGeometry};

/// Background handling options
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CentroidOptions {
    /// Estimates the background from the perimeter of each box
    pub estimate_background: bool,
    /// Offset added to the counts after background subtraction
    pub background_correction: f64,
}

/// Search box intensity statistics
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BoxStatistics {
    pub maxes: Vec<f64>,
    pub mins: Vec<f64>,
    pub means: Vec<f64>,
    pub backgrounds: Vec<f64>,
}
impl BoxStatistics {
    pub fn zeros(n: usize) -> Self {
        Self {
            maxes: vec![0.; n],
            mins: vec![0.; n],
            means: vec![0.; n],
            backgrounds: vec![0.; n],
        }
    }
    pub fn len(&self) -> usize {
        self.maxes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.maxes.is_empty()
    }
}

/// Refined spots positions and box statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Centroids {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub stats: BoxStatistics,
}

/// Spots centroiding interface
pub trait Centroider: Send {
    /// Computes the spots positions within the boxes of `geometry`
    ///
    /// The returned vectors have the same length than the number of lenslets in `geometry`.
    fn compute_centroids(
        &self,
        image: &Frame,
        geometry: &SearchGeometry,
        options: &CentroidOptions,
    ) -> Result<Centroids>;
}

/// Center of mass centroiding
///
/// The boxes are processed in parallel on a dedicated thread pool.
pub struct CenterOfMass {
    pool: rayon::ThreadPool,
}

impl CenterOfMass {
    /// Creates a centroider running on `n_thread` threads
    pub fn new(n_thread: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_thread.max(1))
            .thread_name(|i| format!("centroiding-{i}"))
            .build()
            .map_err(|e| AoError::Configuration(format!("centroiding thread pool: {e}")))?;
        Ok(Self { pool })
    }
}

struct BoxCentroid {
    x: f64,
    y: f64,
    max: f64,
    min: f64,
    mean: f64,
    background: f64,
}

fn box_centroid(
    image: &Frame,
    (x1, x2, y1, y2): (i64, i64, i64, i64),
    (x0, y0): (f64, f64),
    options: &CentroidOptions,
) -> BoxCentroid {
    let (n_rows, n_cols) = image.shape();
    let x1 = x1.max(0);
    let y1 = y1.max(0);
    let x2 = x2.min(n_cols as i64 - 1);
    let y2 = y2.min(n_rows as i64 - 1);
    if x1 > x2 || y1 > y2 {
        // box entirely outside the frame
        return BoxCentroid {
            x: x0,
            y: y0,
            max: 0.,
            min: 0.,
            mean: 0.,
            background: 0.,
        };
    }
    let (x1, x2, y1, y2) = (x1 as usize, x2 as usize, y1 as usize, y2 as usize);

    let mut max = f64::NEG_INFINITY;
    let mut min = f64::INFINITY;
    let mut sum = 0.;
    let mut edge_sum = 0.;
    let mut edge_count = 0usize;
    for y in y1..=y2 {
        for x in x1..=x2 {
            let v = image[(y, x)];
            max = max.max(v);
            min = min.min(v);
            sum += v;
            if x == x1 || x == x2 || y == y1 || y == y2 {
                edge_sum += v;
                edge_count += 1;
            }
        }
    }
    let n_px = ((x2 - x1 + 1) * (y2 - y1 + 1)) as f64;
    let background = if options.estimate_background {
        edge_sum / edge_count as f64
    } else {
        0.
    };

    let mut m00 = 0.;
    let mut m10 = 0.;
    let mut m01 = 0.;
    for y in y1..=y2 {
        for x in x1..=x2 {
            let counts = (image[(y, x)] - background + options.background_correction).max(0.);
            m00 += counts;
            m10 += counts * x as f64;
            m01 += counts * y as f64;
        }
    }
    let (x, y) = if m00 > 0. {
        (m10 / m00, m01 / m00)
    } else {
        (x0, y0)
    };
    BoxCentroid {
        x,
        y,
        max,
        min,
        mean: sum / n_px,
        background,
    }
}

impl Centroider for CenterOfMass {
    fn compute_centroids(
        &self,
        image: &Frame,
        geometry: &SearchGeometry,
        options: &CentroidOptions,
    ) -> Result<Centroids> {
        if image.is_empty() {
            return Err(AoError::Hardware("empty camera frame".into()));
        }
        let boxes: Vec<BoxCentroid> = self.pool.install(|| {
            (0..geometry.n())
                .into_par_iter()
                .map(|i| {
                    box_centroid(
                        image,
                        geometry.bounds(i),
                        (geometry.x()[i], geometry.y()[i]),
                        options,
                    )
                })
                .collect()
        });
        let mut centroids = Centroids::default();
        for b in boxes {
            centroids.x.push(b.x);
            centroids.y.push(b.y);
            centroids.stats.maxes.push(b.max);
            centroids.stats.mins.push(b.min);
            centroids.stats.means.push(b.mean);
            centroids.stats.backgrounds.push(b.background);
        }
        Ok(centroids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spot(frame: &mut Frame, xc: f64, yc: f64, sigma: f64, peak: f64) {
        let (n_rows, n_cols) = frame.shape();
        for y in 0..n_rows {
            for x in 0..n_cols {
                let r2 = (x as f64 - xc).powi(2) + (y as f64 - yc).powi(2);
                frame[(y, x)] += peak * (-0.5 * r2 / sigma.powi(2)).exp();
            }
        }
    }

    const OPTIONS: CentroidOptions = CentroidOptions {
        estimate_background: true,
        background_correction: 0.,
    };

    #[test]
    fn gaussian_spots() -> Result<()> {
        let mut frame = Frame::from_element(64, 64, 10.);
        spot(&mut frame, 15.3, 20.8, 1.5, 1000.);
        spot(&mut frame, 45.6, 40.1, 1.5, 800.);
        let geometry = SearchGeometry::from_pairs(&[(16., 20.), (45., 40.)], 8.)?;
        let centroids = CenterOfMass::new(2)?.compute_centroids(&frame, &geometry, &OPTIONS)?;
        assert!((centroids.x[0] - 15.3).abs() < 0.05, "{:?}", centroids.x);
        assert!((centroids.y[0] - 20.8).abs() < 0.05, "{:?}", centroids.y);
        assert!((centroids.x[1] - 45.6).abs() < 0.05, "{:?}", centroids.x);
        assert!((centroids.y[1] - 40.1).abs() < 0.05, "{:?}", centroids.y);
        assert!(centroids.stats.maxes[0] > 900.);
        assert!((centroids.stats.backgrounds[0] - 10.).abs() < 0.5);
        assert!((centroids.stats.mins[1] - 10.).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn boxes_off_the_frame() -> Result<()> {
        let mut frame = Frame::zeros(32, 32);
        spot(&mut frame, 1.0, 1.0, 1.0, 500.);
        let geometry = SearchGeometry::from_pairs(&[(1., 1.), (80., 80.)], 4.)?;
        let options = CentroidOptions {
            estimate_background: false,
            background_correction: 0.,
        };
        let centroids = CenterOfMass::new(1)?.compute_centroids(&frame, &geometry, &options)?;
        assert!((centroids.x[0] - 1.).abs() < 0.1);
        assert_eq!((centroids.x[1], centroids.y[1]), (80., 80.));
        assert_eq!(centroids.stats.maxes[1], 0.);
        Ok(())
    }

    #[test]
    fn dark_box_keeps_its_center() -> Result<()> {
        let frame = Frame::from_element(32, 32, 5.);
        let geometry = SearchGeometry::from_pairs(&[(12.3, 17.9)], 4.)?;
        let centroids = CenterOfMass::new(1)?.compute_centroids(&frame, &geometry, &OPTIONS)?;
        assert_eq!((centroids.x[0], centroids.y[0]), (12.3, 17.9));
        Ok(())
    }
}
