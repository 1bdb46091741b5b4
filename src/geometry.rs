//! # Search boxes geometry
//!
//! The geometry holds the expected spot position of each lenslet and the
//! square search box, of half width `w`, centered on it.
//! The box bounds are always derived from the positions and `w`:
//! `x1 = round(x - w)` and `x2 = x1 + round(2w)` (ties to even), so every box
//! is exactly `round(2w)` pixels wide and, for `w ≥ 1`, contains its position.
//! Bounds are not clipped to the frame.

use serde::{Deserialize, Serialize};

use crate::{AoError, Result};

/// Lenslet search boxes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchGeometry {
    x: Vec<f64>,
    y: Vec<f64>,
    half_width: f64,
    x1: Vec<i64>,
    x2: Vec<i64>,
    y1: Vec<i64>,
    y2: Vec<i64>,
}

fn bounds(centers: &[f64], half_width: f64) -> (Vec<i64>, Vec<i64>) {
    let width = (2. * half_width).round_ties_even() as i64;
    centers
        .iter()
        .map(|c| {
            let lower = (c - half_width).round_ties_even() as i64;
            (lower, lower + width)
        })
        .unzip()
}

impl SearchGeometry {
    /// Creates the search boxes from the spots coordinates and the box half width
    pub fn new(x: Vec<f64>, y: Vec<f64>, half_width: f64) -> Result<Self> {
        if x.is_empty() {
            return Err(AoError::Configuration(
                "search geometry needs at least one lenslet".into(),
            ));
        }
        if x.len() != y.len() {
            return Err(AoError::shape((x.len(), 2), (y.len(), 2)));
        }
        if half_width <= 0. || half_width.is_nan() {
            return Err(AoError::Configuration(format!(
                "search box half width must be positive, found {half_width}"
            )));
        }
        let (x1, x2) = bounds(&x, half_width);
        let (y1, y2) = bounds(&y, half_width);
        Ok(Self {
            x,
            y,
            half_width,
            x1,
            x2,
            y1,
            y2,
        })
    }
    /// Creates the search boxes from `[x,y]` pairs
    pub fn from_pairs(xy: &[(f64, f64)], half_width: f64) -> Result<Self> {
        let (x, y) = xy.iter().cloned().unzip();
        Self::new(x, y, half_width)
    }
    /// Returns a new geometry with the same half width and the spots moved to new coordinates
    pub fn moved_to(&self, x: Vec<f64>, y: Vec<f64>) -> Result<Self> {
        if x.len() != self.n() || y.len() != self.n() {
            return Err(AoError::shape((self.n(), 2), (x.len(), 2).max((y.len(), 2))));
        }
        Self::new(x, y, self.half_width)
    }
    /// Returns the index of the first search box that contains the pixel
    pub fn lenslet_index_at(&self, px: f64, py: f64) -> Option<usize> {
        (0..self.n()).find(|&i| {
            self.x1[i] as f64 <= px
                && px <= self.x2[i] as f64
                && self.y1[i] as f64 <= py
                && py <= self.y2[i] as f64
        })
    }
    /// Number of lenslets
    #[inline]
    pub fn n(&self) -> usize {
        self.x.len()
    }
    #[inline]
    pub fn half_width(&self) -> f64 {
        self.half_width
    }
    /// Spots horizontal coordinates
    pub fn x(&self) -> &[f64] {
        &self.x
    }
    /// Spots vertical coordinates
    pub fn y(&self) -> &[f64] {
        &self.y
    }
    /// Returns the `(x1,x2,y1,y2)` bounds of the `i`th box
    pub fn bounds(&self, i: usize) -> (i64, i64, i64, i64) {
        (self.x1[i], self.x2[i], self.y1[i], self.y2[i])
    }
    /// Iterator over the `(x1,x2,y1,y2)` bounds of all the boxes
    pub fn iter_bounds(&self) -> impl Iterator<Item = (i64, i64, i64, i64)> + '_ {
        (0..self.n()).map(|i| self.bounds(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_contain_spots() -> Result<()> {
        let x: Vec<f64> = (0..40).map(|i| 10. + 0.37 * i as f64).collect();
        let y: Vec<f64> = (0..40).map(|i| 50.25 - 0.61 * i as f64).collect();
        for w in [1., 1.25, 1.5, 2.5, 3.7, 12.] {
            let sg = SearchGeometry::new(x.clone(), y.clone(), w)?;
            let width = (2. * w).round_ties_even() as i64;
            for (i, (x1, x2, y1, y2)) in sg.iter_bounds().enumerate() {
                assert!(x1 as f64 <= x[i] && x[i] <= x2 as f64, "w={w} x={}", x[i]);
                assert!(y1 as f64 <= y[i] && y[i] <= y2 as f64, "w={w} y={}", y[i]);
                assert_eq!(x2 - x1, width);
                assert_eq!(y2 - y1, width);
            }
        }
        Ok(())
    }

    #[test]
    fn half_pixel_ties() -> Result<()> {
        let sg = SearchGeometry::new(vec![10.5], vec![11.5], 2.)?;
        assert_eq!(sg.bounds(0), (8, 12, 10, 14));
        Ok(())
    }

    #[test]
    fn invalid_geometry() {
        assert!(matches!(
            SearchGeometry::new(vec![], vec![], 3.),
            Err(AoError::Configuration(_))
        ));
        assert!(matches!(
            SearchGeometry::new(vec![1.], vec![1.], 0.),
            Err(AoError::Configuration(_))
        ));
        assert!(matches!(
            SearchGeometry::new(vec![1.], vec![1.], -2.),
            Err(AoError::Configuration(_))
        ));
        assert!(matches!(
            SearchGeometry::new(vec![1.], vec![1.], f64::NAN),
            Err(AoError::Configuration(_))
        ));
    }

    #[test]
    fn move_spots() -> Result<()> {
        let sg = SearchGeometry::from_pairs(&[(10., 10.), (30., 10.)], 5.)?;
        let moved = sg.moved_to(vec![12., 33.], vec![9., 11.])?;
        assert_eq!(moved.x(), &[12., 33.]);
        assert_eq!(moved.y(), &[9., 11.]);
        assert_eq!(moved.half_width(), 5.);
        assert_eq!(moved.bounds(1), (28, 38, 6, 16));
        assert!(matches!(
            sg.moved_to(vec![1.], vec![1.]),
            Err(AoError::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn pixel_lookup() -> Result<()> {
        let sg = SearchGeometry::from_pairs(&[(10., 10.), (30., 10.)], 5.)?;
        assert_eq!(sg.lenslet_index_at(12., 7.), Some(0));
        assert_eq!(sg.lenslet_index_at(35., 15.), Some(1));
        assert_eq!(sg.lenslet_index_at(20., 10.), None);
        Ok(())
    }
}
