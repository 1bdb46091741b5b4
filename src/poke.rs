//! # Poke matrix
//!
//! The poke matrix is the linear response of the wavefront sensor slopes to
//! each deformable mirror actuator.
//! It has `2N` rows, the `N` x-slopes responses stacked above the `N` y-slopes
//! responses, and one column per actuator.

use nalgebra::DMatrix;
use std::path::Path;

use crate::{
    textfile::{self, TextFormat},
    AoError, Result,
};

/// Slopes to actuators response matrix
#[derive(Debug, Clone, PartialEq)]
pub struct PokeMatrix {
    mat: DMatrix<f64>,
    placeholder: bool,
}

impl PokeMatrix {
    /// Creates a poke matrix from a `2N x M` matrix
    pub fn new(mat: DMatrix<f64>) -> Result<Self> {
        if mat.nrows() % 2 != 0 {
            return Err(AoError::Configuration(format!(
                "poke matrix must have an even number of rows, found {}",
                mat.nrows()
            )));
        }
        Ok(Self {
            mat,
            placeholder: false,
        })
    }
    /// Non-corrective poke matrix of the expected shape
    pub fn placeholder(n_lenslets: usize, n_actuators: usize) -> Self {
        Self {
            mat: DMatrix::zeros(2 * n_lenslets, n_actuators),
            placeholder: true,
        }
    }
    /// Builds the poke matrix from the slopes recorded during a poke calibration
    ///
    /// `x_slopes[actuator][step]` (resp. `y_slopes`) are the x (resp. y) slopes measured
    /// with `commands[step]` applied to `actuator`.
    /// The response of each actuator is the mean of the finite differences of the
    /// slopes over the mean command step.
    pub fn from_response(
        commands: &[f64],
        x_slopes: &[Vec<Vec<f64>>],
        y_slopes: &[Vec<Vec<f64>>],
    ) -> Result<Self> {
        let n_step = commands.len();
        if n_step < 2 {
            return Err(AoError::DegenerateCalibration(
                "at least 2 poke commands are required".into(),
            ));
        }
        let d_command = (commands[n_step - 1] - commands[0]) / (n_step - 1) as f64;
        if d_command == 0. {
            return Err(AoError::DegenerateCalibration(
                "poke commands are all identical".into(),
            ));
        }
        let n_actuator = x_slopes.len();
        if y_slopes.len() != n_actuator {
            return Err(AoError::shape((n_actuator, n_step), (y_slopes.len(), n_step)));
        }
        let n_lenslet = x_slopes
            .first()
            .and_then(|steps| steps.first())
            .map_or(0, |s| s.len());
        let mut mat = DMatrix::<f64>::zeros(2 * n_lenslet, n_actuator);
        for (k, (x, y)) in x_slopes.iter().zip(y_slopes).enumerate() {
            for (offset, steps) in [(0, x), (n_lenslet, y)] {
                if steps.len() != n_step || steps.iter().any(|s| s.len() != n_lenslet) {
                    return Err(AoError::shape(
                        (n_step, n_lenslet),
                        (steps.len(), steps.first().map_or(0, |s| s.len())),
                    ));
                }
                for i in 0..n_lenslet {
                    let mean_diff = steps
                        .windows(2)
                        .map(|w| w[1][i] - w[0][i])
                        .sum::<f64>()
                        / (n_step - 1) as f64;
                    mat[(offset + i, k)] = mean_diff / d_command;
                }
            }
        }
        Self::new(mat)
    }
    /// Loads a poke matrix from a text file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(textfile::load_matrix(path)?)
    }
    /// Loads a poke matrix and checks it against the sensor and mirror sizes
    ///
    /// If the file cannot be read or its shape is not `(2 x n_lenslets, n_actuators)`,
    /// a [placeholder](PokeMatrix::placeholder) is returned together with the error.
    pub fn load_checked(
        path: impl AsRef<Path>,
        n_lenslets: usize,
        n_actuators: usize,
    ) -> (Self, Option<AoError>) {
        let path = path.as_ref();
        let expected = (2 * n_lenslets, n_actuators);
        let error = match Self::load(path) {
            Ok(poke) if poke.mat.iter().any(|v| !v.is_finite()) => {
                AoError::DegenerateCalibration("non-finite poke matrix".into())
            }
            Ok(poke) if poke.shape() == expected => {
                log::info!("poke matrix {:?} loaded from {path:?}", poke.shape());
                return (poke, None);
            }
            Ok(poke) => AoError::shape(expected, poke.shape()),
            Err(e) => e,
        };
        log::warn!(
            "cannot use the poke matrix {path:?}: {error}; using a {}x{} placeholder, the loop will not correct",
            expected.0,
            expected.1
        );
        (Self::placeholder(n_lenslets, n_actuators), Some(error))
    }
    /// Writes the poke matrix to a text file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        textfile::save_matrix(path, &self.mat, TextFormat::default())
    }
    /// Returns `(2N, M)`
    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        self.mat.shape()
    }
    #[inline]
    pub fn n_lenslets(&self) -> usize {
        self.mat.nrows() / 2
    }
    #[inline]
    pub fn n_actuators(&self) -> usize {
        self.mat.ncols()
    }
    /// `true` for a placeholder matrix
    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }
    pub fn as_matrix(&self) -> &DMatrix<f64> {
        &self.mat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_response() -> Result<()> {
        let commands = [-0.1, 0., 0.1];
        // 2 lenslets, 2 actuators
        let x: Vec<Vec<Vec<f64>>> = vec![
            commands.iter().map(|c| vec![2. * c, 0.]).collect(),
            commands.iter().map(|c| vec![0., -c + 1.]).collect(),
        ];
        let y: Vec<Vec<Vec<f64>>> = vec![
            commands.iter().map(|c| vec![0., 3. * c]).collect(),
            commands.iter().map(|c| vec![*c, 0.]).collect(),
        ];
        let poke = PokeMatrix::from_response(&commands, &x, &y)?;
        assert_eq!(poke.shape(), (4, 2));
        let expected = DMatrix::from_row_slice(4, 2, &[2., 0., 0., -1., 0., 1., 3., 0.]);
        assert!((poke.as_matrix() - expected).abs().max() < 1e-12);
        Ok(())
    }

    #[test]
    fn mismatched_poke_file() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("ao-poke-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("poke.txt");
        PokeMatrix::new(DMatrix::from_element(4, 3, 1.))?.save(&path)?;

        let (poke, error) = PokeMatrix::load_checked(&path, 3, 3);
        assert_eq!(poke.shape(), (6, 3));
        assert!(poke.is_placeholder());
        assert!(matches!(error, Some(AoError::ShapeMismatch { .. })));

        let (poke, error) = PokeMatrix::load_checked(&path, 2, 3);
        assert!(error.is_none());
        assert!(!poke.is_placeholder());

        let (poke, error) = PokeMatrix::load_checked(dir.join("missing.txt"), 2, 3);
        assert!(matches!(error, Some(AoError::File { .. })));
        assert_eq!(poke.shape(), (4, 3));
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn non_finite_poke_file() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("ao-poke-nan-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("poke.txt");
        std::fs::write(&path, "1.0 nan\n0.5 1.0\n")?;

        let (poke, error) = PokeMatrix::load_checked(&path, 1, 2);
        assert!(poke.is_placeholder());
        assert!(poke.as_matrix().iter().all(|v| *v == 0.));
        assert!(matches!(error, Some(AoError::DegenerateCalibration(_))));
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn degenerate_stimulus() {
        assert!(matches!(
            PokeMatrix::from_response(&[0.1], &[], &[]),
            Err(AoError::DegenerateCalibration(_))
        ));
        assert!(matches!(
            PokeMatrix::from_response(&[0.1, 0.1], &[], &[]),
            Err(AoError::DegenerateCalibration(_))
        ));
    }
}
