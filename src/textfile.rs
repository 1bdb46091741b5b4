//! # Text matrix files
//!
//! Calibration data (poke matrices, reference coordinates, masks, mirror flats)
//! is exchanged as plain numeric tables: one matrix row per line, values
//! separated by white spaces and `#` starting a comment.
//! Files are written with the same conventions as the existing calibration
//! files: a single space delimiter, `\n` line endings and either the
//! `%.18e` scientific format or a fixed `%0.<n>f` format.

use nalgebra::{DMatrix, DVector};
use std::{fmt::Write as _, fs, path::Path};

use crate::{AoError, Result};

/// Number format of a text matrix file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFormat {
    /// `%.<n>e`
    Scientific(usize),
    /// `%0.<n>f`
    Fixed(usize),
}
impl Default for TextFormat {
    fn default() -> Self {
        Self::Scientific(18)
    }
}
impl TextFormat {
    /// Formats a value like the C `printf` family does
    pub fn format(&self, value: f64) -> String {
        if value.is_nan() {
            return "nan".into();
        }
        if value.is_infinite() {
            return if value > 0. { "inf".into() } else { "-inf".into() };
        }
        match *self {
            TextFormat::Fixed(precision) => format!("{value:.precision$}"),
            TextFormat::Scientific(precision) => {
                let s = format!("{value:.precision$e}");
                match s.split_once('e') {
                    Some((mantissa, exponent)) => {
                        let exponent: i32 = exponent.parse().unwrap_or_default();
                        let sign = if exponent < 0 { '-' } else { '+' };
                        format!("{mantissa}e{sign}{:02}", exponent.abs())
                    }
                    None => s,
                }
            }
        }
    }
}

/// Local time stamp used to prefix calibration and log file names
///
/// `precise` appends the microseconds.
pub fn now_string(precise: bool) -> String {
    let now = chrono::Local::now();
    if precise {
        now.format("%Y%m%d%H%M%S_%6f").to_string()
    } else {
        now.format("%Y%m%d%H%M%S").to_string()
    }
}

/// Reads a text matrix file
///
/// Empty lines and comments are skipped; all rows must have the same number of columns.
pub fn load_matrix(path: impl AsRef<Path>) -> Result<DMatrix<f64>> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|e| AoError::file(path, e))?;
    let mut rows: Vec<Vec<f64>> = vec![];
    for (i, line) in contents.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let row = line
            .split_whitespace()
            .map(|x| x.parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|source| AoError::Parse {
                path: path.to_path_buf(),
                line: i + 1,
                source,
            })?;
        if let Some(first) = rows.first() {
            if first.len() != row.len() {
                return Err(AoError::shape(
                    (rows.len() + 1, first.len()),
                    (rows.len() + 1, row.len()),
                ));
            }
        }
        rows.push(row);
    }
    let n_rows = rows.len();
    let n_cols = rows.first().map_or(0, |row| row.len());
    Ok(DMatrix::from_row_iterator(
        n_rows,
        n_cols,
        rows.into_iter().flatten(),
    ))
}

/// Writes a text matrix file
pub fn save_matrix(path: impl AsRef<Path>, matrix: &DMatrix<f64>, format: TextFormat) -> Result<()> {
    let path = path.as_ref();
    let mut contents = String::new();
    for row in matrix.row_iter() {
        let line: Vec<_> = row.iter().map(|x| format.format(*x)).collect();
        // writing into a String never fails
        let _ = writeln!(contents, "{}", line.join(" "));
    }
    fs::write(path, contents).map_err(|e| AoError::file(path, e))?;
    log::debug!("saved {}x{} matrix to {path:?}", matrix.nrows(), matrix.ncols());
    Ok(())
}

/// Reads a vector stored either as a single column or as a single row
pub fn load_vector(path: impl AsRef<Path>) -> Result<DVector<f64>> {
    let matrix = load_matrix(path)?;
    match matrix.shape() {
        (_, 1) | (1, _) => Ok(DVector::from_iterator(
            matrix.len(),
            matrix.iter().cloned(),
        )),
        (n_rows, n_cols) => Err(AoError::shape((n_rows * n_cols, 1), (n_rows, n_cols))),
    }
}

/// Writes a vector as a single column
pub fn save_vector(path: impl AsRef<Path>, vector: &[f64], format: TextFormat) -> Result<()> {
    save_matrix(
        path,
        &DMatrix::from_column_slice(vector.len(), 1, vector),
        format,
    )
}

/// Reads a square boolean grid (non-zero values are `true`)
pub fn load_mask(path: impl AsRef<Path>) -> Result<DMatrix<bool>> {
    let matrix = load_matrix(path)?;
    let (n_rows, n_cols) = matrix.shape();
    if n_rows != n_cols {
        return Err(AoError::shape((n_rows, n_rows), (n_rows, n_cols)));
    }
    Ok(matrix.map(|x| x != 0.))
}

/// Writes a boolean grid as `0`/`1` values
pub fn save_mask(path: impl AsRef<Path>, mask: &DMatrix<bool>) -> Result<()> {
    save_matrix(
        path,
        &mask.map(|x| if x { 1. } else { 0. }),
        TextFormat::Fixed(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn printf_like_formatting() {
        let f = TextFormat::default();
        assert_eq!(f.format(1.), "1.000000000000000000e+00");
        assert_eq!(f.format(-2.5e-7), "-2.500000000000000000e-07");
        assert_eq!(f.format(0.), "0.000000000000000000e+00");
        assert_eq!(f.format(1.5e123), "1.500000000000000000e+123");
        assert_eq!(TextFormat::Fixed(2).format(512.126), "512.13");
        assert_eq!(TextFormat::Fixed(2).format(3.), "3.00");
        assert_eq!(f.format(f64::NAN), "nan");
    }

    #[test]
    fn file_round_trip() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("ao-textfile-{}", std::process::id()));
        fs::create_dir_all(&dir)?;
        let path = dir.join("poke.txt");
        let m = DMatrix::from_row_slice(2, 3, &[1., -2., 3.5, 0.25, 1e-9, -7e12]);
        save_matrix(&path, &m, TextFormat::default())?;
        let contents = fs::read_to_string(&path)?;
        assert_eq!(
            contents.lines().next().unwrap(),
            "1.000000000000000000e+00 -2.000000000000000000e+00 3.500000000000000000e+00"
        );
        assert_eq!(load_matrix(&path)?, m);
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn comments_and_ragged_rows() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("ao-textfile-rag-{}", std::process::id()));
        fs::create_dir_all(&dir)?;
        let path = dir.join("mask.txt");
        fs::write(&path, "# reference mask\n0 1\n1 1 # full row\n\n")?;
        let mask = load_mask(&path)?;
        assert_eq!(mask, DMatrix::from_row_slice(2, 2, &[false, true, true, true]));
        fs::write(&path, "0 1\n1\n")?;
        assert!(matches!(
            load_matrix(&path),
            Err(AoError::ShapeMismatch { .. })
        ));
        fs::write(&path, "0 x\n")?;
        assert!(matches!(load_matrix(&path), Err(AoError::Parse { line: 1, .. })));
        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
