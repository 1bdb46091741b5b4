use std::path::PathBuf;

/// Adaptive optics loop errors
#[derive(thiserror::Error, Debug)]
pub enum AoError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("hardware failure: {0}")]
    Hardware(String),
    #[error("degenerate calibration: {0}")]
    DegenerateCalibration(String),
    #[error("failed to access {path:?}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path:?} at line {line}")]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: std::num::ParseFloatError,
    },
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("failed to decode TOML configuration")]
    Toml(#[from] toml::de::Error),
    #[error("failed to serialize sensor snapshot")]
    Bincode(#[from] bincode::Error),
    #[error("the loop driver has stopped")]
    Stopped,
    #[error("loop driver task failed")]
    Join(#[from] tokio::task::JoinError),
}

impl AoError {
    pub(crate) fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }
    pub(crate) fn shape(expected: (usize, usize), found: (usize, usize)) -> Self {
        Self::ShapeMismatch { expected, found }
    }
}

pub type Result<T> = std::result::Result<T, AoError>;
