//! # Control matrix
//!
//! The control matrix maps the slopes of the active lenslets to actuator
//! commands. It is the truncated pseudo-inverse of the rows of the
//! [PokeMatrix] that belong to the active lenslets.
//!
//! The [ControlLaw] client re-derives the control matrix whenever the set of
//! active lenslets changes and feeds the correction to a [LeakyIntegrator].

use interface::{print_info, Data, Read, Update, Write};
use nalgebra::{DMatrix, DVector};
use std::{collections::VecDeque, fmt, sync::Arc};

use crate::{
    config::{Config, ControlConfig},
    integrator::LeakyIntegrator,
    poke::PokeMatrix,
    AoError, Correction, LensletPeaks, MirrorCommand, Result, XSlopes, YSlopes,
};

/// Condition number reported for a degenerate inversion
pub const DEGENERATE_CONDITION: f64 = -1.;

/// Singular modes retention rule
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModeRetention {
    /// Keeps the largest `n` singular values
    Modes(usize),
    /// Keeps the singular values `s` such as `s_max / s < cutoff`
    Condition(f64),
}
impl ModeRetention {
    /// Whether the `k`th largest singular value `s` is retained
    pub fn retains(&self, k: usize, s_max: f64, s: f64) -> bool {
        match *self {
            Self::Modes(n_mode) => k < n_mode,
            Self::Condition(cutoff) => s_max < cutoff * s,
        }
    }
}
impl From<&ControlConfig> for ModeRetention {
    fn from(config: &ControlConfig) -> Self {
        match config.condition_cutoff {
            Some(cutoff) => Self::Condition(cutoff),
            None => Self::Modes(config.n_control_modes),
        }
    }
}
impl fmt::Display for ModeRetention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Modes(n) => write!(f, "{n} modes"),
            Self::Condition(c) => write!(f, "condition < {c}"),
        }
    }
}

/// Lenslets with enough light for control
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActiveLensletMask(Vec<bool>);
impl ActiveLensletMask {
    /// All lenslets active
    pub fn full(n: usize) -> Self {
        Self(vec![true; n])
    }
    /// Lenslets which peak intensity is strictly above `threshold`
    pub fn from_peaks(peaks: &[f64], threshold: f64) -> Self {
        Self(peaks.iter().map(|p| *p > threshold).collect())
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    /// Number of active lenslets
    pub fn n_active(&self) -> usize {
        self.0.iter().filter(|a| **a).count()
    }
    pub fn as_slice(&self) -> &[bool] {
        &self.0
    }
    /// Concatenates the x then the y slopes of the active lenslets
    pub fn select(&self, x_slopes: &[f64], y_slopes: &[f64]) -> Result<Vec<f64>> {
        let n = self.len();
        if x_slopes.len() != n || y_slopes.len() != n {
            return Err(AoError::shape((n, 2), (x_slopes.len(), 2)));
        }
        let active = |s: &'_ [f64]| -> Vec<f64> {
            s.iter()
                .zip(&self.0)
                .filter_map(|(s, a)| a.then_some(*s))
                .collect()
        };
        let mut slopes = active(x_slopes);
        slopes.extend(active(y_slopes));
        Ok(slopes)
    }
}

/// Truncated pseudo-inverse of the poke matrix
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMatrix {
    mat: DMatrix<f64>,
    cond: f64,
    n_mode: usize,
}

impl ControlMatrix {
    /// Inverts the rows of `poke` that belong to the lenslets of `mask`
    ///
    /// A degenerate poke matrix (all zeros, with non-finite entries or without active lenslets)
    /// results in a zero control matrix with a [condition number](DEGENERATE_CONDITION) of `-1`.
    pub fn invert(
        poke: &PokeMatrix,
        mask: &ActiveLensletMask,
        retention: ModeRetention,
    ) -> Result<Self> {
        let n = poke.n_lenslets();
        if mask.len() != n {
            return Err(AoError::shape((n, 1), (mask.len(), 1)));
        }
        let rows: Vec<usize> = mask
            .as_slice()
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.then_some(i))
            .chain(
                mask.as_slice()
                    .iter()
                    .enumerate()
                    .filter_map(|(i, a)| a.then_some(i + n)),
            )
            .collect();
        let n_actuator = poke.n_actuators();
        let zero = |reason: &str| {
            log::warn!("degenerate control matrix: {reason}");
            Self {
                mat: DMatrix::zeros(n_actuator, rows.len()),
                cond: DEGENERATE_CONDITION,
                n_mode: 0,
            }
        };
        if rows.is_empty() || n_actuator == 0 {
            return Ok(zero("no active lenslet or no actuator"));
        }
        let sub = poke.as_matrix().select_rows(rows.iter());
        if sub.iter().any(|v| !v.is_finite()) {
            return Ok(zero("non-finite poke matrix"));
        }
        let max_dim = sub.nrows().max(sub.ncols()) as f64;
        let svd = sub.svd(true, true);
        let (Some(u), Some(v_t)) = (svd.u.as_ref(), svd.v_t.as_ref()) else {
            return Err(AoError::DegenerateCalibration(
                "singular value decomposition failed".into(),
            ));
        };
        let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
        order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));
        let s_max = svd.singular_values[order[0]];
        let eps = f64::EPSILON * s_max * max_dim;
        if s_max <= 0. || !s_max.is_finite() {
            return Ok(zero("all singular values are zero"));
        }
        let retained: Vec<usize> = order
            .into_iter()
            .filter(|&i| svd.singular_values[i] > eps)
            .enumerate()
            .take_while(|&(k, i)| retention.retains(k, s_max, svd.singular_values[i]))
            .map(|(_, i)| i)
            .collect();
        let Some(&last) = retained.last() else {
            return Ok(zero("no singular value retained"));
        };
        let mut mat = DMatrix::<f64>::zeros(n_actuator, rows.len());
        for &i in &retained {
            let s = svd.singular_values[i];
            mat += v_t.row(i).transpose() * u.column(i).transpose() / s;
        }
        let cond = s_max / svd.singular_values[last];
        log::debug!(
            "control matrix {:?}: {} modes retained, condition number {cond:.3e}",
            mat.shape(),
            retained.len()
        );
        Ok(Self {
            mat,
            cond,
            n_mode: retained.len(),
        })
    }
    /// Returns the condition number of the retained singular values
    #[inline]
    pub fn cond(&self) -> f64 {
        self.cond
    }
    /// Number of retained singular modes
    #[inline]
    pub fn n_mode(&self) -> usize {
        self.n_mode
    }
    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        self.mat.shape()
    }
    pub fn as_matrix(&self) -> &DMatrix<f64> {
        &self.mat
    }
    /// Multiplies the control matrix with the active slopes vector
    pub fn apply(&self, slopes: &[f64]) -> Result<Vec<f64>> {
        if slopes.len() != self.mat.ncols() {
            return Err(AoError::shape(
                (self.mat.ncols(), 1),
                (slopes.len(), 1),
            ));
        }
        Ok((&self.mat * DVector::from_column_slice(slopes))
            .iter()
            .cloned()
            .collect())
    }
}

/// Control matrices of the most recently seen lenslet masks
#[derive(Debug, Clone)]
pub struct ControlMatrixCache {
    capacity: usize,
    entries: VecDeque<(ActiveLensletMask, Arc<ControlMatrix>)>,
}
impl ControlMatrixCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }
    /// Returns the control matrix of `mask`, inverting `poke` if it is not cached yet
    pub fn get_or_invert(
        &mut self,
        poke: &PokeMatrix,
        mask: &ActiveLensletMask,
        retention: ModeRetention,
    ) -> Result<Arc<ControlMatrix>> {
        if let Some((_, ctrl)) = self.entries.iter().find(|(m, _)| m == mask) {
            return Ok(ctrl.clone());
        }
        let ctrl = Arc::new(ControlMatrix::invert(poke, mask, retention)?);
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((mask.clone(), ctrl.clone()));
        Ok(ctrl)
    }
    pub fn clear(&mut self) {
        self.entries.clear();
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Closed-loop control law
///
/// Each update:
///  1. recomputes the active lenslets from the lenslet peak intensities,
///  2. re-derives the control matrix if the active lenslets have changed,
///  3. computes the correction from the active slopes,
///  4. integrates the correction into the mirror command.
///
/// A new command is written only if all the steps succeed.
pub struct ControlLaw {
    poke: PokeMatrix,
    retention: ModeRetention,
    threshold: f64,
    cache: ControlMatrixCache,
    mask: ActiveLensletMask,
    ctrl: Arc<ControlMatrix>,
    integrator: LeakyIntegrator,
    x_slopes: Data<XSlopes>,
    y_slopes: Data<YSlopes>,
    peaks: Data<LensletPeaks>,
    command: Option<Data<MirrorCommand>>,
}

impl ControlLaw {
    /// Creates a control law from a poke matrix, all lenslets active
    pub fn new(poke: PokeMatrix, config: &Config) -> Result<Self> {
        config.validate()?;
        let retention = ModeRetention::from(&config.control);
        let mask = ActiveLensletMask::full(poke.n_lenslets());
        let mut cache = ControlMatrixCache::new(config.control.ctrl_cache_size);
        let ctrl = cache.get_or_invert(&poke, &mask, retention)?;
        let integrator = LeakyIntegrator::new(poke.n_actuators())
            .gain(config.control.gain)
            .loss(config.control.loss);
        Ok(Self {
            poke,
            retention,
            threshold: config.sensor.spots_threshold,
            cache,
            mask,
            ctrl,
            integrator,
            x_slopes: Default::default(),
            y_slopes: Default::default(),
            peaks: Default::default(),
            command: None,
        })
    }
    fn reinvert(&mut self) -> Result<()> {
        self.cache.clear();
        self.ctrl = self
            .cache
            .get_or_invert(&self.poke, &self.mask, self.retention)?;
        Ok(())
    }
    /// Re-derives the control matrix for the current active lenslets
    pub fn invert(&mut self) -> Result<f64> {
        self.reinvert()?;
        log::info!(
            "control matrix inverted with {}: condition number {:.3}",
            self.retention,
            self.ctrl.cond()
        );
        Ok(self.ctrl.cond())
    }
    /// Replaces the poke matrix
    pub fn set_poke(&mut self, poke: PokeMatrix) -> Result<()> {
        if poke.shape() != self.poke.shape() {
            return Err(AoError::shape(self.poke.shape(), poke.shape()));
        }
        let previous = std::mem::replace(&mut self.poke, poke);
        if let Err(e) = self.reinvert() {
            self.poke = previous;
            self.reinvert()?;
            return Err(e);
        }
        Ok(())
    }
    pub fn set_retention(&mut self, retention: ModeRetention) -> Result<()> {
        self.retention = retention;
        self.reinvert()
    }
    /// Retains the `n` largest singular modes
    pub fn set_n_modes(&mut self, n: usize) -> Result<()> {
        self.set_retention(ModeRetention::Modes(n))
    }
    /// Number of modes of the retention rule, `None` when retaining by condition number
    pub fn get_n_modes(&self) -> Option<usize> {
        match self.retention {
            ModeRetention::Modes(n) => Some(n),
            ModeRetention::Condition(_) => None,
        }
    }
    pub fn retention(&self) -> ModeRetention {
        self.retention
    }
    pub fn condition_number(&self) -> f64 {
        self.ctrl.cond()
    }
    pub fn control_matrix(&self) -> &ControlMatrix {
        &self.ctrl
    }
    pub fn poke(&self) -> &PokeMatrix {
        &self.poke
    }
    pub fn active_lenslets(&self) -> &ActiveLensletMask {
        &self.mask
    }
    pub fn set_gain(&mut self, gain: f64) {
        self.integrator.set_gain(gain);
    }
    pub fn set_loss(&mut self, loss: f64) {
        self.integrator.set_loss(loss);
    }
    pub fn gain(&self) -> f64 {
        self.integrator.get_gain()
    }
    pub fn loss(&self) -> f64 {
        self.integrator.get_loss()
    }
    fn step(&mut self) -> Result<Data<MirrorCommand>> {
        let n = self.poke.n_lenslets();
        if self.peaks.len() != n {
            return Err(AoError::shape((n, 1), (self.peaks.len(), 1)));
        }
        let mask = ActiveLensletMask::from_peaks(&self.peaks, self.threshold);
        if mask != self.mask {
            let ctrl = self.cache.get_or_invert(&self.poke, &mask, self.retention)?;
            log::debug!(
                "{} active lenslets out of {n}, condition number {:.3}",
                mask.n_active(),
                ctrl.cond()
            );
            self.mask = mask;
            self.ctrl = ctrl;
        }
        let slopes = self.mask.select(&self.x_slopes, &self.y_slopes)?;
        let correction = self.ctrl.apply(&slopes)?;
        <LeakyIntegrator as Read<Correction>>::read(&mut self.integrator, correction.into());
        self.integrator.update();
        <LeakyIntegrator as Write<MirrorCommand>>::write(&mut self.integrator)
            .ok_or_else(|| AoError::Hardware("integrator has no output".into()))
    }
}

impl Update for ControlLaw {
    fn update(&mut self) {
        self.command = match self.step() {
            Ok(command) => Some(command),
            Err(e) => {
                print_info("control cycle skipped", Some(&e));
                None
            }
        };
    }
}
impl Read<XSlopes> for ControlLaw {
    fn read(&mut self, data: Data<XSlopes>) {
        self.x_slopes = data;
    }
}
impl Read<YSlopes> for ControlLaw {
    fn read(&mut self, data: Data<YSlopes>) {
        self.y_slopes = data;
    }
}
impl Read<LensletPeaks> for ControlLaw {
    fn read(&mut self, data: Data<LensletPeaks>) {
        self.peaks = data;
    }
}
impl Read<MirrorCommand> for ControlLaw {
    fn read(&mut self, data: Data<MirrorCommand>) {
        self.command = None;
        <LeakyIntegrator as Read<MirrorCommand>>::read(&mut self.integrator, data);
    }
}
impl Write<MirrorCommand> for ControlLaw {
    fn write(&mut self) -> Option<Data<MirrorCommand>> {
        self.command.take()
    }
}
