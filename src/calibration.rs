//! # Poke calibration
//!
//! Each actuator is stepped, alone, through a sequence of commands while the
//! wavefront sensor records the slopes; the slopes sensitivity to each
//! actuator gives the [PokeMatrix].
//!
//! The loop is paused for the duration of the calibration. If a measurement
//! fails, the calibration is aborted and the loop keeps running with the
//! previous poke and control matrices.

use indicatif::{ProgressBar, ProgressStyle};
use interface::print_info;
use std::{path::PathBuf, time::Instant};

use crate::{
    config::PokeConfig,
    controller::{Active, ClosedLoop, LoopGuard},
    poke::PokeMatrix,
    textfile::{self, TextFormat},
    AoError, Result,
};

/// Poke calibration commands
#[derive(Debug, Clone, PartialEq)]
pub struct PokeStimulus {
    commands: Vec<f64>,
}
impl PokeStimulus {
    /// `n_step` commands linearly spaced from `command_min` to `command_max`
    pub fn linspace(command_min: f64, command_max: f64, n_step: usize) -> Result<Self> {
        let span = command_max - command_min;
        if n_step < 2 || span <= 0. || span.is_nan() {
            return Err(AoError::Configuration(format!(
                "invalid poke stimulus: {n_step} steps in [{command_min},{command_max}]"
            )));
        }
        let d = (command_max - command_min) / (n_step - 1) as f64;
        Ok(Self {
            commands: (0..n_step).map(|i| command_min + d * i as f64).collect(),
        })
    }
    pub fn commands(&self) -> &[f64] {
        &self.commands
    }
}
impl TryFrom<&PokeConfig> for PokeStimulus {
    type Error = AoError;
    fn try_from(config: &PokeConfig) -> Result<Self> {
        Self::linspace(config.command_min, config.command_max, config.n_command_steps)
    }
}

/// Files written at the end of a successful calibration
#[derive(Debug, Clone, PartialEq)]
pub struct PokeFiles {
    pub poke: PathBuf,
    pub currents: PathBuf,
}

/// Outcome of a poke calibration
#[derive(Debug, Clone)]
pub struct PokeCalibration {
    pub poke: PokeMatrix,
    /// Condition number of the new control matrix
    pub cond: f64,
    pub files: Option<PokeFiles>,
}

fn progress(n_actuator: usize) -> ProgressBar {
    let pb = ProgressBar::new(n_actuator as u64);
    if let Ok(style) =
        ProgressStyle::with_template("{msg} [{eta_precise}] {bar:50.cyan/blue} {pos:>4}/{len:4}")
    {
        pb.set_style(style);
    }
    pb.set_message("Poking actuators");
    pb
}

/// Records the slopes for each actuator and each command
async fn measure(
    guard: &mut LoopGuard<'_>,
    stimulus: &PokeStimulus,
    settling_time: std::time::Duration,
) -> Result<PokeMatrix> {
    let n_actuator = guard.actuation.mirror.n_actuators();
    let pb = progress(n_actuator);
    let mut x_slopes = Vec::with_capacity(n_actuator);
    let mut y_slopes = Vec::with_capacity(n_actuator);
    for k in 0..n_actuator {
        guard.actuation.mirror.flatten()?;
        let mut x = vec![];
        let mut y = vec![];
        for &command in stimulus.commands() {
            guard.actuation.mirror.set_actuator(k, command)?;
            tokio::time::sleep(settling_time).await;
            guard.sensor.sense()?;
            x.push(guard.sensor.x_slopes().to_vec());
            y.push(guard.sensor.y_slopes().to_vec());
        }
        x_slopes.push(x);
        y_slopes.push(y);
        pb.inc(1);
    }
    pb.finish();
    guard.actuation.mirror.flatten()?;
    PokeMatrix::from_response(stimulus.commands(), &x_slopes, &y_slopes)
}

impl<S: Active> ClosedLoop<S> {
    /// Calibrates the poke matrix and derives the new control matrix
    ///
    /// The new poke matrix and the stimulus are saved in the poke directory, if one is configured.
    /// The loop is unpaused on return, whatever the outcome.
    pub async fn run_poke_calibration(&self, stimulus: &PokeStimulus) -> Result<PokeCalibration> {
        self.quiesce().await;
        let now = Instant::now();
        let result = {
            let mut guard = self.shared.lock().await;
            match measure(&mut guard, stimulus, self.config.mirror.settling_time()).await {
                Ok(poke) => guard
                    .actuation
                    .control
                    .set_poke(poke.clone())
                    .map(|_| (poke, guard.actuation.control.condition_number())),
                Err(e) => {
                    if let Err(e) = guard.actuation.mirror.flatten() {
                        print_info("mirror not flattened after poke failure", Some(&e));
                    }
                    Err(e)
                }
            }
        };
        self.unpause().await;
        let (poke, cond) = result.map_err(|e| {
            print_info("poke calibration aborted, previous calibration kept", Some(&e));
            e
        })?;
        log::info!(
            "poke calibration {:?} completed in {:.1}s, condition number {cond:.3}",
            poke.shape(),
            now.elapsed().as_secs_f64()
        );
        let files = match self.config.paths.poke_directory.as_ref() {
            Some(dir) => {
                let stamp = textfile::now_string(false);
                let files = PokeFiles {
                    poke: dir.join(format!("{stamp}_poke.txt")),
                    currents: dir.join(format!("{stamp}_currents.txt")),
                };
                poke.save(&files.poke)?;
                textfile::save_vector(&files.currents, stimulus.commands(), TextFormat::default())?;
                log::info!("poke matrix saved to {:?}", files.poke);
                Some(files)
            }
            None => None,
        };
        Ok(PokeCalibration { poke, cond, files })
    }
}
