//! # Closed-loop controller
//!
//! The controller owns the wavefront sensor, the deformable mirror and the
//! control law, and runs the loop on a [tokio] task:
//! sense, then control and actuate, then sense again, without any timer.
//!
//! The state shared between the driver task and the user-facing methods is
//! split in 2 cells, the sensor and the actuation (mirror and control law).
//! Both cells are only ever locked together through [SharedState::lock],
//! sensor first, so no code path can acquire them in the opposite order.
//!
//! The controller follows a type-state lifecycle:
//! [ClosedLoop<Idle>](Idle) → [start](ClosedLoop::start) → [ClosedLoop<Running>](Running)
//! → [shutdown](ClosedLoop::shutdown) → [ClosedLoop<Terminated>](Terminated).
//! Pausing and resuming happen within the `Running` state.

use interface::{print_info, Read, UniqueIdentifier, Update, Write};
use std::{marker::PhantomData, sync::Arc, time::Instant};
use tokio::{
    sync::{watch, Mutex, MutexGuard},
    task::JoinHandle,
};

use crate::{
    config::Config,
    control::{ControlLaw, ModeRetention},
    devices::{Frame, Mirror, Wavefront},
    poke::PokeMatrix,
    reference,
    sensor::{SensorSnapshot, WavefrontSensor},
    textfile::{self, TextFormat},
    AoError, LensletPeaks, MirrorCommand, Result, SearchGeometry, XSlopes, YSlopes,
};

/// Mirror and control law
pub struct Actuation {
    pub mirror: Box<dyn Mirror>,
    pub control: ControlLaw,
    /// Commands are only computed and applied when the loop is closed
    pub closed: bool,
}

/// Sensor and actuation cells
#[derive(Clone)]
pub struct SharedState {
    sensor: Arc<Mutex<WavefrontSensor>>,
    actuation: Arc<Mutex<Actuation>>,
}

/// Exclusive access to both the sensor and the actuation
///
/// Fields are dropped in declaration order: the actuation lock is released before the sensor lock.
pub struct LoopGuard<'a> {
    pub actuation: MutexGuard<'a, Actuation>,
    pub sensor: MutexGuard<'a, WavefrontSensor>,
}

impl SharedState {
    pub fn new(sensor: WavefrontSensor, actuation: Actuation) -> Self {
        Self {
            sensor: Arc::new(Mutex::new(sensor)),
            actuation: Arc::new(Mutex::new(actuation)),
        }
    }
    /// Locks the sensor then the actuation
    pub async fn lock(&self) -> LoopGuard<'_> {
        let sensor = self.sensor.lock().await;
        let actuation = self.actuation.lock().await;
        LoopGuard { actuation, sensor }
    }
    /// Locks the sensor alone
    pub async fn lock_sensor(&self) -> MutexGuard<'_, WavefrontSensor> {
        self.sensor.lock().await
    }
}

/// Moves the output `U` of `src` to the input `U` of `dst`
fn transfer<U, W, R>(src: &mut W, dst: &mut R)
where
    U: UniqueIdentifier,
    W: Write<U> + ?Sized,
    R: Read<U> + ?Sized,
{
    if let Some(data) = src.write() {
        dst.read(data);
    }
}

impl LoopGuard<'_> {
    /// Runs the control law and applies the new command
    ///
    /// Does nothing if the loop is open. The mirror command is left untouched if any step fails.
    pub fn control(&mut self) {
        let Actuation {
            mirror,
            control,
            closed,
        } = &mut *self.actuation;
        if !*closed {
            return;
        }
        let sensor: &mut WavefrontSensor = &mut self.sensor;
        transfer::<LensletPeaks, _, _>(&mut *sensor, &mut *control);
        transfer::<XSlopes, _, _>(&mut *sensor, &mut *control);
        transfer::<YSlopes, _, _>(&mut *sensor, &mut *control);
        <ControlLaw as Read<MirrorCommand>>::read(control, mirror.get_command().into());
        control.update();
        if let Some(command) = <ControlLaw as Write<MirrorCommand>>::write(control) {
            if let Err(e) = mirror.set_command(&command) {
                print_info("mirror command not applied", Some(&e));
            }
        }
    }
}

/// Loop driver state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    Terminated,
}

/// Controller constructed, loop not started
pub struct Idle;
/// Loop driver task running (possibly paused)
pub struct Running;
/// Loop driver task finished
pub struct Terminated;

/// States in which the loop can be operated
pub trait Active {}
impl Active for Idle {}
impl Active for Running {}

/// Closed-loop adaptive optics controller
pub struct ClosedLoop<S = Idle> {
    pub(crate) shared: SharedState,
    pub(crate) config: Config,
    pub(crate) run_state: watch::Sender<RunState>,
    cycles: watch::Receiver<usize>,
    cycles_tx: Option<watch::Sender<usize>>,
    task: Option<JoinHandle<()>>,
    start: Instant,
    state: PhantomData<S>,
}

impl ClosedLoop<Idle> {
    /// Creates a new controller
    ///
    /// The poke matrix is loaded from the configured file. If the file is missing or does not match the
    /// sensor and the mirror, a non-corrective placeholder is used instead and a warning is issued.
    pub fn new(sensor: WavefrontSensor, mirror: Box<dyn Mirror>, config: &Config) -> Result<Self> {
        config.validate()?;
        let n_lenslets = sensor.n_lenslets();
        let n_actuators = mirror.n_actuators();
        if n_actuators != config.mirror.n_actuators {
            return Err(AoError::Configuration(format!(
                "the mirror has {n_actuators} actuators, {} were configured",
                config.mirror.n_actuators
            )));
        }
        let poke = match config.paths.poke.as_ref() {
            Some(path) => {
                let (poke, error) = PokeMatrix::load_checked(path, n_lenslets, n_actuators);
                if let Some(e) = error {
                    print_info("using a placeholder poke matrix", Some(&e));
                }
                poke
            }
            None => {
                log::warn!("no poke matrix configured, the loop will not correct until calibrated");
                PokeMatrix::placeholder(n_lenslets, n_actuators)
            }
        };
        Self::with_poke(sensor, mirror, poke, config)
    }
    /// Creates a new controller with the given poke matrix
    pub fn with_poke(
        sensor: WavefrontSensor,
        mirror: Box<dyn Mirror>,
        poke: PokeMatrix,
        config: &Config,
    ) -> Result<Self> {
        config.validate()?;
        let expected = (2 * sensor.n_lenslets(), mirror.n_actuators());
        if poke.shape() != expected {
            return Err(AoError::shape(expected, poke.shape()));
        }
        let control = ControlLaw::new(poke, config)?;
        let shared = SharedState::new(
            sensor,
            Actuation {
                mirror,
                control,
                closed: false,
            },
        );
        let (run_state, _) = watch::channel(RunState::Running);
        let (cycles_tx, cycles) = watch::channel(0usize);
        Ok(Self {
            shared,
            config: config.clone(),
            run_state,
            cycles,
            cycles_tx: Some(cycles_tx),
            task: None,
            start: Instant::now(),
            state: PhantomData,
        })
    }
    /// Spawns the loop driver task
    pub fn start(mut self) -> ClosedLoop<Running> {
        let shared = self.shared.clone();
        let run_state = self.run_state.subscribe();
        let task = self
            .cycles_tx
            .take()
            .map(|cycles| tokio::spawn(drive(shared, run_state, cycles)));
        log::info!("adaptive optics loop started");
        ClosedLoop {
            shared: self.shared,
            config: self.config,
            run_state: self.run_state,
            cycles: self.cycles,
            cycles_tx: None,
            task,
            start: Instant::now(),
            state: PhantomData,
        }
    }
}

/// Sense, control, repeat
async fn drive(
    shared: SharedState,
    mut run_state: watch::Receiver<RunState>,
    cycles: watch::Sender<usize>,
) {
    let mut n_cycle = 0usize;
    loop {
        if run_state.has_changed().is_err() {
            break;
        }
        match run_state.wait_for(|s| *s != RunState::Paused).await {
            Ok(state) if *state == RunState::Terminated => break,
            Ok(_) => (),
            Err(_) => break,
        }
        {
            let mut sensor = shared.lock_sensor().await;
            if *run_state.borrow() != RunState::Running {
                continue;
            }
            sensor.update();
        }
        {
            let mut guard = shared.lock().await;
            if *run_state.borrow() != RunState::Running {
                continue;
            }
            guard.control();
        }
        n_cycle += 1;
        cycles.send_replace(n_cycle);
        tokio::task::yield_now().await;
    }
    log::debug!("loop driver stopped after {n_cycle} cycles");
}

impl ClosedLoop<Running> {
    /// Waits for `n` more loop cycles
    pub async fn wait_cycles(&mut self, n: usize) -> Result<usize> {
        let target = *self.cycles.borrow_and_update() + n;
        let n_cycle = *self
            .cycles
            .wait_for(|c| *c >= target)
            .await
            .map_err(|_| AoError::Stopped)?;
        Ok(n_cycle)
    }
    /// Stops the loop driver task
    pub async fn shutdown(mut self) -> Result<ClosedLoop<Terminated>> {
        self.run_state.send_replace(RunState::Terminated);
        if let Some(task) = self.task.take() {
            task.await?;
        }
        log::info!(
            "adaptive optics loop terminated after {} cycles in {:.3}s",
            self.n_cycle(),
            self.start.elapsed().as_secs_f64()
        );
        Ok(ClosedLoop {
            shared: self.shared,
            config: self.config,
            run_state: self.run_state,
            cycles: self.cycles,
            cycles_tx: None,
            task: None,
            start: self.start,
            state: PhantomData,
        })
    }
}

impl<S: Active> ClosedLoop<S> {
    /// Suspends the loop at its next cycle
    pub async fn pause(&self) {
        let mut guard = self.shared.lock().await;
        guard.sensor.pause();
        guard.actuation.mirror.pause();
        self.run_state.send_replace(RunState::Paused);
        log::info!("loop paused");
    }
    /// Resumes the loop
    pub async fn unpause(&self) {
        let mut guard = self.shared.lock().await;
        guard.sensor.unpause();
        guard.actuation.mirror.unpause();
        self.run_state.send_replace(RunState::Running);
        log::info!("loop unpaused");
    }
    /// Pauses the loop and lets the cycle in flight complete
    pub(crate) async fn quiesce(&self) {
        self.pause().await;
        tokio::time::sleep(self.config.control.quiesce_time()).await;
    }
    /// Opens or closes the loop
    pub async fn set_closed(&self, closed: bool) {
        let mut guard = self.shared.lock().await;
        guard.actuation.closed = closed;
        log::info!("loop {}", if closed { "closed" } else { "opened" });
    }
    pub async fn set_gain(&self, gain: f64) -> Result<()> {
        if gain <= 0. || gain.is_nan() {
            return Err(AoError::Configuration(format!(
                "control gain must be positive, found {gain}"
            )));
        }
        self.shared.lock().await.actuation.control.set_gain(gain);
        Ok(())
    }
    pub async fn set_loss(&self, loss: f64) -> Result<()> {
        if !(0. ..1.).contains(&loss) {
            return Err(AoError::Configuration(format!(
                "control loss must be in [0,1), found {loss}"
            )));
        }
        self.shared.lock().await.actuation.control.set_loss(loss);
        Ok(())
    }
    /// Re-derives the control matrix, returning its condition number
    ///
    /// The loop is paused during the inversion and unpaused afterward.
    pub async fn invert(&self) -> Result<f64> {
        self.quiesce().await;
        let result = self.shared.lock().await.actuation.control.invert();
        self.unpause().await;
        result
    }
    /// Retains the `n` largest singular modes in the control matrix
    pub async fn set_n_modes(&self, n: usize) -> Result<()> {
        if n == 0 {
            return Err(AoError::Configuration(
                "at least one control mode is required".into(),
            ));
        }
        self.shared.lock().await.actuation.control.set_n_modes(n)
    }
    /// Retains the singular modes within a condition number in the control matrix
    pub async fn set_condition_cutoff(&self, cutoff: f64) -> Result<()> {
        if cutoff < 1. || cutoff.is_nan() {
            return Err(AoError::Configuration(format!(
                "condition cutoff must be ≥ 1, found {cutoff}"
            )));
        }
        self.shared
            .lock()
            .await
            .actuation
            .control
            .set_retention(ModeRetention::Condition(cutoff))
    }
    /// Replaces the poke matrix, the previous one is kept on failure
    pub async fn set_poke(&self, poke: PokeMatrix) -> Result<()> {
        self.shared.lock().await.actuation.control.set_poke(poke)
    }
    /// Loads a new poke matrix, the previous one is kept on failure
    pub async fn load_poke(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let poke = PokeMatrix::load(path.as_ref())?;
        self.set_poke(poke).await?;
        log::info!("poke matrix loaded from {:?}", path.as_ref());
        Ok(())
    }
    /// Records a new sensor reference
    ///
    /// The coordinates are saved in the reference directory, if one is configured.
    pub async fn record_reference(&self) -> Result<(Vec<f64>, Vec<f64>)> {
        let (coordinates, geometry) = {
            let mut sensor = self.shared.lock_sensor().await;
            let coordinates = sensor.record_reference()?;
            (coordinates, sensor.geometry().clone())
        };
        if let Some(dir) = self.config.paths.reference_directory.as_ref() {
            let path = dir.join(format!("{}_coords.txt", textfile::now_string(false)));
            reference::save_coordinates(&path, &geometry, TextFormat::Fixed(2))?;
            log::info!("reference coordinates saved to {path:?}");
        }
        Ok(coordinates)
    }
    pub async fn set_defocus(&self, diopters: f64) -> Result<()> {
        self.shared.lock_sensor().await.set_defocus(diopters)
    }
    pub async fn set_background_correction(&self, value: f64) {
        self.shared
            .lock_sensor()
            .await
            .set_background_correction(value);
    }
    pub async fn set_logging(&self, logging: bool) -> Result<()> {
        self.shared.lock_sensor().await.set_logging(logging)
    }
}

impl<S> ClosedLoop<S> {
    pub fn config(&self) -> &Config {
        &self.config
    }
    /// Number of completed loop cycles
    pub fn n_cycle(&self) -> usize {
        *self.cycles.borrow()
    }
    pub fn is_paused(&self) -> bool {
        *self.run_state.borrow() == RunState::Paused
    }
    pub async fn is_closed(&self) -> bool {
        self.shared.lock().await.actuation.closed
    }
    pub async fn condition_number(&self) -> f64 {
        self.shared.lock().await.actuation.control.condition_number()
    }
    /// Number of modes of the retention rule, `None` when retaining by condition number
    pub async fn n_modes(&self) -> Option<usize> {
        self.shared.lock().await.actuation.control.get_n_modes()
    }
    pub async fn gain(&self) -> f64 {
        self.shared.lock().await.actuation.control.gain()
    }
    pub async fn loss(&self) -> f64 {
        self.shared.lock().await.actuation.control.loss()
    }
    pub async fn poke(&self) -> PokeMatrix {
        self.shared.lock().await.actuation.control.poke().clone()
    }
    /// Current mirror command
    pub async fn command(&self) -> Vec<f64> {
        self.shared.lock().await.actuation.mirror.get_command()
    }
    pub async fn sensor_snapshot(&self) -> SensorSnapshot {
        self.shared.lock_sensor().await.snapshot()
    }
    pub async fn image(&self) -> Option<Frame> {
        self.shared.lock_sensor().await.image().cloned()
    }
    pub async fn geometry(&self) -> SearchGeometry {
        self.shared.lock_sensor().await.geometry().clone()
    }
    pub async fn wavefront(&self) -> Option<Wavefront> {
        self.shared.lock_sensor().await.wavefront().cloned()
    }
}
