//! # Leaky integrator
//!
//! A leaky integral controller that implements the following relationship
//! between the input `u` and the output `y`:
//! `y = (1 - l) * y - g * u` where `g` is the controller gain and `l` the loss.
//!
//! The integrator memory is read back from the mirror before each update
//! so the law always starts from the command actually applied.

use interface::{Data, Read, Update, Write};

use crate::{Correction, MirrorCommand};

/// Leaky integral controller
#[derive(Clone, Debug)]
pub struct LeakyIntegrator {
    u: Data<Correction>,
    gain: f64,
    loss: f64,
    mem: Vec<f64>,
}
impl LeakyIntegrator {
    /// Creates a new leaky integrator for `n_data` commands
    pub fn new(n_data: usize) -> Self {
        Self {
            u: Default::default(),
            gain: 0.,
            loss: 0.,
            mem: vec![0.; n_data],
        }
    }
    /// Sets the gain
    pub fn gain(self, gain: f64) -> Self {
        Self { gain, ..self }
    }
    /// Sets the loss
    pub fn loss(self, loss: f64) -> Self {
        Self { loss, ..self }
    }
    pub fn set_gain(&mut self, gain: f64) -> &mut Self {
        self.gain = gain;
        self
    }
    pub fn set_loss(&mut self, loss: f64) -> &mut Self {
        self.loss = loss;
        self
    }
    pub fn get_gain(&self) -> f64 {
        self.gain
    }
    pub fn get_loss(&self) -> f64 {
        self.loss
    }
}
impl Update for LeakyIntegrator {
    fn update(&mut self) {
        let leak = 1. - self.loss;
        self.mem
            .iter_mut()
            .zip(self.u.iter())
            .for_each(|(y, u)| *y = *y * leak - self.gain * u);
    }
}
impl Read<Correction> for LeakyIntegrator {
    fn read(&mut self, data: Data<Correction>) {
        self.u = data;
    }
}
impl Read<MirrorCommand> for LeakyIntegrator {
    fn read(&mut self, data: Data<MirrorCommand>) {
        self.mem = data.into();
    }
}
impl Write<MirrorCommand> for LeakyIntegrator {
    fn write(&mut self) -> Option<Data<MirrorCommand>> {
        Some(self.mem.clone().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaky_step() {
        let mut integrator = LeakyIntegrator::new(1).gain(0.5).loss(0.1);
        <LeakyIntegrator as Read<MirrorCommand>>::read(&mut integrator, vec![1.].into());
        // correction: [[2.0]] x [0.2]
        <LeakyIntegrator as Read<Correction>>::read(&mut integrator, vec![0.4].into());
        integrator.update();
        let y = <LeakyIntegrator as Write<MirrorCommand>>::write(&mut integrator).unwrap();
        assert!((y[0] - 0.7).abs() < 1e-12);
    }

    #[test]
    fn bleeds_to_zero() {
        let mut integrator = LeakyIntegrator::new(2).gain(0.3).loss(0.5);
        <LeakyIntegrator as Read<MirrorCommand>>::read(&mut integrator, vec![1., -1.].into());
        <LeakyIntegrator as Read<Correction>>::read(&mut integrator, vec![0., 0.].into());
        for _ in 0..60 {
            integrator.update();
        }
        let y = <LeakyIntegrator as Write<MirrorCommand>>::write(&mut integrator).unwrap();
        assert!(y.iter().all(|y| y.abs() < 1e-15));
    }
}
