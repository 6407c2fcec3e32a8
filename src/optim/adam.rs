//! Adam optimizer over the patch buffer.
//!
//! Standard Adam with bias correction, plus the AMSGrad variant that keeps
//! the running maximum of the second-moment estimate. The optimizer owns
//! the moment buffers for exactly one parameter tensor (the patch) and
//! updates it in place; the caller projects back onto [0, 1] afterwards.

use ndarray::Array3;

/// Adam hyperparameters.
#[derive(Clone, Copy, Debug)]
pub struct AdamConfig {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub amsgrad: bool,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            amsgrad: true,
        }
    }
}

/// Adam state for one 3-channel parameter tensor.
pub struct Adam {
    config: AdamConfig,

    /// First-moment estimate.
    m: Array3<f32>,

    /// Second-moment estimate.
    v: Array3<f32>,

    /// Running maximum of `v` (AMSGrad).
    v_max: Array3<f32>,

    /// Step counter.
    t: u64,
}

impl Adam {
    pub fn new(config: AdamConfig, shape: (usize, usize, usize)) -> Self {
        Self {
            config,
            m: Array3::zeros(shape),
            v: Array3::zeros(shape),
            v_max: Array3::zeros(shape),
            t: 0,
        }
    }

    pub fn lr(&self) -> f32 {
        self.config.lr
    }

    /// The plateau scheduler adjusts the rate between epochs.
    pub fn set_lr(&mut self, lr: f32) {
        self.config.lr = lr;
    }

    pub fn steps(&self) -> u64 {
        self.t
    }

    /// Apply one update in place.
    pub fn step(&mut self, param: &mut Array3<f32>, grad: &Array3<f32>) {
        debug_assert_eq!(param.raw_dim(), grad.raw_dim());
        self.t += 1;
        let c = &self.config;
        let bc1 = 1.0 - c.beta1.powi(self.t as i32);
        let bc2 = 1.0 - c.beta2.powi(self.t as i32);

        for ((p, g), (m, (v, vm))) in param
            .iter_mut()
            .zip(grad.iter())
            .zip(
                self.m
                    .iter_mut()
                    .zip(self.v.iter_mut().zip(self.v_max.iter_mut())),
            )
        {
            *m = c.beta1 * *m + (1.0 - c.beta1) * g;
            *v = c.beta2 * *v + (1.0 - c.beta2) * g * g;
            let m_hat = *m / bc1;
            let v_hat = if c.amsgrad {
                *vm = vm.max(*v);
                *vm / bc2
            } else {
                *v / bc2
            };
            *p -= c.lr * m_hat / (v_hat.sqrt() + c.eps);
        }
    }
}
