//! Reduce-on-plateau learning-rate control.
//!
//! Watches the epoch-mean loss. When it has not improved on the best seen
//! value for more than `patience` consecutive epochs, the learning rate is
//! multiplied by `factor` (never below `min_lr`) and the bad-epoch counter
//! restarts. This is a tuning mechanism, not error recovery: the loop keeps
//! stepping throughout.

/// Scheduler hyperparameters.
#[derive(Clone, Copy, Debug)]
pub struct PlateauConfig {
    /// Multiplier applied on each reduction.
    pub factor: f32,

    /// Number of non-improving epochs tolerated before reducing.
    pub patience: usize,

    /// Relative improvement threshold: `metric < best * (1 - threshold)`
    /// counts as improvement.
    pub threshold: f32,

    /// Lower bound for the learning rate.
    pub min_lr: f32,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            factor: 0.1,
            patience: 50,
            threshold: 1e-4,
            min_lr: 0.0,
        }
    }
}

/// Plateau scheduler state.
pub struct ReduceLrOnPlateau {
    config: PlateauConfig,
    best: f32,
    bad_epochs: usize,
    reductions: u64,
}

impl ReduceLrOnPlateau {
    pub fn new(config: PlateauConfig) -> Self {
        Self {
            config,
            best: f32::INFINITY,
            bad_epochs: 0,
            reductions: 0,
        }
    }

    /// Feed one epoch metric; returns the (possibly reduced) learning rate.
    pub fn step(&mut self, metric: f32, lr: f32) -> f32 {
        if metric < self.best * (1.0 - self.config.threshold) {
            self.best = metric;
            self.bad_epochs = 0;
            return lr;
        }
        self.bad_epochs += 1;
        if self.bad_epochs > self.config.patience {
            self.bad_epochs = 0;
            self.reductions += 1;
            let reduced = (lr * self.config.factor).max(self.config.min_lr);
            return reduced;
        }
        lr
    }

    /// How many times the rate has been reduced.
    pub fn reductions(&self) -> u64 {
        self.reductions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_improving_sequence_never_reduces() {
        let mut sched = ReduceLrOnPlateau::new(PlateauConfig {
            patience: 2,
            ..Default::default()
        });
        let mut lr = 0.1;
        for i in 0..10 {
            lr = sched.step(1.0 / (i + 1) as f32, lr);
        }
        assert_eq!(lr, 0.1);
        assert_eq!(sched.reductions(), 0);
    }

    #[test]
    fn test_reduces_exactly_once_per_breached_window() {
        let cfg = PlateauConfig {
            factor: 0.5,
            patience: 3,
            threshold: 1e-4,
            min_lr: 0.0,
        };
        let mut sched = ReduceLrOnPlateau::new(cfg);
        let mut lr = 0.08;

        // Establish a best, then feed a strictly non-improving sequence.
        lr = sched.step(1.0, lr);
        assert_eq!(lr, 0.08);

        // Epochs 1..=3 are tolerated, epoch 4 breaches the window.
        for _ in 0..3 {
            lr = sched.step(1.0, lr);
            assert_eq!(lr, 0.08);
        }
        lr = sched.step(1.0, lr);
        assert!((lr - 0.04).abs() < 1e-7);
        assert_eq!(sched.reductions(), 1);

        // The counter restarts: the next window takes patience + 1 epochs.
        for _ in 0..3 {
            lr = sched.step(1.0, lr);
            assert!((lr - 0.04).abs() < 1e-7);
        }
        lr = sched.step(1.0, lr);
        assert!((lr - 0.02).abs() < 1e-7);
        assert_eq!(sched.reductions(), 2);
    }

    #[test]
    fn test_improvement_resets_counter() {
        let cfg = PlateauConfig {
            factor: 0.5,
            patience: 2,
            ..Default::default()
        };
        let mut sched = ReduceLrOnPlateau::new(cfg);
        let mut lr = 0.1;
        lr = sched.step(1.0, lr);
        lr = sched.step(1.0, lr);
        lr = sched.step(1.0, lr);
        // Improvement just before the window breaches.
        lr = sched.step(0.5, lr);
        lr = sched.step(0.5, lr);
        lr = sched.step(0.5, lr);
        assert_eq!(lr, 0.1);
        assert_eq!(sched.reductions(), 0);
    }

    #[test]
    fn test_min_lr_floor() {
        let cfg = PlateauConfig {
            factor: 0.1,
            patience: 0,
            threshold: 1e-4,
            min_lr: 0.01,
        };
        let mut sched = ReduceLrOnPlateau::new(cfg);
        let mut lr = 0.02;
        lr = sched.step(1.0, lr);
        for _ in 0..5 {
            lr = sched.step(1.0, lr);
        }
        assert!((lr - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_tiny_improvement_below_threshold_counts_as_bad() {
        let cfg = PlateauConfig {
            factor: 0.5,
            patience: 1,
            threshold: 1e-2,
            min_lr: 0.0,
        };
        let mut sched = ReduceLrOnPlateau::new(cfg);
        let mut lr = 0.1;
        lr = sched.step(1.0, lr);
        // 0.9999 improves by less than 1%, so it is a bad epoch.
        lr = sched.step(0.9999, lr);
        lr = sched.step(0.9999, lr);
        assert!((lr - 0.05).abs() < 1e-7);
    }
}
