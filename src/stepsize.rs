//! Dual-averaging step size adaptation for the warmup phase.

#[derive(Debug, Clone, Copy)]
pub struct DualAverageSettings {
    /// Target mean acceptance statistic.
    pub target_accept: f64,
    pub k: f64,
    pub t0: f64,
    pub gamma: f64,
    pub initial_step: f64,
}

impl Default for DualAverageSettings {
    fn default() -> DualAverageSettings {
        DualAverageSettings {
            target_accept: 0.8,
            k: 0.75,
            t0: 10.,
            gamma: 0.05,
            initial_step: 0.1,
        }
    }
}

/// Nesterov dual averaging of the log step size.
///
/// `current` is the exploring step size used while adaptation runs;
/// `adapted` is the averaged estimate a chain switches to once warmup ends.
#[derive(Debug)]
pub struct DualAverage {
    log_step: f64,
    log_step_adapted: f64,
    hbar: f64,
    mu: f64,
    count: u64,
    settings: DualAverageSettings,
}

impl DualAverage {
    pub fn new(settings: DualAverageSettings, initial_step: f64) -> DualAverage {
        DualAverage {
            log_step: initial_step.ln(),
            log_step_adapted: initial_step.ln(),
            hbar: 0.,
            mu: (10. * initial_step).ln(),
            count: 1,
            settings,
        }
    }

    pub fn advance(&mut self, accept_stat: f64) {
        let w = 1. / (self.count as f64 + self.settings.t0);
        self.hbar = (1. - w) * self.hbar + w * (self.settings.target_accept - accept_stat);
        self.log_step = self.mu - self.hbar * (self.count as f64).sqrt() / self.settings.gamma;
        let mk = (self.count as f64).powf(-self.settings.k);
        self.log_step_adapted = mk * self.log_step + (1. - mk) * self.log_step_adapted;
        self.count += 1;
    }

    /// Restart averaging around a new step size, used after the mass
    /// matrix changes and the old optimum no longer applies.
    pub fn restart(&mut self, initial_step: f64) {
        *self = DualAverage::new(self.settings, initial_step);
    }

    pub fn current(&self) -> f64 {
        self.log_step.exp()
    }

    pub fn adapted(&self) -> f64 {
        self.log_step_adapted.exp()
    }
}
