//! DDIM noise scheduler.

use ndarray::Array4;

/// Training timesteps of Stable Diffusion 1.5.
const TRAIN_TIMESTEPS: usize = 1000;

/// First beta of the scaled-linear schedule.
const BETA_START: f64 = 0.000_85;

/// Last beta of the scaled-linear schedule.
const BETA_END: f64 = 0.012;

/// Offset added to every inference timestep.
const STEPS_OFFSET: usize = 1;

/// Deterministic DDIM scheduler (eta = 0) for epsilon-predicting models.
#[derive(Debug, Clone)]
pub struct DdimScheduler {
    alphas_cumprod: Vec<f64>,
    final_alpha_cumprod: f64,
    timesteps: Vec<usize>,
    step_ratio: usize,
}

impl DdimScheduler {
    /// Create a scheduler running `num_steps` inference steps.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(num_steps: u32) -> Self {
        let num_steps = (num_steps as usize).clamp(1, TRAIN_TIMESTEPS);

        let (start, end) = (BETA_START.sqrt(), BETA_END.sqrt());
        let last = (TRAIN_TIMESTEPS - 1) as f64;

        let mut alphas_cumprod = Vec::with_capacity(TRAIN_TIMESTEPS);
        let mut running = 1.0;
        for i in 0..TRAIN_TIMESTEPS {
            let beta = (end - start).mul_add(i as f64 / last, start).powi(2);
            running *= 1.0 - beta;
            alphas_cumprod.push(running);
        }

        let step_ratio = TRAIN_TIMESTEPS / num_steps;
        let timesteps = (0..num_steps)
            .rev()
            .map(|i| (i * step_ratio + STEPS_OFFSET).min(TRAIN_TIMESTEPS - 1))
            .collect();

        Self {
            final_alpha_cumprod: alphas_cumprod[0],
            alphas_cumprod,
            timesteps,
            step_ratio,
        }
    }

    /// Inference timesteps, from noisiest to cleanest.
    #[must_use]
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    /// Standard deviation of the initial latent noise.
    #[must_use]
    pub const fn init_noise_sigma(&self) -> f32 {
        1.0
    }

    /// Move `sample` from `timestep` to the previous timestep given the
    /// predicted noise.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn step(&self, noise_pred: &Array4<f32>, timestep: usize, sample: &Array4<f32>) -> Array4<f32> {
        let alpha_prod_t = self.alphas_cumprod[timestep.min(TRAIN_TIMESTEPS - 1)];
        let alpha_prod_prev = timestep
            .checked_sub(self.step_ratio)
            .map_or(self.final_alpha_cumprod, |prev| self.alphas_cumprod[prev]);

        let sqrt_alpha_t = alpha_prod_t.sqrt() as f32;
        let sqrt_beta_t = (1.0 - alpha_prod_t).sqrt() as f32;
        let sqrt_alpha_prev = alpha_prod_prev.sqrt() as f32;
        let sqrt_beta_prev = (1.0 - alpha_prod_prev).sqrt() as f32;

        let pred_original = (sample - &(noise_pred * sqrt_beta_t)) / sqrt_alpha_t;
        pred_original * sqrt_alpha_prev + noise_pred * sqrt_beta_prev
    }

    /// Cumulative alpha product at `timestep`.
    #[must_use]
    pub fn alpha_cumprod(&self, timestep: usize) -> f64 {
        self.alphas_cumprod[timestep.min(TRAIN_TIMESTEPS - 1)]
    }
}
