//! Codebook parameter updates
//!
//! Hand-rolled first-order optimizers over the per-level codebook buffers,
//! plus the two warmup learning-rate schedules the trainer selects between.
//! State is flat across levels so it can be carried inside a checkpoint and
//! resumed exactly.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

const ADAM_BETA1: f32 = 0.9;
const ADAM_BETA2: f32 = 0.999;
const ADAM_EPS: f32 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    AdamW,
    Sgd,
}

impl FromStr for OptimizerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "adam" => Ok(Self::Adam),
            "adamw" => Ok(Self::AdamW),
            "sgd" => Ok(Self::Sgd),
            other => Err(format!("Unknown optimizer: {other}")),
        }
    }
}

/// Serializable optimizer state carried inside checkpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizerState {
    pub kind: OptimizerKind,
    pub step: u64,
    pub exp_avg: Vec<f32>,
    pub exp_avg_sq: Vec<f32>,
}

/// First-order optimizer over the flattened codebook parameter space.
///
/// Levels update through [`Optimizer::update`] with their offset into the
/// flat moment buffers; [`Optimizer::begin_step`] advances the shared step
/// counter once per batch.
pub struct Optimizer {
    pub kind: OptimizerKind,
    pub weight_decay: f32,
    step: u64,
    exp_avg: Vec<f32>,
    exp_avg_sq: Vec<f32>,
}

impl Optimizer {
    pub fn new(kind: OptimizerKind, param_len: usize, weight_decay: f32) -> Self {
        let moments = match kind {
            OptimizerKind::Adam | OptimizerKind::AdamW => param_len,
            OptimizerKind::Sgd => 0,
        };
        Self {
            kind,
            weight_decay,
            step: 0,
            exp_avg: vec![0.0; moments],
            exp_avg_sq: vec![0.0; moments],
        }
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Advance the step counter; call once per batch before `update`.
    pub fn begin_step(&mut self) {
        self.step += 1;
    }

    /// Apply one update to a parameter slice whose moments live at `offset`
    /// in the flat state buffers.
    pub fn update(&mut self, offset: usize, params: &mut [f32], grads: &[f32], lr: f32) {
        debug_assert_eq!(params.len(), grads.len());

        match self.kind {
            OptimizerKind::Sgd => {
                for (p, &g) in params.iter_mut().zip(grads) {
                    *p -= lr * (g + self.weight_decay * *p);
                }
            }
            OptimizerKind::Adam | OptimizerKind::AdamW => {
                debug_assert!(self.step > 0, "begin_step() must precede update()");
                let bias1 = 1.0 - ADAM_BETA1.powi(self.step as i32);
                let bias2 = 1.0 - ADAM_BETA2.powi(self.step as i32);
                let decoupled = self.kind == OptimizerKind::AdamW;

                for (i, (p, &g)) in params.iter_mut().zip(grads).enumerate() {
                    let g = if decoupled {
                        g
                    } else {
                        g + self.weight_decay * *p
                    };

                    let m = &mut self.exp_avg[offset + i];
                    let v = &mut self.exp_avg_sq[offset + i];
                    *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
                    *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;

                    let m_hat = *m / bias1;
                    let v_hat = *v / bias2;

                    if decoupled {
                        *p -= lr * self.weight_decay * *p;
                    }
                    *p -= lr * m_hat / (v_hat.sqrt() + ADAM_EPS);
                }
            }
        }
    }

    /// Snapshot the state for checkpointing
    pub fn state(&self) -> OptimizerState {
        OptimizerState {
            kind: self.kind,
            step: self.step,
            exp_avg: self.exp_avg.clone(),
            exp_avg_sq: self.exp_avg_sq.clone(),
        }
    }

    /// Restore from a checkpointed state
    pub fn from_state(state: OptimizerState, weight_decay: f32) -> Self {
        Self {
            kind: state.kind,
            weight_decay,
            step: state.step,
            exp_avg: state.exp_avg,
            exp_avg_sq: state.exp_avg_sq,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    Linear,
    Constant,
}

impl FromStr for ScheduleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "constant" => Ok(Self::Constant),
            other => Err(format!("Unknown schedule: {other}")),
        }
    }
}

/// Warmup learning-rate schedule, stepped once per batch.
///
/// `Linear` ramps from zero over the warmup window then decays linearly to
/// zero at `total_steps`; `Constant` ramps and then holds the base rate.
#[derive(Debug, Clone, Copy)]
pub struct LrSchedule {
    pub kind: ScheduleKind,
    pub warmup_steps: u64,
    pub total_steps: u64,
}

impl LrSchedule {
    pub fn new(kind: ScheduleKind, warmup_steps: u64, total_steps: u64) -> Self {
        Self {
            kind,
            warmup_steps,
            total_steps,
        }
    }

    /// Learning rate for optimizer step `step` (0-based)
    pub fn lr_at(&self, base_lr: f32, step: u64) -> f32 {
        if self.warmup_steps > 0 && step < self.warmup_steps {
            return base_lr * step as f32 / self.warmup_steps as f32;
        }
        match self.kind {
            ScheduleKind::Constant => base_lr,
            ScheduleKind::Linear => {
                if self.total_steps <= self.warmup_steps {
                    return base_lr;
                }
                let remaining = self.total_steps.saturating_sub(step) as f32;
                let span = (self.total_steps - self.warmup_steps) as f32;
                base_lr * (remaining / span).clamp(0.0, 1.0)
            }
        }
    }
}
