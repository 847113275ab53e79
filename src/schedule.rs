use crate::config::{LrPolicy, TrainingConfig};

/// Learning rate after `completed` epochs of the current run.
pub fn learning_rate(config: &TrainingConfig, completed: usize) -> f64 {
    config.lr * lr_factor(config, completed)
}

fn lr_factor(config: &TrainingConfig, completed: usize) -> f64 {
    match config.lr_policy {
        LrPolicy::Linear => {
            let past_constant =
                (completed + config.epoch_count).saturating_sub(config.n_epochs) as f64;
            (1.0 - past_constant / (config.n_epochs_decay as f64 + 1.0)).max(0.0)
        }
        LrPolicy::Step => config.lr_gamma.powi((completed / config.lr_decay_iters) as i32),
    }
}
