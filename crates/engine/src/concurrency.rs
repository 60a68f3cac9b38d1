//! Worker-count derivation.
//!
//! `threads = 0` in the configuration means "one worker per logical CPU".

use crate::config::Config;

/// How many actions may run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyPlan {
    /// Logical CPU cores detected on this machine
    pub total_cores: u32,
    /// Number of concurrent workers in the pool
    pub workers: usize,
}

impl ConcurrencyPlan {
    /// Derive the plan from configuration, detecting cores via num_cpus.
    pub fn derive(cfg: &Config) -> Self {
        Self::with_cores(cfg.workers.threads, num_cpus::get() as u32)
    }

    /// Derive the plan for a machine with `total_cores` cores.
    pub fn with_cores(threads: u32, total_cores: u32) -> Self {
        let total_cores = total_cores.max(1);
        let workers = if threads > 0 { threads } else { total_cores };
        Self {
            total_cores,
            workers: workers as usize,
        }
    }
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}
