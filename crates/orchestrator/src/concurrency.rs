//! Concurrency planning
//!
//! Splits the machine's logical cores between the parallel encode slots.

use crate::config::Config;

/// How the machine is divided between encodes
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Number of encodes running at once
    pub parallel_jobs: u32,
    /// ffmpeg `-threads` value handed to every encode
    pub threads_per_job: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the configured thread count when non-zero, otherwise divides
    /// the detected cores evenly between the parallel jobs.
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    /// Same as [`derive`](Self::derive) with an explicit core count
    pub fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let total_cores = total_cores.max(1);
        let parallel_jobs = cfg.encode.max_parallel_jobs.max(1);

        let threads_per_job = if cfg.encode.ffmpeg_threads > 0 {
            cfg.encode.ffmpeg_threads
        } else {
            (total_cores / parallel_jobs).max(1)
        };

        Self {
            total_cores,
            parallel_jobs,
            threads_per_job,
        }
    }
}

/// Derive a concurrency plan from configuration (convenience function)
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_explicit_threads_win() {
        let mut cfg = Config::default();
        cfg.encode.ffmpeg_threads = 6;
        cfg.encode.max_parallel_jobs = 2;
        let plan = ConcurrencyPlan::derive_with_cores(&cfg, 32);
        assert_eq!(plan.threads_per_job, 6);
        assert_eq!(plan.parallel_jobs, 2);
    }

    #[test]
    fn test_auto_threads_split_cores() {
        let mut cfg = Config::default();
        cfg.encode.ffmpeg_threads = 0;
        cfg.encode.max_parallel_jobs = 4;
        assert_eq!(ConcurrencyPlan::derive_with_cores(&cfg, 16).threads_per_job, 4);
        assert_eq!(ConcurrencyPlan::derive_with_cores(&cfg, 2).threads_per_job, 1);
    }

    #[test]
    fn test_derive_detects_cores() {
        let plan = derive_plan(&Config::default());
        assert!(plan.total_cores >= 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_auto_threads_never_oversubscribe(cores in 1u32..256, jobs in 1u32..=4) {
            let mut cfg = Config::default();
            cfg.encode.ffmpeg_threads = 0;
            cfg.encode.max_parallel_jobs = jobs;
            let plan = ConcurrencyPlan::derive_with_cores(&cfg, cores);

            prop_assert!(plan.threads_per_job >= 1);
            if cores >= jobs {
                prop_assert!(plan.threads_per_job * jobs <= cores);
            }
        }
    }
}
