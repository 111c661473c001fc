//! Controller configuration
//!
//! Every knob is a CLI flag with a `KM_*` environment fallback; the parsed
//! [`ControllerArgs`] convert into the [`ControllerConfig`] the reconciler uses.

use std::time::Duration;

use clap::Args;

use crate::crd::KernelManagerPhase;
use crate::retry::RetryConfig;

/// Requeue interval per phase
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequeueIntervals {
    /// Waiting for the pod to come up
    pub pending: Duration,
    /// Periodic resync of a healthy kernel
    pub running: Duration,
    /// Recheck of a failed resource
    pub failed: Duration,
    /// Polling while the pod is torn down
    pub terminating: Duration,
}

impl Default for RequeueIntervals {
    fn default() -> Self {
        Self {
            pending: Duration::from_secs(10),
            running: Duration::from_secs(300),
            failed: Duration::from_secs(3600),
            terminating: Duration::from_secs(5),
        }
    }
}

impl RequeueIntervals {
    /// Interval for a resource in `phase`
    pub fn for_phase(&self, phase: KernelManagerPhase) -> Duration {
        match phase {
            KernelManagerPhase::Pending => self.pending,
            KernelManagerPhase::Running => self.running,
            KernelManagerPhase::Failed => self.failed,
            KernelManagerPhase::Terminating => self.terminating,
        }
    }
}

/// Runtime configuration of the reconciler
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Namespace to watch, all namespaces when `None`
    pub namespace: Option<String>,
    /// Maximum concurrent reconciles
    pub concurrency: u16,
    /// Requeue interval per phase
    pub requeue: RequeueIntervals,
    /// Backoff curve for transient errors
    pub retry: RetryConfig,
    /// Consecutive transient failures before a resource is marked Failed (0 = unlimited)
    pub retry_budget: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            concurrency: 4,
            requeue: RequeueIntervals::default(),
            retry: RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(300),
                backoff_multiplier: 2.0,
            },
            retry_budget: 10,
        }
    }
}

/// Controller flags
#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Only watch KernelManagers in this namespace
    #[arg(long, env = "KM_NAMESPACE")]
    pub namespace: Option<String>,

    /// Maximum number of concurrent reconciles
    #[arg(long, env = "KM_CONCURRENCY", default_value_t = 4)]
    pub concurrency: u16,

    /// Requeue interval while a kernel is starting, in seconds
    #[arg(long, env = "KM_REQUEUE_PENDING_SECS", default_value_t = 10)]
    pub requeue_pending_secs: u64,

    /// Resync interval for a running kernel, in seconds
    #[arg(long, env = "KM_REQUEUE_RUNNING_SECS", default_value_t = 300)]
    pub requeue_running_secs: u64,

    /// Recheck interval for a failed kernel, in seconds
    #[arg(long, env = "KM_REQUEUE_FAILED_SECS", default_value_t = 3600)]
    pub requeue_failed_secs: u64,

    /// Polling interval during teardown, in seconds
    #[arg(long, env = "KM_REQUEUE_TERMINATING_SECS", default_value_t = 5)]
    pub requeue_terminating_secs: u64,

    /// First backoff delay after a transient error, in milliseconds
    #[arg(long, env = "KM_BACKOFF_INITIAL_MS", default_value_t = 500)]
    pub backoff_initial_ms: u64,

    /// Backoff cap, in seconds
    #[arg(long, env = "KM_BACKOFF_MAX_SECS", default_value_t = 300)]
    pub backoff_max_secs: u64,

    /// Consecutive transient failures before marking a KernelManager Failed (0 = never)
    #[arg(long, env = "KM_RETRY_BUDGET", default_value_t = 10)]
    pub retry_budget: u32,
}

impl From<ControllerArgs> for ControllerConfig {
    fn from(args: ControllerArgs) -> Self {
        Self {
            namespace: args.namespace.filter(|ns| !ns.is_empty()),
            concurrency: args.concurrency.max(1),
            requeue: RequeueIntervals {
                pending: Duration::from_secs(args.requeue_pending_secs),
                running: Duration::from_secs(args.requeue_running_secs),
                failed: Duration::from_secs(args.requeue_failed_secs),
                terminating: Duration::from_secs(args.requeue_terminating_secs),
            },
            retry: RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_millis(args.backoff_initial_ms),
                max_delay: Duration::from_secs(args.backoff_max_secs),
                backoff_multiplier: 2.0,
            },
            retry_budget: args.retry_budget,
        }
    }
}
