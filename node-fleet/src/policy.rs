//! Restart and rollout policies
//!
//! [`RestartPolicy`] decides how long a supervisor waits before relaunching a
//! crashed node, and whether it relaunches at all:
//! - [`AlwaysWithFixedBackoff`] relaunches forever after a constant delay (default)
//! - [`CappedRetries`] gives up after a number of consecutive attempts
//! - [`ExponentialBackoff`] grows the delay up to a cap
//!
//! [`RolloutFailurePolicy`] decides what a fleet rollout does when one node
//! fails to come back on the new version.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay before the relaunch numbered `attempt` (0-indexed, consecutive
/// failures), or `None` to stop relaunching.
pub trait RestartPolicy: Send + Sync + Debug {
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Relaunch indefinitely with a constant delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlwaysWithFixedBackoff {
    pub delay: Duration,
}

impl Default for AlwaysWithFixedBackoff {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(2),
        }
    }
}

impl RestartPolicy for AlwaysWithFixedBackoff {
    fn next_delay(&self, _attempt: u32) -> Option<Duration> {
        Some(self.delay)
    }
}

/// Relaunch with a constant delay, at most `max_attempts` times in a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CappedRetries {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl RestartPolicy for CappedRetries {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_attempts).then_some(self.delay)
    }
}

/// Relaunch indefinitely; delay is `first × factor^attempt` clamped to `max`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl RestartPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            return Some(self.max);
        }
        Some(Duration::from_secs_f64(secs))
    }
}

/// `restartPolicy` section of the fleet configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RestartPolicyConfig {
    #[serde(rename_all = "camelCase")]
    Always { delay_secs: f64 },
    #[serde(rename_all = "camelCase")]
    Capped { delay_secs: f64, max_attempts: u32 },
    #[serde(rename_all = "camelCase")]
    Exponential {
        first_secs: f64,
        max_secs: f64,
        factor: f64,
    },
}

impl Default for RestartPolicyConfig {
    fn default() -> Self {
        RestartPolicyConfig::Always { delay_secs: 2.0 }
    }
}

impl RestartPolicyConfig {
    pub fn build(&self) -> Arc<dyn RestartPolicy> {
        match *self {
            RestartPolicyConfig::Always { delay_secs } => Arc::new(AlwaysWithFixedBackoff {
                delay: secs(delay_secs),
            }),
            RestartPolicyConfig::Capped {
                delay_secs,
                max_attempts,
            } => Arc::new(CappedRetries {
                delay: secs(delay_secs),
                max_attempts,
            }),
            RestartPolicyConfig::Exponential {
                first_secs,
                max_secs,
                factor,
            } => Arc::new(ExponentialBackoff {
                first: secs(first_secs),
                max: secs(max_secs),
                factor,
            }),
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// What a rollout does when a node fails to restart on the new version.
///
/// The new version is persisted only when every node restarted, whatever
/// the policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RolloutFailurePolicy {
    /// Stop the sequence at the failed node; later nodes keep the old version
    #[default]
    Abort,
    /// Log, skip the failed node and carry on with the rest
    Continue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff_never_gives_up() {
        let policy = AlwaysWithFixedBackoff::default();
        assert_eq!(policy.next_delay(0), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_delay(10_000), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_capped_retries() {
        let policy = CappedRetries {
            delay: Duration::from_millis(500),
            max_attempts: 2,
        };
        assert_eq!(policy.next_delay(0), Some(Duration::from_millis(500)));
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(500)));
        assert_eq!(policy.next_delay(2), None);
    }

    #[test]
    fn test_exponential_backoff_is_clamped() {
        let policy = ExponentialBackoff {
            first: Duration::from_millis(100),
            max: Duration::from_secs(10),
            factor: 2.0,
        };
        assert_eq!(policy.next_delay(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(10), Some(Duration::from_secs(10)));
        assert_eq!(policy.next_delay(u32::MAX), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_policy_config_yaml() {
        let config: RestartPolicyConfig =
            serde_yaml::from_str("kind: capped\ndelaySecs: 1.5\nmaxAttempts: 4").unwrap();
        assert_eq!(
            config,
            RestartPolicyConfig::Capped {
                delay_secs: 1.5,
                max_attempts: 4
            }
        );
        assert_eq!(config.build().next_delay(4), None);

        let default = RestartPolicyConfig::default().build();
        assert_eq!(default.next_delay(3), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_rollout_policy_yaml() {
        let policy: RolloutFailurePolicy = serde_yaml::from_str("continue").unwrap();
        assert_eq!(policy, RolloutFailurePolicy::Continue);
        assert_eq!(RolloutFailurePolicy::default(), RolloutFailurePolicy::Abort);
    }
}
