// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Restart policy: what happens to an activation after its container ends.

use chrono::{DateTime, Utc};

use crate::activation::{Activation, ActivationStatus, DesiredState, RestartPolicy};
use crate::config::Config;

/// How a run ended, from the policy's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Exit code 0.
    Clean,
    /// Non-zero exit, lost container, or a rejected spec.
    Failed,
    /// Infrastructure failure before the container ran; not the
    /// activation's fault.
    Infrastructure,
}

/// Global restart settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartSettings {
    /// Backoff after a clean exit, in seconds.
    pub seconds_on_complete: u64,
    /// Backoff after a failure, in seconds.
    pub seconds_on_failure: u64,
    /// Failure cap; `None` is unlimited.
    pub max_restarts: Option<u32>,
}

impl From<&Config> for RestartSettings {
    fn from(config: &Config) -> Self {
        Self {
            seconds_on_complete: config.restart_seconds_on_complete,
            seconds_on_failure: config.restart_seconds_on_failure,
            max_restarts: config.max_restarts_on_failure,
        }
    }
}

/// Lifecycle outcome of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Status to transition to.
    pub status: ActivationStatus,
    /// New consecutive failure count.
    pub restart_count: u32,
    /// When the scheduler may restart; `None` means no automatic restart.
    pub restart_after: Option<DateTime<Utc>>,
}

impl Decision {
    /// Whether the activation gave up.
    pub fn is_errored(&self) -> bool {
        self.status == ActivationStatus::Errored
    }
}

/// Apply the restart policy to a finished run.
pub fn decide(
    activation: &Activation,
    outcome: RunOutcome,
    settings: RestartSettings,
    now: DateTime<Utc>,
) -> Decision {
    let enabled = activation.desired_state == DesiredState::Enabled;
    match outcome {
        RunOutcome::Clean => {
            let restart = enabled && activation.restart_policy == RestartPolicy::Always;
            let delay = activation
                .restart_seconds_on_complete
                .unwrap_or(settings.seconds_on_complete);
            Decision {
                status: ActivationStatus::Completed,
                restart_count: 0,
                restart_after: restart.then(|| after(now, delay)),
            }
        }
        RunOutcome::Failed | RunOutcome::Infrastructure => {
            let restart_count = if outcome == RunOutcome::Failed {
                activation.restart_count.saturating_add(1)
            } else {
                activation.restart_count
            };
            let over_cap = settings.max_restarts.is_some_and(|max| restart_count > max);
            if over_cap {
                return Decision {
                    status: ActivationStatus::Errored,
                    restart_count,
                    restart_after: None,
                };
            }

            // Infrastructure failures are retried regardless of policy: the
            // activation never got to run.
            let restart = enabled
                && (outcome == RunOutcome::Infrastructure
                    || activation.restart_policy != RestartPolicy::Never);
            let delay = activation
                .restart_seconds_on_failure
                .unwrap_or(settings.seconds_on_failure);
            Decision {
                status: ActivationStatus::Failed,
                restart_count,
                restart_after: restart.then(|| after(now, delay)),
            }
        }
    }
}

/// Ten years; longer backoffs are clamped.
const MAX_BACKOFF_SECS: i64 = 315_360_000;

fn after(now: DateTime<Utc>, seconds: u64) -> DateTime<Utc> {
    let seconds = i64::try_from(seconds).unwrap_or(i64::MAX).min(MAX_BACKOFF_SECS);
    now + chrono::Duration::seconds(seconds)
}
