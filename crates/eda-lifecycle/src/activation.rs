// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activation records and the lifecycle state machine.
//!
//! ```text
//!              start               exit 0
//!  ┌─────────┐ ──────► ┌─────────┐ ──────► ┌───────────┐
//!  │ STOPPED │         │ RUNNING │         │ COMPLETED │
//!  └─────────┘ ◄────── └─────────┘         └─────┬─────┘
//!       ▲        stop       │ exit != 0          │ backoff elapsed
//!       │                   ▼                    │ (still enabled)
//!       │              ┌────────┐                ▼
//!       ├───────────── │ FAILED │ ──────────► RUNNING
//!       │     stop     └───┬────┘   backoff
//!       │                  │ restart_count > max
//!       │                  ▼
//!       │             ┌─────────┐
//!       └──────────── │ ERRORED │  (terminal for auto-restart)
//!         restart     └─────────┘
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lifecycle status of an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationStatus {
    /// No container; initial state and the result of an explicit stop.
    Stopped,
    /// A container is running for the activation.
    Running,
    /// The last container exited cleanly.
    Completed,
    /// The last container failed or could not be started.
    Failed,
    /// Gave up after exceeding the restart cap; no further auto-restart.
    Errored,
}

impl ActivationStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationStatus::Stopped => "stopped",
            ActivationStatus::Running => "running",
            ActivationStatus::Completed => "completed",
            ActivationStatus::Failed => "failed",
            ActivationStatus::Errored => "errored",
        }
    }

    /// Whether `self -> next` is a legal lifecycle transition.
    pub fn can_transition_to(&self, next: ActivationStatus) -> bool {
        use ActivationStatus::*;
        matches!(
            (self, next),
            (Stopped, Running | Failed | Stopped)
                | (Running, Completed | Failed | Stopped)
                | (Completed, Running | Failed | Stopped)
                | (Failed, Running | Failed | Errored | Stopped)
                | (Errored, Stopped)
        )
    }

    /// Apply a transition, rejecting anything outside the state machine.
    pub fn transition(self, activation_id: i64, next: ActivationStatus) -> Result<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                activation_id,
                from: self,
                to: next,
            })
        }
    }

    /// Statuses from which the scheduler may admit a new run.
    pub fn is_admissible(&self) -> bool {
        matches!(
            self,
            ActivationStatus::Stopped | ActivationStatus::Completed | ActivationStatus::Failed
        )
    }
}

impl fmt::Display for ActivationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stopped" => Ok(ActivationStatus::Stopped),
            "running" => Ok(ActivationStatus::Running),
            "completed" => Ok(ActivationStatus::Completed),
            "failed" => Ok(ActivationStatus::Failed),
            "errored" => Ok(ActivationStatus::Errored),
            other => Err(Error::Other(format!("unknown activation status '{other}'"))),
        }
    }
}

/// What the user wants: the scheduler's input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    /// Keep the activation running.
    Enabled,
    /// Keep the activation stopped.
    Disabled,
}

impl DesiredState {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Enabled => "enabled",
            DesiredState::Disabled => "disabled",
        }
    }
}

impl FromStr for DesiredState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "enabled" => Ok(DesiredState::Enabled),
            "disabled" => Ok(DesiredState::Disabled),
            other => Err(Error::Other(format!("unknown desired state '{other}'"))),
        }
    }
}

/// When an activation is restarted automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Restart after clean completion and after failure.
    #[default]
    Always,
    /// Restart only after failure.
    OnFailure,
    /// Never restart automatically.
    Never,
}

impl RestartPolicy {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::Never => "never",
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "always" => Ok(RestartPolicy::Always),
            "on-failure" => Ok(RestartPolicy::OnFailure),
            "never" => Ok(RestartPolicy::Never),
            other => Err(Error::Other(format!("unknown restart policy '{other}'"))),
        }
    }
}

/// A configured long-running rule-evaluation process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activation {
    /// Identifier; ascending order breaks admission ties.
    pub id: i64,
    /// Human-readable name.
    pub name: String,
    /// Desired state set by the user.
    pub desired_state: DesiredState,
    /// Container image reference.
    pub image: String,
    /// Container command (empty = image default).
    pub command: Vec<String>,
    /// Extra container environment.
    pub env: BTreeMap<String, String>,
    /// Restart policy mode.
    pub restart_policy: RestartPolicy,
    /// Override of the global backoff after a clean exit.
    pub restart_seconds_on_complete: Option<u64>,
    /// Override of the global backoff after a failure.
    pub restart_seconds_on_failure: Option<u64>,
    /// Current lifecycle status.
    pub status: ActivationStatus,
    /// Consecutive failures counted against the restart cap.
    pub restart_count: u32,
    /// When the current or last container started.
    pub last_start_at: Option<DateTime<Utc>>,
    /// When the last container exited.
    pub last_exit_at: Option<DateTime<Utc>>,
    /// Last known failure reason.
    pub failure_reason: Option<String>,
    /// Backoff timer: earliest time the scheduler may restart it.
    pub restart_after: Option<DateTime<Utc>>,
    /// Whether this activation occupies a runtime slot.
    pub slot_held: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Activation {
    /// Whether the scheduler may admit this activation at `now`.
    ///
    /// A stopped activation starts as soon as it is enabled. A finished run
    /// only restarts through its restart timer; no timer means the policy
    /// declined the restart.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.desired_state != DesiredState::Enabled
            || !self.status.is_admissible()
            || self.slot_held
        {
            return false;
        }
        match self.status {
            ActivationStatus::Stopped => self.restart_after.is_none_or(|at| at <= now),
            _ => self.restart_after.is_some_and(|at| at <= now),
        }
    }

    /// Lifecycle fields, for a compare-and-set update.
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle {
            status: self.status,
            restart_count: self.restart_count,
            last_start_at: self.last_start_at,
            last_exit_at: self.last_exit_at,
            failure_reason: self.failure_reason.clone(),
            restart_after: self.restart_after,
        }
    }
}

/// The worker-owned part of an activation record.
#[derive(Debug, Clone, PartialEq)]
pub struct Lifecycle {
    /// New status.
    pub status: ActivationStatus,
    /// Consecutive failure count.
    pub restart_count: u32,
    /// Last start time.
    pub last_start_at: Option<DateTime<Utc>>,
    /// Last exit time.
    pub last_exit_at: Option<DateTime<Utc>>,
    /// Failure reason.
    pub failure_reason: Option<String>,
    /// Backoff timer.
    pub restart_after: Option<DateTime<Utc>>,
}

/// Input for creating an activation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewActivation {
    /// Human-readable name.
    pub name: String,
    /// Container image reference.
    pub image: String,
    /// Container command.
    #[serde(default)]
    pub command: Vec<String>,
    /// Extra container environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Restart policy mode.
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// Backoff override after a clean exit.
    #[serde(default)]
    pub restart_seconds_on_complete: Option<u64>,
    /// Backoff override after a failure.
    #[serde(default)]
    pub restart_seconds_on_failure: Option<u64>,
    /// Whether the activation starts enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl NewActivation {
    /// Enabled activation with the default restart policy.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: Vec::new(),
            env: BTreeMap::new(),
            restart_policy: RestartPolicy::default(),
            restart_seconds_on_complete: None,
            restart_seconds_on_failure: None,
            enabled: true,
        }
    }

    /// Desired state derived from `enabled`.
    pub fn desired_state(&self) -> DesiredState {
        if self.enabled {
            DesiredState::Enabled
        } else {
            DesiredState::Disabled
        }
    }
}

/// Why an instance ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The container exited on its own.
    Exited,
    /// Stopped by request.
    Stopped,
    /// The container never started.
    StartFailed,
    /// The container disappeared from the runtime.
    Lost,
}

impl EndReason {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Exited => "exited",
            EndReason::Stopped => "stopped",
            EndReason::StartFailed => "start_failed",
            EndReason::Lost => "lost",
        }
    }
}

impl FromStr for EndReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "exited" => Ok(EndReason::Exited),
            "stopped" => Ok(EndReason::Stopped),
            "start_failed" => Ok(EndReason::StartFailed),
            "lost" => Ok(EndReason::Lost),
            other => Err(Error::Other(format!("unknown end reason '{other}'"))),
        }
    }
}

/// One concrete container run of an activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationInstance {
    /// Identifier.
    pub id: i64,
    /// Owning activation.
    pub activation_id: i64,
    /// nth run of the activation, starting at 1.
    pub ordinal: i32,
    /// Runtime-assigned container identifier.
    pub container_id: Option<String>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run ended; `None` while open.
    pub ended_at: Option<DateTime<Utc>>,
    /// Container exit code.
    pub exit_code: Option<i64>,
    /// Why the run ended.
    pub end_reason: Option<EndReason>,
    /// Failure detail.
    pub failure_reason: Option<String>,
}

impl ActivationInstance {
    /// Whether the instance is still open.
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Values written when closing an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceClose {
    /// End time.
    pub ended_at: DateTime<Utc>,
    /// Exit code, when the container reported one.
    pub exit_code: Option<i64>,
    /// Why the run ended.
    pub end_reason: EndReason,
    /// Failure detail.
    pub failure_reason: Option<String>,
}
