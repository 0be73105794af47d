use std::fmt;

use serde::{Deserialize, Serialize};

/// Absence of a record means the instance is active and unmanaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    TerminatingWait,
    Terminated,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::TerminatingWait => "TERMINATING_WAIT",
            InstanceStatus::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminationReason {
    ScaleIn,
    Update,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::ScaleIn => "SCALE_IN",
            TerminationReason::Update => "UPDATE",
        }
    }
}

/// Termination lifecycle of one fleet member. `request_time` is written once
/// when termination is first requested; a TERMINATED record is final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsgInstance {
    pub instance_name: String,
    pub status: InstanceStatus,
    pub request_time: i64,
    pub termination_time: Option<i64>,
    pub termination_reason: TerminationReason,
    pub last_heartbeat_time: Option<i64>,
    /// Store-level expiry, epoch seconds.
    pub ttl: i64,
}

impl AsgInstance {
    pub fn terminating_wait(
        instance_name: impl Into<String>,
        reason: TerminationReason,
        now_ms: i64,
        ttl_days: u32,
    ) -> Self {
        Self {
            instance_name: instance_name.into(),
            status: InstanceStatus::TerminatingWait,
            request_time: now_ms,
            termination_time: None,
            termination_reason: reason,
            last_heartbeat_time: None,
            ttl: now_ms / 1_000 + i64::from(ttl_days) * 86_400,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.status == InstanceStatus::Terminated
    }
}
