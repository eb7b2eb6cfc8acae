use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AdminError;

/// Configuration stored in ~/.impactos/federation.json
///
/// Node-level settings only. The runtime federation policy (shared divisions,
/// privacy parameters, drift cap) lives in the database and is mutated through
/// the admin surface, not this file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Name this node declares to peers. Peers must register us under the
    /// same name for inbound bundles to resolve.
    #[serde(default = "default_node_name")]
    pub node_name: String,
    /// Bind address for the inbound federation endpoint.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Base URL peers should use to reach this node. Informational; shown by
    /// the admin surface so operators can hand it to peer administrators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_url: Option<String>,
    /// Override for the data directory (database, node key, job history).
    /// Defaults to ~/.impactos when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub schedules: Schedules,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            listen_addr: default_listen_addr(),
            advertise_url: None,
            data_dir: None,
            schedules: Schedules::default(),
        }
    }
}

fn default_node_name() -> String {
    "impactos-node".to_string()
}

fn default_listen_addr() -> String {
    "127.0.0.1:8410".to_string()
}

/// Per-job cron schedules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedules {
    #[serde(default = "ScheduleEntry::default_build")]
    pub build: ScheduleEntry,
    #[serde(default = "ScheduleEntry::default_deliver")]
    pub deliver: ScheduleEntry,
    #[serde(default = "ScheduleEntry::default_merge")]
    pub merge: ScheduleEntry,
}

impl Default for Schedules {
    fn default() -> Self {
        Self {
            build: ScheduleEntry::default_build(),
            deliver: ScheduleEntry::default_deliver(),
            merge: ScheduleEntry::default_merge(),
        }
    }
}

impl Schedules {
    /// Iterate (job, entry) pairs in a fixed order.
    pub fn entries(&self) -> [(JobId, &ScheduleEntry); 3] {
        [
            (JobId::BuildBundles, &self.build),
            (JobId::DeliverQueued, &self.deliver),
            (JobId::MergeSignals, &self.merge),
        ]
    }
}

/// A single schedule entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    pub enabled: bool,
    pub cron: String,
    pub timezone: String,
}

impl ScheduleEntry {
    /// Default schedule for bundle building: 02:15 UTC daily, after the
    /// previous day's window has fully closed.
    pub fn default_build() -> Self {
        Self {
            enabled: true,
            cron: "15 2 * * *".to_string(),
            timezone: "UTC".to_string(),
        }
    }

    /// Default schedule for the delivery worker: every 15 minutes.
    pub fn default_deliver() -> Self {
        Self {
            enabled: true,
            cron: "*/15 * * * *".to_string(),
            timezone: "UTC".to_string(),
        }
    }

    /// Default schedule for the merge engine: 03:00 UTC daily.
    pub fn default_merge() -> Self {
        Self {
            enabled: true,
            cron: "0 3 * * *".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

impl Default for ScheduleEntry {
    fn default() -> Self {
        Self::default_deliver()
    }
}

/// Federation job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobId {
    #[serde(rename = "build")]
    BuildBundles,
    #[serde(rename = "deliver")]
    DeliverQueued,
    #[serde(rename = "merge")]
    MergeSignals,
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobId::BuildBundles => write!(f, "build"),
            JobId::DeliverQueued => write!(f, "deliver"),
            JobId::MergeSignals => write!(f, "merge"),
        }
    }
}

impl std::str::FromStr for JobId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "build" | "build_bundles" => Ok(JobId::BuildBundles),
            "deliver" | "send" | "deliver_queued" => Ok(JobId::DeliverQueued),
            "merge" | "merge_signals" => Ok(JobId::MergeSignals),
            _ => Err(format!("Unknown job: {}", s)),
        }
    }
}

/// Current status of a federation job
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Idle,
    Running {
        #[serde(rename = "startedAt")]
        started_at: DateTime<Utc>,
        #[serde(rename = "runId")]
        run_id: String,
    },
    Completed {
        #[serde(rename = "finishedAt")]
        finished_at: DateTime<Utc>,
        #[serde(rename = "durationSecs")]
        duration_secs: u64,
        #[serde(rename = "runId")]
        run_id: String,
    },
    Failed {
        error: AdminError,
        #[serde(rename = "runId")]
        run_id: String,
    },
}

/// Record of a single job run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRun {
    pub id: String,
    pub job: JobId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<u64>,
    pub success: bool,
    pub error_message: Option<String>,
    /// Humanized outcome summary ("1 bundle queued, 2 divisions skipped").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub trigger: ExecutionTrigger,
}

/// What triggered the job run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionTrigger {
    Scheduled,
    Manual,
    CatchUp,
}

impl std::fmt::Display for ExecutionTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionTrigger::Scheduled => write!(f, "scheduled"),
            ExecutionTrigger::Manual => write!(f, "manual"),
            ExecutionTrigger::CatchUp => write!(f, "catch-up"),
        }
    }
}
