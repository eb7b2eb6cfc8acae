use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::FederationError;
use crate::keys::NodeIdentity;
use crate::notify::Notifier;
use crate::types::{Config, ExecutionTrigger, JobId, JobRun, JobStatus};

/// Maximum number of job runs to keep in memory and on disk
const MAX_HISTORY_SIZE: usize = 100;

const CONFIG_FILE: &str = "federation.json";
const HISTORY_FILE: &str = "jobs.json";
const DB_FILE: &str = "federation.db";

/// Shared state for the federation daemon.
pub struct AppState {
    pub config: Mutex<Config>,
    /// Where the node keeps its key, database, and run history.
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub identity: NodeIdentity,
    pub notifier: Notifier,
    pub job_status: Mutex<HashMap<JobId, JobStatus>>,
    pub job_history: Mutex<Vec<JobRun>>,
    pub last_scheduled_run: Mutex<HashMap<JobId, DateTime<Utc>>>,
    /// Jobs currently executing; guards single-flight per job kind.
    running_jobs: Mutex<HashSet<JobId>>,
    /// Filled in once the runner is up; used by admin "run now".
    pub trigger_tx: Mutex<Option<mpsc::Sender<crate::scheduler::SchedulerMessage>>>,
}

impl AppState {
    /// Build the daemon state: config from `~/.impactos/federation.json`
    /// (defaults when absent), node key loaded or generated, database
    /// migrated.
    pub fn init() -> Result<Self, FederationError> {
        let config = match load_config() {
            Ok(config) => config,
            Err(e) => {
                log::info!("Using default config ({})", e);
                Config::default()
            }
        };
        let data_dir = resolve_data_dir(&config)?;
        Self::with_config(config, data_dir)
    }

    fn with_config(config: Config, data_dir: PathBuf) -> Result<Self, FederationError> {
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir)
                .map_err(|e| FederationError::Config(format!("Failed to create data dir: {}", e)))?;
        }

        let db_path = data_dir.join(DB_FILE);
        // Open once up front so migrations run before anything else starts
        crate::db::FederationDb::open_at(db_path.clone())
            .map_err(|e| FederationError::Db(e.to_string()))?;

        let identity = NodeIdentity::load_or_generate(&data_dir)?;
        let history = load_job_history(&data_dir).unwrap_or_default();

        Ok(Self {
            config: Mutex::new(config),
            data_dir,
            db_path,
            identity,
            notifier: Notifier::new(),
            job_status: Mutex::new(HashMap::new()),
            job_history: Mutex::new(history),
            last_scheduled_run: Mutex::new(HashMap::new()),
            running_jobs: Mutex::new(HashSet::new()),
            trigger_tx: Mutex::new(None),
        })
    }

    /// State rooted in a temporary directory, nothing touches the home dir.
    #[cfg(test)]
    pub fn for_tests(dir: &Path) -> Self {
        let config = Config {
            data_dir: Some(dir.to_string_lossy().to_string()),
            ..Config::default()
        };
        Self::with_config(config, dir.to_path_buf()).expect("test state")
    }

    /// Snapshot the config without holding the lock across awaits.
    pub fn config_snapshot(&self) -> Config {
        self.config
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Open a fresh database handle. Each background task owns its own
    /// connection; SQLite WAL coordinates them.
    pub fn open_db(&self) -> Result<crate::db::FederationDb, FederationError> {
        crate::db::FederationDb::open_at(self.db_path.clone())
            .map_err(|e| FederationError::Db(e.to_string()))
    }

    /// Get current status of a job
    pub fn get_job_status(&self, job: JobId) -> JobStatus {
        self.job_status
            .lock()
            .map(|guard| guard.get(&job).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Update job status
    pub fn set_job_status(&self, job: JobId, status: JobStatus) {
        if let Ok(mut guard) = self.job_status.lock() {
            guard.insert(job, status);
        }
    }

    /// Add a job run to history
    pub fn add_job_run(&self, run: JobRun) {
        if let Ok(mut guard) = self.job_history.lock() {
            guard.insert(0, run);

            // Trim to max size
            if guard.len() > MAX_HISTORY_SIZE {
                guard.truncate(MAX_HISTORY_SIZE);
            }
        }

        // Persist to disk (fire and forget)
        let _ = self.save_job_history();
    }

    /// Update an existing job run
    pub fn update_job_run(&self, id: &str, f: impl FnOnce(&mut JobRun)) {
        if let Ok(mut guard) = self.job_history.lock() {
            if let Some(run) = guard.iter_mut().find(|r| r.id == id) {
                f(run);
            }
        }

        // Persist to disk
        let _ = self.save_job_history();
    }

    /// Get job run history, newest first
    pub fn get_job_history(&self, limit: usize) -> Vec<JobRun> {
        self.job_history
            .lock()
            .map(|guard| guard.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Record when a scheduled run last occurred
    pub fn set_last_scheduled_run(&self, job: JobId, time: DateTime<Utc>) {
        if let Ok(mut guard) = self.last_scheduled_run.lock() {
            guard.insert(job, time);
        }
    }

    /// Get when a job last ran on schedule
    pub fn get_last_scheduled_run(&self, job: JobId) -> Option<DateTime<Utc>> {
        self.last_scheduled_run
            .lock()
            .ok()
            .and_then(|guard| guard.get(&job).cloned())
    }

    /// Claim the single-flight slot for a job. Returns None if the job is
    /// already running; the returned guard releases the slot on drop.
    pub fn try_begin_job(&self, job: JobId) -> Option<JobGuard<'_>> {
        let mut guard = self.running_jobs.lock().ok()?;
        if !guard.insert(job) {
            return None;
        }
        Some(JobGuard { state: self, job })
    }

    /// Ask the runner to execute a job soon. Fire and forget: a full trigger
    /// queue drops the request with a warning.
    pub fn trigger_job(&self, job: JobId, trigger: ExecutionTrigger) {
        let sender = match self.trigger_tx.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        match sender {
            Some(tx) => {
                if let Err(e) =
                    tx.try_send(crate::scheduler::SchedulerMessage { job, trigger })
                {
                    log::warn!("Failed to queue {} trigger: {}", job, e);
                }
            }
            None => log::warn!("Job runner not started yet, dropping {} trigger", job),
        }
    }

    /// Save job history to disk
    fn save_job_history(&self) -> Result<(), String> {
        let history = self
            .job_history
            .lock()
            .map_err(|_| "Lock poisoned")?
            .clone();

        let path = self.data_dir.join(HISTORY_FILE);
        let content =
            serde_json::to_string_pretty(&history).map_err(|e| format!("Serialize error: {}", e))?;

        crate::util::atomic_write_str(&path, &content)
    }
}

/// Releases a job's single-flight slot when dropped.
pub struct JobGuard<'a> {
    state: &'a AppState,
    job: JobId,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.state.running_jobs.lock() {
            guard.remove(&self.job);
        }
    }
}

/// Get the canonical config file path (~/.impactos/federation.json)
pub fn config_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or("Could not find home directory")?;
    Ok(home.join(".impactos").join(CONFIG_FILE))
}

/// Resolve where node state lives: the configured override, else `~/.impactos`.
fn resolve_data_dir(config: &Config) -> Result<PathBuf, FederationError> {
    if let Some(dir) = &config.data_dir {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir()
        .ok_or_else(|| FederationError::Config("Could not find home directory".to_string()))?;
    Ok(home.join(".impactos"))
}

/// Load configuration from ~/.impactos/federation.json
pub fn load_config() -> Result<Config, String> {
    let path = config_path()?;

    if !path.exists() {
        return Err(format!("Config file not found at {}", path.display()));
    }

    let content =
        fs::read_to_string(&path).map_err(|e| format!("Failed to read config: {}", e))?;

    serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))
}

/// Load job history from `<data_dir>/jobs.json`.
fn load_job_history(data_dir: &Path) -> Result<Vec<JobRun>, String> {
    let path = data_dir.join(HISTORY_FILE);

    if !path.exists() {
        return Ok(Vec::new());
    }

    let content =
        fs::read_to_string(&path).map_err(|e| format!("Failed to read history: {}", e))?;

    serde_json::from_str(&content).map_err(|e| format!("Failed to parse history: {}", e))
}

/// Create a new job run record
pub fn create_job_run(job: JobId, trigger: ExecutionTrigger) -> JobRun {
    JobRun {
        id: uuid::Uuid::new_v4().to_string(),
        job,
        started_at: Utc::now(),
        finished_at: None,
        duration_secs: None,
        success: false,
        error_message: None,
        detail: None,
        trigger,
    }
}
