//! Archival orchestration: long-lived, cancellable executions.
//!
//! An execution is started per archive candidate and named after its job, so
//! starting the same job twice is a no-op. Executions wait out a grace period
//! before doing any work; an upgrade inside that window can stop them.
//! Stopping is advisory: an execution that already finished is left alone.
//!
//! With a journal file, executions outlive the process: one that was waiting
//! or mid-run at shutdown runs again after the restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use annoflow_core::{JobId, ObjectLocation, UserId};

use super::ProviderError;

/// Input of an archival execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRequest {
    pub job_id: JobId,
    pub user_id: UserId,
    pub result_location: ObjectLocation,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub name: String,
    pub user_id: UserId,
    pub status: ExecutionStatus,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyExists,
}

pub trait ArchivalOrchestrator: Send + Sync {
    /// Whether the workflow definition exists.
    fn is_available(&self) -> Result<bool, ProviderError>;

    fn start_execution(&self, request: ArchiveRequest) -> Result<StartOutcome, ProviderError>;

    fn list_running(&self, user_id: &UserId) -> Result<Vec<ExecutionSummary>, ProviderError>;

    fn stop_execution(&self, name: &str) -> Result<(), ProviderError>;
}

impl<O> ArchivalOrchestrator for Arc<O>
where
    O: ArchivalOrchestrator + ?Sized,
{
    fn is_available(&self) -> Result<bool, ProviderError> {
        (**self).is_available()
    }

    fn start_execution(&self, request: ArchiveRequest) -> Result<StartOutcome, ProviderError> {
        (**self).start_execution(request)
    }

    fn list_running(&self, user_id: &UserId) -> Result<Vec<ExecutionSummary>, ProviderError> {
        (**self).list_running(user_id)
    }

    fn stop_execution(&self, name: &str) -> Result<(), ProviderError> {
        (**self).stop_execution(name)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Execution {
    request: ArchiveRequest,
    due_at: DateTime<Utc>,
    status: ExecutionStatus,
    /// Picked up by `run_due`; no longer waiting.
    #[serde(skip)]
    claimed: bool,
}

/// In-process orchestrator driven by a ticking worker calling
/// [`run_due`](Self::run_due).
#[derive(Debug)]
pub struct LocalOrchestrator {
    grace_period: Duration,
    executions: Mutex<HashMap<String, Execution>>,
    journal: Option<PathBuf>,
}

impl LocalOrchestrator {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            grace_period,
            executions: Mutex::new(HashMap::new()),
            journal: None,
        }
    }

    /// Orchestrator whose executions are written to `journal` after every
    /// change and reloaded from it here.
    pub fn persistent(grace_period: Duration, journal: impl Into<PathBuf>) -> Result<Self, ProviderError> {
        let journal = journal.into();
        let executions = load_journal(&journal)?;
        info!(
            journal = %journal.display(),
            running = executions.values().filter(|e| e.status == ExecutionStatus::Running).count(),
            "archival executions loaded"
        );
        Ok(Self {
            grace_period,
            executions: Mutex::new(executions),
            journal: Some(journal),
        })
    }

    pub fn status(&self, name: &str) -> Option<ExecutionStatus> {
        self.executions
            .lock()
            .ok()
            .and_then(|e| e.get(name).map(|x| x.status))
    }

    /// Run every execution whose grace period elapsed. Returns how many ran.
    pub fn run_due<F, E>(&self, mut body: F) -> usize
    where
        F: FnMut(&ArchiveRequest) -> Result<(), E>,
        E: core::fmt::Display,
    {
        let due: Vec<(String, ArchiveRequest)> = match self.executions.lock() {
            Ok(mut executions) => {
                let now = Utc::now();
                executions
                    .iter_mut()
                    .filter(|(_, e)| {
                        e.status == ExecutionStatus::Running && !e.claimed && e.due_at <= now
                    })
                    .map(|(name, e)| {
                        e.claimed = true;
                        (name.clone(), e.request.clone())
                    })
                    .collect()
            }
            Err(_) => return 0,
        };

        for (name, request) in &due {
            let status = match body(request) {
                Ok(()) => ExecutionStatus::Succeeded,
                Err(e) => {
                    warn!(execution = %name, job_id = %request.job_id, error = %e, "archival execution failed");
                    ExecutionStatus::Failed
                }
            };
            if let Ok(mut executions) = self.executions.lock() {
                if let Some(exec) = executions.get_mut(name) {
                    // A stop that raced the run keeps its Aborted status.
                    if exec.status == ExecutionStatus::Running {
                        exec.status = status;
                    }
                }
                if let Err(e) = self.persist(&executions) {
                    warn!(execution = %name, error = %e, "failed to record execution outcome");
                }
            }
        }
        due.len()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Execution>>, ProviderError> {
        self.executions
            .lock()
            .map_err(|_| ProviderError::Transient("orchestrator lock poisoned".into()))
    }

    fn due_at(&self) -> DateTime<Utc> {
        let grace = chrono::Duration::from_std(self.grace_period).unwrap_or(chrono::Duration::MAX);
        Utc::now().checked_add_signed(grace).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Called with the executions lock held so journal writes stay ordered.
    fn persist(&self, executions: &HashMap<String, Execution>) -> Result<(), ProviderError> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let raw = serde_json::to_vec_pretty(executions).map_err(|e| ProviderError::Rejected(e.to_string()))?;
        super::write_atomically(journal, &raw)
            .map_err(|e| ProviderError::Transient(format!("{}: {e}", journal.display())))
    }
}

fn load_journal(path: &Path) -> Result<HashMap<String, Execution>, ProviderError> {
    match std::fs::read(path) {
        Ok(raw) => serde_json::from_slice(&raw)
            .map_err(|e| ProviderError::Rejected(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(ProviderError::Transient(format!("{}: {e}", path.display()))),
    }
}

impl ArchivalOrchestrator for LocalOrchestrator {
    fn is_available(&self) -> Result<bool, ProviderError> {
        Ok(true)
    }

    fn start_execution(&self, request: ArchiveRequest) -> Result<StartOutcome, ProviderError> {
        let mut executions = self.lock()?;
        let name = request.job_id.to_string();
        if executions.contains_key(&name) {
            return Ok(StartOutcome::AlreadyExists);
        }

        executions.insert(
            name.clone(),
            Execution {
                request,
                due_at: self.due_at(),
                status: ExecutionStatus::Running,
                claimed: false,
            },
        );
        if let Err(e) = self.persist(&executions) {
            executions.remove(&name);
            return Err(e);
        }
        info!(execution = %name, "archival execution started");
        Ok(StartOutcome::Started)
    }

    fn list_running(&self, user_id: &UserId) -> Result<Vec<ExecutionSummary>, ProviderError> {
        let executions = self.lock()?;
        let mut running: Vec<ExecutionSummary> = executions
            .iter()
            .filter(|(_, e)| e.status == ExecutionStatus::Running && &e.request.user_id == user_id)
            .map(|(name, e)| ExecutionSummary {
                name: name.clone(),
                user_id: e.request.user_id.clone(),
                status: e.status,
            })
            .collect();
        running.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(running)
    }

    fn stop_execution(&self, name: &str) -> Result<(), ProviderError> {
        let mut executions = self.lock()?;
        let exec = executions
            .get_mut(name)
            .ok_or_else(|| ProviderError::NotFound(format!("execution {name}")))?;
        if exec.status == ExecutionStatus::Running {
            exec.status = ExecutionStatus::Aborted;
            if let Err(e) = self.persist(&executions) {
                if let Some(exec) = executions.get_mut(name) {
                    exec.status = ExecutionStatus::Running;
                }
                return Err(e);
            }
            info!(execution = %name, "archival execution stopped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(job: &str, user: &str) -> ArchiveRequest {
        ArchiveRequest {
            job_id: JobId::new(job).unwrap(),
            user_id: UserId::new(user).unwrap(),
            result_location: ObjectLocation::new("results", format!("{user}/{job}~a.annot.vcf")).unwrap(),
        }
    }

    #[test]
    fn duplicate_start_is_deduplicated() {
        let orch = LocalOrchestrator::new(Duration::ZERO);
        assert_eq!(orch.start_execution(request("J1", "U1")).unwrap(), StartOutcome::Started);
        assert_eq!(
            orch.start_execution(request("J1", "U1")).unwrap(),
            StartOutcome::AlreadyExists
        );
    }

    #[test]
    fn executions_wait_for_grace_period() {
        let orch = LocalOrchestrator::new(Duration::from_secs(3600));
        orch.start_execution(request("J1", "U1")).unwrap();
        let ran = orch.run_due(|_| Ok::<(), String>(()));
        assert_eq!(ran, 0);
        assert_eq!(orch.status("J1"), Some(ExecutionStatus::Running));
    }

    #[test]
    fn stopped_execution_never_runs() {
        let orch = LocalOrchestrator::new(Duration::ZERO);
        orch.start_execution(request("J1", "U1")).unwrap();
        orch.start_execution(request("J2", "U2")).unwrap();

        let running = orch.list_running(&UserId::new("U1").unwrap()).unwrap();
        assert_eq!(running.len(), 1);
        orch.stop_execution(&running[0].name).unwrap();

        let mut seen = Vec::new();
        orch.run_due(|r| {
            seen.push(r.job_id.to_string());
            Ok::<(), String>(())
        });
        assert_eq!(seen, ["J2"]);
        assert_eq!(orch.status("J1"), Some(ExecutionStatus::Aborted));
        assert_eq!(orch.status("J2"), Some(ExecutionStatus::Succeeded));
    }

    #[test]
    fn stopping_a_finished_execution_is_benign() {
        let orch = LocalOrchestrator::new(Duration::ZERO);
        orch.start_execution(request("J1", "U1")).unwrap();
        orch.run_due(|_| Err::<(), _>("boom"));
        orch.stop_execution("J1").unwrap();
        assert_eq!(orch.status("J1"), Some(ExecutionStatus::Failed));
    }

    #[test]
    fn journaled_executions_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let journal = dir.path().join("executions.json");
        {
            let orch = LocalOrchestrator::persistent(Duration::from_secs(3600), &journal).unwrap();
            orch.start_execution(request("J1", "U1")).unwrap();
            orch.start_execution(request("J2", "U1")).unwrap();
            orch.stop_execution("J2").unwrap();
        }

        let orch = LocalOrchestrator::persistent(Duration::ZERO, &journal).unwrap();
        assert_eq!(orch.status("J1"), Some(ExecutionStatus::Running));
        assert_eq!(orch.status("J2"), Some(ExecutionStatus::Aborted));
        assert_eq!(
            orch.start_execution(request("J1", "U1")).unwrap(),
            StartOutcome::AlreadyExists
        );
        // Still inside the grace period it was started with.
        assert_eq!(orch.run_due(|_| Ok::<(), String>(())), 0);
    }

    #[test]
    fn claimed_execution_runs_again_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let journal = dir.path().join("executions.json");
        let orch = LocalOrchestrator::persistent(Duration::ZERO, &journal).unwrap();
        orch.start_execution(request("J1", "U1")).unwrap();
        // The process dies while the body runs; nothing past the claim is written.
        orch.run_due(|_| -> Result<(), String> {
            let reloaded = LocalOrchestrator::persistent(Duration::ZERO, &journal).unwrap();
            assert_eq!(reloaded.run_due(|_| Ok::<(), String>(())), 1);
            assert_eq!(reloaded.status("J1"), Some(ExecutionStatus::Succeeded));
            Ok(())
        });
    }

    #[test]
    fn corrupt_journal_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let journal = dir.path().join("executions.json");
        std::fs::write(&journal, b"{not json").unwrap();
        assert!(matches!(
            LocalOrchestrator::persistent(Duration::ZERO, &journal),
            Err(ProviderError::Rejected(_))
        ));
    }
}
