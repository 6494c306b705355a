//! Cold storage: archives that need an explicit, tiered retrieval before
//! their bytes can be read again.
//!
//! Two simulators share the retrieval-latency model: [`InMemoryColdStorage`]
//! for tests and [`FsColdStorage`], which keeps vaults, archives and pending
//! retrievals on disk so they survive a restart.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use annoflow_core::{ArchiveId, RetrievalJobId, RetrievalTier};
use annoflow_events::{ColdStorageNotification, Publisher, Topic};

use super::ProviderError;

pub trait ColdStorage: Send + Sync {
    fn vault_exists(&self, vault: &str) -> Result<bool, ProviderError>;

    fn upload_archive(
        &self,
        vault: &str,
        bytes: &[u8],
        description: &str,
    ) -> Result<ArchiveId, ProviderError>;

    /// Start a retrieval. `Capacity` means this tier is exhausted right now.
    ///
    /// `description` is echoed back in the completion notification.
    fn initiate_retrieval(
        &self,
        vault: &str,
        archive_id: &ArchiveId,
        tier: RetrievalTier,
        description: &str,
    ) -> Result<RetrievalJobId, ProviderError>;

    /// Output of a completed retrieval. `Transient` while still in progress.
    fn fetch(&self, vault: &str, retrieval_job_id: &RetrievalJobId) -> Result<Vec<u8>, ProviderError>;

    fn delete_archive(&self, vault: &str, archive_id: &ArchiveId) -> Result<(), ProviderError>;

    fn archive_exists(&self, vault: &str, archive_id: &ArchiveId) -> Result<bool, ProviderError>;
}

impl<C> ColdStorage for Arc<C>
where
    C: ColdStorage + ?Sized,
{
    fn vault_exists(&self, vault: &str) -> Result<bool, ProviderError> {
        (**self).vault_exists(vault)
    }

    fn upload_archive(
        &self,
        vault: &str,
        bytes: &[u8],
        description: &str,
    ) -> Result<ArchiveId, ProviderError> {
        (**self).upload_archive(vault, bytes, description)
    }

    fn initiate_retrieval(
        &self,
        vault: &str,
        archive_id: &ArchiveId,
        tier: RetrievalTier,
        description: &str,
    ) -> Result<RetrievalJobId, ProviderError> {
        (**self).initiate_retrieval(vault, archive_id, tier, description)
    }

    fn fetch(&self, vault: &str, retrieval_job_id: &RetrievalJobId) -> Result<Vec<u8>, ProviderError> {
        (**self).fetch(vault, retrieval_job_id)
    }

    fn delete_archive(&self, vault: &str, archive_id: &ArchiveId) -> Result<(), ProviderError> {
        (**self).delete_archive(vault, archive_id)
    }

    fn archive_exists(&self, vault: &str, archive_id: &ArchiveId) -> Result<bool, ProviderError> {
        (**self).archive_exists(vault, archive_id)
    }
}

#[derive(Debug)]
struct Retrieval {
    vault: String,
    archive_id: ArchiveId,
    tier: RetrievalTier,
    description: String,
    started: Instant,
    output: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct ColdState {
    vaults: HashSet<String>,
    archives: HashMap<ArchiveId, (String, Vec<u8>)>,
    retrievals: HashMap<RetrievalJobId, Retrieval>,
    exhausted: HashSet<RetrievalTier>,
}

/// In-memory vaults with simulated retrieval latency.
///
/// Retrievals complete when [`complete_retrieval`](Self::complete_retrieval)
/// is called, or via [`complete_due`](Self::complete_due) once the tier's
/// latency has elapsed. Completion publishes a cold-storage notification on
/// [`Topic::JobRestore`] through the attached notifier.
pub struct InMemoryColdStorage {
    state: Mutex<ColdState>,
    notifier: Notifier,
    latency: Latency,
}

impl core::fmt::Debug for InMemoryColdStorage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryColdStorage")
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryColdStorage {
    fn default() -> Self {
        let Latency { expedited, standard } = Latency::default();
        Self::with_latency(expedited, standard)
    }
}

impl InMemoryColdStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(expedited: Duration, standard: Duration) -> Self {
        Self {
            state: Mutex::new(ColdState::default()),
            notifier: Notifier::default(),
            latency: Latency { expedited, standard },
        }
    }

    pub fn with_vault(self, vault: impl Into<String>) -> Self {
        self.create_vault(vault);
        self
    }

    pub fn create_vault(&self, vault: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.vaults.insert(vault.into());
        }
    }

    pub fn set_notifier(&self, publisher: Arc<dyn Publisher>) {
        self.notifier.set(publisher);
    }

    /// Make `tier` fail with `Capacity` until restored.
    pub fn exhaust(&self, tier: RetrievalTier) {
        if let Ok(mut state) = self.state.lock() {
            state.exhausted.insert(tier);
        }
    }

    pub fn restore_capacity(&self, tier: RetrievalTier) {
        if let Ok(mut state) = self.state.lock() {
            state.exhausted.remove(&tier);
        }
    }

    pub fn archive_count(&self) -> usize {
        self.state.lock().map(|s| s.archives.len()).unwrap_or(0)
    }

    /// Retrieval jobs not yet completed.
    pub fn pending_retrievals(&self) -> Vec<RetrievalJobId> {
        self.state
            .lock()
            .map(|s| {
                s.retrievals
                    .iter()
                    .filter(|(_, r)| r.output.is_none())
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Finish a retrieval and publish its completion notification.
    pub fn complete_retrieval(&self, retrieval_job_id: &RetrievalJobId) -> Result<(), ProviderError> {
        let notification = {
            let mut state = self.lock()?;
            let ColdState {
                archives,
                retrievals,
                ..
            } = &mut *state;
            let retrieval = retrievals
                .get_mut(retrieval_job_id)
                .ok_or_else(|| ProviderError::NotFound(format!("retrieval {retrieval_job_id}")))?;
            let (_, bytes) = archives.get(&retrieval.archive_id).ok_or_else(|| {
                ProviderError::NotFound(format!("archive {}", retrieval.archive_id))
            })?;
            retrieval.output = Some(bytes.clone());
            ColdStorageNotification::retrieval_succeeded(
                &retrieval.archive_id,
                retrieval_job_id,
                Some(retrieval.description.clone()).filter(|d| !d.is_empty()),
            )
        };

        info!(
            retrieval_job_id = %retrieval_job_id,
            archive_id = %notification.archive_id,
            "retrieval completed"
        );
        self.notifier.send(notification)
    }

    /// Complete every retrieval whose tier latency has elapsed. Returns how many.
    pub fn complete_due(&self) -> usize {
        let due: Vec<RetrievalJobId> = match self.state.lock() {
            Ok(state) => state
                .retrievals
                .iter()
                .filter(|(_, r)| r.output.is_none() && r.started.elapsed() >= self.latency.for_tier(r.tier))
                .map(|(id, _)| id.clone())
                .collect(),
            Err(_) => return 0,
        };

        due.iter()
            .filter(|id| match self.complete_retrieval(id) {
                Ok(()) => true,
                Err(e) => {
                    warn!(retrieval_job_id = %id, error = %e, "failed to complete retrieval");
                    false
                }
            })
            .count()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ColdState>, ProviderError> {
        self.state
            .lock()
            .map_err(|_| ProviderError::Transient("cold storage lock poisoned".into()))
    }

    fn require_vault(state: &ColdState, vault: &str) -> Result<(), ProviderError> {
        if state.vaults.contains(vault) {
            Ok(())
        } else {
            Err(ProviderError::MissingResource(format!("vault {vault}")))
        }
    }
}

impl ColdStorage for InMemoryColdStorage {
    fn vault_exists(&self, vault: &str) -> Result<bool, ProviderError> {
        Ok(self.lock()?.vaults.contains(vault))
    }

    fn upload_archive(
        &self,
        vault: &str,
        bytes: &[u8],
        _description: &str,
    ) -> Result<ArchiveId, ProviderError> {
        let mut state = self.lock()?;
        Self::require_vault(&state, vault)?;
        let archive_id = ArchiveId::new(Uuid::new_v4().simple().to_string())
            .map_err(|e| ProviderError::Rejected(e.to_string()))?;
        state
            .archives
            .insert(archive_id.clone(), (vault.to_string(), bytes.to_vec()));
        Ok(archive_id)
    }

    fn initiate_retrieval(
        &self,
        vault: &str,
        archive_id: &ArchiveId,
        tier: RetrievalTier,
        description: &str,
    ) -> Result<RetrievalJobId, ProviderError> {
        let mut state = self.lock()?;
        Self::require_vault(&state, vault)?;
        if !state.archives.contains_key(archive_id) {
            return Err(ProviderError::NotFound(format!("archive {archive_id}")));
        }
        if state.exhausted.contains(&tier) {
            return Err(ProviderError::Capacity(format!("{tier} retrievals exhausted")));
        }

        let retrieval_job_id = RetrievalJobId::new(Uuid::new_v4().to_string())
            .map_err(|e| ProviderError::Rejected(e.to_string()))?;
        state.retrievals.insert(
            retrieval_job_id.clone(),
            Retrieval {
                vault: vault.to_string(),
                archive_id: archive_id.clone(),
                tier,
                description: description.to_string(),
                started: Instant::now(),
                output: None,
            },
        );
        Ok(retrieval_job_id)
    }

    fn fetch(&self, vault: &str, retrieval_job_id: &RetrievalJobId) -> Result<Vec<u8>, ProviderError> {
        let state = self.lock()?;
        Self::require_vault(&state, vault)?;
        let retrieval = state
            .retrievals
            .get(retrieval_job_id)
            .filter(|r| r.vault == vault)
            .ok_or_else(|| ProviderError::NotFound(format!("retrieval {retrieval_job_id}")))?;
        retrieval
            .output
            .clone()
            .ok_or_else(|| ProviderError::Transient(format!("retrieval {retrieval_job_id} still in progress")))
    }

    fn delete_archive(&self, vault: &str, archive_id: &ArchiveId) -> Result<(), ProviderError> {
        let mut state = self.lock()?;
        Self::require_vault(&state, vault)?;
        match state.archives.get(archive_id) {
            Some((v, _)) if v == vault => {
                state.archives.remove(archive_id);
                Ok(())
            }
            _ => Err(ProviderError::NotFound(format!("archive {archive_id}"))),
        }
    }

    fn archive_exists(&self, vault: &str, archive_id: &ArchiveId) -> Result<bool, ProviderError> {
        let state = self.lock()?;
        Self::require_vault(&state, vault)?;
        Ok(matches!(state.archives.get(archive_id), Some((v, _)) if v == vault))
    }
}

#[derive(Debug, Copy, Clone)]
struct Latency {
    expedited: Duration,
    standard: Duration,
}

impl Default for Latency {
    fn default() -> Self {
        Self {
            expedited: Duration::from_secs(5 * 60),
            standard: Duration::from_secs(5 * 60 * 60),
        }
    }
}

impl Latency {
    fn for_tier(&self, tier: RetrievalTier) -> Duration {
        match tier {
            RetrievalTier::Expedited => self.expedited,
            RetrievalTier::Standard => self.standard,
        }
    }
}

/// Publishes retrieval completions on [`Topic::JobRestore`] once a publisher
/// is attached.
#[derive(Default)]
struct Notifier(Mutex<Option<Arc<dyn Publisher>>>);

impl Notifier {
    fn set(&self, publisher: Arc<dyn Publisher>) {
        if let Ok(mut notifier) = self.0.lock() {
            *notifier = Some(publisher);
        }
    }

    fn send(&self, notification: ColdStorageNotification) -> Result<(), ProviderError> {
        let notifier = self
            .0
            .lock()
            .map_err(|_| ProviderError::Transient("notifier lock poisoned".into()))?
            .clone();
        let Some(publisher) = notifier else {
            debug!("no notifier attached; retrieval completion not published");
            return Ok(());
        };
        let message = serde_json::to_string(&notification)
            .map_err(|e| ProviderError::Rejected(e.to_string()))?;
        publisher
            .publish_message(Topic::JobRestore, message)
            .map_err(|e| ProviderError::Transient(e.to_string()))
    }
}

/// Retrieval bookkeeping persisted next to the vault's archives.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RetrievalRecord {
    archive_id: ArchiveId,
    tier: RetrievalTier,
    description: String,
    started_at: DateTime<Utc>,
    completed: bool,
}

/// Vaults on the local filesystem.
///
/// Layout under `root`, per vault:
///
/// ```text
/// {vault}/archives/{archive_id}
/// {vault}/retrievals/{retrieval_job_id}.json
/// {vault}/outputs/{retrieval_job_id}
/// ```
///
/// A completed retrieval keeps its own copy of the bytes, so deleting the
/// archive afterwards does not break a pending restore. Retrievals started
/// before a restart are completed by the next [`complete_due`](Self::complete_due).
pub struct FsColdStorage {
    root: PathBuf,
    notifier: Notifier,
    latency: Latency,
}

impl core::fmt::Debug for FsColdStorage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FsColdStorage")
            .field("root", &self.root)
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

/// `name` as a single path component.
fn file_component(name: &str) -> Result<&str, ProviderError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name),
        _ => Err(ProviderError::Rejected(format!("{name:?} is not a plain file name"))),
    }
}

fn io_error(what: &str, err: std::io::Error) -> ProviderError {
    match err.kind() {
        ErrorKind::NotFound => ProviderError::NotFound(what.to_string()),
        ErrorKind::PermissionDenied => ProviderError::Rejected(format!("{what}: {err}")),
        _ => ProviderError::Transient(format!("{what}: {err}")),
    }
}

impl FsColdStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            notifier: Notifier::default(),
            latency: Latency::default(),
        }
    }

    pub fn with_latency(mut self, expedited: Duration, standard: Duration) -> Self {
        self.latency = Latency { expedited, standard };
        self
    }

    pub fn create_vault(&self, vault: &str) -> Result<(), ProviderError> {
        let dir = self.vault_dir(vault)?;
        for sub in ["archives", "retrievals", "outputs"] {
            std::fs::create_dir_all(dir.join(sub)).map_err(|e| io_error(vault, e))?;
        }
        Ok(())
    }

    pub fn set_notifier(&self, publisher: Arc<dyn Publisher>) {
        self.notifier.set(publisher);
    }

    /// Finish a retrieval and publish its completion notification. Completing
    /// it again only republishes.
    pub fn complete_retrieval(&self, vault: &str, retrieval_job_id: &RetrievalJobId) -> Result<(), ProviderError> {
        let dir = self.require_vault(vault)?;
        let mut record = self.read_record(&dir, retrieval_job_id)?;
        if !record.completed {
            let bytes = std::fs::read(self.archive_path(vault, &record.archive_id)?)
                .map_err(|e| io_error(&format!("archive {}", record.archive_id), e))?;
            let output = Self::output_path(&dir, retrieval_job_id)?;
            super::write_atomically(&output, &bytes).map_err(|e| io_error(vault, e))?;
            record.completed = true;
            self.write_record(&dir, retrieval_job_id, &record)?;
        }

        info!(
            retrieval_job_id = %retrieval_job_id,
            archive_id = %record.archive_id,
            "retrieval completed"
        );
        self.notifier.send(ColdStorageNotification::retrieval_succeeded(
            &record.archive_id,
            retrieval_job_id,
            Some(record.description).filter(|d| !d.is_empty()),
        ))
    }

    /// Complete every retrieval, in any vault, whose tier latency has
    /// elapsed. Returns how many.
    pub fn complete_due(&self) -> usize {
        let vaults = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "cannot scan cold storage");
                return 0;
            }
        };

        let now = Utc::now();
        let mut completed = 0;
        for vault in vaults.flatten() {
            let Some(vault) = vault.file_name().to_str().map(str::to_string) else {
                continue;
            };
            for (retrieval_job_id, record) in self.pending(&vault) {
                let elapsed = (now - record.started_at).to_std().unwrap_or(Duration::ZERO);
                if elapsed < self.latency.for_tier(record.tier) {
                    continue;
                }
                match self.complete_retrieval(&vault, &retrieval_job_id) {
                    Ok(()) => completed += 1,
                    Err(e) => warn!(retrieval_job_id = %retrieval_job_id, error = %e, "failed to complete retrieval"),
                }
            }
        }
        completed
    }

    /// Retrievals in `vault` not yet completed.
    pub fn pending_retrievals(&self, vault: &str) -> Vec<RetrievalJobId> {
        self.pending(vault).into_iter().map(|(id, _)| id).collect()
    }

    fn pending(&self, vault: &str) -> Vec<(RetrievalJobId, RetrievalRecord)> {
        let Ok(dir) = self.require_vault(vault) else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir(dir.join("retrievals")) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    return None;
                }
                let id = path.file_stem()?.to_str()?;
                let retrieval_job_id = RetrievalJobId::new(id).ok()?;
                match self.read_record(&dir, &retrieval_job_id) {
                    Ok(record) if !record.completed => Some((retrieval_job_id, record)),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "unreadable retrieval record");
                        None
                    }
                }
            })
            .collect()
    }

    fn vault_dir(&self, vault: &str) -> Result<PathBuf, ProviderError> {
        Ok(self.root.join(file_component(vault)?))
    }

    fn require_vault(&self, vault: &str) -> Result<PathBuf, ProviderError> {
        let dir = self.vault_dir(vault)?;
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(ProviderError::MissingResource(format!("vault {vault}")))
        }
    }

    fn record_path(dir: &Path, retrieval_job_id: &RetrievalJobId) -> Result<PathBuf, ProviderError> {
        let name = file_component(retrieval_job_id.as_str())?;
        Ok(dir.join("retrievals").join(format!("{name}.json")))
    }

    fn output_path(dir: &Path, retrieval_job_id: &RetrievalJobId) -> Result<PathBuf, ProviderError> {
        Ok(dir.join("outputs").join(file_component(retrieval_job_id.as_str())?))
    }

    fn read_record(&self, dir: &Path, retrieval_job_id: &RetrievalJobId) -> Result<RetrievalRecord, ProviderError> {
        let what = format!("retrieval {retrieval_job_id}");
        let raw = std::fs::read(Self::record_path(dir, retrieval_job_id)?).map_err(|e| io_error(&what, e))?;
        serde_json::from_slice(&raw).map_err(|e| ProviderError::Rejected(format!("{what}: {e}")))
    }

    fn write_record(
        &self,
        dir: &Path,
        retrieval_job_id: &RetrievalJobId,
        record: &RetrievalRecord,
    ) -> Result<(), ProviderError> {
        let raw = serde_json::to_vec(record).map_err(|e| ProviderError::Rejected(e.to_string()))?;
        super::write_atomically(&Self::record_path(dir, retrieval_job_id)?, &raw)
            .map_err(|e| io_error(&format!("retrieval {retrieval_job_id}"), e))
    }

    fn archive_path(&self, vault: &str, archive_id: &ArchiveId) -> Result<PathBuf, ProviderError> {
        let name = file_component(archive_id.as_str())?;
        Ok(self.require_vault(vault)?.join("archives").join(name))
    }
}

impl ColdStorage for FsColdStorage {
    fn vault_exists(&self, vault: &str) -> Result<bool, ProviderError> {
        Ok(self.vault_dir(vault)?.is_dir())
    }

    fn upload_archive(
        &self,
        vault: &str,
        bytes: &[u8],
        _description: &str,
    ) -> Result<ArchiveId, ProviderError> {
        let archive_id = ArchiveId::new(Uuid::new_v4().simple().to_string())
            .map_err(|e| ProviderError::Rejected(e.to_string()))?;
        let path = self.archive_path(vault, &archive_id)?;
        super::write_atomically(&path, bytes).map_err(|e| io_error(vault, e))?;
        Ok(archive_id)
    }

    fn initiate_retrieval(
        &self,
        vault: &str,
        archive_id: &ArchiveId,
        tier: RetrievalTier,
        description: &str,
    ) -> Result<RetrievalJobId, ProviderError> {
        if !self.archive_exists(vault, archive_id)? {
            return Err(ProviderError::NotFound(format!("archive {archive_id}")));
        }
        let retrieval_job_id = RetrievalJobId::new(Uuid::new_v4().to_string())
            .map_err(|e| ProviderError::Rejected(e.to_string()))?;
        let record = RetrievalRecord {
            archive_id: archive_id.clone(),
            tier,
            description: description.to_string(),
            started_at: Utc::now(),
            completed: false,
        };
        self.write_record(&self.require_vault(vault)?, &retrieval_job_id, &record)?;
        debug!(retrieval_job_id = %retrieval_job_id, archive_id = %archive_id, tier = %tier, "retrieval initiated");
        Ok(retrieval_job_id)
    }

    fn fetch(&self, vault: &str, retrieval_job_id: &RetrievalJobId) -> Result<Vec<u8>, ProviderError> {
        let dir = self.require_vault(vault)?;
        let record = self.read_record(&dir, retrieval_job_id)?;
        if !record.completed {
            return Err(ProviderError::Transient(format!(
                "retrieval {retrieval_job_id} still in progress"
            )));
        }
        std::fs::read(Self::output_path(&dir, retrieval_job_id)?)
            .map_err(|e| io_error(&format!("retrieval {retrieval_job_id}"), e))
    }

    fn delete_archive(&self, vault: &str, archive_id: &ArchiveId) -> Result<(), ProviderError> {
        std::fs::remove_file(self.archive_path(vault, archive_id)?)
            .map_err(|e| io_error(&format!("archive {archive_id}"), e))
    }

    fn archive_exists(&self, vault: &str, archive_id: &ArchiveId) -> Result<bool, ProviderError> {
        Ok(self.archive_path(vault, archive_id)?.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use annoflow_events::{decode, InMemoryQueue, InMemoryTopics, LifecycleEvent, DeliveryQueue, ReceiveOptions};

    #[test]
    fn missing_vault_is_a_missing_resource() {
        let cold = InMemoryColdStorage::new();
        assert!(matches!(
            cold.upload_archive("vault", b"x", "J1"),
            Err(ProviderError::MissingResource(_))
        ));
    }

    #[test]
    fn exhausted_tier_reports_capacity() {
        let cold = InMemoryColdStorage::new().with_vault("vault");
        let archive_id = cold.upload_archive("vault", b"x", "J1").unwrap();
        cold.exhaust(RetrievalTier::Expedited);

        assert!(matches!(
            cold.initiate_retrieval("vault", &archive_id, RetrievalTier::Expedited, "J1"),
            Err(ProviderError::Capacity(_))
        ));
        assert!(cold
            .initiate_retrieval("vault", &archive_id, RetrievalTier::Standard, "J1")
            .is_ok());
    }

    #[test]
    fn fetch_is_transient_until_completed_then_notifies() {
        let topics = Arc::new(InMemoryTopics::new());
        let restore_queue = Arc::new(InMemoryQueue::new("restore"));
        topics.subscribe(Topic::JobRestore, restore_queue.clone());

        let cold = InMemoryColdStorage::new().with_vault("vault");
        cold.set_notifier(topics.clone());
        let archive_id = cold.upload_archive("vault", b"payload", "J1").unwrap();
        let rid = cold
            .initiate_retrieval("vault", &archive_id, RetrievalTier::Expedited, "J1")
            .unwrap();

        assert!(matches!(cold.fetch("vault", &rid), Err(ProviderError::Transient(_))));
        cold.complete_retrieval(&rid).unwrap();
        assert_eq!(cold.fetch("vault", &rid).unwrap(), b"payload");

        let delivery = restore_queue
            .receive(ReceiveOptions::new(1, Duration::from_millis(10)))
            .unwrap()
            .remove(0);
        match decode(Topic::JobRestore, &delivery.body).unwrap() {
            LifecycleEvent::RetrievalReady(e) => {
                assert_eq!(e.archive_id, archive_id);
                assert_eq!(e.retrieval_job_id, rid);
                assert_eq!(e.job_id.map(|j| j.into_string()).as_deref(), Some("J1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn complete_due_respects_tier_latency() {
        let cold = InMemoryColdStorage::with_latency(Duration::ZERO, Duration::from_secs(3600))
            .with_vault("vault");
        let a = cold.upload_archive("vault", b"a", "J1").unwrap();
        let b = cold.upload_archive("vault", b"b", "J2").unwrap();
        cold.initiate_retrieval("vault", &a, RetrievalTier::Expedited, "J1").unwrap();
        cold.initiate_retrieval("vault", &b, RetrievalTier::Standard, "J2").unwrap();

        assert_eq!(cold.complete_due(), 1);
        assert_eq!(cold.pending_retrievals().len(), 1);
    }

    #[test]
    fn fs_vault_must_be_created_first() {
        let dir = tempfile::tempdir().unwrap();
        let cold = FsColdStorage::new(dir.path());
        assert!(!cold.vault_exists("vault").unwrap());
        assert!(matches!(
            cold.upload_archive("vault", b"x", "J1"),
            Err(ProviderError::MissingResource(_))
        ));
        assert!(matches!(cold.create_vault("../vault"), Err(ProviderError::Rejected(_))));
    }

    #[test]
    fn fs_retrieval_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (archive_id, rid) = {
            let cold = FsColdStorage::new(dir.path());
            cold.create_vault("vault").unwrap();
            let archive_id = cold.upload_archive("vault", b"payload", "J1").unwrap();
            let rid = cold
                .initiate_retrieval("vault", &archive_id, RetrievalTier::Standard, "J1")
                .unwrap();
            assert!(matches!(cold.fetch("vault", &rid), Err(ProviderError::Transient(_))));
            (archive_id, rid)
        };

        let topics = Arc::new(InMemoryTopics::new());
        let restore_queue = Arc::new(InMemoryQueue::new("restore"));
        topics.subscribe(Topic::JobRestore, restore_queue.clone());
        let cold = FsColdStorage::new(dir.path()).with_latency(Duration::ZERO, Duration::ZERO);
        cold.set_notifier(topics.clone());
        assert!(cold.archive_exists("vault", &archive_id).unwrap());
        assert_eq!(cold.pending_retrievals("vault"), vec![rid.clone()]);

        assert_eq!(cold.complete_due(), 1);
        assert!(cold.pending_retrievals("vault").is_empty());
        cold.delete_archive("vault", &archive_id).unwrap();
        assert_eq!(cold.fetch("vault", &rid).unwrap(), b"payload");
        assert_eq!(restore_queue.len(), 1);
    }

    #[test]
    fn fs_ids_cannot_leave_the_vault() {
        let dir = tempfile::tempdir().unwrap();
        let cold = FsColdStorage::new(dir.path());
        cold.create_vault("vault").unwrap();
        let outside = ArchiveId::new("../../escaped").unwrap();
        assert!(matches!(
            cold.archive_exists("vault", &outside),
            Err(ProviderError::Rejected(_))
        ));
        let rid = RetrievalJobId::new("../x").unwrap();
        assert!(matches!(cold.fetch("vault", &rid), Err(ProviderError::Rejected(_))));
    }
}
