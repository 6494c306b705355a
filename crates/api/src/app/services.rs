//! Backend selection and the state shared by HTTP handlers.
//!
//! - `DATABASE_URL` set → Postgres job records and profiles, else in-memory
//! - `REDIS_URL` set (and the `redis` feature enabled) → Redis Streams queues
//!   and topic streams, else in-process topics with in-memory queues
//!
//! Object storage is the filesystem store under `storage.root_dir` and mail
//! goes to the log. Cold storage and archival executions follow the job
//! records: durable records get vaults and an execution journal under
//! `storage.state_dir`, in-memory records get in-process simulators.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use sqlx::postgres::PgPoolOptions;
use tokio::runtime::Handle;
use tracing::info;

use annoflow_events::{DeliveryQueue, InMemoryQueue, InMemoryTopics, Publisher, Topic};
use annoflow_infra::collaborators::{
    AccountDirectory, ColdStorage, FsColdStorage, FsObjectStore, InMemoryAccounts,
    InMemoryColdStorage, LocalOrchestrator, LogMailer, ObjectStore, PostgresAccounts,
    ProcessRunner,
};
use annoflow_infra::record_store::{InMemoryJobStore, JobRecordStore, PostgresJobStore};
use annoflow_infra::stages::SubmissionStage;
use annoflow_infra::workers::IntervalWorker;
use annoflow_infra::{Collaborators, Coordinator, CoordinatorConfig, Stages};

use crate::app::errors;

/// How often the cold-storage simulator completes due retrievals.
const COLD_STORAGE_TICK: Duration = Duration::from_secs(5);

/// State handed to every handler.
pub struct AppServices {
    pub store: Arc<dyn JobRecordStore>,
    pub accounts: Arc<dyn AccountDirectory>,
    pub objects: Arc<dyn ObjectStore>,
    pub publisher: Arc<dyn Publisher>,
    pub submission: Arc<SubmissionStage>,
    pub inputs_bucket: String,
    pub presigned_ttl: Duration,
}

impl AppServices {
    pub fn new(collaborators: &Collaborators, stages: &Stages, config: &CoordinatorConfig) -> Self {
        Self {
            store: collaborators.store.clone(),
            accounts: collaborators.accounts.clone(),
            objects: collaborators.objects.clone(),
            publisher: collaborators.publisher.clone(),
            submission: stages.submission.clone(),
            inputs_bucket: config.storage.inputs_bucket.clone(),
            presigned_ttl: config.storage.presigned_ttl,
        }
    }

    /// Run synchronous store/collaborator calls off the async executor.
    pub async fn blocking<F, T>(self: &Arc<Self>, f: F) -> Result<T, axum::response::Response>
    where
        F: FnOnce(&AppServices) -> T + Send + 'static,
        T: Send + 'static,
    {
        let services = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&services))
            .await
            .map_err(|e| errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string()))
    }
}

enum QueueSource {
    InMemory(Arc<InMemoryTopics>),
    #[cfg(feature = "redis")]
    Redis { url: String },
}

#[derive(Clone)]
enum ColdBackend {
    InMemory(Arc<InMemoryColdStorage>),
    Fs(Arc<FsColdStorage>),
}

impl ColdBackend {
    fn storage(&self) -> Arc<dyn ColdStorage> {
        match self {
            Self::InMemory(cold) => cold.clone() as Arc<dyn ColdStorage>,
            Self::Fs(cold) => cold.clone() as Arc<dyn ColdStorage>,
        }
    }

    fn complete_due(&self) -> usize {
        match self {
            Self::InMemory(cold) => cold.complete_due(),
            Self::Fs(cold) => cold.complete_due(),
        }
    }
}

/// Cold storage plus the orchestrator whose executions archive into it.
struct ArchiveBackends {
    cold: ColdBackend,
    orchestrator: Arc<LocalOrchestrator>,
}

impl ArchiveBackends {
    fn in_memory(config: &CoordinatorConfig, publisher: &Arc<dyn Publisher>) -> Self {
        let cold = Arc::new(InMemoryColdStorage::new().with_vault(config.storage.vault.clone()));
        cold.set_notifier(publisher.clone());
        Self {
            cold: ColdBackend::InMemory(cold),
            orchestrator: Arc::new(LocalOrchestrator::new(config.archive.grace_period)),
        }
    }

    fn durable(config: &CoordinatorConfig, publisher: &Arc<dyn Publisher>) -> anyhow::Result<Self> {
        let state_dir = &config.storage.state_dir;
        let cold = Arc::new(FsColdStorage::new(state_dir.join("vaults")));
        cold.create_vault(&config.storage.vault)?;
        cold.set_notifier(publisher.clone());
        let orchestrator = LocalOrchestrator::persistent(
            config.archive.grace_period,
            state_dir.join("archival-executions.json"),
        )?;
        info!(state_dir = %state_dir.display(), "using filesystem vaults and execution journal");
        Ok(Self {
            cold: ColdBackend::Fs(cold),
            orchestrator: Arc::new(orchestrator),
        })
    }
}

/// Every collaborator and stage of one coordinator process.
pub struct Backend {
    pub config: CoordinatorConfig,
    pub collaborators: Collaborators,
    pub stages: Stages,
    cold: ColdBackend,
    queues: QueueSource,
}

pub async fn build_backend(config: CoordinatorConfig) -> anyhow::Result<Backend> {
    let store: Arc<dyn JobRecordStore>;
    let accounts: Arc<dyn AccountDirectory>;
    match &config.backends.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
            let pg_store = PostgresJobStore::new(pool.clone(), Handle::current());
            pg_store.ensure_schema().await?;
            info!("using Postgres job records and profiles");
            store = Arc::new(pg_store);
            accounts = Arc::new(PostgresAccounts::new(pool, Handle::current()));
        }
        None => {
            info!("DATABASE_URL not set; using in-memory job records and profiles");
            store = Arc::new(InMemoryJobStore::new());
            accounts = Arc::new(InMemoryAccounts::new());
        }
    }

    let (publisher, queues) = build_transport(&config)?;
    let archive = if config.backends.database_url.is_some() {
        ArchiveBackends::durable(&config, &publisher)?
    } else {
        ArchiveBackends::in_memory(&config, &publisher)
    };
    assemble(config, store, accounts, publisher, queues, archive)
}

/// In-memory backend for tests and local runs; nothing touches the network.
pub fn in_memory_backend(
    config: CoordinatorConfig,
    accounts: Arc<InMemoryAccounts>,
) -> anyhow::Result<Backend> {
    let topics = Arc::new(InMemoryTopics::new());
    let publisher: Arc<dyn Publisher> = topics.clone();
    let archive = ArchiveBackends::in_memory(&config, &publisher);
    assemble(
        config,
        Arc::new(InMemoryJobStore::new()),
        accounts,
        publisher,
        QueueSource::InMemory(topics),
        archive,
    )
}

fn build_transport(config: &CoordinatorConfig) -> anyhow::Result<(Arc<dyn Publisher>, QueueSource)> {
    if let Some(url) = &config.backends.redis_url {
        #[cfg(feature = "redis")]
        {
            use annoflow_infra::event_bus::{RedisTopicPublisher, DEFAULT_STREAM_PREFIX};

            info!("using Redis Streams transport");
            let publisher: Arc<dyn Publisher> =
                Arc::new(RedisTopicPublisher::new(url, DEFAULT_STREAM_PREFIX)?);
            return Ok((publisher, QueueSource::Redis { url: url.clone() }));
        }
        #[cfg(not(feature = "redis"))]
        {
            tracing::warn!(redis_url = %url, "REDIS_URL set but redis feature not enabled, falling back to in-memory");
        }
    }

    let topics = Arc::new(InMemoryTopics::new());
    let publisher: Arc<dyn Publisher> = topics.clone();
    Ok((publisher, QueueSource::InMemory(topics)))
}

fn assemble(
    config: CoordinatorConfig,
    store: Arc<dyn JobRecordStore>,
    accounts: Arc<dyn AccountDirectory>,
    publisher: Arc<dyn Publisher>,
    queues: QueueSource,
    archive: ArchiveBackends,
) -> anyhow::Result<Backend> {
    let collaborators = Collaborators {
        store,
        accounts,
        objects: Arc::new(FsObjectStore::new(config.storage.root_dir.clone())),
        cold: archive.cold.storage(),
        mailer: Arc::new(LogMailer),
        runner: Arc::new(ProcessRunner::new(config.annotator.command.clone())?),
        orchestrator: archive.orchestrator,
        publisher,
    };
    let stages = Stages::new(&collaborators, &config);

    Ok(Backend {
        config,
        collaborators,
        stages,
        cold: archive.cold,
        queues,
    })
}

impl Backend {
    pub fn services(&self) -> Arc<AppServices> {
        Arc::new(AppServices::new(&self.collaborators, &self.stages, &self.config))
    }

    /// Start every stage worker and ticker.
    pub fn start(&self) -> anyhow::Result<Coordinator> {
        let visibility_timeout = self.config.poll.visibility_timeout;

        let mut coordinator = Coordinator::start(
            &self.stages,
            self.collaborators.orchestrator.clone(),
            &self.config,
            |topic: Topic, stage: &'static str| -> anyhow::Result<Arc<dyn DeliveryQueue>> {
                match &self.queues {
                    QueueSource::InMemory(topics) => {
                        let queue = Arc::new(InMemoryQueue::with_visibility_timeout(stage, visibility_timeout));
                        topics.subscribe(topic, queue.clone());
                        Ok(queue)
                    }
                    #[cfg(feature = "redis")]
                    QueueSource::Redis { url } => {
                        use annoflow_infra::event_bus::redis_streams::stream_key;
                        use annoflow_infra::event_bus::{RedisStreamsQueue, DEFAULT_STREAM_PREFIX};

                        let queue = RedisStreamsQueue::new(
                            url,
                            stream_key(DEFAULT_STREAM_PREFIX, topic),
                            stage,
                            visibility_timeout,
                        )?;
                        queue.ensure_group()?;
                        Ok(Arc::new(queue))
                    }
                }
            },
        )?;

        let cold = self.cold.clone();
        coordinator.attach(IntervalWorker::spawn("cold-storage", COLD_STORAGE_TICK, move || {
            let completed = cold.complete_due();
            if completed > 0 {
                info!(completed, "retrievals completed");
            }
        })?);

        Ok(coordinator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use annoflow_core::{JobId, ObjectLocation, UserId};
    use annoflow_infra::collaborators::{ArchivalOrchestrator, ArchiveRequest, ExecutionStatus};

    #[test]
    fn durable_archive_state_outlives_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CoordinatorConfig::default();
        config.storage.state_dir = dir.path().to_path_buf();
        let publisher: Arc<dyn Publisher> = Arc::new(InMemoryTopics::new());

        let archive_id = {
            let archive = ArchiveBackends::durable(&config, &publisher).unwrap();
            archive
                .orchestrator
                .start_execution(ArchiveRequest {
                    job_id: JobId::new("J1").unwrap(),
                    user_id: UserId::new("U1").unwrap(),
                    result_location: ObjectLocation::new("results", "U1/J1~a.annot.vcf").unwrap(),
                })
                .unwrap();
            archive
                .cold
                .storage()
                .upload_archive(&config.storage.vault, b"annotated", "J1")
                .unwrap()
        };

        let archive = ArchiveBackends::durable(&config, &publisher).unwrap();
        assert_eq!(archive.orchestrator.status("J1"), Some(ExecutionStatus::Running));
        assert!(archive
            .cold
            .storage()
            .archive_exists(&config.storage.vault, &archive_id)
            .unwrap());
    }
}
