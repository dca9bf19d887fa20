pub mod indexing;
pub mod wiki;

use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use shadow_core::TaskId;
use shadow_provider::ProviderClient;
use tracing::{error, info};

use crate::config::ShadowConfig;
use crate::repo_lock::RepoLock;
use crate::store::Store;

pub use indexing::{EmbeddingProvider, InMemoryVectorIndex, OllamaEmbedder};

/// Status of one background job, exactly as spec §4.10 names the fields.
#[derive(Debug, Clone, Default)]
pub struct JobStatus {
    pub started: bool,
    pub completed: bool,
    pub failed: bool,
    pub blocking: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct TaskJobs {
    indexing: JobStatus,
    wiki: JobStatus,
}

/// Spawns and tracks the indexing and wiki jobs for each task's first
/// initialization. Neither job ever fails the task itself — failures are
/// recorded on the `JobStatus` and logged (spec §4.10's "failures are
/// recorded but never propagate as task failure").
pub struct BackgroundServiceManager {
    store: Arc<dyn Store>,
    repo_lock: Arc<dyn RepoLock>,
    config: Arc<ShadowConfig>,
    embedder: Arc<dyn EmbeddingProvider>,
    provider: Arc<dyn ProviderClient>,
    jobs: Mutex<std::collections::HashMap<TaskId, TaskJobs>>,
    index: Mutex<std::collections::HashMap<String, Arc<InMemoryVectorIndex>>>,
}

impl BackgroundServiceManager {
    pub fn new(
        store: Arc<dyn Store>,
        repo_lock: Arc<dyn RepoLock>,
        config: Arc<ShadowConfig>,
        embedder: Arc<dyn EmbeddingProvider>,
        provider: Arc<dyn ProviderClient>,
    ) -> Self {
        Self {
            store,
            repo_lock,
            config,
            embedder,
            provider,
            jobs: Mutex::new(std::collections::HashMap::new()),
            index: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn set_job(&self, task_id: TaskId, f: impl FnOnce(&mut TaskJobs)) {
        let mut jobs = self.jobs.lock().unwrap();
        f(jobs.entry(task_id).or_default());
    }

    pub fn indexing_status(&self, task_id: TaskId) -> JobStatus {
        self.jobs.lock().unwrap().get(&task_id).cloned().unwrap_or_default().indexing
    }

    pub fn wiki_status(&self, task_id: TaskId) -> JobStatus {
        self.jobs.lock().unwrap().get(&task_id).cloned().unwrap_or_default().wiki
    }

    /// Runs the indexing job inline for a repository outside the per-task
    /// `spawn_for_task` lifecycle — the `/api/indexing/index` HTTP surface's
    /// direct-trigger entry point (spec §6). Blocks the caller until the
    /// job finishes; replaces any existing namespace for the repo.
    pub async fn index_namespace(
        self: &Arc<Self>,
        repo_full_name: String,
        workspace_root: std::path::PathBuf,
    ) -> Result<(), crate::error::DaemonError> {
        let index = indexing::IndexingJob::run(
            &workspace_root,
            &repo_full_name,
            self.repo_lock.as_ref(),
            self.embedder.as_ref(),
        )
        .await?;
        self.index.lock().unwrap().insert(repo_full_name, Arc::new(index));
        Ok(())
    }

    /// Drops a repository's indexed namespace. Returns whether one existed.
    /// `codebase_search` reverts to its plain-scan fallback for that repo
    /// until the next `index_namespace` or `spawn_for_task` call completes.
    pub fn clear_namespace(&self, repo_full_name: &str) -> bool {
        self.index.lock().unwrap().remove(repo_full_name).is_some()
    }

    /// Returns the semantic index populated for a repository, once the
    /// indexing job has completed. `codebase_search` falls back to a plain
    /// scan while this is `None` (spec §4.6's graceful degradation note).
    pub fn semantic_index(&self, repo_full_name: &str) -> Option<Arc<InMemoryVectorIndex>> {
        self.index.lock().unwrap().get(repo_full_name).cloned()
    }

    /// Spawns both jobs for a freshly-initialized task. The wiki job is
    /// marked non-blocking; the indexing job is marked non-blocking too
    /// once `codebase_search`'s scan fallback made a hard block unnecessary
    /// — both run to completion independently of variant readiness.
    pub fn spawn_for_task(self: &Arc<Self>, task_id: TaskId, repo_full_name: String, workspace_root: std::path::PathBuf) {
        self.set_job(task_id, |jobs| {
            jobs.indexing = JobStatus { started: true, blocking: false, ..Default::default() };
            jobs.wiki = JobStatus { started: true, blocking: false, ..Default::default() };
        });

        let this = Arc::clone(self);
        let repo = repo_full_name.clone();
        let root = workspace_root.clone();
        tokio::spawn(async move {
            match indexing::IndexingJob::run(&root, &repo, this.repo_lock.as_ref(), this.embedder.as_ref()).await {
                Ok(index) => {
                    this.index.lock().unwrap().insert(repo.clone(), Arc::new(index));
                    this.set_job(task_id, |jobs| jobs.indexing.completed = true);
                    info!(%task_id, repo = %repo, "indexing job completed");
                }
                Err(err) => {
                    error!(%task_id, repo = %repo, error = %err, "indexing job failed");
                    this.set_job(task_id, |jobs| {
                        jobs.indexing.failed = true;
                        jobs.indexing.error = Some(err.to_string());
                    });
                }
            }
        });

        let this = Arc::clone(self);
        let repo = repo_full_name;
        let root = workspace_root;
        let freshness = chrono::Duration::hours(self.config.wiki_freshness_hours);
        tokio::spawn(async move {
            match wiki::generate_if_stale(this.store.as_ref(), this.provider.as_ref(), &root, &repo, freshness).await {
                Ok(_) => {
                    this.set_job(task_id, |jobs| jobs.wiki.completed = true);
                    info!(%task_id, repo = %repo, "wiki job completed");
                }
                Err(err) => {
                    error!(%task_id, repo = %repo, error = %err, "wiki job failed");
                    this.set_job(task_id, |jobs| {
                        jobs.wiki.failed = true;
                        jobs.wiki.error = Some(err.to_string());
                    });
                }
            }
        });
    }
}

pub(crate) fn is_fresh(generated_at: DateTime<Utc>, freshness: chrono::Duration) -> bool {
    Utc::now().signed_duration_since(generated_at) < freshness
}
