use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::repositories::{
    NewRun, RepositoryError, RepositoryResult, RunPatch, RunRecord, RunRepository, collect_pages,
};

const RUNS_PAGE_SIZE: u32 = 100;
const MAX_RUN_PAGES: u32 = 10;

/// Client-side cache of agent runs.
///
/// Loads fail soft; mutations surface their error and reload on success.
pub struct RunsStore {
    repository: Arc<dyn RunRepository>,
    runs: Mutex<Vec<RunRecord>>,
}

impl RunsStore {
    pub fn new(repository: Arc<dyn RunRepository>) -> Self {
        Self {
            repository,
            runs: Mutex::new(Vec::new()),
        }
    }

    /// Built-in list shown when the backend is unavailable
    fn fallback_runs() -> Vec<RunRecord> {
        Vec::new()
    }

    pub async fn load_runs(&self) {
        let repository = self.repository.clone();
        match collect_pages(RUNS_PAGE_SIZE, MAX_RUN_PAGES, |q| repository.list_runs(q)).await {
            Ok(runs) => {
                info!(count = runs.len(), "Runs loaded");
                *self.runs.lock() = runs;
            }
            Err(RepositoryError::Unavailable) => {
                warn!("Run storage unavailable, using fallback list");
                *self.runs.lock() = Self::fallback_runs();
            }
            Err(e) => {
                warn!(error = ?e, "Failed to load runs, keeping previous list");
            }
        }
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.runs.lock().clone()
    }

    pub fn get_run_by_id(&self, id: &str) -> Option<RunRecord> {
        self.runs.lock().iter().find(|r| r.id == id).cloned()
    }

    pub async fn create_run(&self, run: NewRun) -> RepositoryResult<RunRecord> {
        let created = self.repository.create_run(run).await?;
        debug!(run_id = %created.id, "Run created");
        self.load_runs().await;
        Ok(created)
    }

    pub async fn update_run(&self, id: &str, patch: RunPatch) -> RepositoryResult<RunRecord> {
        let updated = self.repository.update_run(id, patch).await?;
        debug!(run_id = %id, status = %updated.status, "Run updated");
        self.load_runs().await;
        Ok(updated)
    }

    pub async fn delete_run(&self, id: &str) -> RepositoryResult<()> {
        self.repository.delete_run(id).await?;
        debug!(run_id = %id, "Run deleted");
        self.load_runs().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::{Failure, InMemoryRemoteStore, Operation};

    fn new_run(title: &str) -> NewRun {
        NewRun {
            conversation_id: Some("c1".into()),
            title: title.into(),
            status: "running".into(),
        }
    }

    fn store() -> (InMemoryRemoteStore, RunsStore) {
        let remote = InMemoryRemoteStore::new();
        let runs = RunsStore::new(Arc::new(remote.clone()));
        (remote, runs)
    }

    #[tokio::test]
    async fn test_create_reloads_list() {
        let (remote, runs) = store();
        let created = runs.create_run(new_run("Deploy")).await.unwrap();
        assert_eq!(remote.call_count(Operation::ListRuns), 1);
        assert_eq!(runs.get_run_by_id(&created.id).unwrap().title, "Deploy");
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let (_remote, runs) = store();
        let created = runs.create_run(new_run("Deploy")).await.unwrap();
        runs.update_run(
            &created.id,
            RunPatch {
                status: Some("completed".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(runs.get_run_by_id(&created.id).unwrap().status, "completed");

        runs.delete_run(&created.id).await.unwrap();
        assert!(runs.get_run_by_id(&created.id).is_none());
        assert!(runs.delete_run(&created.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_load_unavailable_falls_back() {
        let (remote, runs) = store();
        runs.create_run(new_run("Deploy")).await.unwrap();
        assert_eq!(runs.runs().len(), 1);

        remote.fail(Operation::ListRuns, Failure::Unavailable);
        runs.load_runs().await;
        assert!(runs.runs().is_empty());
    }

    #[tokio::test]
    async fn test_load_unauthorized_keeps_previous_list() {
        let (remote, runs) = store();
        runs.create_run(new_run("Deploy")).await.unwrap();

        remote.fail(Operation::ListRuns, Failure::Unauthorized);
        runs.load_runs().await;
        assert_eq!(runs.runs().len(), 1);
    }

    #[tokio::test]
    async fn test_mutation_errors_are_surfaced() {
        let (remote, runs) = store();
        remote.fail(Operation::CreateRun, Failure::Unavailable);
        assert!(runs.create_run(new_run("x")).await.unwrap_err().is_unavailable());

        remote.fail(Operation::CreateRun, Failure::Unauthorized);
        let err = runs.create_run(new_run("x")).await.unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(err.to_string(), "Please sign in to save and load conversations");
        assert_eq!(remote.call_count(Operation::ListRuns), 0);
    }
}
