use std::error::Error as _;
use std::sync::Arc;

use tracing::error;

use crate::db::Store;
use crate::error::{AppError, Result};
use crate::types::{now_ns, Layer, RunStatus, ScrapeRun, TriggerOrigin};

/// Final tallies copied onto the audit record when a run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub items_found: i64,
    pub items_created: i64,
    pub items_updated: i64,
    pub error_count: i64,
}

/// Owns one `ScrapeRun` audit record and persists every transition.
///
/// Transitions follow `started → in_progress → {completed | failed | cancelled}`
/// and are refused otherwise, so readers never see a run go backwards.
pub struct RunRecorder {
    store: Arc<dyn Store>,
    run: ScrapeRun,
}

impl RunRecorder {
    pub async fn start(
        store: Arc<dyn Store>,
        source: &str,
        layer: Layer,
        trigger: TriggerOrigin,
        proxy_used: Option<String>,
    ) -> Result<Self> {
        let mut run = ScrapeRun {
            id: 0,
            source: source.to_string(),
            layer,
            trigger,
            status: RunStatus::Started,
            started_at_ns: now_ns(),
            finished_at_ns: None,
            duration_ms: None,
            items_found: 0,
            items_created: 0,
            items_updated: 0,
            error_count: 0,
            error_message: None,
            error_context: None,
            proxy_used,
        };
        run.id = store.insert_run(&run).await?;
        Ok(Self { store, run })
    }

    pub fn run(&self) -> &ScrapeRun {
        &self.run
    }

    fn advance(&mut self, next: RunStatus) -> Result<()> {
        if !self.run.status.can_transition_to(next) {
            return Err(AppError::Store(format!(
                "run {} cannot move from {} to {}",
                self.run.id, self.run.status, next
            )));
        }
        self.run.status = next;
        Ok(())
    }

    pub async fn in_progress(&mut self) -> Result<()> {
        self.advance(RunStatus::InProgress)?;
        self.store.update_run(&self.run).await
    }

    pub async fn complete(self, counts: RunCounts) -> Result<ScrapeRun> {
        self.finish(RunStatus::Completed, counts, None).await
    }

    /// `phase` names the step that failed; the error's source chain is kept with it.
    pub async fn fail(self, counts: RunCounts, err: &AppError, phase: &str) -> Result<ScrapeRun> {
        self.finish(RunStatus::Failed, counts, Some((err.to_string(), error_context(err, phase))))
            .await
    }

    pub async fn cancel(self, counts: RunCounts) -> Result<ScrapeRun> {
        self.finish(RunStatus::Cancelled, counts, None).await
    }

    async fn finish(
        mut self,
        status: RunStatus,
        counts: RunCounts,
        failure: Option<(String, String)>,
    ) -> Result<ScrapeRun> {
        self.advance(status)?;
        let finished = now_ns();
        self.run.finished_at_ns = Some(finished);
        self.run.duration_ms = Some((finished - self.run.started_at_ns).max(0) as f64 / 1e6);
        self.run.items_found = counts.items_found;
        self.run.items_created = counts.items_created;
        self.run.items_updated = counts.items_updated;
        self.run.error_count = counts.error_count;
        if let Some((message, context)) = failure {
            self.run.error_message = Some(message);
            self.run.error_context = Some(context);
        }
        if let Err(e) = self.store.update_run(&self.run).await {
            error!(run_id = self.run.id, status = %status, "Failed to persist run result: {e}");
            return Err(e);
        }
        Ok(self.run)
    }
}

fn error_context(err: &AppError, phase: &str) -> String {
    let mut context = format!("phase={phase}; {err:?}");
    let mut source = err.source();
    while let Some(cause) = source {
        context.push_str(&format!("; caused by: {cause}"));
        source = cause.source();
    }
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::error::CollectError;

    async fn recorder(store: &Arc<MemoryStore>) -> RunRecorder {
        RunRecorder::start(store.clone(), "shop", Layer::Seed, TriggerOrigin::Manual, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn completed_run_carries_counts() {
        let store = MemoryStore::new();
        let mut rec = recorder(&store).await;
        let id = rec.run().id;
        assert_eq!(store.get_run(id).await.unwrap().unwrap().status, RunStatus::Started);

        rec.in_progress().await.unwrap();
        assert_eq!(store.get_run(id).await.unwrap().unwrap().status, RunStatus::InProgress);

        let counts = RunCounts { items_found: 10, items_created: 8, items_updated: 0, error_count: 2 };
        let run = rec.complete(counts).await.unwrap();
        let stored = store.get_run(id).await.unwrap().unwrap();
        assert_eq!(stored, run);
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.items_created, 8);
        assert_eq!(stored.error_count, 2);
        assert!(stored.finished_at_ns.is_some());
        assert_eq!(stored.trigger, TriggerOrigin::Manual);
    }

    #[tokio::test]
    async fn failed_run_keeps_error_and_phase() {
        let store = MemoryStore::new();
        let mut rec = recorder(&store).await;
        rec.in_progress().await.unwrap();
        let err = AppError::Collect(CollectError::Blocked { status: 403 });
        let run = rec.fail(RunCounts::default(), &err, "discover").await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error_message.unwrap().contains("HTTP 403"));
        let ctx = run.error_context.unwrap();
        assert!(ctx.starts_with("phase=discover"));
        assert!(ctx.contains("caused by: blocked by source"));
    }

    #[tokio::test]
    async fn completion_requires_in_progress() {
        let store = MemoryStore::new();
        let rec = recorder(&store).await;
        let id = rec.run().id;
        assert!(rec.complete(RunCounts::default()).await.is_err());
        assert_eq!(store.get_run(id).await.unwrap().unwrap().status, RunStatus::Started);
    }

    #[tokio::test]
    async fn setup_failure_fails_straight_from_started() {
        let store = MemoryStore::new();
        let rec = recorder(&store).await;
        let err = AppError::Config("no collector".into());
        let run = rec.fail(RunCounts::default(), &err, "setup").await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
    }
}
