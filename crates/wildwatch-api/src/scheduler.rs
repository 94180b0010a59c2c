//! Periodic reconciliation of configured (or all cached) forms.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use wildwatch_core::config::SyncSettings;
use wildwatch_core::services::DatabaseService;
use wildwatch_core::sync::{SyncCoordinator, SyncMode};
use wildwatch_core::Error;

pub struct SyncScheduler {
    coordinator: Arc<SyncCoordinator>,
    db: DatabaseService,
    forms: Vec<String>,
}

impl SyncScheduler {
    pub const fn new(
        coordinator: Arc<SyncCoordinator>,
        db: DatabaseService,
        forms: Vec<String>,
    ) -> Self {
        Self {
            coordinator,
            db,
            forms,
        }
    }

    /// Start the loop; `None` when scheduled runs are disabled.
    pub fn spawn(self, settings: &SyncSettings, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let interval = settings.interval?;
        Some(tokio::spawn(async move { self.run(interval, cancel).await }))
    }

    async fn run(self, period: Duration, cancel: CancellationToken) {
        tracing::info!(interval_secs = period.as_secs(), "Sync scheduler started");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick(&cancel).await,
            }
        }
        tracing::info!("Sync scheduler stopped");
    }

    async fn tick(&self, cancel: &CancellationToken) {
        let forms = match self.targets().await {
            Ok(forms) => forms,
            Err(error) => {
                tracing::warn!("Scheduler could not list forms: {error}");
                return;
            }
        };

        for form_id in forms {
            if cancel.is_cancelled() {
                return;
            }
            // Other failures are logged and recorded by the coordinator
            if let Err(Error::SyncInProgress(_)) = self
                .coordinator
                .run(&form_id, SyncMode::Incremental, cancel)
                .await
            {
                tracing::debug!(form_id, "Skipping scheduled sync, run already in progress");
            }
        }
    }

    async fn targets(&self) -> wildwatch_core::Result<Vec<String>> {
        if !self.forms.is_empty() {
            return Ok(self.forms.clone());
        }
        Ok(self
            .db
            .list_forms()
            .await?
            .into_iter()
            .map(|form| form.form_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::Value;
    use wildwatch_core::kobo::{FormGateway, GatewayResult, KoboUser, RemotePage};
    use wildwatch_core::models::PullPhase;
    use wildwatch_core::sync::SyncOptions;
    use wildwatch_core::Submission;

    use super::*;

    #[derive(Default)]
    struct CountingKobo {
        fetches: AtomicU32,
    }

    #[async_trait]
    impl FormGateway for CountingKobo {
        async fn list_forms(&self) -> GatewayResult<Vec<Value>> {
            Ok(Vec::new())
        }

        async fn get_form(&self, _form_id: &str) -> GatewayResult<Option<Value>> {
            Ok(None)
        }

        async fn fetch_submissions(
            &self,
            _form_id: &str,
            _phase: PullPhase,
            _since_millis: i64,
            _start: u32,
            _limit: u32,
        ) -> GatewayResult<RemotePage> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(RemotePage::default())
        }

        async fn push_submission(&self, _submission: &Submission) -> GatewayResult<i64> {
            Ok(1)
        }

        async fn current_user(&self) -> GatewayResult<KoboUser> {
            Ok(KoboUser {
                username: "u".into(),
                email: None,
            })
        }
    }

    async fn scheduler(forms: Vec<String>) -> (SyncScheduler, Arc<CountingKobo>, Arc<SyncCoordinator>) {
        let db = DatabaseService::open_in_memory().await.unwrap();
        let kobo = Arc::new(CountingKobo::default());
        let coordinator = Arc::new(SyncCoordinator::new(
            kobo.clone(),
            Arc::new(db.clone()),
            SyncOptions::default(),
        ));
        (
            SyncScheduler::new(coordinator.clone(), db, forms),
            kobo,
            coordinator,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tick_runs_configured_forms_and_skips_busy_ones() {
        let (scheduler, kobo, coordinator) =
            scheduler(vec!["aOne".to_string(), "aTwo".to_string()]).await;
        let _busy = coordinator.acquire("aTwo").unwrap();

        scheduler.tick(&CancellationToken::new()).await;
        // One empty page per pull phase, for `aOne` only
        assert_eq!(kobo.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disabled_interval_spawns_nothing() {
        let (scheduler, _, _) = scheduler(Vec::new()).await;
        let settings = SyncSettings {
            interval: None,
            ..SyncSettings::default()
        };
        assert!(scheduler.spawn(&settings, CancellationToken::new()).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn loop_stops_on_cancel() {
        let (scheduler, _, _) = scheduler(Vec::new()).await;
        let settings = SyncSettings {
            interval: Some(Duration::from_secs(3600)),
            ..SyncSettings::default()
        };
        let cancel = CancellationToken::new();
        let handle = scheduler.spawn(&settings, cancel.clone()).unwrap();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
