//! Scheduler.
//!
//! Synchronizes cron-timer state with the schedule store and runs
//! schedules through the Schedule Executor. Built on `tokio_cron_scheduler`
//! rather than a hand-rolled timer loop.

use crate::config::{constants, AppConfig};
use crate::error::EngineError;
use crate::schedule_executor::ScheduleExecutor;
use crate::schedule_store::ScheduleStore;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

struct ActiveJob {
    job_id: uuid::Uuid,
    cron_expression: String,
}

/// Owns the output directory creation and the cron-job map. Reload and
/// manual-stop both go through `jobs`'s mutex so the two paths never
/// interleave.
pub struct Scheduler {
    config: Arc<AppConfig>,
    store: Arc<dyn ScheduleStore>,
    executor: Arc<ScheduleExecutor>,
    cron_scheduler: JobScheduler,
    jobs: Mutex<HashMap<String, ActiveJob>>,
    reload_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Scheduler {
    pub async fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn ScheduleStore>,
        executor: Arc<ScheduleExecutor>,
    ) -> Result<Arc<Self>, EngineError> {
        tokio::fs::create_dir_all(&config.output_dir).await?;

        let cron_scheduler = JobScheduler::new()
            .await
            .map_err(|err| EngineError::ConfigurationError(format!("failed to start cron scheduler: {err}")))?;
        cron_scheduler
            .start()
            .await
            .map_err(|err| EngineError::ConfigurationError(format!("failed to start cron scheduler: {err}")))?;

        Ok(Arc::new(Self {
            config,
            store,
            executor,
            cron_scheduler,
            jobs: Mutex::new(HashMap::new()),
            reload_handle: Mutex::new(None),
        }))
    }

    /// Immediate reload, then repeat on `SCHEDULER_RELOAD_INTERVAL_MS`.
    pub async fn start(self: &Arc<Self>) {
        self.reload().await;

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(constants::SCHEDULER_RELOAD_INTERVAL_MS));
            interval.tick().await; // first tick fires immediately; already reloaded above
            loop {
                interval.tick().await;
                this.reload().await;
            }
        });
        *self.reload_handle.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.reload_handle.lock().await.take() {
            handle.abort();
        }
        let mut jobs = self.jobs.lock().await;
        for (_, active) in jobs.drain() {
            let _ = self.cron_scheduler.remove(&active.job_id).await;
        }
        let _ = self.cron_scheduler.shutdown().await;
    }

    /// Upsert-prune: re-registers every enabled schedule whose cron job
    /// isn't already current, then removes jobs for schedules that
    /// disappeared or were disabled since the last reload.
    async fn reload(self: &Arc<Self>) {
        let schedules = match self.store.list().await {
            Ok(s) => s,
            Err(err) => {
                error!("scheduler reload: failed to load schedules: {err}");
                return;
            }
        };

        let mut jobs = self.jobs.lock().await;
        let mut active_ids = std::collections::HashSet::new();

        for schedule in &schedules {
            if !schedule.enabled {
                if let Some(active) = jobs.remove(&schedule.id) {
                    let _ = self.cron_scheduler.remove(&active.job_id).await;
                }
                continue;
            }

            if cron::Schedule::from_str(&normalize_cron(&schedule.cron)).is_err() {
                warn!("schedule '{}' ({}) has invalid cron '{}', skipping", schedule.name, schedule.id, schedule.cron);
                continue;
            }

            if let Some(active) = jobs.remove(&schedule.id) {
                let _ = self.cron_scheduler.remove(&active.job_id).await;
            }

            let executor = self.executor.clone();
            let schedule_for_job = schedule.clone();
            let enabled_count = schedules.iter().filter(|s| s.enabled).count();

            let normalized_cron = normalize_cron(&schedule.cron);
            let job = match Job::new_async(normalized_cron.as_str(), move |_uuid, _lock| {
                let executor = executor.clone();
                let schedule_for_job = schedule_for_job.clone();
                Box::pin(async move {
                    // Errors are logged and swallowed so a failing run never
                    // disables the timer.
                    if let Err(err) = executor.run(&schedule_for_job, enabled_count).await {
                        error!("scheduled run for '{}' failed: {err}", schedule_for_job.name);
                    }
                })
            }) {
                Ok(job) => job,
                Err(err) => {
                    warn!("schedule '{}' ({}) could not be scheduled: {err}", schedule.name, schedule.id);
                    continue;
                }
            };

            match self.cron_scheduler.add(job).await {
                Ok(job_id) => {
                    active_ids.insert(schedule.id.clone());
                    jobs.insert(schedule.id.clone(), ActiveJob { job_id, cron_expression: schedule.cron.clone() });
                }
                Err(err) => {
                    warn!("failed to register job for schedule '{}': {err}", schedule.name);
                }
            }
        }

        let stale_ids: Vec<String> = jobs.keys().filter(|id| !active_ids.contains(*id)).cloned().collect();
        for id in stale_ids {
            if let Some(active) = jobs.remove(&id) {
                let _ = self.cron_scheduler.remove(&active.job_id).await;
            }
        }

        info!("scheduler reload complete: {} active job(s)", jobs.len());
    }

    /// Runs a schedule immediately, regardless of `enabled`.
    pub async fn execute_now(&self, id: &str) -> Result<std::path::PathBuf, EngineError> {
        let schedule = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| EngineError::ScheduleNotFound(id.to_string()))?;

        let enabled_count = self.store.list().await?.iter().filter(|s| s.enabled).count().max(1);
        self.executor.run(&schedule, enabled_count).await
    }

    /// Current cron expression for a schedule's active job, if any —
    /// exposed for diagnostics.
    pub async fn active_cron_expression(&self, id: &str) -> Option<String> {
        self.jobs.lock().await.get(id).map(|j| j.cron_expression.clone())
    }
}

/// The `cron` crate requires a leading seconds field; schedules are allowed
/// to use the standard 5-field form without one. A bare 5-field expression
/// gets `0 ` prepended so both forms validate identically.
pub fn normalize_cron(expr: &str) -> String {
    let field_count = expr.split_whitespace().count();
    if field_count == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_cron_is_valid() {
        assert!(cron::Schedule::from_str(&normalize_cron("* * * * *")).is_ok());
    }

    #[test]
    fn six_field_cron_with_seconds_is_valid() {
        assert!(cron::Schedule::from_str(&normalize_cron("0 * * * * *")).is_ok());
    }

    #[test]
    fn malformed_cron_is_rejected() {
        assert!(cron::Schedule::from_str(&normalize_cron("not a cron")).is_err());
    }

    #[test]
    fn five_field_expression_gets_seconds_field_prepended() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron("0 * * * * *"), "0 * * * * *");
    }
}
