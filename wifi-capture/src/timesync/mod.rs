use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use tokio::sync::RwLock;
use wifi_capture_schemas::models::{SnifferEvent, SyncState, TimeInfo};
use crate::events::EventPublisher;
use crate::remote::RemoteExecutor;

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const TIME_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Estimates the clock offset between this machine and the router, and can push
/// the local clock onto the router. Capture timestamps come from the router so
/// an unsynced clock makes artefacts hard to line up with other evidence.
pub struct TimeSyncEstimator {
    executor: Arc<dyn RemoteExecutor>,
    events: EventPublisher,
    last_sync: RwLock<Option<DateTime<Utc>>>,
}

impl TimeSyncEstimator {
    pub fn new(executor: Arc<dyn RemoteExecutor>, events: EventPublisher) -> Self {
        Self {
            executor,
            events,
            last_sync: RwLock::new(None),
        }
    }

    /// Signed seconds between local and remote clock (positive means the router
    /// is behind). None when the query fails, never a fabricated zero.
    pub async fn offset(&self) -> Option<f64> {
        let before = Local::now().naive_local();
        let result = self
            .executor
            .execute(&format!("date '+{DATE_FORMAT}'"), TIME_QUERY_TIMEOUT)
            .await
            .ok()?;
        let after = Local::now().naive_local();
        if !result.success() {
            return None;
        }
        let remote = NaiveDateTime::parse_from_str(result.stdout.trim(), DATE_FORMAT).ok()?;
        // sample the local clock around the round trip and use the midpoint
        let local = before + (after - before) / 2;
        Some((local - remote).num_milliseconds() as f64 / 1000.0)
    }

    /// Local and remote clock readings plus the offset classification.
    pub async fn time_info(&self) -> TimeInfo {
        let local_time = Local::now().format(DATE_FORMAT).to_string();
        let remote_result = self
            .executor
            .execute(&format!("date '+{DATE_FORMAT}'"), TIME_QUERY_TIMEOUT)
            .await;
        let remote_time = match &remote_result {
            Ok(result) if result.success() => {
                let trimmed = result.stdout.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            _ => None,
        };
        let offset_seconds = remote_time.as_ref().and_then(|remote| {
            let remote = NaiveDateTime::parse_from_str(remote, DATE_FORMAT).ok()?;
            Some((Local::now().naive_local() - remote).num_milliseconds() as f64 / 1000.0)
        });
        TimeInfo {
            local_time,
            remote_time,
            offset_seconds,
            state: SyncState::classify(offset_seconds),
            last_sync: *self.last_sync.read().await,
        }
    }

    /// Set the router clock to the local clock. Idempotent, safe to repeat,
    /// called automatically before the first capture and available manually.
    pub async fn sync(&self) -> anyhow::Result<String> {
        let offset_before = self.offset().await;
        if let Some(offset) = offset_before {
            tracing::info!("router clock offset before sync: {offset:.1}s");
        }
        let time_str = Local::now().format(DATE_FORMAT).to_string();
        self.executor
            .execute_checked(&format!("date -s \"{time_str}\""), TIME_QUERY_TIMEOUT)
            .await
            .map_err(|err| anyhow::anyhow!("setting router time failed: {err}"))?;
        *self.last_sync.write().await = Some(Utc::now());
        self.events.publish(SnifferEvent::TimeSynced {
            offset_seconds: offset_before,
        });
        Ok(format!("time synced: {time_str}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::ScriptedExecutor;
    use crate::remote::ExecutionError;

    fn estimator_with(executor: Arc<ScriptedExecutor>) -> TimeSyncEstimator {
        TimeSyncEstimator::new(executor, EventPublisher::new())
    }

    #[tokio::test]
    async fn test_offset_near_zero_for_matching_clocks() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond("date '+", &Local::now().format(DATE_FORMAT).to_string());
        let estimator = estimator_with(executor);
        let offset = estimator.offset().await.unwrap();
        assert!(offset.abs() < 2.0);
    }

    #[tokio::test]
    async fn test_failed_query_is_unknown_not_zero() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond_with(
            "date '+",
            Err(ExecutionError::Timeout(TIME_QUERY_TIMEOUT)),
        );
        let estimator = estimator_with(executor);
        assert!(estimator.offset().await.is_none());
        let info = estimator.time_info().await;
        assert!(info.offset_seconds.is_none());
        assert_eq!(info.state, SyncState::Unknown);
    }

    #[tokio::test]
    async fn test_sync_sets_remote_clock_and_records_timestamp() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond("date '+", &Local::now().format(DATE_FORMAT).to_string());
        let estimator = estimator_with(executor.clone());
        let message = estimator.sync().await.unwrap();
        assert!(message.starts_with("time synced:"));
        assert_eq!(executor.calls_matching("date -s"), 1);
        let info = estimator.time_info().await;
        assert!(info.last_sync.is_some());
    }

    #[tokio::test]
    async fn test_garbled_remote_time_is_unknown() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond("date '+", "not a date");
        let estimator = estimator_with(executor);
        assert!(estimator.offset().await.is_none());
    }
}
