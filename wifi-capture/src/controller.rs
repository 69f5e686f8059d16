use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use wifi_capture_schemas::models::{
    ActionOutcome, Band, BandChannelConfig, CaptureStatusReport, DiagnoseReport, FileSplitConfig,
    InterfaceMapping, SnifferEvent, TimeInfo, WifiReloadReport,
};
use wifi_capture_schemas::settings::SnifferSettings;
use crate::capture::CaptureManager;
use crate::channels::ChannelConfigurator;
use crate::diagnostics::Diagnostics;
use crate::events::EventPublisher;
use crate::interfaces::InterfaceResolver;
use crate::remote::{RemoteExecutor, SshPool};
use crate::retrieval::FileRetriever;
use crate::timesync::TimeSyncEstimator;

/// The one facade a front end talks to. Owns the transport pool and every
/// capture component, and exposes the full operation surface as plain async
/// methods so a web or CLI layer stays a thin translation.
pub struct SnifferController {
    pool: Option<Arc<SshPool>>,
    resolver: Arc<InterfaceResolver>,
    timesync: Arc<TimeSyncEstimator>,
    diagnostics: Diagnostics,
    capture: CaptureManager,
    channels: ChannelConfigurator,
    events: EventPublisher,
}

impl SnifferController {
    /// Build a controller with a real ssh pool to the router in `settings`.
    pub fn new(settings: SnifferSettings) -> anyhow::Result<Self> {
        let events = EventPublisher::new();
        let pool = Arc::new(SshPool::new(settings.clone(), events.clone())?);
        let executor: Arc<dyn RemoteExecutor> = pool.clone();
        let mut controller = Self::from_parts(executor, settings, events);
        controller.pool = Some(pool);
        Ok(controller)
    }

    /// Assemble the components over any executor. Tests inject a scripted one.
    pub fn from_parts(
        executor: Arc<dyn RemoteExecutor>,
        settings: SnifferSettings,
        events: EventPublisher,
    ) -> Self {
        let resolver = Arc::new(InterfaceResolver::new(
            executor.clone(),
            settings.clone(),
            events.clone(),
        ));
        let timesync = Arc::new(TimeSyncEstimator::new(executor.clone(), events.clone()));
        let retriever = FileRetriever::new(executor.clone(), settings.clone());
        let diagnostics = Diagnostics::new(executor.clone(), settings.clone());
        let channels = ChannelConfigurator::new(
            executor.clone(),
            resolver.clone(),
            settings.clone(),
            events.clone(),
        );
        let capture = CaptureManager::new(
            executor,
            resolver.clone(),
            retriever,
            timesync.clone(),
            settings,
            events.clone(),
        );
        Self {
            pool: None,
            resolver,
            timesync,
            diagnostics,
            capture,
            channels,
            events,
        }
    }

    /// Verify the router is reachable and clear out anything a previous run
    /// left behind. Call once at startup, failures are reported not fatal.
    pub async fn startup(&self) -> ActionOutcome {
        if let Some(pool) = &self.pool {
            if !pool.health_check().await {
                let reason = pool
                    .last_error()
                    .await
                    .unwrap_or_else(|| "router not reachable".to_string());
                tracing::warn!("startup health check failed: {reason}");
                return ActionOutcome::failed(reason);
            }
        }
        self.capture.cleanup_remote().await
    }

    /// Best effort teardown, stops running captures and closes the pool.
    pub async fn shutdown(&self) {
        let results = self.capture.stop_all().await;
        for (band, outcome) in results {
            if !outcome.success {
                tracing::warn!("shutdown stop of {band} failed: {}", outcome.message);
            }
        }
        if let Some(pool) = &self.pool {
            pool.shutdown().await;
        }
    }

    pub async fn start_capture(&self, band: Band) -> ActionOutcome {
        self.capture.start(band).await
    }

    pub async fn stop_capture(&self, band: Band) -> ActionOutcome {
        self.capture.stop(band).await
    }

    pub async fn start_all(&self) -> BTreeMap<Band, ActionOutcome> {
        self.capture.start_all().await
    }

    pub async fn stop_all(&self) -> BTreeMap<Band, ActionOutcome> {
        self.capture.stop_all().await
    }

    pub async fn get_status(&self, band: Band) -> CaptureStatusReport {
        self.capture.status(band).await
    }

    pub async fn get_all_status(&self) -> BTreeMap<Band, CaptureStatusReport> {
        self.capture.status_all().await
    }

    /// The current band to interface mapping, detected lazily and cached.
    pub async fn get_interface_mapping(&self) -> InterfaceMapping {
        self.resolver.resolve(false).await
    }

    /// Force a fresh detection pass, bypassing the cache.
    pub async fn detect_interfaces(&self) -> InterfaceMapping {
        self.resolver.resolve(true).await
    }

    pub async fn get_time_info(&self) -> TimeInfo {
        self.timesync.time_info().await
    }

    pub async fn sync_time(&self) -> ActionOutcome {
        match self.timesync.sync().await {
            Ok(message) => ActionOutcome::ok(message),
            Err(err) => ActionOutcome::failed(format!("{err:#}")),
        }
    }

    pub async fn get_file_split(&self) -> FileSplitConfig {
        self.capture.get_split().await
    }

    pub async fn set_file_split(&self, enabled: bool, size_mb: u64) -> ActionOutcome {
        self.capture.set_split(enabled, size_mb).await
    }

    pub async fn diagnose(&self) -> DiagnoseReport {
        self.diagnostics.diagnose().await
    }

    /// Kill orphaned remote captures and delete their output files.
    pub async fn cleanup_remote(&self) -> ActionOutcome {
        self.capture.cleanup_remote().await
    }

    /// The channel plan, optionally refreshed from the router's UCI state.
    pub async fn get_channel_config(&self, refresh: bool) -> BTreeMap<Band, BandChannelConfig> {
        self.channels.get_config(refresh).await
    }

    /// Update the local channel plan for one band, applied later.
    pub async fn set_channel_config(
        &self,
        band: Band,
        channel: u32,
        htmode: Option<String>,
    ) -> ActionOutcome {
        self.channels.set_config(band, channel, htmode).await
    }

    /// Write one band's plan to the router without committing or reloading.
    pub async fn apply_channel_config(&self, band: Band) -> ActionOutcome {
        self.channels.apply(band).await
    }

    /// Push the whole channel plan and reload the wifi stack. Refused while
    /// any capture is running, the reload tears every interface down.
    pub async fn apply_all_and_reload(&self) -> WifiReloadReport {
        if self.capture.any_running() {
            return WifiReloadReport {
                success: false,
                messages: vec![
                    "cannot reload wifi while a capture is running, stop all captures first"
                        .to_string(),
                ],
                bands: BTreeMap::new(),
            };
        }
        self.channels.apply_all_and_reload().await
    }

    /// Subscribe to state change notifications. Every subscriber sees every
    /// event from the point of subscription, lagging subscribers drop oldest.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SnifferEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::ScriptedExecutor;

    fn controller_with(executor: Arc<ScriptedExecutor>) -> (SnifferController, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let settings = SnifferSettings {
            download_dir: dir.path().to_path_buf(),
            auto_sync_time: false,
            ..SnifferSettings::default()
        };
        (
            SnifferController::from_parts(executor, settings, EventPublisher::new()),
            dir,
        )
    }

    #[tokio::test]
    async fn test_capture_round_trip_through_facade() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond("tcpdump -i", "TCPDUMP_STARTED");
        executor.respond("ls -1 /tmp/2G.pcap*", "/tmp/2G.pcap\n");
        executor.respond("cat /tmp/2G.pcap", "bytes");
        let (controller, _dir) = controller_with(executor);
        assert!(controller.start_capture(Band::Band2G).await.success);
        assert!(controller.get_status(Band::Band2G).await.running);
        let stop = controller.stop_capture(Band::Band2G).await;
        assert!(stop.success, "{}", stop.message);
        assert!(stop.local_path.is_some());
    }

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond("tcpdump -i", "TCPDUMP_STARTED");
        let (controller, _dir) = controller_with(executor);
        let mut rx = controller.subscribe_events();
        assert!(controller.start_capture(Band::Band5G).await.success);
        let event = rx.recv().await.unwrap();
        match event {
            SnifferEvent::CaptureStarted { band, .. } => assert_eq!(band, Band::Band5G),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_startup_without_pool_cleans_router() {
        let executor = Arc::new(ScriptedExecutor::new());
        let (controller, _dir) = controller_with(executor.clone());
        let outcome = controller.startup().await;
        assert!(outcome.success);
        assert_eq!(executor.calls_matching("killall tcpdump"), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_running_captures() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond("tcpdump -i", "TCPDUMP_STARTED");
        let (controller, _dir) = controller_with(executor.clone());
        assert!(controller.start_capture(Band::Band6G).await.success);
        controller.shutdown().await;
        assert!(!controller.get_status(Band::Band6G).await.running);
    }

    #[tokio::test]
    async fn test_channel_plan_flows_through_facade() {
        let executor = Arc::new(ScriptedExecutor::new());
        let (controller, _dir) = controller_with(executor);
        assert!(
            controller
                .set_channel_config(Band::Band5G, 149, Some("EHT80".to_string()))
                .await
                .success
        );
        let plan = controller.get_channel_config(false).await;
        assert_eq!(plan[&Band::Band5G].channel, 149);
        assert_eq!(plan[&Band::Band5G].htmode, "EHT80");
    }

    #[tokio::test]
    async fn test_wifi_reload_refused_while_capturing() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond("tcpdump -i", "TCPDUMP_STARTED");
        let (controller, _dir) = controller_with(executor.clone());
        assert!(controller.start_capture(Band::Band2G).await.success);
        let report = controller.apply_all_and_reload().await;
        assert!(!report.success);
        assert!(report.messages[0].contains("stop all captures"));
        // nothing reached the router
        assert_eq!(executor.calls_matching("uci set"), 0);
        assert_eq!(executor.calls_matching("uci commit"), 0);
    }

    #[tokio::test]
    async fn test_split_config_flows_to_capture_commands() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond("tcpdump -i", "TCPDUMP_STARTED");
        let (controller, _dir) = controller_with(executor.clone());
        assert!(controller.set_file_split(true, 500).await.success);
        assert_eq!(controller.get_file_split().await.size_mb, 500);
        assert!(controller.start_capture(Band::Band2G).await.success);
        let start_call = executor
            .calls()
            .into_iter()
            .find(|c| c.contains("tcpdump -i"))
            .unwrap();
        assert!(start_call.contains("-C 500"));
    }
}
