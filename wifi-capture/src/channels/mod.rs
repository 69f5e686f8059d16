use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use strum::IntoEnumIterator;
use tokio::sync::RwLock;
use tokio::time::Instant;
use wifi_capture_schemas::models::{
    ActionOutcome, Band, BandChannelConfig, SnifferEvent, WifiReloadReport,
};
use wifi_capture_schemas::settings::SnifferSettings;
use crate::events::EventPublisher;
use crate::interfaces::InterfaceResolver;
use crate::remote::RemoteExecutor;

const UCI_TIMEOUT: Duration = Duration::from_secs(10);
const WIFI_LOAD_TIMEOUT: Duration = Duration::from_secs(60);
const RELOAD_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Manages the channel plan for the router's radios. Edits are held locally
/// until `apply` pushes them as UCI options, and nothing takes effect on air
/// until the wifi stack is reloaded. Reloading tears every interface down so
/// it must never run while a capture is up, the controller enforces that.
pub struct ChannelConfigurator {
    executor: Arc<dyn RemoteExecutor>,
    resolver: Arc<InterfaceResolver>,
    settings: SnifferSettings,
    events: EventPublisher,
    config: RwLock<BTreeMap<Band, BandChannelConfig>>,
}

impl ChannelConfigurator {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        resolver: Arc<InterfaceResolver>,
        settings: SnifferSettings,
        events: EventPublisher,
    ) -> Self {
        Self {
            executor,
            resolver,
            settings,
            events,
            config: RwLock::new(BandChannelConfig::defaults()),
        }
    }

    /// The channel plan as locally held. With `refresh` the router's actual
    /// UCI values are read first and folded in, bands whose query fails keep
    /// their local values.
    pub async fn get_config(&self, refresh: bool) -> BTreeMap<Band, BandChannelConfig> {
        if refresh {
            let radios = self.resolver.resolve(false).await.uci_radios;
            for band in Band::iter() {
                let radio = &radios[&band];
                let query = format!(
                    "uci get wireless.{radio}.channel 2>/dev/null; \
                     uci get wireless.{radio}.htmode 2>/dev/null"
                );
                match self.executor.execute(&query, UCI_TIMEOUT).await {
                    Ok(result) if result.success() => {
                        let mut lines = result.stdout.lines();
                        let channel = lines.next().and_then(|l| l.trim().parse::<u32>().ok());
                        let htmode = lines.next().map(|l| l.trim().to_string());
                        if let Some(channel) = channel.filter(|c| *c > 0) {
                            let mut config = self.config.write().await;
                            if let Some(entry) = config.get_mut(&band) {
                                entry.channel = channel;
                                if let Some(htmode) = htmode.filter(|h| !h.is_empty()) {
                                    entry.htmode = htmode;
                                }
                            }
                        }
                    }
                    _ => {
                        tracing::debug!("could not read channel config for {band}");
                    }
                }
            }
        }
        self.config.read().await.clone()
    }

    /// Update the local plan for one band. The router is untouched until the
    /// plan is applied.
    pub async fn set_config(
        &self,
        band: Band,
        channel: u32,
        htmode: Option<String>,
    ) -> ActionOutcome {
        if channel == 0 {
            return ActionOutcome::failed("channel must be a positive channel number".to_string());
        }
        let updated = {
            let mut config = self.config.write().await;
            let mut entry = config
                .get(&band)
                .cloned()
                .unwrap_or_else(|| BandChannelConfig {
                    channel,
                    htmode: "HT20".to_string(),
                });
            entry.channel = channel;
            if let Some(htmode) = htmode {
                entry.htmode = htmode;
            }
            config.insert(band, entry.clone());
            entry
        };
        self.events.publish(SnifferEvent::ChannelConfigChanged {
            band,
            config: updated.clone(),
        });
        ActionOutcome::ok(format!(
            "{band} plan updated: CH{} {}",
            updated.channel, updated.htmode
        ))
    }

    /// Write one band's plan to the router's UCI options. Uncommitted, a
    /// reload is what makes it live.
    pub async fn apply(&self, band: Band) -> ActionOutcome {
        let radios = self.resolver.resolve(false).await.uci_radios;
        let radio = radios[&band].clone();
        let plan = self.config.read().await[&band].clone();
        let commands = [
            format!("uci set wireless.{radio}.channel={}", plan.channel),
            format!("uci set wireless.{radio}.htmode={}", plan.htmode),
        ];
        for command in &commands {
            if let Err(err) = self.executor.execute_checked(command, UCI_TIMEOUT).await {
                return ActionOutcome::failed(format!("failed to run {command}: {err}"));
            }
            tracing::info!("applied uci option: {command}");
        }
        ActionOutcome::ok(format!(
            "{band} config set: CH{} {}",
            plan.channel, plan.htmode
        ))
    }

    /// Push the whole plan, commit it, and reload the wifi stack, then wait
    /// for the data interfaces to come back and re-detect the mapping. Any
    /// failed band aborts before the commit so the router never reloads into
    /// a half written plan.
    pub async fn apply_all_and_reload(&self) -> WifiReloadReport {
        let mut report = WifiReloadReport {
            success: true,
            ..WifiReloadReport::default()
        };
        for band in Band::iter() {
            let outcome = self.apply(band).await;
            report.messages.push(format!("{band}: {}", outcome.message));
            if !outcome.success {
                report.success = false;
            }
            report.bands.insert(band, outcome);
        }
        if !report.success {
            return report;
        }

        if let Err(err) = self
            .executor
            .execute_checked("uci commit wireless", UCI_TIMEOUT)
            .await
        {
            report.success = false;
            report.messages.push(format!("uci commit failed: {err}"));
            return report;
        }
        report.messages.push("uci changes committed".to_string());

        tracing::info!("reloading wifi stack to apply channel plan");
        if let Err(err) = self
            .executor
            .execute_checked("wifi load", WIFI_LOAD_TIMEOUT)
            .await
        {
            // some firmwares hold the foreground call until the radios settle,
            // fall back to a detached reload before giving up
            tracing::warn!("foreground wifi load failed, retrying detached: {err}");
            report.messages.push("retrying wifi load detached".to_string());
            if let Err(err) = self
                .executor
                .execute_checked("nohup wifi load > /dev/null 2>&1 &", UCI_TIMEOUT)
                .await
            {
                report.success = false;
                report.messages.push(format!("wifi load failed: {err}"));
                return report;
            }
        }
        report.messages.push("wifi reload initiated".to_string());

        if self.wait_for_interfaces().await {
            report.messages.push("all interfaces back up".to_string());
            // the radios may have come back in a different order
            self.resolver.resolve(true).await;
        } else {
            report.success = false;
            report.messages.push(format!(
                "timed out after {}s waiting for interfaces",
                self.settings.wifi_reload_wait_secs
            ));
        }
        report
    }

    /// Poll iwconfig until all three data interfaces answer or the configured
    /// wait is exhausted. Checks before the first sleep so a quick reload does
    /// not pay the poll interval.
    async fn wait_for_interfaces(&self) -> bool {
        let deadline =
            Instant::now() + Duration::from_secs(self.settings.wifi_reload_wait_secs);
        loop {
            let result = self
                .executor
                .execute("iwconfig 2>/dev/null | grep -E '^ath'", UCI_TIMEOUT)
                .await;
            if let Ok(result) = result {
                if result.success() && interfaces_present(&result.stdout) {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(RELOAD_POLL_INTERVAL).await;
        }
    }
}

fn interfaces_present(stdout: &str) -> bool {
    ["ath0", "ath1", "ath2"]
        .iter()
        .all(|iface| stdout.contains(iface))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::ScriptedExecutor;
    use crate::remote::ExecutionError;

    const IWCONFIG_ALL_UP: &str = "ath0  IEEE 802.11\nath1  IEEE 802.11\nath2  IEEE 802.11\n";

    fn configurator_with(executor: Arc<ScriptedExecutor>) -> ChannelConfigurator {
        let settings = SnifferSettings {
            // exhaust the reload wait on the first poll in tests
            wifi_reload_wait_secs: 0,
            ..SnifferSettings::default()
        };
        let events = EventPublisher::new();
        let resolver = Arc::new(InterfaceResolver::new(
            executor.clone(),
            settings.clone(),
            events.clone(),
        ));
        ChannelConfigurator::new(executor, resolver, settings, events)
    }

    #[tokio::test]
    async fn test_set_updates_local_plan_only() {
        let executor = Arc::new(ScriptedExecutor::new());
        let configurator = configurator_with(executor.clone());
        let outcome = configurator
            .set_config(Band::Band5G, 149, Some("EHT80".to_string()))
            .await;
        assert!(outcome.success, "{}", outcome.message);
        let plan = configurator.get_config(false).await;
        assert_eq!(plan[&Band::Band5G].channel, 149);
        assert_eq!(plan[&Band::Band5G].htmode, "EHT80");
        // nothing went to the router
        assert_eq!(executor.calls_matching("uci set"), 0);
    }

    #[tokio::test]
    async fn test_set_keeps_htmode_when_not_given() {
        let executor = Arc::new(ScriptedExecutor::new());
        let configurator = configurator_with(executor);
        assert!(configurator.set_config(Band::Band2G, 11, None).await.success);
        let plan = configurator.get_config(false).await;
        assert_eq!(plan[&Band::Band2G].channel, 11);
        assert_eq!(plan[&Band::Band2G].htmode, "HT40");
    }

    #[tokio::test]
    async fn test_set_rejects_zero_channel() {
        let executor = Arc::new(ScriptedExecutor::new());
        let configurator = configurator_with(executor);
        let outcome = configurator.set_config(Band::Band2G, 0, None).await;
        assert!(!outcome.success);
        assert_eq!(configurator.get_config(false).await[&Band::Band2G].channel, 6);
    }

    #[tokio::test]
    async fn test_apply_writes_uci_options_for_band() {
        let executor = Arc::new(ScriptedExecutor::new());
        let configurator = configurator_with(executor.clone());
        let outcome = configurator.apply(Band::Band2G).await;
        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(executor.calls_matching("uci set wireless.wifi0.channel=6"), 1);
        assert_eq!(executor.calls_matching("uci set wireless.wifi0.htmode=HT40"), 1);
        // apply alone does not commit or reload
        assert_eq!(executor.calls_matching("uci commit"), 0);
        assert_eq!(executor.calls_matching("wifi load"), 0);
    }

    #[tokio::test]
    async fn test_refresh_folds_in_router_values() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond("uci get wireless.wifi2.channel", "100\nEHT80\n");
        let configurator = configurator_with(executor);
        let plan = configurator.get_config(true).await;
        assert_eq!(plan[&Band::Band5G].channel, 100);
        assert_eq!(plan[&Band::Band5G].htmode, "EHT80");
        // bands with no answer keep the local plan
        assert_eq!(plan[&Band::Band2G].channel, 6);
    }

    #[tokio::test]
    async fn test_reload_commits_and_waits_for_interfaces() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond("iwconfig", IWCONFIG_ALL_UP);
        let configurator = configurator_with(executor.clone());
        let report = configurator.apply_all_and_reload().await;
        assert!(report.success, "{:?}", report.messages);
        assert_eq!(report.bands.len(), 3);
        assert!(report.bands.values().all(|o| o.success));
        assert_eq!(executor.calls_matching("uci commit wireless"), 1);
        assert_eq!(executor.calls_matching("wifi load"), 1);
    }

    #[tokio::test]
    async fn test_failed_band_aborts_before_commit() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond_with(
            "uci set wireless.wifi0.channel",
            Err(ExecutionError::ConnectionRefused("down".to_string())),
        );
        let configurator = configurator_with(executor.clone());
        let report = configurator.apply_all_and_reload().await;
        assert!(!report.success);
        assert!(!report.bands[&Band::Band2G].success);
        assert_eq!(executor.calls_matching("uci commit"), 0);
        assert_eq!(executor.calls_matching("wifi load"), 0);
    }

    #[tokio::test]
    async fn test_reload_reports_interface_timeout() {
        let executor = Arc::new(ScriptedExecutor::new());
        // iwconfig answers without ath1, the radios never come back
        executor.respond("iwconfig", "ath0  IEEE 802.11\nath2  IEEE 802.11\n");
        let configurator = configurator_with(executor);
        let report = configurator.apply_all_and_reload().await;
        assert!(!report.success);
        assert!(report
            .messages
            .iter()
            .any(|m| m.contains("waiting for interfaces")));
    }

    #[test]
    fn test_interface_presence_check() {
        assert!(interfaces_present(IWCONFIG_ALL_UP));
        assert!(!interfaces_present("ath0\nath2\n"));
        assert!(!interfaces_present(""));
    }
}
