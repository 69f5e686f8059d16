use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::RwLock;
use wifi_capture_schemas::models::{Band, InterfaceMapping, SnifferEvent};
use wifi_capture_schemas::settings::SnifferSettings;
use crate::events::EventPublisher;
use crate::remote::RemoteExecutor;

lazy_static! {
    static ref IFACE_RE: Regex = Regex::new(r"^(ath\d+)").unwrap();
    static ref FREQ_RE: Regex = Regex::new(r"Frequency[:\s]*(\d+\.?\d*)").unwrap();
    static ref UCI_CHANNEL_RE: Regex =
        Regex::new(r"wireless\.(wifi\d+)\.channel='?(\d+)'?").unwrap();
}

struct CachedMapping {
    mapping: InterfaceMapping,
    refreshed: Instant,
}

/// Classifies the router's radio interfaces into logical bands by their
/// operating frequency. Detection fails soft, a usable mapping always comes
/// back with `detected` saying whether it is real or the hard coded default.
pub struct InterfaceResolver {
    executor: Arc<dyn RemoteExecutor>,
    settings: SnifferSettings,
    cache: RwLock<Option<CachedMapping>>,
    events: EventPublisher,
}

impl InterfaceResolver {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        settings: SnifferSettings,
        events: EventPublisher,
    ) -> Self {
        Self {
            executor,
            settings,
            cache: RwLock::new(None),
            events,
        }
    }

    /// Resolve the band to interface mapping, serving from the cache while the
    /// last successful detection is younger than the configured TTL. `force`
    /// bypasses the cache and re-runs detection unconditionally, the cache is
    /// only replaced when that detection succeeds.
    pub async fn resolve(&self, force: bool) -> InterfaceMapping {
        let ttl = Duration::from_secs(self.settings.interface_cache_ttl_secs);
        if !force {
            if let Some(cached) = self.cache.read().await.as_ref() {
                if cached.refreshed.elapsed() < ttl {
                    return cached.mapping.clone();
                }
            }
        }
        match self.detect().await {
            Some(mapping) => {
                // replace the cache under the write lock so a concurrent cached
                // read cannot observe a half written entry
                *self.cache.write().await = Some(CachedMapping {
                    mapping: mapping.clone(),
                    refreshed: Instant::now(),
                });
                self.events.publish(SnifferEvent::InterfacesDetected {
                    mapping: mapping.clone(),
                });
                mapping
            }
            None => {
                tracing::warn!("interface detection failed, using default mapping");
                self.defaults()
            }
        }
    }

    /// The data interface for a band, from the cached mapping or defaults.
    pub async fn interface_for(&self, band: Band) -> String {
        self.resolve(false).await.interfaces[&band].clone()
    }

    fn defaults(&self) -> InterfaceMapping {
        InterfaceMapping {
            interfaces: self.settings.default_interfaces.clone(),
            uci_radios: self.settings.default_uci_radios.clone(),
            detected: false,
            last_detection: None,
        }
    }

    /// One detection pass. Returns None when the query fails or classification
    /// is ambiguous, in which case the caller falls back to the defaults.
    async fn detect(&self) -> Option<InterfaceMapping> {
        let timeout = Duration::from_secs(self.settings.command_timeout_secs);
        let result = self
            .executor
            .execute("iwconfig 2>/dev/null | grep -E '^ath|Frequency'", timeout)
            .await
            .ok()?;
        if !result.success() {
            return None;
        }
        let interfaces = classify_interfaces(&result.stdout)?;
        tracing::info!("detected interface mapping: {:?}", interfaces);

        // the UCI radio sections are resolved separately and fail soft on their
        // own, a band missing from the answer keeps its default section
        let mut uci_radios = self.settings.default_uci_radios.clone();
        let uci_result = self
            .executor
            .execute("uci show wireless | grep -E 'wifi[0-9]+\\.channel'", timeout)
            .await;
        if let Ok(uci) = uci_result {
            if uci.success() {
                for (band, radio) in classify_uci_radios(&uci.stdout) {
                    uci_radios.insert(band, radio);
                }
            }
        }

        Some(InterfaceMapping {
            interfaces,
            uci_radios,
            detected: true,
            last_detection: Some(Utc::now()),
        })
    }
}

/// Parse iwconfig output and classify each interface by frequency. Returns None
/// when fewer than the three bands were found or two interfaces claim the same
/// band, partial results are discarded rather than mixed with defaults.
fn classify_interfaces(stdout: &str) -> Option<BTreeMap<Band, String>> {
    let mut mapping: BTreeMap<Band, String> = BTreeMap::new();
    let mut current_iface: Option<String> = None;
    for line in stdout.lines() {
        if let Some(capture) = IFACE_RE.captures(line) {
            current_iface = Some(capture[1].to_string());
        } else if let (Some(iface), Some(capture)) = (&current_iface, FREQ_RE.captures(line)) {
            let freq: f64 = capture[1].parse().ok()?;
            let band = Band::from_frequency_ghz(normalise_frequency_ghz(freq));
            if mapping.insert(band, iface.clone()).is_some() {
                // two radios claiming one band means the heuristic is wrong
                tracing::warn!("duplicate classification for band {band}, discarding detection");
                return None;
            }
        }
    }
    if mapping.len() < 3 {
        return None;
    }
    Some(mapping)
}

/// Drivers report the operating frequency in GHz or MHz depending on version,
/// normalise to GHz before classification.
fn normalise_frequency_ghz(freq: f64) -> f64 {
    if freq > 1000.0 {
        freq / 1000.0
    } else {
        freq
    }
}

fn classify_uci_radios(stdout: &str) -> BTreeMap<Band, String> {
    let mut radios = BTreeMap::new();
    for capture in UCI_CHANNEL_RE.captures_iter(stdout) {
        if let Ok(channel) = capture[2].parse::<u32>() {
            if channel > 0 {
                radios.insert(Band::from_channel(channel), capture[1].to_string());
            }
        }
    }
    radios
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::ScriptedExecutor;

    const IWCONFIG_THREE_BANDS: &str = "\
ath0      IEEE 802.11  ESSID:\"\"
          Mode:Monitor  Frequency:2.437 GHz  Access Point: Not-Associated
ath1      IEEE 802.11  ESSID:\"\"
          Mode:Monitor  Frequency:6.135 GHz  Access Point: Not-Associated
ath2      IEEE 802.11  ESSID:\"\"
          Mode:Monitor  Frequency:5.18 GHz  Access Point: Not-Associated
";

    fn resolver_with(executor: Arc<dyn RemoteExecutor>) -> InterfaceResolver {
        InterfaceResolver::new(executor, SnifferSettings::default(), EventPublisher::new())
    }

    #[tokio::test]
    async fn test_detection_classifies_all_bands() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond("iwconfig", IWCONFIG_THREE_BANDS);
        executor.respond(
            "uci show wireless",
            "wireless.wifi0.channel='6'\nwireless.wifi1.channel='213'\nwireless.wifi2.channel='36'\n",
        );
        let resolver = resolver_with(executor.clone());
        let mapping = resolver.resolve(false).await;
        assert!(mapping.detected);
        assert_eq!(mapping.interfaces[&Band::Band2G], "ath0");
        assert_eq!(mapping.interfaces[&Band::Band5G], "ath2");
        assert_eq!(mapping.interfaces[&Band::Band6G], "ath1");
        assert_eq!(mapping.uci_radios[&Band::Band2G], "wifi0");
        assert_eq!(mapping.uci_radios[&Band::Band5G], "wifi2");
        assert_eq!(mapping.uci_radios[&Band::Band6G], "wifi1");
    }

    #[tokio::test]
    async fn test_mhz_frequencies_are_normalised() {
        let stdout = "\
ath0 x\n Frequency:2400 MHz\nath1 x\n Frequency:6135 MHz\nath2 x\n Frequency:5180 MHz\n";
        let mapping = classify_interfaces(stdout).unwrap();
        assert_eq!(mapping[&Band::Band2G], "ath0");
        assert_eq!(mapping[&Band::Band5G], "ath2");
        assert_eq!(mapping[&Band::Band6G], "ath1");
    }

    #[tokio::test]
    async fn test_duplicate_band_falls_back_to_defaults() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond(
            "iwconfig",
            "ath0 x\n Frequency:2.437 GHz\nath1 x\n Frequency:2.462 GHz\nath2 x\n Frequency:5.18 GHz\n",
        );
        let resolver = resolver_with(executor);
        let mapping = resolver.resolve(false).await;
        assert!(!mapping.detected);
        assert_eq!(mapping.interfaces[&Band::Band2G], "ath0");
        assert_eq!(mapping.interfaces[&Band::Band5G], "ath2");
        assert_eq!(mapping.interfaces[&Band::Band6G], "ath1");
    }

    #[tokio::test]
    async fn test_partial_detection_falls_back_to_defaults() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond("iwconfig", "ath0 x\n Frequency:2.437 GHz\n");
        let resolver = resolver_with(executor);
        let mapping = resolver.resolve(false).await;
        assert!(!mapping.detected);
    }

    #[tokio::test]
    async fn test_cache_serves_second_read_without_query() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond("iwconfig", IWCONFIG_THREE_BANDS);
        let resolver = resolver_with(executor.clone());
        let first = resolver.resolve(false).await;
        let second = resolver.resolve(false).await;
        assert_eq!(first, second);
        assert_eq!(executor.calls_matching("iwconfig"), 1);
    }

    #[tokio::test]
    async fn test_force_bypasses_cache() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond("iwconfig", IWCONFIG_THREE_BANDS);
        let resolver = resolver_with(executor.clone());
        resolver.resolve(false).await;
        resolver.resolve(true).await;
        assert_eq!(executor.calls_matching("iwconfig"), 2);
    }

    #[tokio::test]
    async fn test_failed_detection_is_not_cached() {
        let executor = Arc::new(ScriptedExecutor::new());
        // unscripted iwconfig answers with empty output, detection fails
        let resolver = resolver_with(executor.clone());
        resolver.resolve(false).await;
        resolver.resolve(false).await;
        assert_eq!(executor.calls_matching("iwconfig"), 2);
    }
}
