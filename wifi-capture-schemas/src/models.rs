use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Formatter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// The three logical radio bands the router exposes. The string forms are used in
/// remote file names and in the JSON surface, so keep them short.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter, EnumString)]
pub enum Band {
    #[serde(rename = "2G")]
    #[strum(serialize = "2G")]
    Band2G,
    #[serde(rename = "5G")]
    #[strum(serialize = "5G")]
    Band5G,
    #[serde(rename = "6G")]
    #[strum(serialize = "6G")]
    Band6G,
}

impl Band {
    /// Classify a radio operating frequency in GHz into a logical band.
    pub fn from_frequency_ghz(freq: f64) -> Band {
        if freq < 3.0 {
            Band::Band2G
        } else if freq <= 6.0 {
            Band::Band5G
        } else {
            Band::Band6G
        }
    }

    /// Classify a UCI wireless channel number into a logical band.
    pub fn from_channel(channel: u32) -> Band {
        if channel <= 14 {
            Band::Band2G
        } else if channel <= 177 {
            Band::Band5G
        } else {
            Band::Band6G
        }
    }
}

/// Mapping from logical band to the router's data interface name and UCI radio
/// section. `detected` is false when the hard coded defaults are in use.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct InterfaceMapping {
    pub interfaces: BTreeMap<Band, String>,
    pub uci_radios: BTreeMap<Band, String>,
    pub detected: bool,
    pub last_detection: Option<DateTime<Utc>>,
}

impl fmt::Display for InterfaceMapping {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&serde_json::to_string_pretty(&self).unwrap())
            .expect("interface mapping to json via serde failed");
        Ok(())
    }
}

/// Capture file rotation settings, read once at capture start and baked into the
/// remote command. Later changes do not affect an in-flight capture.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct FileSplitConfig {
    pub enabled: bool,
    pub size_mb: u64,
}

impl FileSplitConfig {
    pub const ALLOWED_SIZES_MB: [u64; 5] = [50, 100, 200, 500, 1000];

    pub fn is_allowed_size(size_mb: u64) -> bool {
        Self::ALLOWED_SIZES_MB.contains(&size_mb)
    }
}

impl Default for FileSplitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            size_mb: 200,
        }
    }
}

/// Result of a mutating capture operation, shaped for the web layer. A failed
/// download after a successful stop still reports `success` with the reason in
/// the message, the capture session is reset either way.
#[derive(Deserialize, Serialize, Debug, Default, Clone)]
#[serde(rename_all = "snake_case")]
pub struct ActionOutcome {
    pub success: bool,
    pub message: String,
    pub local_path: Option<String>,
}

impl ActionOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            local_path: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            local_path: None,
        }
    }
}

/// Point in time capture state for one band. `duration` is derived from the
/// locally recorded start time, not from the remote clock. `stale` marks a
/// packet count that could not be refreshed on the last poll.
#[derive(Deserialize, Serialize, Debug, Default, Clone)]
#[serde(rename_all = "snake_case")]
pub struct CaptureStatusReport {
    pub running: bool,
    pub duration: Option<String>,
    pub duration_seconds: Option<u64>,
    pub packets: u64,
    pub stale: bool,
}

impl CaptureStatusReport {
    /// Format elapsed seconds as `MM:SS` for display.
    pub fn format_duration(total_seconds: u64) -> String {
        format!("{:02}:{:02}", total_seconds / 60, total_seconds % 60)
    }
}

/// Desired channel and width for one radio. Held locally until applied, the
/// router only sees it through an explicit apply.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BandChannelConfig {
    pub channel: u32,
    pub htmode: String,
}

impl BandChannelConfig {
    /// Factory channel plan for the router's three radios.
    pub fn defaults() -> BTreeMap<Band, BandChannelConfig> {
        BTreeMap::from([
            (
                Band::Band2G,
                BandChannelConfig {
                    channel: 6,
                    htmode: "HT40".to_string(),
                },
            ),
            (
                Band::Band5G,
                BandChannelConfig {
                    channel: 36,
                    htmode: "EHT160".to_string(),
                },
            ),
            (
                Band::Band6G,
                BandChannelConfig {
                    channel: 37,
                    htmode: "EHT320".to_string(),
                },
            ),
        ])
    }
}

/// Outcome of pushing the full channel plan to the router and reloading the
/// radios. Per band results are reported independently, one failed band does
/// not hide the others.
#[derive(Deserialize, Serialize, Debug, Default, Clone)]
#[serde(rename_all = "snake_case")]
pub struct WifiReloadReport {
    pub success: bool,
    pub messages: Vec<String>,
    pub bands: BTreeMap<Band, ActionOutcome>,
}

impl fmt::Display for WifiReloadReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&serde_json::to_string_pretty(&self).unwrap())
            .expect("wifi reload report to json via serde failed");
        Ok(())
    }
}

/// How far the remote clock is believed to drift from the local clock.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncState {
    Synced,
    Warning,
    Error,
    Unknown,
}

impl SyncState {
    pub fn classify(offset_seconds: Option<f64>) -> SyncState {
        match offset_seconds {
            Some(offset) if offset.abs() < 2.0 => SyncState::Synced,
            Some(offset) if offset.abs() < 60.0 => SyncState::Warning,
            Some(_) => SyncState::Error,
            None => SyncState::Unknown,
        }
    }
}

/// Local and remote clock readings plus the estimated offset between them.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub struct TimeInfo {
    pub local_time: String,
    pub remote_time: Option<String>,
    pub offset_seconds: Option<f64>,
    pub state: SyncState,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Read only composite health probe over the local network and ssh layers.
#[derive(Deserialize, Serialize, Debug, Default, Clone)]
#[serde(rename_all = "snake_case")]
pub struct DiagnoseReport {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub ssh_keys_found: Vec<String>,
    pub has_ssh_key: bool,
    pub ping_ok: bool,
    pub ssh_ok: bool,
    pub error: Option<String>,
    pub hint: Option<String>,
}

impl fmt::Display for DiagnoseReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&serde_json::to_string_pretty(&self).unwrap())
            .expect("diagnose report to json via serde failed");
        Ok(())
    }
}

/// State change notifications published by the core. The web layer can push
/// these over a websocket or ignore them and poll the equivalent getters, both
/// observe the same state.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SnifferEvent {
    ConnectionUp,
    ConnectionDown { error: String },
    CaptureStarted { band: Band, interface: String },
    CaptureStopped { band: Band, outcome: ActionOutcome },
    StatusTick { statuses: BTreeMap<Band, CaptureStatusReport> },
    InterfacesDetected { mapping: InterfaceMapping },
    TimeSynced { offset_seconds: Option<f64> },
    SplitConfigChanged { config: FileSplitConfig },
    ChannelConfigChanged { band: Band, config: BandChannelConfig },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_frequency_classification() {
        assert_eq!(Band::from_frequency_ghz(2.400), Band::Band2G);
        assert_eq!(Band::from_frequency_ghz(2.484), Band::Band2G);
        assert_eq!(Band::from_frequency_ghz(5.180), Band::Band5G);
        assert_eq!(Band::from_frequency_ghz(6.135), Band::Band6G);
    }

    #[test]
    fn test_band_string_round_trip() {
        assert_eq!(Band::Band5G.to_string(), "5G");
        assert_eq!("6G".parse::<Band>().unwrap(), Band::Band6G);
        assert_eq!(serde_json::to_string(&Band::Band2G).unwrap(), "\"2G\"");
    }

    #[test]
    fn test_sync_state_classification() {
        assert_eq!(SyncState::classify(Some(1.0)), SyncState::Synced);
        assert_eq!(SyncState::classify(Some(-1.5)), SyncState::Synced);
        assert_eq!(SyncState::classify(Some(10.0)), SyncState::Warning);
        assert_eq!(SyncState::classify(Some(120.0)), SyncState::Error);
        assert_eq!(SyncState::classify(None), SyncState::Unknown);
    }

    #[test]
    fn test_split_sizes() {
        assert!(FileSplitConfig::is_allowed_size(200));
        assert!(!FileSplitConfig::is_allowed_size(150));
        let default = FileSplitConfig::default();
        assert!(!default.enabled);
        assert_eq!(default.size_mb, 200);
    }

    #[test]
    fn test_default_channel_plan_covers_all_bands() {
        let plan = BandChannelConfig::defaults();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[&Band::Band2G].channel, 6);
        assert_eq!(plan[&Band::Band2G].htmode, "HT40");
        assert_eq!(plan[&Band::Band5G].channel, 36);
        assert_eq!(plan[&Band::Band6G].htmode, "EHT320");
    }

    #[test]
    fn test_duration_format() {
        assert_eq!(CaptureStatusReport::format_duration(0), "00:00");
        assert_eq!(CaptureStatusReport::format_duration(61), "01:01");
        assert_eq!(CaptureStatusReport::format_duration(3599), "59:59");
    }

    #[test]
    fn test_event_serialisation_shape() {
        let event = SnifferEvent::CaptureStarted {
            band: Band::Band2G,
            interface: "ath0".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "capture_started");
        assert_eq!(json["data"]["band"], "2G");
    }
}
