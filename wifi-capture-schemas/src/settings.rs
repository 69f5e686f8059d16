use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Formatter;
use std::path::PathBuf;
use serde::{Deserialize, Serialize};
use crate::models::Band;
use crate::SNIFFER_SETTINGS_FILE;

/// Connection and behaviour settings for the capture controller. Every field
/// has a sensible default for a factory OpenWrt router at 192.168.1.1, so the
/// settings file is optional and can override just the fields that differ.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub struct SnifferSettings {
    /// ip or hostname of the router performing the capture
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    /// only used when set, the default dropbear setup is passwordless keys
    #[serde(default)]
    pub password: Option<String>,
    /// explicit private key, otherwise the ssh agent/default keys are used
    #[serde(default)]
    pub identity_file: Option<String>,
    /// number of pooled ssh sessions
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// timeout for control commands
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// timeout for pulling capture files, these can be large so this must be
    /// much longer than the control command timeout
    #[serde(default = "default_retrieval_timeout")]
    pub retrieval_timeout_secs: u64,
    /// how long execute() waits for a free pooled session
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
    /// how long a successful interface detection is trusted
    #[serde(default = "default_interface_cache_ttl")]
    pub interface_cache_ttl_secs: u64,
    /// where retrieved capture files are placed
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// fallback data interface per band when detection fails
    #[serde(default = "default_interfaces")]
    pub default_interfaces: BTreeMap<Band, String>,
    /// fallback UCI radio section per band when detection fails
    #[serde(default = "default_uci_radios")]
    pub default_uci_radios: BTreeMap<Band, String>,
    /// sync the router clock before the first capture starts
    #[serde(default = "default_auto_sync_time")]
    pub auto_sync_time: bool,
    /// how long to wait for the radios to come back after a wifi reload
    #[serde(default = "default_wifi_reload_wait")]
    pub wifi_reload_wait_secs: u64,
}

fn default_host() -> String {
    "192.168.1.1".to_string()
}

fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_string()
}

fn default_pool_size() -> usize {
    3
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    30
}

fn default_retrieval_timeout() -> u64 {
    600
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_interface_cache_ttl() -> u64 {
    300
}

fn default_download_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join("Downloads"),
        None => PathBuf::from("."),
    }
}

fn default_interfaces() -> BTreeMap<Band, String> {
    BTreeMap::from([
        (Band::Band2G, "ath0".to_string()),
        (Band::Band5G, "ath2".to_string()),
        (Band::Band6G, "ath1".to_string()),
    ])
}

fn default_uci_radios() -> BTreeMap<Band, String> {
    BTreeMap::from([
        (Band::Band2G, "wifi0".to_string()),
        (Band::Band5G, "wifi2".to_string()),
        (Band::Band6G, "wifi1".to_string()),
    ])
}

fn default_auto_sync_time() -> bool {
    true
}

fn default_wifi_reload_wait() -> u64 {
    90
}

impl Default for SnifferSettings {
    fn default() -> Self {
        // round trip through serde so the field defaults are the single source
        serde_json::from_str("{}").expect("sniffer settings defaults failed")
    }
}

impl fmt::Display for SnifferSettings {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&serde_json::to_string_pretty(&self).unwrap())
            .expect("sniffer settings to json via serde failed");
        Ok(())
    }
}

impl SnifferSettings {
    /// Load settings from the optional JSON file in the current directory,
    /// falling back to the defaults when it does not exist.
    pub async fn read() -> anyhow::Result<SnifferSettings> {
        let path = PathBuf::from(SNIFFER_SETTINGS_FILE);
        if path.is_file() {
            let text = tokio::fs::read_to_string(&path).await?;
            let settings: SnifferSettings = serde_json::from_str(&text)?;
            Ok(settings)
        } else {
            tracing::debug!("no {SNIFFER_SETTINGS_FILE} found, using default settings");
            Ok(SnifferSettings::default())
        }
    }
}
