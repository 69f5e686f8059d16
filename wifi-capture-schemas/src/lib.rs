pub mod models;
pub mod settings;

/// Optional settings override file, looked up in the working directory.
pub const SNIFFER_SETTINGS_FILE: &str = "wifi-capture.json";
