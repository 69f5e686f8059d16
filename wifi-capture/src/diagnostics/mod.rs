use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use wifi_capture_schemas::models::DiagnoseReport;
use wifi_capture_schemas::settings::SnifferSettings;
use crate::remote::RemoteExecutor;

const PROBE_MARKER: &str = "diagnostic-probe";
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

// key file names dropbear and openssh clients pick up by default
const KEY_NAMES: [&str; 4] = ["id_rsa", "id_ecdsa", "id_ed25519", "id_dsa"];

/// Read only health probe over the path to the router, layer by layer: local
/// key material, ICMP reachability, then an authenticated command. Nothing in
/// here mutates router state so it is safe to run at any time.
pub struct Diagnostics {
    executor: Arc<dyn RemoteExecutor>,
    settings: SnifferSettings,
}

impl Diagnostics {
    pub fn new(executor: Arc<dyn RemoteExecutor>, settings: SnifferSettings) -> Self {
        Self { executor, settings }
    }

    pub async fn diagnose(&self) -> DiagnoseReport {
        let ssh_dir = ssh_dir();
        let ssh_keys_found = scan_ssh_keys(&ssh_dir, self.settings.identity_file.as_deref());
        let ping_ok = ping_host(&self.settings.host).await;
        let ssh_result = self.ssh_probe().await;
        self.build_report(ping_ok, ssh_result, ssh_keys_found)
    }

    /// Run a trivial authenticated command through the executor and check its
    /// output came back intact.
    async fn ssh_probe(&self) -> Result<(), String> {
        match self
            .executor
            .execute_checked(&format!("echo {PROBE_MARKER}"), PROBE_TIMEOUT)
            .await
        {
            Ok(result) if result.stdout.contains(PROBE_MARKER) => Ok(()),
            Ok(result) => Err(format!(
                "probe command returned unexpected output: {}",
                result.stdout.trim()
            )),
            Err(err) => Err(err.to_string()),
        }
    }

    fn build_report(
        &self,
        ping_ok: bool,
        ssh_result: Result<(), String>,
        ssh_keys_found: Vec<String>,
    ) -> DiagnoseReport {
        let has_ssh_key = !ssh_keys_found.is_empty() || self.settings.password.is_some();
        let (ssh_ok, error) = match ssh_result {
            Ok(()) => (true, None),
            Err(err) => (false, Some(err)),
        };
        let hint = hint_for(ping_ok, ssh_ok, has_ssh_key, error.as_deref());
        DiagnoseReport {
            host: self.settings.host.clone(),
            port: self.settings.port,
            user: self.settings.user.clone(),
            ssh_keys_found,
            has_ssh_key,
            ping_ok,
            ssh_ok,
            error,
            hint,
        }
    }
}

fn ssh_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".ssh"),
        None => PathBuf::from(".ssh"),
    }
}

/// List the private key files present in `dir`, plus the configured identity
/// file when it exists. Names only, never key material.
fn scan_ssh_keys(dir: &Path, identity_file: Option<&str>) -> Vec<String> {
    let mut found = Vec::new();
    for name in KEY_NAMES {
        if dir.join(name).is_file() {
            found.push(name.to_string());
        }
    }
    if let Some(identity) = identity_file {
        if Path::new(identity).is_file() && !found.iter().any(|f| f == identity) {
            found.push(identity.to_string());
        }
    }
    found
}

/// One ICMP echo with a short deadline. A missing ping binary or a non zero
/// exit both read as unreachable, the ssh probe is the authoritative check.
async fn ping_host(host: &str) -> bool {
    let result = Command::new("ping")
        .args(["-c", "1", "-W", "2", host])
        .output()
        .await;
    match result {
        Ok(output) => output.status.success(),
        Err(err) => {
            tracing::debug!("could not run ping: {err}");
            false
        }
    }
}

/// Turn the probe results into one actionable sentence for the operator.
fn hint_for(
    ping_ok: bool,
    ssh_ok: bool,
    has_ssh_key: bool,
    error: Option<&str>,
) -> Option<String> {
    if ssh_ok {
        return None;
    }
    if !ping_ok {
        return Some(
            "router is not reachable, check it is powered on and this machine is on its network"
                .to_string(),
        );
    }
    if !has_ssh_key {
        return Some(
            "no ssh key or password is configured, add a key to ~/.ssh or set a password"
                .to_string(),
        );
    }
    if error
        .map(|e| e.contains("authentication") || e.contains("Permission denied"))
        .unwrap_or(false)
    {
        return Some(
            "the router rejected the credentials, check the configured user and key or password"
                .to_string(),
        );
    }
    Some("router answers ping but ssh failed, check dropbear is running on the router".to_string())
}
