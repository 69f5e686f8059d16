use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Local};
use futures_util::future::join_all;
use strum::IntoEnumIterator;
use tokio::sync::{Mutex, RwLock};
use wifi_capture_schemas::models::{
    ActionOutcome, Band, CaptureStatusReport, FileSplitConfig, SnifferEvent,
};
use wifi_capture_schemas::settings::SnifferSettings;
use crate::events::EventPublisher;
use crate::interfaces::InterfaceResolver;
use crate::remote::RemoteExecutor;
use crate::retrieval::{FileRetriever, RetrievalOutcome};
use crate::timesync::TimeSyncEstimator;

const STATUS_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const STARTED_MARKER: &str = "TCPDUMP_STARTED";
const FAILED_MARKER: &str = "TCPDUMP_FAILED";

/// Local belief about one band's capture. Authoritative for the UI, reconciled
/// against the router on each status poll.
#[derive(Debug, Default)]
struct BandState {
    running: bool,
    interface: Option<String>,
    started_at: Option<DateTime<Local>>,
    packets: u64,
    stale: bool,
    split_at_start: FileSplitConfig,
}

struct BandSlot {
    state: Mutex<BandState>,
    // mirrored running flag so other bands can check without taking the lock
    running: AtomicBool,
}

/// Owns the per band capture state machines. Start and stop for one band are
/// serialised by that band's lock, different bands proceed independently.
pub struct CaptureManager {
    executor: Arc<dyn RemoteExecutor>,
    resolver: Arc<InterfaceResolver>,
    retriever: FileRetriever,
    timesync: Arc<TimeSyncEstimator>,
    settings: SnifferSettings,
    events: EventPublisher,
    split_config: RwLock<FileSplitConfig>,
    bands: BTreeMap<Band, BandSlot>,
}

impl CaptureManager {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        resolver: Arc<InterfaceResolver>,
        retriever: FileRetriever,
        timesync: Arc<TimeSyncEstimator>,
        settings: SnifferSettings,
        events: EventPublisher,
    ) -> Self {
        let bands = Band::iter()
            .map(|band| {
                (
                    band,
                    BandSlot {
                        state: Mutex::new(BandState::default()),
                        running: AtomicBool::new(false),
                    },
                )
            })
            .collect();
        Self {
            executor,
            resolver,
            retriever,
            timesync,
            settings,
            events,
            split_config: RwLock::new(FileSplitConfig::default()),
            bands,
        }
    }

    fn remote_path(band: Band) -> String {
        format!("/tmp/{band}.pcap")
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.command_timeout_secs)
    }

    fn any_other_band_running(&self, band: Band) -> bool {
        // unsynchronised read of the mirrors, concurrent first starts may each
        // run the time sync precondition, sync() is idempotent so that is fine
        self.bands
            .iter()
            .any(|(b, slot)| *b != band && slot.running.load(Ordering::SeqCst))
    }

    /// Whether any band currently has a capture up, per the local belief.
    pub fn any_running(&self) -> bool {
        self.bands
            .values()
            .any(|slot| slot.running.load(Ordering::SeqCst))
    }

    /// Start capture on one band. Rejected while already running, the caller
    /// has to stop first. The file split configuration is read here and baked
    /// into the remote command, later changes do not affect this capture.
    pub async fn start(&self, band: Band) -> ActionOutcome {
        let slot = &self.bands[&band];
        let mut state = slot.state.lock().await;
        if state.running {
            return ActionOutcome::failed(format!("{band} capture already running"));
        }

        // sync the router clock before the first capture so artefact timestamps
        // line up, a failure is a warning and never blocks the start
        let mut sync_warning = None;
        if self.settings.auto_sync_time && !self.any_other_band_running(band) {
            if let Err(err) = self.timesync.sync().await {
                tracing::warn!("time sync before capture failed: {err:#}");
                sync_warning = Some(" (warning: time sync failed)");
            }
        }

        let mapping = self.resolver.resolve(false).await;
        let interface = mapping.interfaces[&band].clone();
        let split = *self.split_config.read().await;
        let remote_path = Self::remote_path(band);
        let tcpdump = if split.enabled {
            format!(
                "tcpdump -i {interface} -U -s0 -w {remote_path} -C {}",
                split.size_mb
            )
        } else {
            format!("tcpdump -i {interface} -U -s0 -w {remote_path}")
        };
        // kill any stale capture on the interface, clear old output, background
        // the new capture and verify it survived its first second
        let command = format!(
            "PID=$(ps | grep \"tcpdump -i {interface}\" | grep -v grep | awk '{{print $1}}'); \
             [ -n \"$PID\" ] && kill $PID 2>/dev/null; \
             rm -f {remote_path} {remote_path}[0-9]*; \
             ({tcpdump} &); \
             sleep 1; \
             ps | grep \"tcpdump -i {interface}\" | grep -v grep >/dev/null \
             && echo {STARTED_MARKER} || echo {FAILED_MARKER}"
        );
        let result = match self.executor.execute(&command, self.command_timeout()).await {
            Ok(result) => result,
            Err(err) => {
                return ActionOutcome::failed(format!("cannot start {band} capture: {err}"));
            }
        };
        if !result.success() || result.stdout.contains(FAILED_MARKER) {
            return ActionOutcome::failed(format!(
                "failed to start tcpdump on {interface}: {}",
                if result.stderr.trim().is_empty() {
                    result.stdout.trim()
                } else {
                    result.stderr.trim()
                }
            ));
        }
        if !result.stdout.contains(STARTED_MARKER) {
            return ActionOutcome::failed("tcpdump start verification failed".to_string());
        }

        state.running = true;
        state.interface = Some(interface.clone());
        state.started_at = Some(Local::now());
        state.packets = 0;
        state.stale = false;
        state.split_at_start = split;
        slot.running.store(true, Ordering::SeqCst);
        self.events.publish(SnifferEvent::CaptureStarted { band, interface: interface.clone() });
        tracing::info!("{band} capture started on {interface}");
        ActionOutcome::ok(format!(
            "{band} capture started on {interface}{}",
            sync_warning.unwrap_or("")
        ))
    }

    /// Stop capture on one band, retrieve whatever the router wrote and delete
    /// the remote copies. The session always returns to idle once the stop
    /// command has run, a failed download is reported but never leaves the
    /// band stuck in running.
    pub async fn stop(&self, band: Band) -> ActionOutcome {
        let slot = &self.bands[&band];
        let mut state = slot.state.lock().await;
        if !state.running {
            return ActionOutcome::ok(format!("{band} capture not running"));
        }
        let interface = state
            .interface
            .clone()
            .unwrap_or_else(|| self.settings.default_interfaces[&band].clone());

        // terminate the remote process, the trailing sleep lets tcpdump flush
        // its final buffer before we list the output
        let kill = format!(
            "PID=$(ps | grep \"tcpdump -i {interface}\" | grep -v grep | awk '{{print $1}}'); \
             [ -n \"$PID\" ] && kill $PID 2>/dev/null; sleep 1; true"
        );
        if let Err(err) = self.executor.execute(&kill, self.command_timeout()).await {
            tracing::warn!("stopping {band} tcpdump failed: {err}");
        }

        let outcome = match self
            .retriever
            .retrieve_capture(band, &Self::remote_path(band), Local::now())
            .await
        {
            Ok(RetrievalOutcome::Files { files, failed }) => {
                let total: u64 = files.iter().map(|f| f.bytes).sum();
                let mut message = if files.len() == 1 && failed.is_empty() {
                    format!("saved {} ({} bytes)", files[0].local_path.display(), total)
                } else {
                    format!(
                        "saved {} of {} files ({} bytes total)",
                        files.len(),
                        files.len() + failed.len(),
                        total
                    )
                };
                if !failed.is_empty() {
                    message.push_str(&format!(", failed parts: {}", failed.join(", ")));
                }
                let mut outcome = ActionOutcome::ok(message);
                outcome.local_path = Some(files[0].local_path.display().to_string());
                outcome
            }
            Ok(RetrievalOutcome::NoFile) => {
                ActionOutcome::ok(format!("no capture file on router for {band}"))
            }
            Err(err) => ActionOutcome::failed(format!("{band} download failed: {err:#}")),
        };

        // idle unconditionally, whatever happened to the download
        *state = BandState::default();
        slot.running.store(false, Ordering::SeqCst);
        self.events.publish(SnifferEvent::CaptureStopped {
            band,
            outcome: outcome.clone(),
        });
        tracing::info!("{band} capture stopped: {}", outcome.message);
        outcome
    }

    /// Point in time status for one band. The packet counter is refreshed from
    /// the router with a short timeout, on failure the last known value is kept
    /// and flagged stale rather than reset.
    pub async fn status(&self, band: Band) -> CaptureStatusReport {
        let slot = &self.bands[&band];
        let mut state = slot.state.lock().await;
        if !state.running {
            return CaptureStatusReport::default();
        }
        let query = format!(
            "ls -la {} 2>/dev/null | awk '{{print $5}}'",
            Self::remote_path(band)
        );
        match self.executor.execute(&query, STATUS_QUERY_TIMEOUT).await {
            Ok(result) if result.success() => {
                if let Ok(size) = result.stdout.trim().parse::<u64>() {
                    // rough approximation, average packet around a hundred bytes
                    state.packets = size / 100;
                    state.stale = false;
                } else {
                    state.stale = true;
                }
            }
            _ => {
                state.stale = true;
            }
        }
        let elapsed = state
            .started_at
            .map(|started| (Local::now() - started).num_seconds().max(0) as u64);
        CaptureStatusReport {
            running: true,
            duration: elapsed.map(CaptureStatusReport::format_duration),
            duration_seconds: elapsed,
            packets: state.packets,
            stale: state.stale,
        }
    }

    /// Status for every band, published as a tick for push subscribers.
    pub async fn status_all(&self) -> BTreeMap<Band, CaptureStatusReport> {
        let mut statuses = BTreeMap::new();
        for band in Band::iter() {
            statuses.insert(band, self.status(band).await);
        }
        self.events.publish(SnifferEvent::StatusTick {
            statuses: statuses.clone(),
        });
        statuses
    }

    /// Start every band. Bands fan out concurrently and report independently,
    /// one failure never abandons the others.
    pub async fn start_all(&self) -> BTreeMap<Band, ActionOutcome> {
        let results = join_all(Band::iter().map(|band| async move {
            (band, self.start(band).await)
        }))
        .await;
        results.into_iter().collect()
    }

    /// Stop every band that is running.
    pub async fn stop_all(&self) -> BTreeMap<Band, ActionOutcome> {
        let results = join_all(Band::iter().map(|band| async move {
            (band, self.stop(band).await)
        }))
        .await;
        results.into_iter().collect()
    }

    pub async fn get_split(&self) -> FileSplitConfig {
        *self.split_config.read().await
    }

    /// Update the rotation settings for future captures. The size has to be one
    /// of the supported thresholds.
    pub async fn set_split(&self, enabled: bool, size_mb: u64) -> ActionOutcome {
        if !FileSplitConfig::is_allowed_size(size_mb) {
            return ActionOutcome::failed(format!(
                "unsupported split size {size_mb} MB, allowed: {:?}",
                FileSplitConfig::ALLOWED_SIZES_MB
            ));
        }
        let config = FileSplitConfig { enabled, size_mb };
        *self.split_config.write().await = config;
        self.events.publish(SnifferEvent::SplitConfigChanged { config });
        ActionOutcome::ok(if enabled {
            format!("file split enabled ({size_mb} MB per file)")
        } else {
            "file split disabled".to_string()
        })
    }

    /// Kill orphaned captures and stale output left on the router by a previous
    /// run. Idempotent, called once after the first successful connection.
    pub async fn cleanup_remote(&self) -> ActionOutcome {
        let paths: Vec<String> = Band::iter()
            .map(|band| format!("{}*", Self::remote_path(band)))
            .collect();
        let command = format!(
            "killall tcpdump 2>/dev/null; rm -f {}; true",
            paths.join(" ")
        );
        match self.executor.execute(&command, self.command_timeout()).await {
            Ok(_) => ActionOutcome::ok("removed stale captures from router"),
            Err(err) => ActionOutcome::failed(format!("remote cleanup failed: {err}")),
        }
    }
}
